//! The trainable classification head.
//!
//! Two dense layers on top of frozen features: a ReLU hidden layer and a
//! softmax output layer whose width is the number of classes. A head is a
//! value tied to the class set it was trained on; when that set changes the
//! head is thrown away and a new one is fitted, never resized.

use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;

use crate::error::{KernelError, Result};
use crate::store::ClassLabel;

/// Clipping bound applied to probabilities inside the losses.
pub const PROB_EPSILON: f32 = 1e-7;

/// Loss formulation, chosen from the class count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossKind {
    /// Element-wise binary cross-entropy averaged over both output columns.
    BinaryCrossentropy,
    /// Categorical cross-entropy over all output columns.
    CategoricalCrossentropy,
}

impl LossKind {
    /// Exactly two classes train with the binary loss, more with categorical.
    pub fn for_class_count(num_classes: usize) -> Self {
        if num_classes == 2 {
            LossKind::BinaryCrossentropy
        } else {
            LossKind::CategoricalCrossentropy
        }
    }

    /// Mean loss over a batch of softmax outputs against one-hot targets.
    pub fn loss(&self, probs: ArrayView2<f32>, targets: ArrayView2<f32>) -> f32 {
        let batch = probs.nrows().max(1) as f32;
        let clipped = probs.mapv(|p| p.clamp(PROB_EPSILON, 1.0 - PROB_EPSILON));
        match self {
            LossKind::BinaryCrossentropy => {
                let cols = probs.ncols().max(1) as f32;
                let total: f32 = clipped
                    .iter()
                    .zip(targets.iter())
                    .map(|(&p, &y)| -(y * p.ln() + (1.0 - y) * (1.0 - p).ln()))
                    .sum();
                total / (batch * cols)
            }
            LossKind::CategoricalCrossentropy => {
                let total: f32 = clipped
                    .iter()
                    .zip(targets.iter())
                    .map(|(&p, &y)| -y * p.ln())
                    .sum();
                total / batch
            }
        }
    }

    /// Gradient of the mean loss with respect to the pre-softmax logits.
    pub fn logits_grad(&self, probs: ArrayView2<f32>, targets: ArrayView2<f32>) -> Array2<f32> {
        let batch = probs.nrows().max(1) as f32;
        match self {
            LossKind::CategoricalCrossentropy => (&probs - &targets) / batch,
            LossKind::BinaryCrossentropy => {
                let cols = probs.ncols().max(1) as f32;
                let mut grad = Array2::zeros(probs.raw_dim());
                for ((mut out, p_row), y_row) in grad
                    .axis_iter_mut(Axis(0))
                    .zip(probs.axis_iter(Axis(0)))
                    .zip(targets.axis_iter(Axis(0)))
                {
                    // dL/dp, zero where the clip is active
                    let dp: Array1<f32> = p_row
                        .iter()
                        .zip(y_row.iter())
                        .map(|(&p, &y)| {
                            if p <= PROB_EPSILON || p >= 1.0 - PROB_EPSILON {
                                0.0
                            } else {
                                (-y / p + (1.0 - y) / (1.0 - p)) / (batch * cols)
                            }
                        })
                        .collect();
                    // softmax backward: dz_j = p_j * (dp_j - sum_i dp_i p_i)
                    let dot = dp.dot(&p_row);
                    for ((o, &p), &d) in out.iter_mut().zip(p_row.iter()).zip(dp.iter()) {
                        *o = p * (d - dot);
                    }
                }
                grad
            }
        }
    }
}

/// Fully connected layer: `y = x · weights + bias`.
#[derive(Clone, Debug)]
pub struct DenseLayer {
    pub(crate) weights: Array2<f32>,
    pub(crate) bias: Array1<f32>,
}

impl DenseLayer {
    /// Glorot-uniform kernel, zero bias.
    pub fn glorot<R: Rng>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (inputs + outputs).max(1) as f32).sqrt();
        let weights = Array2::from_shape_fn((inputs, outputs), |_| rng.gen_range(-limit..=limit));
        Self {
            weights,
            bias: Array1::zeros(outputs),
        }
    }

    pub fn inputs(&self) -> usize {
        self.weights.nrows()
    }

    pub fn outputs(&self) -> usize {
        self.weights.ncols()
    }

    pub(crate) fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        x.dot(&self.weights) + &self.bias
    }

    fn is_finite(&self) -> bool {
        self.weights.iter().chain(self.bias.iter()).all(|v| v.is_finite())
    }
}

pub(crate) fn relu(x: Array2<f32>) -> Array2<f32> {
    x.mapv_into(|v| v.max(0.0))
}

/// Row-wise softmax, shifted by the row max for stability.
pub(crate) fn softmax_rows(mut logits: Array2<f32>) -> Array2<f32> {
    for mut row in logits.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    logits
}

/// A fitted classifier over a fixed, ordered set of class labels.
///
/// Output column `i` scores `labels()[i]`.
#[derive(Clone, Debug)]
pub struct TrainedHead {
    pub(crate) hidden: DenseLayer,
    pub(crate) output: DenseLayer,
    labels: Vec<ClassLabel>,
    loss: LossKind,
}

impl TrainedHead {
    pub(crate) fn new(
        hidden: DenseLayer,
        output: DenseLayer,
        labels: Vec<ClassLabel>,
    ) -> Result<Self> {
        if hidden.outputs() != output.inputs() || output.outputs() != labels.len() {
            return Err(KernelError::Training(anyhow!(
                "layer shapes {}x{} -> {}x{} do not fit {} classes",
                hidden.inputs(),
                hidden.outputs(),
                output.inputs(),
                output.outputs(),
                labels.len()
            )));
        }
        let loss = LossKind::for_class_count(labels.len());
        Ok(Self {
            hidden,
            output,
            labels,
            loss,
        })
    }

    /// Build an untrained head with freshly initialized weights.
    pub fn initialize<R: Rng>(
        feature_width: usize,
        hidden_units: usize,
        labels: Vec<ClassLabel>,
        rng: &mut R,
    ) -> Result<Self> {
        let hidden = DenseLayer::glorot(feature_width, hidden_units, rng);
        let output = DenseLayer::glorot(hidden_units, labels.len(), rng);
        Self::new(hidden, output, labels)
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn feature_width(&self) -> usize {
        self.hidden.inputs()
    }

    pub fn hidden_units(&self) -> usize {
        self.hidden.outputs()
    }

    pub fn labels(&self) -> &[ClassLabel] {
        &self.labels
    }

    pub fn label_at(&self, index: usize) -> Option<ClassLabel> {
        self.labels.get(index).copied()
    }

    pub fn loss_kind(&self) -> LossKind {
        self.loss
    }

    /// Probability distribution over `labels()` for one feature vector.
    pub fn infer(&self, features: ArrayView1<f32>) -> Result<Array1<f32>> {
        if features.len() != self.feature_width() {
            return Err(KernelError::extraction(format!(
                "feature vector has width {}, head expects {}",
                features.len(),
                self.feature_width()
            )));
        }
        let batch = features.insert_axis(Axis(0));
        let probs = self.forward(batch);
        Ok(probs.index_axis_move(Axis(0), 0))
    }

    /// Batch forward pass returning softmax probabilities.
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let hidden = relu(self.hidden.forward(x));
        softmax_rows(self.output.forward(hidden.view()))
    }

    pub(crate) fn is_finite(&self) -> bool {
        self.hidden.is_finite() && self.output.is_finite()
    }
}

/// The current head, replaced as a whole when training completes.
pub(crate) type HeadSlot = Arc<RwLock<Option<Arc<TrainedHead>>>>;

pub(crate) fn current_head(slot: &HeadSlot) -> Result<Option<Arc<TrainedHead>>> {
    slot.read()
        .map(|head| head.clone())
        .map_err(|_| KernelError::LockPoisoned("trained head"))
}

pub(crate) fn replace_head(
    slot: &HeadSlot,
    head: Option<Arc<TrainedHead>>,
) -> Result<Option<Arc<TrainedHead>>> {
    let mut guard = slot
        .write()
        .map_err(|_| KernelError::LockPoisoned("trained head"))?;
    Ok(std::mem::replace(&mut *guard, head))
}

/// Adam optimizer state for one parameter tensor.
#[derive(Clone, Debug)]
struct Moments<D: ndarray::Dimension> {
    m: ndarray::Array<f32, D>,
    v: ndarray::Array<f32, D>,
}

impl<D: ndarray::Dimension> Moments<D> {
    fn zeros_like(param: &ndarray::Array<f32, D>) -> Self {
        Self {
            m: ndarray::Array::zeros(param.raw_dim()),
            v: ndarray::Array::zeros(param.raw_dim()),
        }
    }
}

/// Adam with bias correction.
#[derive(Clone, Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
    hidden_w: Moments<ndarray::Ix2>,
    hidden_b: Moments<ndarray::Ix1>,
    output_w: Moments<ndarray::Ix2>,
    output_b: Moments<ndarray::Ix1>,
}

/// Loss, hits and gradients of one forward/backward pass.
#[derive(Debug)]
pub(crate) struct BatchPass {
    pub loss: f32,
    /// Rows whose arg-max matches the target column.
    pub correct: usize,
    pub grads: Gradients,
}

/// Parameter gradients for one batch.
#[derive(Debug)]
pub(crate) struct Gradients {
    pub hidden_w: Array2<f32>,
    pub hidden_b: Array1<f32>,
    pub output_w: Array2<f32>,
    pub output_b: Array1<f32>,
}

impl Adam {
    pub fn new(learning_rate: f32, head: &TrainedHead) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            step: 0,
            hidden_w: Moments::zeros_like(&head.hidden.weights),
            hidden_b: Moments::zeros_like(&head.hidden.bias),
            output_w: Moments::zeros_like(&head.output.weights),
            output_b: Moments::zeros_like(&head.output.bias),
        }
    }

    pub(crate) fn apply(&mut self, head: &mut TrainedHead, grads: &Gradients) {
        self.step += 1;
        let bc1 = 1.0 - self.beta1.powi(self.step);
        let bc2 = 1.0 - self.beta2.powi(self.step);
        let lr = self.learning_rate * bc2.sqrt() / bc1;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);

        update(&mut head.hidden.weights, &grads.hidden_w, &mut self.hidden_w, lr, b1, b2, eps);
        update(&mut head.hidden.bias, &grads.hidden_b, &mut self.hidden_b, lr, b1, b2, eps);
        update(&mut head.output.weights, &grads.output_w, &mut self.output_w, lr, b1, b2, eps);
        update(&mut head.output.bias, &grads.output_b, &mut self.output_b, lr, b1, b2, eps);
    }
}

fn update<D: ndarray::Dimension>(
    param: &mut ndarray::Array<f32, D>,
    grad: &ndarray::Array<f32, D>,
    moments: &mut Moments<D>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
) {
    ndarray::Zip::from(param)
        .and(grad)
        .and(&mut moments.m)
        .and(&mut moments.v)
        .for_each(|p, &g, m, v| {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            *p -= lr * *m / (v.sqrt() + epsilon);
        });
}

/// Forward + backward pass for one batch. Returns the batch loss and the
/// parameter gradients.
pub(crate) fn backprop(
    head: &TrainedHead,
    x: ArrayView2<f32>,
    targets: ArrayView2<f32>,
) -> BatchPass {
    let hidden = relu(head.hidden.forward(x));
    let probs = softmax_rows(head.output.forward(hidden.view()));
    let loss = head.loss.loss(probs.view(), targets);
    let correct = probs
        .axis_iter(Axis(0))
        .zip(targets.axis_iter(Axis(0)))
        .filter(|(p, y)| {
            let predicted = crate::predict::argmax(p.view());
            predicted.is_some() && predicted == crate::predict::argmax(y.view())
        })
        .count();

    let d_logits = head.loss.logits_grad(probs.view(), targets);
    let output_w = hidden.t().dot(&d_logits);
    let output_b = d_logits.sum_axis(Axis(0));

    let mut d_hidden = d_logits.dot(&head.output.weights.t());
    ndarray::Zip::from(&mut d_hidden)
        .and(&hidden)
        .for_each(|d, &h| {
            if h <= 0.0 {
                *d = 0.0;
            }
        });
    let hidden_w = x.t().dot(&d_hidden);
    let hidden_b = d_hidden.sum_axis(Axis(0));

    BatchPass {
        loss,
        correct,
        grads: Gradients {
            hidden_w,
            hidden_b,
            output_w,
            output_b,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn labels(n: u32) -> Vec<ClassLabel> {
        (0..n).map(ClassLabel).collect()
    }

    #[test]
    fn loss_kind_depends_on_class_count() {
        assert_eq!(LossKind::for_class_count(2), LossKind::BinaryCrossentropy);
        assert_eq!(LossKind::for_class_count(3), LossKind::CategoricalCrossentropy);
        assert_eq!(LossKind::for_class_count(7), LossKind::CategoricalCrossentropy);
    }

    #[test]
    fn inference_is_a_distribution_over_classes() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let head = TrainedHead::initialize(4, 8, labels(3), &mut rng)?;
        let probs = head.infer(array![0.3, -1.2, 4.0, 0.0].view())?;
        assert_eq!(probs.len(), 3);
        assert!((probs.sum() - 1.0).abs() < 1e-5);
        assert!(probs.iter().all(|p| *p >= 0.0));
        Ok(())
    }

    #[test]
    fn inference_rejects_wrong_width() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let head = TrainedHead::initialize(4, 8, labels(2), &mut rng)?;
        assert!(head.infer(array![1.0, 2.0].view()).is_err());
        Ok(())
    }

    #[test]
    fn softmax_survives_large_logits() {
        let probs = softmax_rows(array![[1000.0, 1000.0], [-1000.0, 0.0]]);
        assert!((probs[[0, 0]] - 0.5).abs() < 1e-6);
        assert!(probs.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn categorical_loss_matches_closed_form() {
        let probs = array![[0.7f32, 0.2, 0.1], [0.1, 0.1, 0.8]];
        let targets = array![[1.0f32, 0.0, 0.0], [0.0, 0.0, 1.0]];
        let expected = -(0.7f32.ln() + 0.8f32.ln()) / 2.0;
        let loss = LossKind::CategoricalCrossentropy.loss(probs.view(), targets.view());
        assert!((loss - expected).abs() < 1e-6);
    }

    #[test]
    fn binary_loss_averages_both_columns() {
        let probs = array![[0.9f32, 0.1]];
        let targets = array![[1.0f32, 0.0]];
        // both columns contribute -ln(0.9); the mean over columns is -ln(0.9)
        let expected = -(0.9f32.ln());
        let loss = LossKind::BinaryCrossentropy.loss(probs.view(), targets.view());
        assert!((loss - expected).abs() < 1e-6);
    }

    #[test]
    fn logit_gradients_match_finite_differences() {
        let logits = array![[0.2f32, -0.4, 0.9], [1.1, 0.3, -0.7]];
        let targets = array![[0.0f32, 1.0, 0.0], [1.0, 0.0, 0.0]];
        for kind in [LossKind::CategoricalCrossentropy, LossKind::BinaryCrossentropy] {
            let probs = softmax_rows(logits.clone());
            let analytic = kind.logits_grad(probs.view(), targets.view());
            let h = 1e-2f32;
            for ((r, c), &g) in analytic.indexed_iter() {
                let mut plus = logits.clone();
                plus[[r, c]] += h;
                let mut minus = logits.clone();
                minus[[r, c]] -= h;
                let lp = kind.loss(softmax_rows(plus).view(), targets.view());
                let lm = kind.loss(softmax_rows(minus).view(), targets.view());
                let numeric = (lp - lm) / (2.0 * h);
                assert!(
                    (numeric - g).abs() < 1e-3,
                    "{kind:?} [{r},{c}] numeric {numeric} analytic {g}"
                );
            }
        }
    }

    #[test]
    fn adam_steps_reduce_loss_on_a_separable_batch() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        let mut head = TrainedHead::initialize(2, 16, labels(2), &mut rng)?;
        let x = array![[1.0f32, 0.0], [0.0, 1.0]];
        let y = array![[1.0f32, 0.0], [0.0, 1.0]];
        let mut adam = Adam::new(0.05, &head);

        let first = backprop(&head, x.view(), y.view()).loss;
        for _ in 0..50 {
            let pass = backprop(&head, x.view(), y.view());
            adam.apply(&mut head, &pass.grads);
        }
        let last = backprop(&head, x.view(), y.view());
        assert!(last.loss < first, "loss went from {first} to {}", last.loss);
        assert_eq!(last.correct, 2);
        assert!(head.is_finite());
        Ok(())
    }
}
