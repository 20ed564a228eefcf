//! Training-set assembly and the fit loop.
//!
//! `train` takes the current classes, stacks their feature vectors, shuffles
//! features and labels with one shared permutation, one-hot encodes the labels
//! against dense column indices and fits a fresh `TrainedHead` with
//! mini-batch Adam. A run either returns a fully trained head or an error;
//! partially trained weights are dropped.

use anyhow::anyhow;
use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{KernelError, Result};
use crate::head::{backprop, Adam, TrainedHead};
use crate::sink::ProgressSink;
use crate::store::{ClassLabel, SampleStore};

/// Fit hyper-parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub hidden_units: usize,
    /// Seed for weight init and shuffling; `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 5,
            learning_rate: 0.001,
            hidden_units: 128,
            seed: None,
        }
    }
}

impl TrainingConfig {
    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// Stacked samples ready for fitting.
///
/// Row `i` of `features` belongs to column `targets[i]`, and column `c`
/// stands for `labels[c]`.
#[derive(Debug)]
pub struct TrainingSet {
    pub features: Array2<f32>,
    pub targets: Vec<usize>,
    pub labels: Vec<ClassLabel>,
}

impl TrainingSet {
    /// Concatenate every class's samples in store order.
    ///
    /// Needs at least two classes, each with at least one sample. Class
    /// labels are mapped to dense column indices in store order, so gaps left
    /// by deleted classes never reach the one-hot encoding.
    pub fn assemble(store: &SampleStore) -> Result<Self> {
        if store.len() < 2 {
            return Err(KernelError::InsufficientData(format!(
                "need at least 2 classes, have {}",
                store.len()
            )));
        }
        if let Some(empty) = store.classes().iter().find(|c| c.is_empty()) {
            return Err(KernelError::InsufficientData(format!(
                "class {} ({}) has no samples",
                empty.label(),
                empty.name()
            )));
        }

        let width = store.classes()[0].features()[0].len();
        let total = store.total_samples();
        let mut features = Array2::<f32>::zeros((total, width));
        let mut targets = Vec::with_capacity(total);
        let mut labels = Vec::with_capacity(store.len());

        let mut row = 0;
        for (column, class) in store.classes().iter().enumerate() {
            labels.push(class.label());
            for vector in class.features() {
                if vector.len() != width {
                    return Err(KernelError::Training(anyhow!(
                        "class {} has a {}-wide feature vector, expected {}",
                        class.label(),
                        vector.len(),
                        width
                    )));
                }
                features.row_mut(row).assign(vector);
                targets.push(column);
                row += 1;
            }
        }

        Ok(Self {
            features,
            targets,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn feature_width(&self) -> usize {
        self.features.ncols()
    }

    /// Reorder rows and targets with one shared permutation.
    ///
    /// Row `i` after the shuffle is row `perm[i]` from before, and so is its
    /// target. Returns the permutation.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..self.len()).collect();
        perm.shuffle(rng);
        self.features = self.features.select(Axis(0), &perm);
        self.targets = perm.iter().map(|&i| self.targets[i]).collect();
        perm
    }
}

/// One-hot encode dense targets into `num_classes` columns.
pub fn one_hot(targets: &[usize], num_classes: usize) -> Result<Array2<f32>> {
    let mut encoded = Array2::<f32>::zeros((targets.len(), num_classes));
    for (row, &target) in targets.iter().enumerate() {
        if target >= num_classes {
            return Err(KernelError::Training(anyhow!(
                "target {} outside 0..{}",
                target,
                num_classes
            )));
        }
        encoded[[row, target]] = 1.0;
    }
    Ok(encoded)
}

/// Statistics for one completed epoch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochStats {
    /// 0-based epoch index.
    pub epoch: usize,
    /// Sample-weighted mean loss over the epoch's batches.
    pub loss: f32,
    /// Fraction of samples in [0, 1] whose arg-max hit the target class,
    /// measured on each batch before its update.
    pub accuracy: f32,
}

/// Outcome of a successful run.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub final_loss: f32,
    pub final_accuracy: f32,
    pub num_classes: usize,
    pub samples: usize,
}

/// Assemble the current store and fit a fresh head.
pub fn train(
    store: &SampleStore,
    config: &TrainingConfig,
    progress: &dyn ProgressSink,
) -> Result<(TrainedHead, TrainingSummary)> {
    let set = TrainingSet::assemble(store)?;
    fit(set, config, progress)
}

/// Fit a fresh head on an assembled training set.
///
/// The set is consumed so its stacked matrices are released when the run
/// ends, whatever the outcome.
pub fn fit(
    mut set: TrainingSet,
    config: &TrainingConfig,
    progress: &dyn ProgressSink,
) -> Result<(TrainedHead, TrainingSummary)> {
    if config.epochs == 0 || config.batch_size == 0 || config.hidden_units == 0 {
        return Err(KernelError::training(
            "epochs, batch size and hidden units must be positive",
        ));
    }
    if !config.learning_rate.is_finite() || config.learning_rate <= 0.0 {
        return Err(KernelError::training(format!(
            "learning rate {} is not a positive finite number",
            config.learning_rate
        )));
    }

    let mut rng = config.rng();
    set.shuffle(&mut rng);
    let targets = one_hot(&set.targets, set.num_classes())?;

    let mut head = TrainedHead::initialize(
        set.feature_width(),
        config.hidden_units,
        set.labels.clone(),
        &mut rng,
    )?;
    let mut adam = Adam::new(config.learning_rate, &head);
    log::debug!(
        "training {}-class head ({:?}) on {} samples of width {}",
        set.num_classes(),
        head.loss_kind(),
        set.len(),
        set.feature_width()
    );

    let mut order: Vec<usize> = (0..set.len()).collect();
    let mut last = EpochStats {
        epoch: 0,
        loss: f32::NAN,
        accuracy: 0.0,
    };
    for epoch in 0..config.epochs {
        order.shuffle(&mut rng);
        let mut weighted = 0.0f32;
        let mut correct = 0usize;
        for batch in order.chunks(config.batch_size) {
            let x = set.features.select(Axis(0), batch);
            let y = targets.select(Axis(0), batch);
            let (loss, hits) = step(&mut head, &mut adam, x.view(), y.view())?;
            weighted += loss * batch.len() as f32;
            correct += hits;
        }
        let epoch_loss = weighted / set.len() as f32;
        if !epoch_loss.is_finite() {
            return Err(KernelError::Training(anyhow!(
                "loss became {} at epoch {}",
                epoch_loss,
                epoch
            )));
        }
        last = EpochStats {
            epoch,
            loss: epoch_loss,
            accuracy: correct as f32 / set.len() as f32,
        };
        log::debug!(
            "epoch {} loss {:.5} accuracy {:.3}",
            epoch,
            last.loss,
            last.accuracy
        );
        progress.on_epoch_stats(&last);
    }

    let summary = TrainingSummary {
        epochs: config.epochs,
        final_loss: last.loss,
        final_accuracy: last.accuracy,
        num_classes: set.num_classes(),
        samples: set.len(),
    };
    Ok((head, summary))
}

fn step(
    head: &mut TrainedHead,
    adam: &mut Adam,
    x: ArrayView2<f32>,
    y: ArrayView2<f32>,
) -> Result<(f32, usize)> {
    let pass = backprop(head, x, y);
    if !pass.loss.is_finite() {
        return Err(KernelError::Training(anyhow!("batch loss is {}", pass.loss)));
    }
    adam.apply(head, &pass.grads);
    if !head.is_finite() {
        return Err(KernelError::training("weights diverged to non-finite values"));
    }
    Ok((pass.loss, pass.correct))
}
