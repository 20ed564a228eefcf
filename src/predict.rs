//! Live prediction loop.
//!
//! While running, every tick snapshots the frame source, extracts features,
//! runs the current head and reports the winning class to a `ResultSink`.
//! The loop only reads: it looks the head up through the shared slot on each
//! tick and reads class names and frames through a `StoreReader`.
//!
//! The representative image of a result is the most recent frame captured
//! for the winning class.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ndarray::ArrayView1;

use crate::error::{Failure, KernelError, Operation, Result};
use crate::extract::FeatureExtractor;
use crate::frame::{snapshot_shared, RasterFrame, SharedFrameSource};
use crate::head::{current_head, HeadSlot};
use crate::schedule::PeriodicTask;
use crate::sink::{FailureSink, ResultSink};
use crate::store::{ClassLabel, StoreReader};

/// Outcome of one predict tick.
#[derive(Clone, Debug)]
pub struct PredictionResult {
    pub label: ClassLabel,
    pub name: String,
    /// Most recent captured frame of the winning class.
    pub image: Option<Arc<RasterFrame>>,
    pub confidence: f32,
    /// Probability per class, in head column order.
    pub scores: Vec<(ClassLabel, f32)>,
}

/// Index of the highest score. Ties go to the lower index; NaN never wins.
pub fn argmax(scores: ArrayView1<f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredictorState {
    Stopped,
    Running,
}

#[derive(Clone)]
struct PredictTick {
    source: SharedFrameSource,
    extractor: Arc<dyn FeatureExtractor>,
    head: HeadSlot,
    store: StoreReader,
    failures: Arc<dyn FailureSink>,
    delivered: Arc<AtomicU64>,
}

impl PredictTick {
    fn predict(&self) -> Result<Option<PredictionResult>> {
        let Some(head) = current_head(&self.head)? else {
            return Ok(None);
        };

        let vector = {
            let frame = snapshot_shared(&self.source)?;
            self.extractor.extract(&frame)?
        };
        let probs = head.infer(vector.view())?;
        let index = argmax(probs.view())
            .ok_or_else(|| KernelError::extraction("head produced no comparable score"))?;
        let label = head
            .label_at(index)
            .ok_or_else(|| KernelError::extraction(format!("head has no column {}", index)))?;

        let store = self.store.read()?;
        let class = store.class(label).ok_or(KernelError::UnknownClass(label))?;
        Ok(Some(PredictionResult {
            label,
            name: class.name().to_string(),
            image: class.latest_frame().cloned(),
            confidence: probs[index],
            scores: head
                .labels()
                .iter()
                .copied()
                .zip(probs.iter().copied())
                .collect(),
        }))
    }

    fn run(&self, sink: &dyn ResultSink) {
        match self.predict() {
            Ok(Some(result)) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                sink.on_prediction(&result);
            }
            Ok(None) => log::debug!("predict tick without a trained head"),
            Err(error) => self
                .failures
                .on_failure(&Failure::new(Operation::Predict, error)),
        }
    }
}

pub struct PredictorLoop {
    tick: PredictTick,
    interval: Duration,
    task: Option<PeriodicTask>,
}

impl PredictorLoop {
    pub(crate) fn new(
        interval: Duration,
        source: SharedFrameSource,
        extractor: Arc<dyn FeatureExtractor>,
        head: HeadSlot,
        store: StoreReader,
        failures: Arc<dyn FailureSink>,
    ) -> Self {
        Self {
            tick: PredictTick {
                source,
                extractor,
                head,
                store,
                failures,
                delivered: Arc::new(AtomicU64::new(0)),
            },
            interval,
            task: None,
        }
    }

    pub fn state(&self) -> PredictorState {
        if self.task.is_some() {
            PredictorState::Running
        } else {
            PredictorState::Stopped
        }
    }

    /// Stopped → Running. Returns false, and stays stopped, without a head.
    pub fn start(&mut self, sink: Arc<dyn ResultSink>) -> Result<bool> {
        if current_head(&self.tick.head)?.is_none() {
            log::info!("predictor not started: no trained head");
            return Ok(false);
        }
        self.stop();

        let tick = self.tick.clone();
        let task = PeriodicTask::spawn("predict", self.interval, move || tick.run(sink.as_ref()))
            .map_err(KernelError::Worker)?;
        self.task = Some(task);
        log::info!("predictor running every {}ms", self.interval.as_millis());
        Ok(true)
    }

    /// Running → Stopped. No prediction is delivered after this returns.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            let stats = task.stop();
            log::info!(
                "predictor stopped after {} ticks ({} skipped)",
                stats.ticks,
                stats.skipped
            );
        }
    }

    /// Run one prediction on the calling thread.
    pub fn predict_once(&self) -> Result<Option<PredictionResult>> {
        self.tick.predict()
    }

    /// Results delivered to sinks since this loop was created.
    pub fn delivered(&self) -> u64 {
        self.tick.delivered.load(Ordering::Relaxed)
    }
}

impl Drop for PredictorLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{FeatureVector, InputSize};
    use crate::frame::share_source;
    use crate::head::{DenseLayer, TrainedHead};
    use crate::ingest::{Scene, SceneHandle, SyntheticConfig, SyntheticSource};
    use crate::store::SampleStore;
    use ndarray::{array, Array1, Array2};
    use std::sync::{Mutex, RwLock};
    use std::time::Instant;

    /// Two features: mean red and mean blue of the frame.
    struct RedBlue;

    impl FeatureExtractor for RedBlue {
        fn name(&self) -> &'static str {
            "red-blue"
        }

        fn input_size(&self) -> InputSize {
            InputSize::square(4)
        }

        fn dimension(&self) -> usize {
            2
        }

        fn extract(&self, frame: &RasterFrame) -> Result<FeatureVector> {
            let pixels = frame.pixels();
            let count = (pixels.len() / 3) as f32;
            let mean = |channel: usize| {
                pixels.iter().skip(channel).step_by(3).map(|v| *v as f32).sum::<f32>()
                    / count
                    / 255.0
            };
            Ok(array![mean(0), mean(2)])
        }
    }

    fn identity_head(labels: Vec<ClassLabel>) -> TrainedHead {
        let layer = || DenseLayer {
            weights: Array2::<f32>::eye(2) * 4.0,
            bias: Array1::zeros(2),
        };
        TrainedHead::new(layer(), layer(), labels).expect("head")
    }

    struct Fixture {
        scene: SceneHandle,
        head: HeadSlot,
        predictor: PredictorLoop,
        failures: Arc<Mutex<Vec<String>>>,
    }

    fn fixture() -> Fixture {
        let source = SyntheticSource::new(
            SyntheticConfig {
                url: "stub://predict".to_string(),
                width: 8,
                height: 8,
            },
            Scene::Solid([250, 0, 0]),
        );
        let scene = source.scene_handle();

        let mut store = SampleStore::new();
        let cat = store.add_class(Some("cat"));
        let dog = store.add_class(Some("dog"));
        for (label, rgb) in [(cat, [240, 0, 0]), (cat, [250, 0, 0]), (dog, [0, 0, 250])] {
            let frame = RasterFrame::solid(8, 8, rgb).expect("frame");
            store
                .push_sample(label, Arc::new(frame), array![0.0, 0.0])
                .expect("push");
        }
        let store = Arc::new(RwLock::new(store));

        let head: HeadSlot = Arc::new(RwLock::new(None));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let predictor = PredictorLoop::new(
            Duration::from_millis(2),
            share_source(source),
            Arc::new(RedBlue),
            head.clone(),
            StoreReader::new(store),
            Arc::new(move |failure: &Failure| {
                sink.lock().expect("lock").push(failure.to_string());
            }),
        );
        Fixture {
            scene,
            head,
            predictor,
            failures,
        }
    }

    fn install(fx: &Fixture) {
        *fx.head.write().expect("write") =
            Some(Arc::new(identity_head(vec![ClassLabel(0), ClassLabel(1)])));
    }

    #[test]
    fn argmax_prefers_the_lower_index_on_ties() {
        assert_eq!(argmax(array![0.2, 0.4, 0.4].view()), Some(1));
        assert_eq!(argmax(array![0.5, 0.5].view()), Some(0));
        assert_eq!(argmax(array![f32::NAN, 0.1].view()), Some(1));
        assert_eq!(argmax(Array1::<f32>::zeros(0).view()), None);
    }

    #[test]
    fn start_without_a_head_is_a_no_op() -> Result<()> {
        let mut fx = fixture();
        let accepted = fx.predictor.start(Arc::new(|_: &PredictionResult| {}))?;
        assert!(!accepted);
        assert_eq!(fx.predictor.state(), PredictorState::Stopped);
        Ok(())
    }

    #[test]
    fn result_names_the_winner_and_shows_its_latest_frame() -> Result<()> {
        let fx = fixture();
        install(&fx);

        let result = fx.predictor.predict_once()?.expect("prediction");
        assert_eq!(result.label, ClassLabel(0));
        assert_eq!(result.name, "cat");
        let image = result.image.expect("cat has frames");
        assert_eq!(&image.pixels()[..3], &[250, 0, 0]);
        assert_eq!(result.scores.len(), 2);
        assert!((result.scores.iter().map(|(_, p)| p).sum::<f32>() - 1.0).abs() < 1e-5);

        fx.scene.set(Scene::Solid([0, 0, 250]));
        let result = fx.predictor.predict_once()?.expect("prediction");
        assert_eq!((result.label, result.name.as_str()), (ClassLabel(1), "dog"));
        Ok(())
    }

    #[test]
    fn no_prediction_is_delivered_after_stop() -> Result<()> {
        let mut fx = fixture();
        install(&fx);
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        assert!(fx.predictor.start(Arc::new(move |_: &PredictionResult| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))?);
        assert_eq!(fx.predictor.state(), PredictorState::Running);

        let started = Instant::now();
        while seen.load(Ordering::SeqCst) < 3 && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        fx.predictor.stop();
        let at_stop = seen.load(Ordering::SeqCst);
        assert!(at_stop >= 3);
        assert_eq!(fx.predictor.delivered(), at_stop);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(seen.load(Ordering::SeqCst), at_stop);
        Ok(())
    }

    #[test]
    fn missing_frames_are_reported_and_the_loop_keeps_going() -> Result<()> {
        let mut fx = fixture();
        install(&fx);
        fx.scene.set(Scene::Offline);
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        fx.predictor.start(Arc::new(move |_: &PredictionResult| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))?;

        let started = Instant::now();
        while fx.failures.lock().expect("lock").is_empty()
            && started.elapsed() < Duration::from_secs(5)
        {
            std::thread::sleep(Duration::from_millis(1));
        }
        fx.scene.set(Scene::Solid([250, 0, 0]));
        while seen.load(Ordering::SeqCst) == 0 && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        fx.predictor.stop();

        assert!(seen.load(Ordering::SeqCst) >= 1);
        assert!(fx.failures.lock().expect("lock")[0].starts_with("predict NO_FRAME"));
        Ok(())
    }
}
