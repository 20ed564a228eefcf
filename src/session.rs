//! The session: single owner of the collect → train → predict pipeline.
//!
//! All mutation goes through `Session` methods. Periodic tasks get shared
//! handles: capture controllers write samples to the store, the predictor
//! reads the store and the head slot. Training runs on its own thread and
//! replaces the head as a whole when it finishes.
//!
//! The head is tied to the class set it was fitted on. Adding, deleting or
//! resetting classes drops the head and stops the predictor; a run that
//! finishes after such a change is discarded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::anyhow;

use crate::capture::{CaptureController, CaptureState, CaptureSummary};
use crate::error::{Failure, KernelError, Operation, Result};
use crate::extract::FeatureExtractor;
use crate::frame::SharedFrameSource;
use crate::head::{current_head, HeadSlot, TrainedHead};
use crate::predict::{PredictionResult, PredictorLoop, PredictorState};
use crate::sink::{FailureSink, ProgressSink, ResultSink};
use crate::store::{write_store, ClassLabel, SampleStore, SharedStore, StoreReader};
use crate::train::{fit, TrainingConfig, TrainingSet, TrainingSummary};

/// Tick intervals and fit hyper-parameters for one session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSettings {
    pub capture_interval: Duration,
    pub predict_interval: Duration,
    pub training: TrainingConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            capture_interval: Duration::from_millis(40),
            predict_interval: Duration::from_millis(100),
            training: TrainingConfig::default(),
        }
    }
}

/// Head slot plus the class-set generation it belongs to.
///
/// The generation only changes while the slot's write lock is held, so a
/// finishing run can check it and install its head atomically.
#[derive(Clone)]
struct HeadState {
    slot: HeadSlot,
    generation: Arc<AtomicU64>,
}

impl HeadState {
    fn new() -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn invalidate(&self) -> Result<()> {
        let mut head = self
            .slot
            .write()
            .map_err(|_| KernelError::LockPoisoned("trained head"))?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        if head.take().is_some() {
            log::info!("trained head dropped: class set changed");
        }
        Ok(())
    }

    /// Install `head` if the class set is still the one it was fitted on.
    fn install(&self, head: TrainedHead, fitted_on: u64) -> Result<()> {
        let mut slot = self
            .slot
            .write()
            .map_err(|_| KernelError::LockPoisoned("trained head"))?;
        if self.generation() != fitted_on {
            return Err(KernelError::training(
                "classes changed while training; result discarded",
            ));
        }
        *slot = Some(Arc::new(head));
        Ok(())
    }
}

/// Clears the in-flight flag when the training thread ends, however it ends.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A training run in progress.
///
/// Dropping the handle detaches the run; it still installs its head when it
/// finishes.
pub struct TrainingHandle {
    handle: JoinHandle<Result<TrainingSummary>>,
}

impl TrainingHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the run ends.
    pub fn wait(self) -> Result<TrainingSummary> {
        self.handle
            .join()
            .map_err(|_| KernelError::Training(anyhow!("training thread panicked")))?
    }
}

pub struct Session {
    source: SharedFrameSource,
    extractor: Arc<dyn FeatureExtractor>,
    store: SharedStore,
    head: HeadState,
    captures: BTreeMap<ClassLabel, CaptureController>,
    predictor: PredictorLoop,
    training: Arc<AtomicBool>,
    failures: Arc<dyn FailureSink>,
    settings: SessionSettings,
}

impl Session {
    pub fn new(
        source: SharedFrameSource,
        extractor: Arc<dyn FeatureExtractor>,
        settings: SessionSettings,
        failures: Arc<dyn FailureSink>,
    ) -> Self {
        let store: SharedStore = Arc::new(RwLock::new(SampleStore::new()));
        let head = HeadState::new();
        let predictor = PredictorLoop::new(
            settings.predict_interval,
            source.clone(),
            extractor.clone(),
            head.slot.clone(),
            StoreReader::new(store.clone()),
            failures.clone(),
        );
        log::info!(
            "session ready: extractor {} ({}-d), capture {}ms, predict {}ms",
            extractor.name(),
            extractor.dimension(),
            settings.capture_interval.as_millis(),
            settings.predict_interval.as_millis()
        );
        Self {
            source,
            extractor,
            store,
            head,
            captures: BTreeMap::new(),
            predictor,
            training: Arc::new(AtomicBool::new(false)),
            failures,
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn extractor(&self) -> &Arc<dyn FeatureExtractor> {
        &self.extractor
    }

    /// Read-only view of the sample store.
    pub fn store(&self) -> StoreReader {
        StoreReader::new(self.store.clone())
    }

    pub fn head(&self) -> Result<Option<Arc<TrainedHead>>> {
        current_head(&self.head.slot)
    }

    pub fn add_class(&mut self, name: Option<&str>) -> Result<ClassLabel> {
        let label = write_store(&self.store)?.add_class(name);
        self.invalidate_head()?;
        log::info!("class {} added", label);
        Ok(label)
    }

    pub fn rename_class(&mut self, label: ClassLabel, name: &str) -> Result<()> {
        write_store(&self.store)?.rename_class(label, name)
    }

    pub fn delete_class(&mut self, label: ClassLabel) -> Result<()> {
        self.disarm(label);
        write_store(&self.store)?.delete_class(label)?;
        self.invalidate_head()?;
        log::info!("class {} deleted", label);
        Ok(())
    }

    /// Drop every sample of a class. The class and its label remain.
    pub fn clear_class(&mut self, label: ClassLabel) -> Result<()> {
        self.disarm(label);
        write_store(&self.store)?.clear_class(label)
    }

    /// Arm periodic capture for `label`.
    pub fn start_capture(&mut self, label: ClassLabel) -> Result<()> {
        self.ensure_class(label)?;
        if !self.captures.contains_key(&label) {
            let controller = self.controller(label);
            self.captures.insert(label, controller);
        }
        match self.captures.get_mut(&label) {
            Some(controller) => controller.arm(),
            None => Err(KernelError::UnknownClass(label)),
        }
    }

    /// Disarm capture for `label` and report what it recorded.
    pub fn stop_capture(&mut self, label: ClassLabel) -> Result<CaptureSummary> {
        match self.disarm(label) {
            Some(summary) => Ok(summary),
            None => {
                self.ensure_class(label)?;
                Ok(CaptureSummary::default())
            }
        }
    }

    pub fn capture_state(&self, label: ClassLabel) -> CaptureState {
        self.captures
            .get(&label)
            .map(CaptureController::state)
            .unwrap_or(CaptureState::Idle)
    }

    /// Record one sample for `label` right now, on the calling thread.
    pub fn capture_once(&self, label: ClassLabel) -> Result<usize> {
        match self.captures.get(&label) {
            Some(controller) => controller.capture_once(),
            None => self.controller(label).capture_once(),
        }
    }

    /// Start fitting a new head on the current samples.
    ///
    /// Assembly happens before this returns, so data problems are reported
    /// here; the fit itself runs in the background.
    pub fn train(&self, progress: Arc<dyn ProgressSink>) -> Result<TrainingHandle> {
        if self
            .training
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(KernelError::TrainingInProgress);
        }
        let in_flight = InFlight(self.training.clone());

        let fitted_on = self.head.generation();
        let set = {
            let store = self
                .store
                .read()
                .map_err(|_| KernelError::LockPoisoned("sample store"))?;
            TrainingSet::assemble(&store)?
        };
        log::info!(
            "training on {} samples across {} classes",
            set.len(),
            set.num_classes()
        );

        let config = self.settings.training.clone();
        let head = self.head.clone();
        let failures = self.failures.clone();
        let handle = std::thread::Builder::new()
            .name("train".to_string())
            .spawn(move || {
                let _in_flight = in_flight;
                let outcome = fit(set, &config, progress.as_ref())
                    .and_then(|(trained, summary)| {
                        head.install(trained, fitted_on)?;
                        Ok(summary)
                    });
                match &outcome {
                    Ok(summary) => log::info!(
                        "training finished: {} epochs, final loss {:.4}, accuracy {:.3}",
                        summary.epochs,
                        summary.final_loss,
                        summary.final_accuracy
                    ),
                    Err(error) => {
                        failures.on_failure(&Failure::new(Operation::Train, duplicate(error)))
                    }
                }
                outcome
            })
            .map_err(|err| KernelError::Worker(err.into()))?;
        Ok(TrainingHandle { handle })
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::SeqCst)
    }

    /// Start live prediction. Returns false when there is no trained head.
    pub fn start_predicting(&mut self, sink: Arc<dyn ResultSink>) -> Result<bool> {
        self.predictor.start(sink)
    }

    pub fn stop_predicting(&mut self) {
        self.predictor.stop();
    }

    pub fn predictor_state(&self) -> PredictorState {
        self.predictor.state()
    }

    /// Classify the current frame on the calling thread.
    pub fn predict_once(&self) -> Result<Option<PredictionResult>> {
        self.predictor.predict_once()
    }

    /// Stop everything and forget all classes and the head.
    pub fn reset(&mut self) -> Result<()> {
        self.disarm_all();
        self.predictor.stop();
        write_store(&self.store)?.clear();
        self.head.invalidate()?;
        log::info!("session reset");
        Ok(())
    }

    fn controller(&self, label: ClassLabel) -> CaptureController {
        CaptureController::new(
            label,
            self.settings.capture_interval,
            self.source.clone(),
            self.extractor.clone(),
            self.store.clone(),
            self.failures.clone(),
        )
    }

    fn ensure_class(&self, label: ClassLabel) -> Result<()> {
        let store = self
            .store
            .read()
            .map_err(|_| KernelError::LockPoisoned("sample store"))?;
        store
            .class(label)
            .map(|_| ())
            .ok_or(KernelError::UnknownClass(label))
    }

    fn disarm(&mut self, label: ClassLabel) -> Option<CaptureSummary> {
        self.captures
            .remove(&label)
            .map(|mut controller| controller.disarm())
    }

    fn disarm_all(&mut self) {
        for (_, mut controller) in std::mem::take(&mut self.captures) {
            controller.disarm();
        }
    }

    fn invalidate_head(&mut self) -> Result<()> {
        self.predictor.stop();
        self.head.invalidate()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disarm_all();
        self.predictor.stop();
    }
}

/// Copy of a run's error for the failure sink; `anyhow` sources do not clone.
fn duplicate(error: &KernelError) -> KernelError {
    match error {
        KernelError::Training(inner) => KernelError::Training(anyhow!("{:#}", inner)),
        KernelError::InsufficientData(message) => KernelError::InsufficientData(message.clone()),
        KernelError::LockPoisoned(what) => KernelError::LockPoisoned(what),
        other => KernelError::training(other),
    }
}
