//! Capture controller.
//!
//! While armed for a class, every tick snapshots the frame source, extracts
//! the frame's features and commits the pair to that class. A tick commits
//! either both halves of a sample or nothing. Scheduled ticks and manual
//! `capture_once` calls share one per-controller gate, so a class never has
//! more than one capture in flight. A scheduled tick that finds the gate held
//! is dropped and counted as skipped; slow extractions make the scheduler
//! skip deadlines rather than queue them.
//!
//! Disarming joins the tick thread: a tick already past its snapshot is
//! allowed to finish and commit, and nothing is committed after `disarm`
//! returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use crate::error::{Failure, KernelError, Operation, Result};
use crate::extract::FeatureExtractor;
use crate::frame::{snapshot_shared, SharedFrameSource};
use crate::schedule::PeriodicTask;
use crate::sink::FailureSink;
use crate::store::{write_store, ClassLabel, SharedStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Armed,
}

/// Counters for one controller, reported on disarm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub committed: u64,
    pub failed: u64,
    /// Ticks dropped because the previous capture was still running.
    pub skipped: u64,
}

#[derive(Default)]
struct Counters {
    committed: AtomicU64,
    failed: AtomicU64,
    busy: AtomicU64,
}

/// Everything one capture tick needs.
#[derive(Clone)]
struct CaptureTick {
    label: ClassLabel,
    source: SharedFrameSource,
    extractor: Arc<dyn FeatureExtractor>,
    store: SharedStore,
    failures: Arc<dyn FailureSink>,
    counters: Arc<Counters>,
    gate: Arc<Mutex<()>>,
}

impl CaptureTick {
    /// Snapshot, extract, commit. Returns the class's new sample count.
    fn capture(&self) -> Result<usize> {
        let frame = snapshot_shared(&self.source)?;
        let vector = self.extractor.extract(&frame)?;
        let mut store = write_store(&self.store)?;
        store.push_sample(self.label, Arc::new(frame), vector)
    }

    /// Wait for the gate, then capture.
    fn run(&self) -> Result<usize> {
        let _gate = self
            .gate
            .lock()
            .map_err(|_| KernelError::LockPoisoned("capture gate"))?;
        self.record(self.capture())
    }

    fn record(&self, outcome: Result<usize>) -> Result<usize> {
        match outcome {
            Ok(count) => {
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
                Ok(count)
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Scheduled tick: capture only if nothing else is in flight.
    fn run_reporting(&self) {
        let outcome = match self.gate.try_lock() {
            Ok(_gate) => self.record(self.capture()),
            Err(TryLockError::WouldBlock) => {
                self.counters.busy.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(TryLockError::Poisoned(_)) => Err(KernelError::LockPoisoned("capture gate")),
        };
        if let Err(error) = outcome {
            self.failures.on_failure(&Failure::new(
                Operation::Capture { label: self.label },
                error,
            ));
        }
    }
}

pub struct CaptureController {
    tick: CaptureTick,
    interval: Duration,
    task: Option<PeriodicTask>,
    skipped: u64,
}

impl CaptureController {
    pub(crate) fn new(
        label: ClassLabel,
        interval: Duration,
        source: SharedFrameSource,
        extractor: Arc<dyn FeatureExtractor>,
        store: SharedStore,
        failures: Arc<dyn FailureSink>,
    ) -> Self {
        Self {
            tick: CaptureTick {
                label,
                source,
                extractor,
                store,
                failures,
                counters: Arc::new(Counters::default()),
                gate: Arc::new(Mutex::new(())),
            },
            interval,
            task: None,
            skipped: 0,
        }
    }

    pub fn label(&self) -> ClassLabel {
        self.tick.label
    }

    pub fn state(&self) -> CaptureState {
        if self.task.is_some() {
            CaptureState::Armed
        } else {
            CaptureState::Idle
        }
    }

    /// Idle → Armed. Arming an armed controller does nothing.
    pub fn arm(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let tick = self.tick.clone();
        let name = format!("capture-{}", self.tick.label);
        self.task = Some(PeriodicTask::spawn(&name, self.interval, move || {
            tick.run_reporting()
        })
        .map_err(KernelError::Worker)?);
        log::info!(
            "capture armed for class {} every {}ms",
            self.tick.label,
            self.interval.as_millis()
        );
        Ok(())
    }

    /// Armed → Idle. Waits for an in-flight tick to commit.
    pub fn disarm(&mut self) -> CaptureSummary {
        if let Some(task) = self.task.take() {
            self.skipped += task.stop().skipped;
            let summary = self.summary();
            log::info!(
                "capture disarmed for class {}: {} committed, {} failed, {} skipped",
                self.tick.label,
                summary.committed,
                summary.failed,
                summary.skipped
            );
        }
        self.summary()
    }

    /// Run one capture on the calling thread, after any in-flight tick.
    pub fn capture_once(&self) -> Result<usize> {
        self.tick.run()
    }

    pub fn summary(&self) -> CaptureSummary {
        CaptureSummary {
            committed: self.tick.counters.committed.load(Ordering::Relaxed),
            failed: self.tick.counters.failed.load(Ordering::Relaxed),
            skipped: self.skipped + self.tick.counters.busy.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::HistogramExtractor;
    use crate::extract::InputSize;
    use crate::frame::{share_source, RasterFrame};
    use crate::ingest::{Scene, SceneHandle, SyntheticConfig, SyntheticSource};
    use crate::store::SampleStore;
    use std::sync::{Mutex, RwLock};
    use std::time::Instant;

    struct Fixture {
        store: SharedStore,
        scene: SceneHandle,
        failures: Arc<Mutex<Vec<String>>>,
        controller: CaptureController,
    }

    fn fixture(interval: Duration) -> Fixture {
        let source = SyntheticSource::new(
            SyntheticConfig {
                url: "stub://capture".to_string(),
                width: 16,
                height: 12,
            },
            Scene::Solid([200, 30, 30]),
        );
        let scene = source.scene_handle();
        let mut store = SampleStore::new();
        let label = store.add_class(Some("cat"));
        let store: SharedStore = Arc::new(RwLock::new(store));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let controller = CaptureController::new(
            label,
            interval,
            share_source(source),
            Arc::new(HistogramExtractor::new(InputSize::square(8))),
            store.clone(),
            Arc::new(move |failure: &Failure| {
                sink.lock().expect("lock").push(failure.to_string());
            }),
        );
        Fixture {
            store,
            scene,
            failures,
            controller,
        }
    }

    fn sample_count(store: &SharedStore, label: ClassLabel) -> (usize, usize) {
        let store = store.read().expect("read");
        let class = store.class(label).expect("class");
        (class.frames().len(), class.features().len())
    }

    #[test]
    fn manual_capture_commits_frame_and_vector_together() -> Result<()> {
        let fx = fixture(Duration::from_millis(10));
        let label = fx.controller.label();
        for expected in 1..=3 {
            assert_eq!(fx.controller.capture_once()?, expected);
            assert_eq!(sample_count(&fx.store, label), (expected, expected));
        }
        assert_eq!(fx.controller.summary().committed, 3);
        Ok(())
    }

    #[test]
    fn missing_frames_commit_nothing() {
        let fx = fixture(Duration::from_millis(10));
        fx.scene.set(Scene::Offline);
        let err = fx.controller.capture_once().unwrap_err();
        assert!(matches!(err, KernelError::NoFrame { .. }));
        assert_eq!(sample_count(&fx.store, fx.controller.label()), (0, 0));
        assert_eq!(fx.controller.summary().failed, 1);
    }

    #[test]
    fn armed_controller_records_until_disarmed() -> anyhow::Result<()> {
        let mut fx = fixture(Duration::from_millis(2));
        let label = fx.controller.label();
        fx.controller.arm()?;
        assert_eq!(fx.controller.state(), CaptureState::Armed);

        let started = Instant::now();
        while sample_count(&fx.store, label).0 < 3 && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let summary = fx.controller.disarm();
        assert_eq!(fx.controller.state(), CaptureState::Idle);

        let (frames, vectors) = sample_count(&fx.store, label);
        assert_eq!(frames, vectors);
        assert_eq!(frames as u64, summary.committed);

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(sample_count(&fx.store, label), (frames, vectors));
        Ok(())
    }

    #[test]
    fn tick_failures_are_reported_and_capture_continues() -> anyhow::Result<()> {
        let mut fx = fixture(Duration::from_millis(2));
        let label = fx.controller.label();
        fx.scene.set(Scene::Offline);
        fx.controller.arm()?;

        let started = Instant::now();
        while fx.failures.lock().expect("lock").is_empty()
            && started.elapsed() < Duration::from_secs(5)
        {
            std::thread::sleep(Duration::from_millis(1));
        }
        fx.scene.set(Scene::Solid([10, 10, 200]));
        while sample_count(&fx.store, label).0 == 0 && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let summary = fx.controller.disarm();

        assert!(summary.failed >= 1);
        assert!(summary.committed >= 1);
        let failures = fx.failures.lock().expect("lock");
        assert!(failures[0].starts_with(&format!("capture[{}] NO_FRAME", label)));
        Ok(())
    }

    /// Sleeps in `extract` and records how many calls overlap.
    struct SlowExtractor {
        inner: HistogramExtractor,
        delay: Duration,
        active: AtomicU64,
        peak: AtomicU64,
    }

    impl FeatureExtractor for SlowExtractor {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn input_size(&self) -> InputSize {
            self.inner.input_size()
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn extract(&self, frame: &RasterFrame) -> Result<crate::extract::FeatureVector> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let vector = self.inner.extract(frame);
            self.active.fetch_sub(1, Ordering::SeqCst);
            vector
        }
    }

    #[test]
    fn manual_captures_wait_for_the_armed_tick() -> anyhow::Result<()> {
        let source = SyntheticSource::new(
            SyntheticConfig {
                url: "stub://slow".to_string(),
                width: 16,
                height: 12,
            },
            Scene::Solid([30, 200, 30]),
        );
        let mut store = SampleStore::new();
        let label = store.add_class(Some("slow"));
        let store: SharedStore = Arc::new(RwLock::new(store));
        let extractor = Arc::new(SlowExtractor {
            inner: HistogramExtractor::new(InputSize::square(8)),
            delay: Duration::from_millis(40),
            active: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        });
        let mut controller = CaptureController::new(
            label,
            Duration::from_millis(5),
            share_source(source),
            extractor.clone(),
            store.clone(),
            Arc::new(crate::sink::LogFailureSink),
        );

        controller.arm()?;
        for _ in 0..3 {
            controller.capture_once()?;
        }
        let summary = controller.disarm();

        assert_eq!(extractor.peak.load(Ordering::SeqCst), 1);
        assert!(summary.committed >= 3);
        let (frames, vectors) = sample_count(&store, label);
        assert_eq!(frames, vectors);
        assert_eq!(frames as u64, summary.committed);
        Ok(())
    }

    #[test]
    fn commits_to_a_deleted_class_fail_cleanly() {
        let fx = fixture(Duration::from_millis(10));
        let label = fx.controller.label();
        fx.store.write().expect("write").delete_class(label).expect("delete");
        let err = fx.controller.capture_once().unwrap_err();
        assert!(matches!(err, KernelError::UnknownClass(l) if l == label));
    }
}
