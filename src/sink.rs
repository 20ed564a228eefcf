//! Callbacks the kernel reports through.
//!
//! The surrounding application implements these (a UI, a CLI, a test). Plain
//! closures work for all three.

use crate::error::Failure;
use crate::predict::PredictionResult;
use crate::train::EpochStats;

/// Receives per-epoch training progress.
pub trait ProgressSink: Send + Sync {
    fn on_epoch(&self, epoch: usize, loss: f32);

    /// Full statistics for a finished epoch. Defaults to `on_epoch`.
    fn on_epoch_stats(&self, stats: &EpochStats) {
        self.on_epoch(stats.epoch, stats.loss);
    }
}

impl<F> ProgressSink for F
where
    F: Fn(usize, f32) + Send + Sync,
{
    fn on_epoch(&self, epoch: usize, loss: f32) {
        self(epoch, loss)
    }
}

/// Receives one result per predict tick.
pub trait ResultSink: Send + Sync {
    fn on_prediction(&self, result: &PredictionResult);
}

impl<F> ResultSink for F
where
    F: Fn(&PredictionResult) + Send + Sync,
{
    fn on_prediction(&self, result: &PredictionResult) {
        self(result)
    }
}

/// Receives attributable failure events from ticks and training runs.
pub trait FailureSink: Send + Sync {
    fn on_failure(&self, failure: &Failure);
}

impl<F> FailureSink for F
where
    F: Fn(&Failure) + Send + Sync,
{
    fn on_failure(&self, failure: &Failure) {
        self(failure)
    }
}

/// Failure sink that writes to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogFailureSink;

impl FailureSink for LogFailureSink {
    fn on_failure(&self, failure: &Failure) {
        log::warn!("{}", failure);
    }
}

/// Progress sink that discards every update.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_epoch(&self, _epoch: usize, _loss: f32) {}
}
