//! Error taxonomy for the collect → train → predict pipeline.
//!
//! Every failure carries a stable `code()` so callers can attribute it without
//! matching on message text. Tick-level failures are wrapped in a [`Failure`]
//! that names the operation that produced them.

use std::fmt;

use thiserror::Error;

use crate::store::ClassLabel;

/// Errors produced by the kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A frame could not be turned into a feature vector.
    #[error("feature extraction failed: {0:#}")]
    Extraction(anyhow::Error),

    /// The feature extractor could not be loaded or warmed up.
    #[error("model load failed: {0:#}")]
    ModelLoad(anyhow::Error),

    /// Training was requested without enough classes or samples.
    #[error("insufficient training data: {0}")]
    InsufficientData(String),

    /// Numerical or resource failure while fitting the head.
    #[error("training failed: {0:#}")]
    Training(anyhow::Error),

    /// The frame source has no frame to hand out.
    #[error("no frame available from {source_name}")]
    NoFrame { source_name: String },

    /// A frame was constructed from inconsistent dimensions or buffers.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A second training run was requested while one is in flight.
    #[error("a training run is already in progress")]
    TrainingInProgress,

    /// The class label does not exist in the sample store.
    #[error("unknown class {0}")]
    UnknownClass(ClassLabel),

    /// A shared lock was poisoned by a panicking holder.
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    /// A periodic task or training thread could not be started.
    #[error("could not start worker: {0:#}")]
    Worker(anyhow::Error),
}

impl KernelError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            KernelError::Extraction(_) => "EXTRACTION_FAILED",
            KernelError::ModelLoad(_) => "MODEL_LOAD_FAILED",
            KernelError::InsufficientData(_) => "INSUFFICIENT_DATA",
            KernelError::Training(_) => "TRAINING_FAILED",
            KernelError::NoFrame { .. } => "NO_FRAME",
            KernelError::InvalidFrame(_) => "INVALID_FRAME",
            KernelError::TrainingInProgress => "TRAINING_IN_PROGRESS",
            KernelError::UnknownClass(_) => "UNKNOWN_CLASS",
            KernelError::LockPoisoned(_) => "LOCK_POISONED",
            KernelError::Worker(_) => "WORKER_FAILED",
        }
    }

    pub(crate) fn extraction(message: impl fmt::Display) -> Self {
        KernelError::Extraction(anyhow::anyhow!("{}", message))
    }

    pub(crate) fn training(message: impl fmt::Display) -> Self {
        KernelError::Training(anyhow::anyhow!("{}", message))
    }

    pub(crate) fn no_frame(source_name: impl Into<String>) -> Self {
        KernelError::NoFrame {
            source_name: source_name.into(),
        }
    }
}

pub type Result<T, E = KernelError> = std::result::Result<T, E>;

/// The user-visible operation a failure is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Capture { label: ClassLabel },
    Predict,
    Train,
    LoadModel,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Capture { label } => write!(f, "capture[{}]", label),
            Operation::Predict => f.write_str("predict"),
            Operation::Train => f.write_str("train"),
            Operation::LoadModel => f.write_str("load-model"),
        }
    }
}

/// A discrete, attributable failure event.
#[derive(Debug)]
pub struct Failure {
    pub operation: Operation,
    pub error: KernelError,
}

impl Failure {
    pub fn new(operation: Operation, error: KernelError) -> Self {
        Self { operation, error }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.operation, self.error.code(), self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_display_names_operation_and_code() {
        let failure = Failure::new(
            Operation::Capture {
                label: ClassLabel(3),
            },
            KernelError::no_frame("stub://camera"),
        );
        let text = failure.to_string();
        assert!(text.starts_with("capture[3] NO_FRAME"));
        assert!(text.contains("stub://camera"));
    }

    #[test]
    fn wrapped_causes_keep_their_chain() {
        let cause = anyhow::anyhow!("tensor shape mismatch").context("forward pass");
        let err = KernelError::Training(cause);
        assert_eq!(err.code(), "TRAINING_FAILED");
        assert!(err.to_string().contains("forward pass"));
        assert!(err.to_string().contains("tensor shape mismatch"));
    }
}
