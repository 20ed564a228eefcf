//! Teachable Kernel
//!
//! Teach a small classifier to recognize visual categories from a live frame
//! source: collect labeled samples, fit a trainable head on top of a frozen
//! feature extractor, then classify live frames.
//!
//! # Pipeline
//!
//! Frame source → capture controller → sample store → trainer → trained head
//! → predictor loop → result sink.
//!
//! A [`Session`] owns every piece. Capture and prediction run as periodic
//! tasks with explicit start/stop; training runs in the background and
//! replaces the head as a whole.
//!
//! # Module Structure
//!
//! - `frame`: owned RGB snapshots and the `FrameSource` seam
//! - `ingest`: frame sources (synthetic, still images, V4L2)
//! - `extract`: frozen feature extractors and model loading
//! - `store`: labeled sample classes
//! - `head`, `train`: the trainable head and its fit loop
//! - `capture`, `predict`: periodic capture and live prediction
//! - `session`: the owner tying it together

pub mod capture;
pub mod config;
pub mod error;
pub mod extract;
pub mod frame;
pub mod head;
pub mod ingest;
pub mod predict;
pub mod schedule;
pub mod session;
pub mod sink;
pub mod store;
pub mod train;
pub mod ui;

pub use capture::{CaptureController, CaptureState, CaptureSummary};
pub use error::{Failure, KernelError, Operation, Result};
pub use extract::{
    load_extractor, load_extractor_reporting, ExtractorSettings, FeatureExtractor, FeatureVector,
    HistogramExtractor, InputSize, TensorLayout, BUILTIN_HISTOGRAM,
};
#[cfg(feature = "backend-tract")]
pub use extract::TractExtractor;
pub use frame::{share_source, FrameSource, RasterFrame, SharedFrameSource};
pub use head::{LossKind, TrainedHead};
pub use ingest::{open_source, OpenedSource};
pub use predict::{argmax, PredictionResult, PredictorLoop, PredictorState};
pub use schedule::{PeriodicTask, TaskStats};
pub use session::{Session, SessionSettings, TrainingHandle};
pub use sink::{FailureSink, LogFailureSink, NoProgress, ProgressSink, ResultSink};
pub use store::{ClassLabel, SampleClass, SampleStore, StoreReader};
pub use train::{EpochStats, TrainingConfig, TrainingSet, TrainingSummary};
