//! Frozen feature extraction.
//!
//! A `FeatureExtractor` turns a raster frame into a fixed-length embedding.
//! Backends are selected by an opaque model reference at load time and are
//! warmed up once before the first live tick.

mod backend;
pub mod backends;
mod loader;
pub mod preprocess;

pub use backend::FeatureExtractor;
pub use backends::HistogramExtractor;
#[cfg(feature = "backend-tract")]
pub use backends::TractExtractor;
pub use loader::{load_extractor, load_extractor_reporting, ExtractorSettings, BUILTIN_HISTOGRAM};
pub use preprocess::{InputSize, TensorLayout};

/// Fixed-length embedding of one frame.
pub type FeatureVector = ndarray::Array1<f32>;
