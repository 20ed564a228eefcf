pub mod histogram;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use histogram::{HistogramExtractor, HISTOGRAM_DIMENSION};

#[cfg(feature = "backend-tract")]
pub use tract::TractExtractor;
