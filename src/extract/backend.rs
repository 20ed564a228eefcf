use crate::error::{KernelError, Result};
use crate::frame::RasterFrame;

use super::preprocess::InputSize;
use super::FeatureVector;

/// Feature extractor backend trait.
///
/// Implementations wrap a frozen model: `extract` is a pure function of the
/// pixel content and never mutates the extractor, so one instance can be
/// shared by capture and predict ticks at the same time.
pub trait FeatureExtractor: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Resolution frames are resized to before the forward pass.
    fn input_size(&self) -> InputSize;

    /// Width of the produced embedding. Zero until known (see `warm_up`).
    fn dimension(&self) -> usize;

    /// Run the frozen forward pass on one frame.
    fn extract(&self, frame: &RasterFrame) -> Result<FeatureVector>;

    /// One dummy forward pass on an all-zero frame.
    fn warm_up(&self) -> Result<FeatureVector> {
        let size = self.input_size();
        let blank = RasterFrame::solid(size.width, size.height, [0, 0, 0])?;
        let vector = self.extract(&blank)?;
        if vector.is_empty() {
            return Err(KernelError::extraction(format!(
                "{} produced an empty embedding during warm-up",
                self.name()
            )));
        }
        Ok(vector)
    }
}
