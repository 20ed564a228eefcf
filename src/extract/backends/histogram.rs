use ndarray::Array1;

use crate::error::Result;
use crate::extract::backend::FeatureExtractor;
use crate::extract::preprocess::{letterbox, normalized_pixels, InputSize};
use crate::extract::FeatureVector;
use crate::frame::RasterFrame;

const GRID: usize = 4;
const LUMA_BINS: usize = 16;

/// Width of the histogram embedding: per-cell RGB means plus luminance bins.
pub const HISTOGRAM_DIMENSION: usize = GRID * GRID * 3 + LUMA_BINS;

/// CPU embedding built from coarse color statistics.
///
/// Not a learned model: it summarizes a letterboxed frame as the mean color
/// of each cell in a 4x4 grid followed by a normalized 16-bin luminance
/// histogram. Deterministic and cheap, which makes it the default backend for
/// tests and synthetic sources.
#[derive(Clone, Debug)]
pub struct HistogramExtractor {
    input: InputSize,
}

impl HistogramExtractor {
    pub fn new(input: InputSize) -> Self {
        Self { input }
    }
}

impl Default for HistogramExtractor {
    fn default() -> Self {
        Self::new(InputSize::square(64))
    }
}

impl FeatureExtractor for HistogramExtractor {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn input_size(&self) -> InputSize {
        self.input
    }

    fn dimension(&self) -> usize {
        HISTOGRAM_DIMENSION
    }

    fn extract(&self, frame: &RasterFrame) -> Result<FeatureVector> {
        let image = letterbox(frame, self.input)?;
        let values = normalized_pixels(&image);
        let width = self.input.width as usize;
        let height = self.input.height as usize;

        let mut cell_sums = [[0.0f32; 3]; GRID * GRID];
        let mut cell_counts = [0u32; GRID * GRID];
        let mut luma = [0.0f32; LUMA_BINS];

        for (i, px) in values.chunks_exact(3).enumerate() {
            let (x, y) = (i % width, i / width);
            let cell = (y * GRID / height) * GRID + (x * GRID / width);
            for (sum, v) in cell_sums[cell].iter_mut().zip(px) {
                *sum += v;
            }
            cell_counts[cell] += 1;

            let l = 0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2];
            let bin = ((l * LUMA_BINS as f32) as usize).min(LUMA_BINS - 1);
            luma[bin] += 1.0;
        }

        let mut features = Vec::with_capacity(HISTOGRAM_DIMENSION);
        for (sums, &count) in cell_sums.iter().zip(&cell_counts) {
            let count = count.max(1) as f32;
            features.extend(sums.iter().map(|s| s / count));
        }
        let total = self.input.pixel_count().max(1) as f32;
        features.extend(luma.iter().map(|c| c / total));

        Ok(Array1::from(features))
    }
}
