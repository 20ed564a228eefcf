#![cfg(feature = "backend-tract")]

use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, Context};
use ndarray::Array1;
use tract_onnx::prelude::*;

use crate::error::{KernelError, Result};
use crate::extract::backend::FeatureExtractor;
use crate::extract::preprocess::{letterbox, normalized_pixels, InputSize, TensorLayout};
use crate::extract::FeatureVector;
use crate::frame::RasterFrame;

/// Tract-based backend for frozen ONNX embedding models.
///
/// The model must take a single f32 image tensor and produce a single
/// embedding tensor with a batch dimension of 1. Everything after the batch
/// dimension is flattened into the feature vector.
pub struct TractExtractor {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input: InputSize,
    layout: TensorLayout,
    dimension: OnceLock<usize>,
}

impl TractExtractor {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn from_path<P: AsRef<Path>>(
        model_path: P,
        input: InputSize,
        layout: TensorLayout,
    ) -> anyhow::Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?;
        Self::prepare(model, input, layout)
    }

    /// Load an ONNX model from an in-memory reader (e.g., a fetched download).
    pub fn from_reader<R: Read>(
        reader: &mut R,
        input: InputSize,
        layout: TensorLayout,
    ) -> anyhow::Result<Self> {
        let model = tract_onnx::onnx()
            .model_for_read(reader)
            .context("failed to parse ONNX model")?;
        Self::prepare(model, input, layout)
    }

    fn prepare(model: InferenceModel, input: InputSize, layout: TensorLayout) -> anyhow::Result<Self> {
        let (w, h) = (input.width as usize, input.height as usize);
        let shape = match layout {
            TensorLayout::Nhwc => tvec!(1, h, w, 3),
            TensorLayout::Nchw => tvec!(1, 3, h, w),
        };
        let model = model
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), shape))
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input,
            layout,
            dimension: OnceLock::new(),
        })
    }

    fn build_input(&self, frame: &RasterFrame) -> Result<Tensor> {
        let image = letterbox(frame, self.input)?;
        let values = normalized_pixels(&image);
        let (w, h) = (self.input.width as usize, self.input.height as usize);

        let tensor = match self.layout {
            TensorLayout::Nhwc => {
                tract_ndarray::Array4::from_shape_fn((1, h, w, 3), |(_, y, x, c)| {
                    values[(y * w + x) * 3 + c]
                })
                .into_tensor()
            }
            TensorLayout::Nchw => {
                tract_ndarray::Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
                    values[(y * w + x) * 3 + c]
                })
                .into_tensor()
            }
        };
        Ok(tensor)
    }

    fn squeeze_output(outputs: TVec<TValue>) -> anyhow::Result<Vec<f32>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        if view.shape().first().copied().unwrap_or(0) != 1 {
            return Err(anyhow!("expected batch size 1, got shape {:?}", view.shape()));
        }
        Ok(view.iter().copied().collect())
    }
}

impl FeatureExtractor for TractExtractor {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_size(&self) -> InputSize {
        self.input
    }

    fn dimension(&self) -> usize {
        self.dimension.get().copied().unwrap_or(0)
    }

    fn extract(&self, frame: &RasterFrame) -> Result<FeatureVector> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into_tvalue()))
            .context("ONNX inference failed")
            .map_err(KernelError::Extraction)?;
        let values = Self::squeeze_output(outputs).map_err(KernelError::Extraction)?;

        let width = *self.dimension.get_or_init(|| values.len());
        if values.len() != width {
            return Err(KernelError::extraction(format!(
                "embedding width changed from {} to {}",
                width,
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(KernelError::extraction("embedding contains non-finite values"));
        }
        Ok(Array1::from(values))
    }
}
