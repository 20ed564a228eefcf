use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;

use crate::error::{Failure, KernelError, Operation, Result};
use crate::sink::FailureSink;

use super::backend::FeatureExtractor;
use super::backends::HistogramExtractor;
use super::preprocess::{InputSize, TensorLayout};

/// Model reference selecting the built-in color-statistics embedding.
pub const BUILTIN_HISTOGRAM: &str = "builtin:histogram";

/// How to find and feed the frozen embedding model.
#[derive(Clone, Debug)]
pub struct ExtractorSettings {
    /// Opaque model reference: `builtin:histogram`, a local ONNX path, or an
    /// http(s) URL.
    pub reference: String,
    pub input: InputSize,
    pub layout: TensorLayout,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            reference: BUILTIN_HISTOGRAM.to_string(),
            input: InputSize::default(),
            layout: TensorLayout::default(),
        }
    }
}

/// Load the feature extractor named by `settings.reference` and warm it up.
///
/// Every failure, including a failed warm-up pass, is a `ModelLoad` error.
pub fn load_extractor(settings: &ExtractorSettings) -> Result<Arc<dyn FeatureExtractor>> {
    let started = Instant::now();
    let extractor = resolve(settings).map_err(KernelError::ModelLoad)?;

    let warm = extractor.warm_up().map_err(|e| {
        KernelError::ModelLoad(anyhow!("warm-up of {} failed: {}", settings.reference, e))
    })?;
    log::info!(
        "feature extractor {} ({}) ready: {}x{} input, {}-wide embedding, warm-up {}ms",
        settings.reference,
        extractor.name(),
        settings.input.width,
        settings.input.height,
        warm.len(),
        started.elapsed().as_millis()
    );
    Ok(extractor)
}

/// `load_extractor`, reporting a failure to `failures` as a `load-model`
/// event before returning it.
pub fn load_extractor_reporting(
    settings: &ExtractorSettings,
    failures: &dyn FailureSink,
) -> Result<Arc<dyn FeatureExtractor>> {
    load_extractor(settings).map_err(|error| {
        let failure = Failure::new(Operation::LoadModel, error);
        failures.on_failure(&failure);
        failure.error
    })
}

fn resolve(settings: &ExtractorSettings) -> anyhow::Result<Arc<dyn FeatureExtractor>> {
    let reference = settings.reference.trim();
    if reference.is_empty() {
        return Err(anyhow!("model reference is empty"));
    }
    if reference == BUILTIN_HISTOGRAM {
        return Ok(Arc::new(HistogramExtractor::new(settings.input)));
    }
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return fetch_remote(reference, settings);
    }
    if reference.contains("://") || reference.starts_with("builtin:") {
        return Err(anyhow!("unsupported model reference {}", reference));
    }
    load_local(reference, settings)
}

#[cfg(feature = "backend-tract")]
fn load_local(path: &str, settings: &ExtractorSettings) -> anyhow::Result<Arc<dyn FeatureExtractor>> {
    let extractor = super::backends::TractExtractor::from_path(path, settings.input, settings.layout)?;
    Ok(Arc::new(extractor))
}

#[cfg(not(feature = "backend-tract"))]
fn load_local(path: &str, _settings: &ExtractorSettings) -> anyhow::Result<Arc<dyn FeatureExtractor>> {
    Err(anyhow!(
        "loading model {} requires the backend-tract feature",
        path
    ))
}

#[cfg(feature = "model-fetch")]
fn fetch_remote(
    reference: &str,
    settings: &ExtractorSettings,
) -> anyhow::Result<Arc<dyn FeatureExtractor>> {
    use anyhow::Context;
    use std::io::Read;

    let url = url::Url::parse(reference).with_context(|| format!("invalid model URL {}", reference))?;
    log::info!("fetching model from {}", url);
    let response = ureq::get(url.as_str())
        .call()
        .with_context(|| format!("GET {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut bytes)
        .with_context(|| format!("read model body from {}", url))?;
    log::debug!("fetched {} bytes of model data", bytes.len());

    let extractor = super::backends::TractExtractor::from_reader(
        &mut std::io::Cursor::new(bytes),
        settings.input,
        settings.layout,
    )?;
    Ok(Arc::new(extractor))
}

#[cfg(not(feature = "model-fetch"))]
fn fetch_remote(
    reference: &str,
    _settings: &ExtractorSettings,
) -> anyhow::Result<Arc<dyn FeatureExtractor>> {
    Err(anyhow!(
        "fetching model {} requires the model-fetch feature",
        reference
    ))
}
