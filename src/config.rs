use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::extract::{ExtractorSettings, InputSize, TensorLayout, BUILTIN_HISTOGRAM};
use crate::session::SessionSettings;
use crate::train::TrainingConfig;

const DEFAULT_INPUT_SIDE: u32 = 224;
const DEFAULT_SOURCE_URL: &str = "stub://camera";
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_CAPTURE_INTERVAL_MS: u64 = 40;
const DEFAULT_PREDICT_INTERVAL_MS: u64 = 100;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SessionConfigFile {
    model: Option<ModelConfigFile>,
    source: Option<SourceConfigFile>,
    capture: Option<IntervalConfigFile>,
    predict: Option<IntervalConfigFile>,
    training: Option<TrainingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ModelConfigFile {
    reference: Option<String>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    layout: Option<TensorLayout>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct IntervalConfigFile {
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrainingConfigFile {
    epochs: Option<usize>,
    batch_size: Option<usize>,
    learning_rate: Option<f32>,
    hidden_units: Option<usize>,
    seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: ExtractorSettings,
    pub source: SourceSettings,
    pub capture_interval: Duration,
    pub predict_interval: Duration,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

impl SessionConfig {
    /// File named by `TEACHABLE_CONFIG` (if any), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TEACHABLE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file instead of `TEACHABLE_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            capture_interval: self.capture_interval,
            predict_interval: self.predict_interval,
            training: self.training.clone(),
        }
    }

    fn from_file(file: SessionConfigFile) -> Self {
        let model = file.model.unwrap_or_default();
        let source = file.source.unwrap_or_default();
        let training = file.training.unwrap_or_default();
        let defaults = TrainingConfig::default();
        Self {
            model: ExtractorSettings {
                reference: model
                    .reference
                    .unwrap_or_else(|| BUILTIN_HISTOGRAM.to_string()),
                input: InputSize {
                    width: model.input_width.unwrap_or(DEFAULT_INPUT_SIDE),
                    height: model.input_height.unwrap_or(DEFAULT_INPUT_SIDE),
                },
                layout: model.layout.unwrap_or_default(),
            },
            source: SourceSettings {
                url: source
                    .url
                    .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
            },
            capture_interval: Duration::from_millis(
                file.capture
                    .and_then(|capture| capture.interval_ms)
                    .unwrap_or(DEFAULT_CAPTURE_INTERVAL_MS),
            ),
            predict_interval: Duration::from_millis(
                file.predict
                    .and_then(|predict| predict.interval_ms)
                    .unwrap_or(DEFAULT_PREDICT_INTERVAL_MS),
            ),
            training: TrainingConfig {
                epochs: training.epochs.unwrap_or(defaults.epochs),
                batch_size: training.batch_size.unwrap_or(defaults.batch_size),
                learning_rate: training.learning_rate.unwrap_or(defaults.learning_rate),
                hidden_units: training.hidden_units.unwrap_or(defaults.hidden_units),
                seed: training.seed,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(reference) = std::env::var("TEACHABLE_MODEL_REF") {
            if !reference.trim().is_empty() {
                self.model.reference = reference;
            }
        }
        if let Ok(url) = std::env::var("TEACHABLE_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Some(epochs) = env_number("TEACHABLE_EPOCHS")? {
            self.training.epochs = epochs;
        }
        if let Some(batch_size) = env_number("TEACHABLE_BATCH_SIZE")? {
            self.training.batch_size = batch_size;
        }
        if let Some(learning_rate) = env_number("TEACHABLE_LEARNING_RATE")? {
            self.training.learning_rate = learning_rate;
        }
        if let Some(ms) = env_number("TEACHABLE_CAPTURE_INTERVAL_MS")? {
            self.capture_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("TEACHABLE_PREDICT_INTERVAL_MS")? {
            self.predict_interval = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.model.reference.trim().is_empty() {
            return Err(anyhow!("model reference must not be empty"));
        }
        if self.model.input.width == 0 || self.model.input.height == 0 {
            return Err(anyhow!("model input size must be greater than zero"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source size must be greater than zero"));
        }
        if self.capture_interval.is_zero() || self.predict_interval.is_zero() {
            return Err(anyhow!("capture and predict intervals must be greater than zero"));
        }
        let training = &self.training;
        if training.epochs == 0 || training.batch_size == 0 || training.hidden_units == 0 {
            return Err(anyhow!(
                "epochs, batch size and hidden units must be greater than zero"
            ));
        }
        if !training.learning_rate.is_finite() || training.learning_rate <= 0.0 {
            return Err(anyhow!("learning rate must be a positive number"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<SessionConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a number, got {:?}", key, value)),
        _ => Ok(None),
    }
}
