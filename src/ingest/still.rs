//! Still-image frame source.
//!
//! `StillImageSource` replays local image files as if they were camera frames,
//! cycling through a single file or every image in a directory (sorted by
//! name). It only reads local paths; URL schemes are rejected.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use crate::error::{KernelError, Result};
use crate::frame::{FrameSource, RasterFrame};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Configuration for a still-image source.
#[derive(Clone, Debug, Default)]
pub struct StillConfig {
    /// Local file or directory path.
    pub path: String,
}

/// Statistics for a still-image source.
#[derive(Clone, Debug)]
pub struct StillStats {
    pub frames_captured: u64,
    pub files: usize,
    pub path: String,
}

pub struct StillImageSource {
    config: StillConfig,
    files: Vec<PathBuf>,
    cursor: usize,
    frame_count: u64,
}

impl StillImageSource {
    pub fn new(config: StillConfig) -> anyhow::Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "still-image ingestion only supports local paths (no URL schemes)"
            ));
        }
        let files = collect_images(Path::new(&config.path))?;
        if files.is_empty() {
            return Err(anyhow!("no images found under {}", config.path));
        }
        log::info!(
            "StillImageSource: {} image(s) under {}",
            files.len(),
            config.path
        );
        Ok(Self {
            config,
            files,
            cursor: 0,
            frame_count: 0,
        })
    }

    pub fn stats(&self) -> StillStats {
        StillStats {
            frames_captured: self.frame_count,
            files: self.files.len(),
            path: self.config.path.clone(),
        }
    }
}

impl FrameSource for StillImageSource {
    fn name(&self) -> &str {
        &self.config.path
    }

    fn snapshot(&mut self) -> Result<RasterFrame> {
        let Some(path) = self.files.get(self.cursor) else {
            return Err(KernelError::no_frame(&self.config.path));
        };
        let decoded = image::open(path)
            .with_context(|| format!("decode {}", path.display()))
            .map_err(|e| {
                log::warn!("StillImageSource: {:#}", e);
                KernelError::no_frame(&self.config.path)
            })?;
        self.cursor = (self.cursor + 1) % self.files.len();
        self.frame_count += 1;
        RasterFrame::from_image(decoded.to_rgb8())
    }
}

fn collect_images(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(path).with_context(|| format!("read {}", path.display()))? {
        let entry_path = entry?.path();
        let is_image = entry_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if entry_path.is_file() && is_image {
            files.push(entry_path);
        }
    }
    files.sort();
    Ok(files)
}

fn is_local_file_path(path: &str) -> bool {
    !path.trim().is_empty() && !path.contains("://")
}
