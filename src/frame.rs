//! Raster frames and the frame source boundary.
//!
//! - `RasterFrame`: owned RGB8 snapshot of one video frame.
//! - `FrameSource`: anything that can hand out the current frame on demand.
//! - `SharedFrameSource`: the handle capture and prediction ticks grab
//!   independently; each tick takes its own snapshot and releases it.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use image::RgbImage;

use crate::error::{KernelError, Result};
use crate::ingest::normalize::{normalize_to_rgb, PixelFormat};

/// Owned RGB8 pixels for a single frame.
///
/// Frames kept in the sample store are wrapped in `Arc` so prediction results
/// can reference a representative image without copying it.
#[derive(Clone, Debug)]
pub struct RasterFrame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    captured_at: Instant,
}

impl RasterFrame {
    /// Build a frame from tightly packed RGB8 pixels.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(KernelError::InvalidFrame(format!(
                "zero-size frame {}x{}",
                width, height
            )));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| KernelError::InvalidFrame("frame dimensions overflow".into()))?;
        if data.len() != expected {
            return Err(KernelError::InvalidFrame(format!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    /// Build a frame from pixels in another layout (RGBA, YUYV, NV12).
    pub fn from_pixels(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let rgb = normalize_to_rgb(pixels, width, height, format)
            .map_err(|e| KernelError::InvalidFrame(format!("{:#}", e)))?;
        Self::from_rgb(rgb, width, height)
    }

    /// Build a frame from a decoded `image` buffer.
    pub fn from_image(image: RgbImage) -> Result<Self> {
        let (width, height) = image.dimensions();
        Self::from_rgb(image.into_raw(), width, height)
    }

    /// A frame filled with a single color.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let count = (width as usize).saturating_mul(height as usize);
        let data = rgb.iter().copied().cycle().take(count * 3).collect();
        Self::from_rgb(data, width, height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Packed RGB8 pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Borrow the pixels as an `image` buffer (copies).
    pub fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| KernelError::InvalidFrame("pixel buffer does not match dimensions".into()))
    }

    /// Instant the frame was snapshotted.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// A live video source that produces a snapshot on demand.
pub trait FrameSource: Send {
    /// Source identifier, used in logs and `NoFrame` errors.
    fn name(&self) -> &str;

    /// Grab the current frame. Fails with `KernelError::NoFrame` when the source
    /// is not ready.
    fn snapshot(&mut self) -> Result<RasterFrame>;

    /// Returns true when the source is currently producing frames.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Frame source shared between capture and predict ticks.
pub type SharedFrameSource = Arc<Mutex<dyn FrameSource>>;

/// Wrap a source for sharing across periodic tasks.
pub fn share_source<S: FrameSource + 'static>(source: S) -> SharedFrameSource {
    Arc::new(Mutex::new(source))
}

/// Take one snapshot from a shared source. The lock is held only for the grab.
///
/// A source that hands out an unusable frame (zero-size canvas, short buffer)
/// fails the tick with `Extraction`; `NoFrame` passes through unchanged.
pub fn snapshot_shared(source: &SharedFrameSource) -> Result<RasterFrame> {
    let mut guard = source
        .lock()
        .map_err(|_| KernelError::LockPoisoned("frame source"))?;
    match guard.snapshot() {
        Err(KernelError::InvalidFrame(reason)) => Err(KernelError::extraction(format!(
            "{} produced an unusable frame: {}",
            guard.name(),
            reason
        ))),
        other => other,
    }
}
