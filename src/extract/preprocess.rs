//! Frame preprocessing shared by extractor backends.
//!
//! Frames are letterboxed to the model's input resolution (aspect ratio kept,
//! bilinear resampling, centered on a black canvas) and scaled to [0, 1].

use image::{imageops, RgbImage};
use serde::Deserialize;

use crate::error::{KernelError, Result};
use crate::frame::RasterFrame;

/// Model input resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

impl InputSize {
    pub const fn square(side: u32) -> Self {
        Self {
            width: side,
            height: side,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for InputSize {
    fn default() -> Self {
        Self::square(224)
    }
}

/// Memory layout of the model's input tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, H, W, 3]`, the TensorFlow convention.
    #[default]
    Nhwc,
    /// `[1, 3, H, W]`, the PyTorch/ONNX-export convention.
    Nchw,
}

/// Resize a frame to `size`, padding to keep the aspect ratio.
pub fn letterbox(frame: &RasterFrame, size: InputSize) -> Result<RgbImage> {
    if frame.width() == 0 || frame.height() == 0 || size.width == 0 || size.height == 0 {
        return Err(KernelError::extraction(format!(
            "cannot resize {}x{} frame to {}x{}",
            frame.width(),
            frame.height(),
            size.width,
            size.height
        )));
    }
    let source = frame.to_image()?;

    if (frame.width(), frame.height()) == (size.width, size.height) {
        return Ok(source);
    }

    let (w, h) = (frame.width() as f32, frame.height() as f32);
    let scale = (size.width as f32 / w).min(size.height as f32 / h);
    let new_w = ((w * scale).round() as u32).clamp(1, size.width);
    let new_h = ((h * scale).round() as u32).clamp(1, size.height);
    let scaled = imageops::resize(&source, new_w, new_h, imageops::FilterType::Triangle);

    if (new_w, new_h) == (size.width, size.height) {
        return Ok(scaled);
    }

    let mut canvas = RgbImage::new(size.width, size.height);
    let x_offset = ((size.width - new_w) / 2) as i64;
    let y_offset = ((size.height - new_h) / 2) as i64;
    imageops::overlay(&mut canvas, &scaled, x_offset, y_offset);
    Ok(canvas)
}

/// Interleaved RGB values scaled to [0, 1], row-major (HWC order).
pub fn normalized_pixels(image: &RgbImage) -> Vec<f32> {
    image.as_raw().iter().map(|&v| v as f32 / 255.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_pads_wide_frames_vertically() -> anyhow::Result<()> {
        let frame = RasterFrame::solid(40, 20, [255, 255, 255])?;
        let boxed = letterbox(&frame, InputSize::square(20))?;
        assert_eq!(boxed.dimensions(), (20, 20));
        // top rows are padding, center row is content
        assert_eq!(boxed.get_pixel(10, 0).0, [0, 0, 0]);
        assert_eq!(boxed.get_pixel(10, 10).0, [255, 255, 255]);
        Ok(())
    }

    #[test]
    fn matching_frames_pass_through() -> anyhow::Result<()> {
        let frame = RasterFrame::solid(8, 8, [3, 4, 5])?;
        let boxed = letterbox(&frame, InputSize::square(8))?;
        assert_eq!(boxed.as_raw(), frame.pixels());
        Ok(())
    }

    #[test]
    fn normalization_maps_to_unit_range() -> anyhow::Result<()> {
        let frame = RasterFrame::solid(1, 1, [0, 51, 255])?;
        let values = normalized_pixels(&frame.to_image()?);
        assert_eq!(values, vec![0.0, 0.2, 1.0]);
        Ok(())
    }
}
