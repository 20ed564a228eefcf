use anyhow::{anyhow, Result};

/// Pixel layouts a frame source may deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Rgba32,
    Yuyv,
    Nv12,
}

pub fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    let area = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    match format {
        PixelFormat::Rgb24 => {
            expect_len(pixels, area.checked_mul(3), "RGB")?;
            Ok(pixels.to_vec())
        }
        PixelFormat::Rgba32 => {
            expect_len(pixels, area.checked_mul(4), "RGBA")?;
            Ok(pixels
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect())
        }
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, area),
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height),
    }
}

fn expect_len(pixels: &[u8], expected: Option<usize>, label: &str) -> Result<()> {
    let expected = expected.ok_or_else(|| anyhow!("{} frame dimensions overflow", label))?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "{} frame length mismatch: expected {}, got {}",
            label,
            expected,
            pixels.len()
        ));
    }
    Ok(())
}

fn yuyv_to_rgb(pixels: &[u8], area: usize) -> Result<Vec<u8>> {
    if area % 2 != 0 {
        return Err(anyhow!("YUYV frames need an even pixel count"));
    }
    expect_len(pixels, area.checked_mul(2), "YUYV")?;

    let mut rgb = Vec::with_capacity(area * 3);
    for quad in pixels.chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0], quad[2]] {
            rgb.extend_from_slice(&yuv_to_rgb(y as f32, u, v));
        }
    }
    Ok(rgb)
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    expect_len(pixels, y_plane.checked_add(y_plane / 2), "NV12")?;

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }

    Ok(rgb)
}

fn yuv_to_rgb(y: f32, u: f32, v: f32) -> [u8; 3] {
    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;
    [clamp_to_u8(r), clamp_to_u8(g), clamp_to_u8(b)]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
