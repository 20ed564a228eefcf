//! Synthetic frame source (`stub://`).
//!
//! Generates frames from a controllable scene so tests and the demo binary can
//! run the whole pipeline without a camera. The scene is switched through a
//! `SceneHandle`, which plays the role of "pointing the camera at something".

use std::sync::{Arc, Mutex};

use crate::error::{KernelError, Result};
use crate::frame::{FrameSource, RasterFrame};

/// Configuration for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Source URL (e.g., "stub://camera").
    pub url: String,
    pub width: u32,
    pub height: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            width: 640,
            height: 480,
        }
    }
}

/// What the synthetic camera is looking at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scene {
    /// Camera not ready; snapshots fail with `NoFrame`.
    Offline,
    Solid([u8; 3]),
    /// Vertical stripes alternating between two colors.
    Stripes {
        a: [u8; 3],
        b: [u8; 3],
        period: u32,
    },
    /// Horizontal luminance ramp.
    Gradient,
}

/// Shared control over the scene of a `SyntheticSource`.
#[derive(Clone, Debug)]
pub struct SceneHandle {
    scene: Arc<Mutex<Scene>>,
}

impl SceneHandle {
    pub fn set(&self, scene: Scene) {
        if let Ok(mut guard) = self.scene.lock() {
            *guard = scene;
        }
    }

    pub fn get(&self) -> Scene {
        self.scene.lock().map(|g| *g).unwrap_or(Scene::Offline)
    }
}

/// Statistics for a synthetic source.
#[derive(Clone, Debug)]
pub struct SyntheticStats {
    pub frames_captured: u64,
    pub url: String,
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    scene: SceneHandle,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig, initial: Scene) -> Self {
        Self {
            config,
            scene: SceneHandle {
                scene: Arc::new(Mutex::new(initial)),
            },
            frame_count: 0,
        }
    }

    pub fn scene_handle(&self) -> SceneHandle {
        self.scene.clone()
    }

    pub fn stats(&self) -> SyntheticStats {
        SyntheticStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }

    /// Render one frame of the given scene.
    ///
    /// A small brightness jitter keyed on the frame counter keeps consecutive
    /// frames from being byte-identical, like sensor noise would.
    fn render(&self, scene: Scene) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let jitter = (self.frame_count % 3) as u8;
        let mut pixels = Vec::with_capacity(width * height * 3);
        for _y in 0..height {
            for x in 0..width {
                let rgb = match scene {
                    Scene::Offline => [0, 0, 0],
                    Scene::Solid(rgb) => rgb,
                    Scene::Stripes { a, b, period } => {
                        if (x as u32 / period.max(1)) % 2 == 0 {
                            a
                        } else {
                            b
                        }
                    }
                    Scene::Gradient => {
                        let v = ((x * 255) / width.max(1)) as u8;
                        [v, v, v]
                    }
                };
                pixels.extend(rgb.iter().map(|c| c.saturating_add(jitter)));
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.config.url
    }

    fn snapshot(&mut self) -> Result<RasterFrame> {
        let scene = self.scene.get();
        if scene == Scene::Offline {
            return Err(KernelError::no_frame(&self.config.url));
        }
        self.frame_count += 1;
        let pixels = self.render(scene);
        RasterFrame::from_rgb(pixels, self.config.width, self.config.height)
    }

    fn is_healthy(&self) -> bool {
        self.scene.get() != Scene::Offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SyntheticConfig {
        SyntheticConfig {
            url: "stub://test".to_string(),
            width: 8,
            height: 4,
        }
    }

    #[test]
    fn synthetic_source_produces_frames() -> anyhow::Result<()> {
        let mut source = SyntheticSource::new(small_config(), Scene::Solid([200, 0, 0]));
        let frame = source.snapshot()?;
        assert_eq!(frame.width(), 8);
        assert_eq!(frame.height(), 4);
        assert_eq!(source.stats().frames_captured, 1);
        Ok(())
    }

    #[test]
    fn offline_scene_reports_no_frame() {
        let mut source = SyntheticSource::new(small_config(), Scene::Offline);
        let err = source.snapshot().unwrap_err();
        assert_eq!(err.code(), "NO_FRAME");
        assert!(!source.is_healthy());
    }

    #[test]
    fn scene_handle_switches_content() -> anyhow::Result<()> {
        let mut source = SyntheticSource::new(small_config(), Scene::Solid([0, 0, 200]));
        let handle = source.scene_handle();
        let blue = source.snapshot()?;
        handle.set(Scene::Solid([200, 0, 0]));
        let red = source.snapshot()?;
        assert!(blue.pixels()[2] >= 200);
        assert!(red.pixels()[0] >= 200);
        Ok(())
    }

    #[test]
    fn stripes_alternate_by_period() -> anyhow::Result<()> {
        let mut source = SyntheticSource::new(
            small_config(),
            Scene::Stripes {
                a: [10, 10, 10],
                b: [240, 240, 240],
                period: 2,
            },
        );
        let frame = source.snapshot()?;
        let row: Vec<u8> = frame.pixels()[..24].chunks(3).map(|px| px[0]).collect();
        assert!(row[0] < 20 && row[1] < 20);
        assert!(row[2] > 200 && row[3] > 200);
        Ok(())
    }
}
