//! Frame ingestion sources.
//!
//! This module provides different sources for live frames:
//! - Synthetic scenes (`stub://`), for tests and demos
//! - Local still images (a file or a directory of files)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! All sources implement `FrameSource` and hand out owned `RasterFrame`
//! snapshots. The ingestion layer MUST NOT retain frames after handing them
//! out; whoever takes the snapshot decides whether it is kept.

pub mod normalize;
pub mod still;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};

pub use still::{StillConfig, StillImageSource};
pub use synthetic::{Scene, SceneHandle, SyntheticConfig, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

use crate::frame::{share_source, SharedFrameSource};

/// An opened source, plus the scene control when the source is synthetic.
pub struct OpenedSource {
    pub source: SharedFrameSource,
    pub scene: Option<SceneHandle>,
}

/// Open a frame source from its URL.
///
/// - `stub://name`: synthetic scene, initially a mid-gray frame
/// - `v4l2:///dev/videoN`: V4L2 device (feature `ingest-v4l2`)
/// - anything else without a scheme: local image file or directory
pub fn open_source(url: &str, width: u32, height: u32) -> Result<OpenedSource> {
    if url.starts_with("stub://") {
        let source = SyntheticSource::new(
            SyntheticConfig {
                url: url.to_string(),
                width,
                height,
            },
            Scene::Solid([128, 128, 128]),
        );
        let scene = source.scene_handle();
        log::info!("frame source: connected to {} (synthetic)", url);
        return Ok(OpenedSource {
            source: share_source(source),
            scene: Some(scene),
        });
    }

    if let Some(device) = url.strip_prefix("v4l2://") {
        #[cfg(feature = "ingest-v4l2")]
        {
            let mut source = V4l2Source::new(V4l2Config {
                device: device.to_string(),
                width,
                height,
                ..V4l2Config::default()
            });
            source.connect()?;
            return Ok(OpenedSource {
                source: share_source(source),
                scene: None,
            });
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            return Err(anyhow!(
                "v4l2 device {} requires the ingest-v4l2 feature",
                device
            ));
        }
    }

    if url.contains("://") {
        return Err(anyhow!("unsupported frame source URL {}", url));
    }

    let source = StillImageSource::new(StillConfig {
        path: url.to_string(),
    })?;
    Ok(OpenedSource {
        source: share_source(source),
        scene: None,
    })
}
