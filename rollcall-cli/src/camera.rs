//! Camera device backed by an image file.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rollcall_core::{CameraDevice, CameraError, Facing, Frame, VideoFeed};
use tracing::debug;

/// Serves the same still image as every frame, whichever way it "faces".
pub struct FileCamera {
    frame: Frame,
}

impl FileCamera {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read face image: {}", path.display()))?;
        let frame = image::load_from_memory(&bytes)
            .with_context(|| format!("Failed to decode face image: {}", path.display()))?
            .to_rgba8();
        debug!(
            path = %path.display(),
            width = frame.width(),
            height = frame.height(),
            "Loaded face image"
        );
        Ok(Self { frame })
    }
}

#[async_trait]
impl CameraDevice for FileCamera {
    async fn open(&self, facing: Facing) -> std::result::Result<Box<dyn VideoFeed>, CameraError> {
        debug!(?facing, "Opening file camera");
        Ok(Box::new(FileFeed {
            frame: Some(self.frame.clone()),
        }))
    }
}

struct FileFeed {
    frame: Option<Frame>,
}

#[async_trait]
impl VideoFeed for FileFeed {
    async fn next_frame(&mut self) -> std::result::Result<Frame, CameraError> {
        self.frame
            .clone()
            .ok_or_else(|| CameraError::Feed("feed stopped".into()))
    }

    async fn stop(&mut self) -> std::result::Result<(), CameraError> {
        self.frame = None;
        Ok(())
    }
}
