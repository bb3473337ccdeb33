//! Single-frame capture from a live feed.

use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::{ImageFormat, RgbaImage};
use tracing::debug;

use super::{CameraError, EncodedImage, FeedLease, Frame};
use crate::error::{Result, RollcallError};

/// Open front camera, ready for still capture.
pub struct StillCamera {
    lease: FeedLease,
}

impl std::fmt::Debug for StillCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StillCamera").finish_non_exhaustive()
    }
}

impl StillCamera {
    pub(super) fn new(lease: FeedLease) -> Self {
        Self { lease }
    }

    /// Capture exactly one frame and encode it.
    pub async fn capture(&self) -> Result<EncodedImage> {
        let frame = self.lease.feed().lock().await.next_frame().await?;
        encode_frame(&frame)
    }

    /// Release the camera stream. Never fails.
    pub async fn stop(mut self) {
        self.lease.release().await;
        debug!("Still camera stopped");
    }
}

/// Draw a frame onto a same-size surface and encode it as a PNG data URL.
pub fn encode_frame(frame: &Frame) -> Result<EncodedImage> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(CameraError::NoFrame.into());
    }

    let mut surface = RgbaImage::new(frame.width(), frame.height());
    image::imageops::replace(&mut surface, frame, 0, 0);

    let mut png = Cursor::new(Vec::new());
    surface
        .write_to(&mut png, ImageFormat::Png)
        .map_err(|e| RollcallError::ImageEncoding(e.to_string()))?;

    Ok(EncodedImage::from_data_url(format!(
        "data:image/png;base64,{}",
        BASE64.encode(png.into_inner())
    )))
}
