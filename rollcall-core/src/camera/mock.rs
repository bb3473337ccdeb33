//! In-memory camera for tests and demos.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{CameraDevice, CameraError, Facing, Frame, QrDecoder, VideoFeed};

#[derive(Debug, Default)]
struct MockCameraStats {
    opened: AtomicUsize,
    stopped: AtomicUsize,
    frame_failures: AtomicUsize,
}

/// Camera that serves a fixed frame and counts open/stop calls.
///
/// Clones share their counters, so a test can keep one handle while the
/// adapter owns another.
#[derive(Debug, Clone)]
pub struct MockCameraDevice {
    frame: Frame,
    fail_open: bool,
    fail_stop: bool,
    stats: Arc<MockCameraStats>,
}

impl MockCameraDevice {
    pub fn new() -> Self {
        Self::with_frame(Frame::from_pixel(64, 48, image::Rgba([128, 128, 128, 255])))
    }

    pub fn with_frame(frame: Frame) -> Self {
        Self {
            frame,
            fail_open: false,
            fail_stop: false,
            stats: Arc::default(),
        }
    }

    /// A camera the user refused permission for.
    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::new()
        }
    }

    /// A camera whose tracks error on stop.
    pub fn failing_stop() -> Self {
        Self {
            fail_stop: true,
            ..Self::new()
        }
    }

    /// Make the next `count` frame reads fail, on any open feed.
    pub fn fail_next_frames(&self, count: usize) {
        self.stats.frame_failures.store(count, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.stats.opened.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stats.stopped.load(Ordering::SeqCst)
    }

    /// Feeds opened and not yet stopped.
    pub fn active_feeds(&self) -> usize {
        self.open_count().saturating_sub(self.stop_count())
    }
}

impl Default for MockCameraDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CameraDevice for MockCameraDevice {
    async fn open(&self, _facing: Facing) -> Result<Box<dyn VideoFeed>, CameraError> {
        if self.fail_open {
            return Err(CameraError::Open("permission denied".into()));
        }
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockFeed {
            frame: self.frame.clone(),
            fail_stop: self.fail_stop,
            stopped: false,
            stats: self.stats.clone(),
        }))
    }
}

struct MockFeed {
    frame: Frame,
    fail_stop: bool,
    stopped: bool,
    stats: Arc<MockCameraStats>,
}

#[async_trait]
impl VideoFeed for MockFeed {
    async fn next_frame(&mut self) -> Result<Frame, CameraError> {
        if self.stopped {
            return Err(CameraError::Feed("feed stopped".into()));
        }
        let dropped = self
            .stats
            .frame_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if dropped {
            return Err(CameraError::Feed("frame dropped".into()));
        }
        Ok(self.frame.clone())
    }

    async fn stop(&mut self) -> Result<(), CameraError> {
        if !self.stopped {
            self.stopped = true;
            self.stats.stopped.fetch_add(1, Ordering::SeqCst);
        }
        if self.fail_stop {
            return Err(CameraError::Feed("track already ended".into()));
        }
        Ok(())
    }
}

/// Decoder that "finds" a fixed payload after a number of misses.
#[derive(Debug)]
pub struct MockQrDecoder {
    payload: Option<String>,
    misses: usize,
    seen: AtomicUsize,
}

impl MockQrDecoder {
    /// Decode `payload` on the frame after `misses` empty frames.
    pub fn after(payload: impl Into<String>, misses: usize) -> Self {
        Self {
            payload: Some(payload.into()),
            misses,
            seen: AtomicUsize::new(0),
        }
    }

    /// Decoder that never finds a code.
    pub fn never() -> Self {
        Self {
            payload: None,
            misses: 0,
            seen: AtomicUsize::new(0),
        }
    }

    pub fn frames_seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

impl QrDecoder for MockQrDecoder {
    fn decode(&self, _region: &Frame) -> Option<String> {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen > self.misses {
            self.payload.clone()
        } else {
            None
        }
    }
}
