//! Continuous QR scan loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::{CameraError, FeedLease, QrDecoder, ScannerConfig};

/// Outcome reported by a running scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A code was decoded. Emitted at most once per scanner.
    Decoded(String),
    /// The feed broke; the loop has ended.
    Failed(String),
}

/// Running QR scanner. Holds the camera until [`QrScanner::stop`].
pub struct QrScanner {
    task: Option<JoinHandle<()>>,
    events: Option<mpsc::UnboundedReceiver<ScanEvent>>,
    lease: FeedLease,
}

impl std::fmt::Debug for QrScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrScanner").finish_non_exhaustive()
    }
}

impl QrScanner {
    pub(super) fn start(
        lease: FeedLease,
        decoder: Arc<dyn QrDecoder>,
        config: ScannerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(decode_loop(lease.feed(), decoder, config, tx));
        Self {
            task: Some(task),
            events: Some(rx),
            lease,
        }
    }

    /// Take the event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ScanEvent>> {
        self.events.take()
    }

    /// Halt the decode loop, then release the camera. Never fails.
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            if let Err(e) = task.await {
                trace!(error = %e, "Scanner loop ended");
            }
        }
        self.lease.release().await;
        debug!("Scanner stopped");
    }
}

impl Drop for QrScanner {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn decode_loop(
    feed: Arc<tokio::sync::Mutex<Box<dyn super::VideoFeed>>>,
    decoder: Arc<dyn QrDecoder>,
    config: ScannerConfig,
    events: mpsc::UnboundedSender<ScanEvent>,
) {
    let mut ticker = tokio::time::interval(config.frame_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let frame = feed.lock().await.next_frame().await;
        match frame {
            Ok(frame) => {
                let region = config.region.crop(&frame);
                if let Some(text) = decoder.decode(&region) {
                    debug!(len = text.len(), "QR code decoded");
                    let _ = events.send(ScanEvent::Decoded(text));
                    return;
                }
            }
            Err(CameraError::NoFrame) => {}
            Err(e) => {
                warn!(error = %e, "Scanner feed failed");
                let _ = events.send(ScanEvent::Failed(e.to_string()));
                return;
            }
        }
    }
}
