//! Camera and QR scanner adapter.
//!
//! Wraps the two device-camera usages of the student flow behind one
//! capability probe:
//!
//! - **Scanner** ([`QrScanner`]): continuous decode loop at a fixed frame
//!   rate over a centred detection region, single-shot success.
//! - **Still capture** ([`StillCamera`]): one frame, encoded as a PNG data URL.
//!
//! Both hold the same exclusive device lease, so the scanner and the still
//! camera can never be active at the same time. Teardown is best-effort:
//! failures while stopping a feed are swallowed (and optionally reported to a
//! [`TeardownObserver`]) so a broken camera never blocks opening a new one.

mod mock;
mod scanner;
mod still;

pub use mock::{MockCameraDevice, MockQrDecoder};
pub use scanner::{QrScanner, ScanEvent};
pub use still::{encode_frame, StillCamera};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument};

use crate::error::{Result, RollcallError};

/// One RGBA video frame.
pub type Frame = image::RgbaImage;

/// Callback receiving teardown failures that are otherwise swallowed.
pub type TeardownObserver = Arc<dyn Fn(&CameraError) + Send + Sync>;

/// Image payload ready to be sent to the backend (`data:image/png;base64,...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage(String);

impl EncodedImage {
    pub fn from_data_url(data_url: impl Into<String>) -> Self {
        Self(data_url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Why the camera cannot be used at all on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraBlockReason {
    /// The backend origin is neither HTTPS nor loopback.
    InsecureContext,
    /// No camera device is available to this client.
    CameraApiUnavailable,
}

impl std::fmt::Display for CameraBlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsecureContext => write!(
                f,
                "Camera is blocked because this page is not running on HTTPS (or localhost). \
                 Open the app over HTTPS."
            ),
            Self::CameraApiUnavailable => write!(f, "Camera API is not available in this browser."),
        }
    }
}

/// Device-level camera failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("Camera is already in use")]
    Busy,

    #[error("Unable to open camera: {0}")]
    Open(String),

    #[error("QR scanner library failed to load. Please refresh and try again.")]
    ScannerUnavailable,

    #[error("Camera is not ready.")]
    NoFrame,

    #[error("Camera feed error: {0}")]
    Feed(String),
}

/// Which way the requested camera faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    /// Front camera, used for face capture.
    User,
    /// Rear camera, used for QR scanning.
    Environment,
}

/// A camera device that can open live video feeds.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    async fn open(&self, facing: Facing) -> std::result::Result<Box<dyn VideoFeed>, CameraError>;
}

/// A live video feed. `stop` releases the underlying tracks.
#[async_trait]
pub trait VideoFeed: Send {
    /// Grab the next frame. [`CameraError::NoFrame`] means "nothing yet".
    async fn next_frame(&mut self) -> std::result::Result<Frame, CameraError>;

    async fn stop(&mut self) -> std::result::Result<(), CameraError>;
}

/// QR decoder applied to the detection region of each frame.
pub trait QrDecoder: Send + Sync {
    fn decode(&self, region: &Frame) -> Option<String>;
}

/// Centred square-ish area of the frame searched for codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionRegion {
    pub width: u32,
    pub height: u32,
}

impl DetectionRegion {
    /// Crop the centred region out of a frame, clamped to the frame size.
    pub fn crop(&self, frame: &Frame) -> Frame {
        let width = self.width.min(frame.width());
        let height = self.height.min(frame.height());
        let x = (frame.width() - width) / 2;
        let y = (frame.height() - height) / 2;
        image::imageops::crop_imm(frame, x, y, width, height).to_image()
    }
}

/// Scanner loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannerConfig {
    /// Decode attempts per second (default: 10)
    pub fps: u32,
    /// Detection region (default: 220x220)
    pub region: DetectionRegion,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            fps: 10,
            region: DetectionRegion {
                width: 220,
                height: 220,
            },
        }
    }
}

impl ScannerConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps.max(1)))
    }
}

/// Whether an origin counts as a secure context: HTTPS, or a loopback host.
pub fn is_secure_origin(origin: &str) -> bool {
    let (scheme, rest) = match origin.split_once("://") {
        Some(parts) => parts,
        None => return false,
    };
    if scheme.eq_ignore_ascii_case("https") {
        return true;
    }
    let authority = rest.split('/').next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or_default();
    let host = if authority.starts_with('[') {
        authority.split(']').next().map(|h| &h[1..]).unwrap_or_default()
    } else {
        authority.split(':').next().unwrap_or_default()
    };
    let host = host.to_ascii_lowercase();
    host == "localhost"
        || host.ends_with(".localhost")
        || host == "::1"
        || (host.split('.').next() == Some("127") && host.split('.').count() == 4)
}

/// Device feed plus the exclusive lease it was opened under.
///
/// Released explicitly via [`FeedLease::release`]; a lease dropped without
/// release hands the feed to a background task so the device is still freed.
struct FeedLease {
    feed: Arc<AsyncMutex<Box<dyn VideoFeed>>>,
    permit: Option<OwnedSemaphorePermit>,
    observer: Option<TeardownObserver>,
}

impl FeedLease {
    fn new(
        feed: Box<dyn VideoFeed>,
        permit: OwnedSemaphorePermit,
        observer: Option<TeardownObserver>,
    ) -> Self {
        Self {
            feed: Arc::new(AsyncMutex::new(feed)),
            permit: Some(permit),
            observer,
        }
    }

    fn feed(&self) -> Arc<AsyncMutex<Box<dyn VideoFeed>>> {
        self.feed.clone()
    }

    /// Stop the feed and return the device lease. Errors are swallowed.
    async fn release(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        if let Err(e) = self.feed.lock().await.stop().await {
            debug!(error = %e, "Ignoring camera teardown failure");
            if let Some(observer) = &self.observer {
                observer(&e);
            }
        }
        drop(permit);
    }
}

impl Drop for FeedLease {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let feed = self.feed.clone();
        let observer = self.observer.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = feed.lock().await.stop().await {
                    if let Some(observer) = observer {
                        observer(&e);
                    }
                }
                drop(permit);
            });
        }
    }
}

/// Entry point for opening the scanner or the still camera.
#[derive(Clone)]
pub struct CameraAdapter {
    device: Option<Arc<dyn CameraDevice>>,
    decoder: Option<Arc<dyn QrDecoder>>,
    secure_context: bool,
    lease: Arc<Semaphore>,
    scanner: ScannerConfig,
    observer: Option<TeardownObserver>,
}

impl std::fmt::Debug for CameraAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraAdapter")
            .field("has_device", &self.device.is_some())
            .field("has_decoder", &self.decoder.is_some())
            .field("secure_context", &self.secure_context)
            .field("scanner", &self.scanner)
            .finish()
    }
}

impl CameraAdapter {
    /// Adapter over a camera device.
    pub fn new(device: Arc<dyn CameraDevice>, secure_context: bool) -> Self {
        Self {
            device: Some(device),
            decoder: None,
            secure_context,
            lease: Arc::new(Semaphore::new(1)),
            scanner: ScannerConfig::default(),
            observer: None,
        }
    }

    /// Adapter for a platform with no camera at all.
    pub fn unavailable(secure_context: bool) -> Self {
        Self {
            device: None,
            decoder: None,
            secure_context,
            lease: Arc::new(Semaphore::new(1)),
            scanner: ScannerConfig::default(),
            observer: None,
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn QrDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn with_scanner_config(mut self, config: ScannerConfig) -> Self {
        self.scanner = config;
        self
    }

    pub fn with_teardown_observer(mut self, observer: TeardownObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Capability probe, checked before any device access.
    pub fn probe(&self) -> std::result::Result<(), CameraBlockReason> {
        if !self.secure_context {
            return Err(CameraBlockReason::InsecureContext);
        }
        if self.device.is_none() {
            return Err(CameraBlockReason::CameraApiUnavailable);
        }
        Ok(())
    }

    /// Whether the scanner or the still camera currently holds the device.
    pub fn is_device_busy(&self) -> bool {
        self.lease.available_permits() == 0
    }

    fn acquire(
        &self,
    ) -> std::result::Result<(Arc<dyn CameraDevice>, OwnedSemaphorePermit), RollcallError> {
        self.probe().map_err(RollcallError::CameraBlocked)?;
        let device = self
            .device
            .clone()
            .ok_or(RollcallError::CameraBlocked(CameraBlockReason::CameraApiUnavailable))?;
        let permit = self
            .lease
            .clone()
            .try_acquire_owned()
            .map_err(|_| CameraError::Busy)?;
        Ok((device, permit))
    }

    /// Open the rear camera and start the decode loop.
    #[instrument(level = "debug", skip(self))]
    pub async fn open_scanner(&self) -> Result<QrScanner> {
        self.probe().map_err(RollcallError::CameraBlocked)?;
        let decoder = self.decoder.clone().ok_or(CameraError::ScannerUnavailable)?;
        let (device, permit) = self.acquire()?;
        let feed = device.open(Facing::Environment).await?;
        debug!(fps = self.scanner.fps, "Scanner started");
        Ok(QrScanner::start(
            FeedLease::new(feed, permit, self.observer.clone()),
            decoder,
            self.scanner,
        ))
    }

    /// Open the front camera for still capture.
    #[instrument(level = "debug", skip(self))]
    pub async fn open_still(&self) -> Result<StillCamera> {
        let (device, permit) = self.acquire()?;
        let feed = device.open(Facing::User).await?;
        debug!("Still camera started");
        Ok(StillCamera::new(FeedLease::new(
            feed,
            permit,
            self.observer.clone(),
        )))
    }
}
