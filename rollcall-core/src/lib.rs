//! Rollcall Core - QR and face-verified classroom attendance client
//!
//! This crate implements the client side of a two-step attendance protocol:
//! a teacher opens a time-boxed session that displays rotating one-time QR
//! tokens, and a student presents a token and then passes a face check
//! before attendance is recorded.
//!
//! # Features
//!
//! - Teacher session lifecycle: start, polling token refresh, countdown and
//!   race-free stop
//! - Student handshake state machine: scan or type a token, validate, capture
//!   a face, verify
//! - Exclusive camera lease shared by the QR scanner and the still camera
//! - HTTP/JSON gateway with cookie-jar anti-forgery headers
//! - Deterministic in-memory backend for tests and demos
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rollcall_core::{
//!     AttendanceGateway, CameraAdapter, ClassroomId, MockCameraDevice, MockGateway,
//!     StudentVerificationController, VerificationTiming,
//! };
//!
//! # async fn example() -> rollcall_core::Result<()> {
//! let gateway = Arc::new(MockGateway::default());
//! let session = gateway.start_session(ClassroomId(7)).await?;
//!
//! let camera = CameraAdapter::new(Arc::new(MockCameraDevice::new()), true);
//! let (student, _events) =
//!     StudentVerificationController::new(gateway, camera, VerificationTiming::default(), true);
//!
//! student.request_scan(ClassroomId(7)).await?;
//! student.submit_token(&session.token).await?;
//! let outcome = student.capture_and_submit().await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod config;
pub mod error;
pub mod export;
pub mod gateway;
pub mod session;
pub mod verification;

// Re-export main types for convenience
pub use camera::{
    encode_frame, is_secure_origin, CameraAdapter, CameraBlockReason, CameraDevice, CameraError,
    DetectionRegion, EncodedImage, Facing, Frame, MockCameraDevice, MockQrDecoder, QrDecoder,
    QrScanner, ScanEvent, ScannerConfig, StillCamera, TeardownObserver, VideoFeed,
};
pub use config::{ClientConfig, EndpointTemplates, SessionTiming, VerificationTiming};
pub use error::{ErrorKind, Operation, Result, RollcallError, MEMBERSHIP_MISMATCH};
pub use export::{download_attendance, export_filename, sanitize_filename, ExportFile};
pub use gateway::{
    AttendanceGateway, AttendanceId, ClassroomId, ExportPayload, FaceVerdict, MockBackendConfig,
    MockGateway, OpaqueId, ScanAcceptance, SessionGrant, SessionId, TokenGrant,
};
pub use session::{
    AttendanceSession, SessionEvent, SessionState, StopOutcome, TeacherSessionController,
};
pub use verification::{
    AttendanceResult, CaptureMode, CaptureOutcome, PendingVerification,
    StudentVerificationController, Surface, VerificationEvent, VerificationPhase,
};

#[cfg(feature = "http")]
pub use gateway::HttpGateway;
