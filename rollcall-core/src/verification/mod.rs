//! Student-side verification handshake.
//!
//! A student first presents a teacher's QR token (scanned or typed in). A
//! valid token yields a [`PendingVerification`] handle, which is consumed by
//! exactly one face capture submission:
//!
//! ```text
//! Idle -> Scanning -> Validating -> AwaitingCapture(Attendance) -> Submitting -> Idle
//! Idle -> AwaitingCapture(Register) -> Submitting(Register) -> Idle
//! ```
//!
//! Any phase returns to `Idle` when its surface is dismissed.

mod controller;
mod state;

pub use controller::StudentVerificationController;
pub use state::{
    format_score, AttendanceResult, CaptureMode, CaptureOutcome, PendingVerification,
    VerificationPhase,
};

/// The two student-facing surfaces, each with its own status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// QR scan view with manual token entry.
    Scan,
    /// Face capture view.
    Capture,
}

/// Notifications for the student UI.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationEvent {
    Status {
        surface: Surface,
        message: String,
        is_error: bool,
    },
    StatusCleared(Surface),
    /// Blocking alert.
    Alert(String),
    ScanSurfaceOpened,
    ScanSurfaceClosed,
    CaptureSurfaceOpened(CaptureMode),
    CaptureSurfaceClosed,
    /// The still camera is streaming and capture is possible.
    CameraReady,
    RegistrationComplete,
    /// The host should reload the student's dashboard.
    ReloadRequested,
    AttendanceResult(AttendanceResult),
}
