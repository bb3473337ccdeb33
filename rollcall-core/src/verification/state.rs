use crate::error::{Result, RollcallError};
use crate::gateway::{AttendanceId, ClassroomId, FaceVerdict};

/// What a face capture is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureMode {
    /// Enroll the reference face.
    #[default]
    Register,
    /// Verify against the reference for a pending attendance record.
    Attendance,
}

/// Student-side protocol phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VerificationPhase {
    #[default]
    Idle,
    Scanning,
    Validating,
    AwaitingCapture(CaptureMode),
    Submitting(CaptureMode),
}

impl VerificationPhase {
    /// Whether `next` is reachable from this phase.
    pub fn can_transition_to(self, next: Self) -> bool {
        use VerificationPhase::*;

        match (self, next) {
            (_, Idle) => true,
            (Idle, Scanning) => true,
            (Idle, AwaitingCapture(CaptureMode::Register)) => true,
            (Scanning, Validating) => true,
            (Validating, Scanning) => true,
            (Validating, AwaitingCapture(CaptureMode::Attendance)) => true,
            (AwaitingCapture(a), Submitting(b)) => a == b,
            (Submitting(a), AwaitingCapture(b)) => a == b,
            _ => false,
        }
    }

    /// Move to `next`, or fail with [`RollcallError::InvalidTransition`].
    pub fn transition(&mut self, next: Self) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(RollcallError::InvalidTransition {
                from: format!("{self:?}"),
                to: format!("{next:?}"),
            });
        }
        *self = next;
        Ok(())
    }

    pub fn capture_mode(self) -> Option<CaptureMode> {
        match self {
            Self::AwaitingCapture(mode) | Self::Submitting(mode) => Some(mode),
            _ => None,
        }
    }
}

/// Handle to an attendance record awaiting face verification.
///
/// Not `Clone`. The controller moves it out on submission, so each handle
/// backs at most one verification.
#[derive(Debug, PartialEq, Eq)]
pub struct PendingVerification {
    attendance_id: AttendanceId,
    classroom: ClassroomId,
}

impl PendingVerification {
    pub(crate) fn new(attendance_id: AttendanceId, classroom: ClassroomId) -> Self {
        Self {
            attendance_id,
            classroom,
        }
    }

    pub fn attendance_id(&self) -> &AttendanceId {
        &self.attendance_id
    }

    pub fn classroom(&self) -> ClassroomId {
        self.classroom
    }
}

/// Verdict of an attendance face check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttendanceResult {
    pub matched: bool,
    pub score: f64,
}

impl AttendanceResult {
    pub fn message(&self) -> String {
        if self.matched {
            format!("Attendance marked. Score: {}", format_score(self.score))
        } else {
            format!("Face verification failed. Score: {}", format_score(self.score))
        }
    }
}

impl From<FaceVerdict> for AttendanceResult {
    fn from(verdict: FaceVerdict) -> Self {
        Self {
            matched: verdict.matched,
            score: verdict.score,
        }
    }
}

/// Result of a successful capture submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureOutcome {
    Registered,
    Attendance(AttendanceResult),
}

/// Similarity score with four decimals.
pub fn format_score(score: f64) -> String {
    format!("{score:.4}")
}
