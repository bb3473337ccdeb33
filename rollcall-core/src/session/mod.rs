//! Teacher-side attendance session lifecycle.
//!
//! A [`TeacherSessionController`] owns at most one active session. While the
//! session is active two timers run: a refresh poll that replaces the token
//! in place, and a countdown that redraws the seconds left until expiry.
//! Stopping cancels both timers before the stop request is sent, so no
//! refresh can race a stop.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rollcall_core::{ClassroomId, MockGateway, SessionTiming, TeacherSessionController};
//!
//! # async fn example() -> rollcall_core::Result<()> {
//! let (controller, mut events) =
//!     TeacherSessionController::new(Arc::new(MockGateway::default()), SessionTiming::default());
//!
//! let session = controller.start(ClassroomId(7)).await?;
//! println!("Show QR for token {}", session.token);
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! #   break;
//! }
//! controller.dismiss_display().await?;
//! # Ok(())
//! # }
//! ```

mod controller;

pub use controller::TeacherSessionController;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::gateway::{ClassroomId, SessionId};

/// Lifecycle of an attendance session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Stopping,
    Stopped,
}

/// Snapshot of the controller's session.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceSession {
    pub session_id: SessionId,
    pub classroom: ClassroomId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub state: SessionState,
    /// False once a stop has been attempted; the token is then frozen.
    pub polling: bool,
}

/// Result of a stop request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The backend closed the session.
    Stopped,
    /// Nothing was running.
    NoActiveSession,
    /// Another stop is in flight; this call did nothing.
    AlreadyStopping,
}

impl StopOutcome {
    /// Whether the caller may treat the session as closed.
    pub fn completed(self) -> bool {
        !matches!(self, Self::AlreadyStopping)
    }
}

/// Notifications for the QR display surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The QR display should be shown.
    DisplayOpened { classroom: ClassroomId },
    Started {
        session_id: SessionId,
        token: String,
        expires_at: DateTime<Utc>,
    },
    TokenRefreshed {
        token: String,
        expires_at: DateTime<Utc>,
    },
    /// Countdown redraw; `None` blanks the countdown.
    Countdown { seconds_left: Option<u64> },
    /// Inline status line.
    Status { message: String, is_error: bool },
    /// Blocking alert.
    Alert(String),
    Stopped { session_id: SessionId },
    /// The backend no longer knows the session.
    Ended { session_id: SessionId, reason: String },
    /// Token, countdown and status should be cleared.
    DisplayCleared,
}

/// Whole seconds left until `deadline`, rounded up and floored at zero.
pub fn seconds_left(deadline: Instant, now: Instant) -> u64 {
    let remaining = deadline.saturating_duration_since(now);
    remaining.as_millis().div_ceil(1000) as u64
}

/// Map a wall-clock expiry onto the monotonic clock.
pub(crate) fn deadline_for(
    expires_at: DateTime<Utc>,
    wall_now: DateTime<Utc>,
    now: Instant,
) -> Instant {
    let remaining = (expires_at - wall_now).to_std().unwrap_or(Duration::ZERO);
    now + remaining
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_left_rounds_up() {
        let now = Instant::now();
        assert_eq!(seconds_left(now + Duration::from_millis(29_001), now), 30);
        assert_eq!(seconds_left(now + Duration::from_millis(30_000), now), 30);
        assert_eq!(seconds_left(now + Duration::from_millis(1), now), 1);
        assert_eq!(seconds_left(now, now), 0);
    }

    #[test]
    fn test_seconds_left_floors_at_zero() {
        let now = Instant::now();
        let past = now;
        assert_eq!(seconds_left(past, now + Duration::from_secs(5)), 0);
    }

    #[test]
    fn test_deadline_for_past_expiry() {
        let now = Instant::now();
        let wall = Utc::now();
        let deadline = deadline_for(wall - chrono::Duration::seconds(3), wall, now);
        assert_eq!(deadline, now);

        let deadline = deadline_for(wall + chrono::Duration::seconds(30), wall, now);
        assert_eq!(seconds_left(deadline, now), 30);
    }

    #[test]
    fn test_stop_outcome_completion() {
        assert!(StopOutcome::Stopped.completed());
        assert!(StopOutcome::NoActiveSession.completed());
        assert!(!StopOutcome::AlreadyStopping.completed());
    }
}
