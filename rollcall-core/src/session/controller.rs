use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::{deadline_for, seconds_left, AttendanceSession, SessionEvent, SessionState, StopOutcome};
use crate::config::SessionTiming;
use crate::error::{Operation, Result, RollcallError};
use crate::export::{download_attendance, ExportFile};
use crate::gateway::{AttendanceGateway, ClassroomId, SessionGrant, SessionId, TokenGrant};

struct LiveSession {
    id: SessionId,
    classroom: ClassroomId,
    token: String,
    expires_at: DateTime<Utc>,
    /// `None` blanks the countdown.
    deadline: Option<Instant>,
    state: SessionState,
    polling: bool,
}

impl LiveSession {
    fn new(grant: SessionGrant, classroom: ClassroomId) -> Self {
        Self {
            deadline: Some(deadline_for(grant.expires_at, Utc::now(), Instant::now())),
            id: grant.session_id,
            classroom,
            token: grant.token,
            expires_at: grant.expires_at,
            state: SessionState::Active,
            polling: true,
        }
    }

    fn apply(&mut self, grant: TokenGrant) {
        self.deadline = Some(deadline_for(grant.expires_at, Utc::now(), Instant::now()));
        self.token = grant.token;
        self.expires_at = grant.expires_at;
    }

    fn is_active(&self, id: &SessionId) -> bool {
        self.id == *id && self.state == SessionState::Active
    }

    fn snapshot(&self) -> AttendanceSession {
        AttendanceSession {
            session_id: self.id.clone(),
            classroom: self.classroom,
            token: self.token.clone(),
            expires_at: self.expires_at,
            state: self.state,
            polling: self.polling,
        }
    }

    /// Final snapshot once the backend no longer holds this session.
    fn into_stopped(self) -> AttendanceSession {
        AttendanceSession {
            state: SessionState::Stopped,
            polling: false,
            ..self.snapshot()
        }
    }
}

/// Poll and countdown tasks of one session. Always torn down together.
struct SessionTimers {
    poll: JoinHandle<()>,
    countdown: JoinHandle<()>,
}

impl SessionTimers {
    fn cancel(self) {
        self.poll.abort();
        self.countdown.abort();
    }
}

#[derive(Default)]
struct ControllerState {
    session: Option<LiveSession>,
    /// The most recent session that was stopped or ended by the server.
    last_stopped: Option<AttendanceSession>,
    timers: Option<SessionTimers>,
    starting: bool,
    stopping: bool,
    exporting: bool,
}

struct Shared {
    gateway: Arc<dyn AttendanceGateway>,
    timing: SessionTiming,
    state: Mutex<ControllerState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

enum RefreshOutcome {
    Updated,
    Failed,
    Ended,
    Discarded,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn status(&self, message: impl Into<String>, is_error: bool) {
        self.emit(SessionEvent::Status {
            message: message.into(),
            is_error,
        });
    }

    async fn refresh(&self, session_id: &SessionId) -> RefreshOutcome {
        let active = self.lock().session.as_ref().is_some_and(|s| s.is_active(session_id));
        if !active {
            return RefreshOutcome::Discarded;
        }

        match self.gateway.refresh_token(session_id).await {
            Ok(grant) => {
                {
                    let mut state = self.lock();
                    match state.session.as_mut() {
                        Some(session) if session.is_active(session_id) => {
                            session.apply(grant.clone())
                        }
                        _ => {
                            debug!(
                                session_id = %session_id,
                                "Discarding refresh for a session that moved on"
                            );
                            return RefreshOutcome::Discarded;
                        }
                    }
                }
                debug!(session_id = %session_id, expires_at = %grant.expires_at, "Token refreshed");
                self.emit(SessionEvent::TokenRefreshed {
                    token: grant.token,
                    expires_at: grant.expires_at,
                });
                self.status("QR updated.", false);
                RefreshOutcome::Updated
            }
            Err(e) if e.is_not_found() => {
                let reason = e.user_message(Operation::RefreshToken);
                {
                    let mut state = self.lock();
                    if !state.session.as_ref().is_some_and(|s| s.is_active(session_id)) {
                        return RefreshOutcome::Discarded;
                    }
                    state.last_stopped = state.session.take().map(LiveSession::into_stopped);
                    if let Some(timers) = state.timers.take() {
                        timers.cancel();
                    }
                }
                warn!(session_id = %session_id, reason = %reason, "Session no longer exists");
                self.emit(SessionEvent::Ended {
                    session_id: session_id.clone(),
                    reason,
                });
                self.emit(SessionEvent::Countdown { seconds_left: None });
                self.emit(SessionEvent::DisplayCleared);
                RefreshOutcome::Ended
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Token refresh failed");
                self.status(e.user_message(Operation::RefreshToken), true);
                RefreshOutcome::Failed
            }
        }
    }

    fn countdown_value(&self) -> Option<u64> {
        self.lock()
            .session
            .as_ref()
            .and_then(|s| s.deadline)
            .map(|deadline| seconds_left(deadline, Instant::now()))
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timers) = state.timers.take() {
            timers.cancel();
        }
    }
}

/// Refresh delay policy: fixed cadence, widened exponentially on failures.
fn refresh_backoff(timing: &SessionTiming) -> Option<ExponentialBackoff> {
    timing.refresh_backoff_cap.map(|cap| ExponentialBackoff {
        initial_interval: timing.poll_interval,
        current_interval: timing.poll_interval,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: cap.max(timing.poll_interval),
        max_elapsed_time: None,
        ..Default::default()
    })
}

async fn poll_loop(shared: Weak<Shared>, session_id: SessionId, timing: SessionTiming) {
    let mut backoff = refresh_backoff(&timing);
    let mut delay = timing.poll_interval;

    loop {
        tokio::time::sleep(delay).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match shared.refresh(&session_id).await {
            RefreshOutcome::Updated => {
                if let Some(backoff) = backoff.as_mut() {
                    backoff.reset();
                }
                delay = timing.poll_interval;
            }
            RefreshOutcome::Failed => {
                delay = backoff
                    .as_mut()
                    .and_then(Backoff::next_backoff)
                    .unwrap_or(timing.poll_interval);
                debug!(delay_ms = delay.as_millis() as u64, "Next refresh delayed");
            }
            RefreshOutcome::Ended | RefreshOutcome::Discarded => return,
        }
    }
}

async fn countdown_loop(shared: Weak<Shared>, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let seconds_left = shared.countdown_value();
        shared.emit(SessionEvent::Countdown { seconds_left });
    }
}

/// Clears an in-flight flag when the owning operation finishes or is dropped.
struct FlagReset<'a> {
    shared: &'a Shared,
    flag: fn(&mut ControllerState) -> &mut bool,
}

fn starting_flag(state: &mut ControllerState) -> &mut bool {
    &mut state.starting
}

fn exporting_flag(state: &mut ControllerState) -> &mut bool {
    &mut state.exporting
}

impl Drop for FlagReset<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        *(self.flag)(&mut state) = false;
    }
}

/// Restores the post-failure state if a stop is abandoned mid-request.
struct StopGuard<'a> {
    shared: &'a Shared,
    session_id: SessionId,
    armed: bool,
}

impl StopGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.shared.lock();
        state.stopping = false;
        if let Some(session) = state.session.as_mut().filter(|s| s.id == self.session_id) {
            session.state = SessionState::Active;
        }
        debug!(
            session_id = %self.session_id,
            "Stop abandoned; session left active without polling"
        );
    }
}

/// Drives one teacher attendance session at a time.
///
/// Cheap to clone; clones share the session, timers and event channel.
#[derive(Clone)]
pub struct TeacherSessionController {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TeacherSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeacherSessionController")
            .field("timing", &self.shared.timing)
            .field("session", &self.snapshot())
            .finish()
    }
}

impl TeacherSessionController {
    /// Create a controller and the receiving end of its event stream.
    pub fn new(
        gateway: Arc<dyn AttendanceGateway>,
        timing: SessionTiming,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            gateway,
            timing,
            state: Mutex::new(ControllerState::default()),
            events,
        });
        (Self { shared }, rx)
    }

    /// Current session, if any.
    pub fn snapshot(&self) -> Option<AttendanceSession> {
        self.shared.lock().session.as_ref().map(LiveSession::snapshot)
    }

    /// The session that most recently stopped, in state `Stopped`.
    ///
    /// Cleared when a new session starts.
    pub fn last_stopped(&self) -> Option<AttendanceSession> {
        self.shared.lock().last_stopped.clone()
    }

    /// Seconds left on the current token, `None` when the countdown is blank.
    pub fn seconds_left(&self) -> Option<u64> {
        self.shared.countdown_value()
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.lock().stopping
    }

    /// Open a session for `classroom` and start its poll and countdown timers.
    ///
    /// A session that is already active is superseded locally; its timers
    /// are cancelled before the new session is installed.
    #[instrument(level = "info", skip_all, fields(classroom = %classroom))]
    pub async fn start(&self, classroom: ClassroomId) -> Result<AttendanceSession> {
        {
            let mut state = self.shared.lock();
            if state.starting {
                return Err(RollcallError::Busy("Starting attendance"));
            }
            state.starting = true;
        }
        let _reset = FlagReset {
            shared: &self.shared,
            flag: starting_flag,
        };

        let grant = match self.shared.gateway.start_session(classroom).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(error = %e, "Failed to start attendance session");
                self.shared
                    .emit(SessionEvent::Alert(e.user_message(Operation::StartSession)));
                return Err(e);
            }
        };

        let session_id = grant.session_id.clone();
        let snapshot = {
            let mut state = self.shared.lock();
            if let Some(old) = state.timers.take() {
                old.cancel();
            }
            if let Some(previous) = state.session.take() {
                warn!(previous = %previous.id, "Superseding active session");
            }
            let session = LiveSession::new(grant, classroom);
            let snapshot = session.snapshot();
            state.session = Some(session);
            state.last_stopped = None;
            state.timers = Some(self.spawn_timers(session_id.clone()));
            snapshot
        };

        info!(
            session_id = %session_id,
            expires_at = %snapshot.expires_at,
            "Attendance session started"
        );
        self.shared.emit(SessionEvent::Started {
            session_id,
            token: snapshot.token.clone(),
            expires_at: snapshot.expires_at,
        });
        self.shared.status("Session started.", false);
        self.shared.emit(SessionEvent::DisplayOpened { classroom });
        Ok(snapshot)
    }

    fn spawn_timers(&self, session_id: SessionId) -> SessionTimers {
        let timing = self.shared.timing.clone();
        let weak = Arc::downgrade(&self.shared);
        SessionTimers {
            countdown: tokio::spawn(countdown_loop(weak.clone(), timing.countdown_tick)),
            poll: tokio::spawn(poll_loop(weak, session_id, timing)),
        }
    }

    /// Stop the current session.
    ///
    /// Both timers are cancelled before the stop request is sent. On failure
    /// the session stays active with polling disabled and the error is
    /// returned so the caller can retry.
    #[instrument(level = "info", skip(self))]
    pub async fn stop(&self) -> Result<StopOutcome> {
        let session_id = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            if state.stopping {
                debug!("Stop already in flight");
                return Ok(StopOutcome::AlreadyStopping);
            }
            let Some(session) = state.session.as_mut() else {
                return Ok(StopOutcome::NoActiveSession);
            };
            if let Some(timers) = state.timers.take() {
                timers.cancel();
            }
            session.state = SessionState::Stopping;
            session.polling = false;
            session.deadline = None;
            state.stopping = true;
            session.id.clone()
        };
        self.shared.emit(SessionEvent::Countdown { seconds_left: None });

        let mut guard = StopGuard {
            shared: &self.shared,
            session_id: session_id.clone(),
            armed: true,
        };
        let result = self.shared.gateway.stop_session(&session_id).await;
        guard.disarm();

        match result {
            Ok(()) => {
                {
                    let mut state = self.shared.lock();
                    state.stopping = false;
                    if state.session.as_ref().is_some_and(|s| s.id == session_id) {
                        state.last_stopped = state.session.take().map(LiveSession::into_stopped);
                    }
                }
                info!(session_id = %session_id, "Attendance session stopped");
                self.shared.status("Session stopped.", false);
                self.shared.emit(SessionEvent::Stopped { session_id });
                self.shared.emit(SessionEvent::DisplayCleared);
                Ok(StopOutcome::Stopped)
            }
            Err(e) => {
                {
                    let mut state = self.shared.lock();
                    state.stopping = false;
                    if let Some(session) = state.session.as_mut().filter(|s| s.id == session_id) {
                        session.state = SessionState::Active;
                    }
                }
                warn!(session_id = %session_id, error = %e, "Failed to stop session");
                self.shared.status(e.user_message(Operation::StopSession), true);
                Err(e)
            }
        }
    }

    /// Close the QR display. Stops the session if one exists.
    pub async fn dismiss_display(&self) -> Result<StopOutcome> {
        let has_session = self.shared.lock().session.is_some();
        if has_session {
            return self.stop().await;
        }
        self.shared.emit(SessionEvent::DisplayCleared);
        Ok(StopOutcome::NoActiveSession)
    }

    /// Download the attendance spreadsheet for `classroom`.
    ///
    /// Failures raise an alert with the server's message or a generic
    /// fallback, then return the error.
    #[instrument(level = "info", skip_all, fields(classroom = %classroom))]
    pub async fn download_export(
        &self,
        classroom: ClassroomId,
        name: Option<&str>,
    ) -> Result<ExportFile> {
        {
            let mut state = self.shared.lock();
            if state.exporting {
                return Err(RollcallError::Busy("Downloading attendance"));
            }
            state.exporting = true;
        }
        let _reset = FlagReset {
            shared: &self.shared,
            flag: exporting_flag,
        };

        match download_attendance(self.shared.gateway.as_ref(), classroom, name).await {
            Ok(file) => Ok(file),
            Err(e) => {
                self.shared
                    .emit(SessionEvent::Alert(e.user_message(Operation::DownloadExport)));
                Err(e)
            }
        }
    }
}
