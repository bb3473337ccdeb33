use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::state::{CaptureMode, CaptureOutcome, PendingVerification, VerificationPhase};
use super::{Surface, VerificationEvent};
use crate::camera::{CameraAdapter, CameraError, QrScanner, ScanEvent, StillCamera};
use crate::config::VerificationTiming;
use crate::error::{Operation, Result, RollcallError};
use crate::gateway::{AttendanceGateway, ClassroomId};

const REGISTRATION_REQUIRED: &str = "Please register facial biometrics first.";
const ALREADY_REGISTERED: &str = "Your face is already verified!";
const SCANNER_START_FAILED: &str = "Unable to start QR scanner.";
const CAMERA_START_FAILED: &str = "Error accessing camera. Please allow camera permissions.";

#[derive(Default)]
struct StudentState {
    phase: VerificationPhase,
    registered: bool,
    classroom: Option<ClassroomId>,
    pending: Option<PendingVerification>,
    capture_mode: CaptureMode,
    scanner: Option<QrScanner>,
    still: Option<StillCamera>,
    /// Bumped whenever the scan surface opens or closes.
    scan_generation: u64,
    /// Bumped whenever the capture surface opens or closes.
    capture_generation: u64,
    capturing: bool,
    handoff: bool,
}

struct Shared {
    gateway: Arc<dyn AttendanceGateway>,
    camera: CameraAdapter,
    timing: VerificationTiming,
    state: Mutex<StudentState>,
    events: mpsc::UnboundedSender<VerificationEvent>,
}

/// Drives the student's scan, validate and face-verify handshake.
///
/// Cheap to clone; clones share state, camera and event channel.
#[derive(Clone)]
pub struct StudentVerificationController {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StudentVerificationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("StudentVerificationController")
            .field("phase", &state.phase)
            .field("registered", &state.registered)
            .field("classroom", &state.classroom)
            .field("has_pending", &state.pending.is_some())
            .finish()
    }
}

/// User-facing text for a camera start failure.
fn camera_failure(error: &RollcallError, fallback: &str) -> String {
    match error {
        RollcallError::CameraBlocked(reason) => reason.to_string(),
        RollcallError::Camera(CameraError::ScannerUnavailable) => {
            CameraError::ScannerUnavailable.to_string()
        }
        _ => fallback.to_string(),
    }
}

impl StudentVerificationController {
    /// Create a controller and the receiving end of its event stream.
    ///
    /// `registered` is whether the student already has a reference face.
    pub fn new(
        gateway: Arc<dyn AttendanceGateway>,
        camera: CameraAdapter,
        timing: VerificationTiming,
        registered: bool,
    ) -> (Self, mpsc::UnboundedReceiver<VerificationEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = StudentState {
            registered,
            ..Default::default()
        };
        let shared = Arc::new(Shared {
            gateway,
            camera,
            timing,
            state: Mutex::new(state),
            events,
        });
        (Self { shared }, rx)
    }

    fn lock(&self) -> MutexGuard<'_, StudentState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: VerificationEvent) {
        let _ = self.shared.events.send(event);
    }

    fn status(&self, surface: Surface, message: impl Into<String>, is_error: bool) {
        self.emit(VerificationEvent::Status {
            surface,
            message: message.into(),
            is_error,
        });
    }

    pub fn phase(&self) -> VerificationPhase {
        self.lock().phase
    }

    pub fn is_registered(&self) -> bool {
        self.lock().registered
    }

    /// Whether a validated token is waiting for its face capture.
    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub fn selected_classroom(&self) -> Option<ClassroomId> {
        self.lock().classroom
    }

    /// Whether the QR scanner is currently running.
    pub fn is_scanning(&self) -> bool {
        self.lock().scanner.is_some()
    }

    /// Whether the still camera is open on the capture surface.
    pub fn is_camera_open(&self) -> bool {
        self.lock().still.is_some()
    }

    /// Open the scan surface for `classroom` and start the QR scanner.
    ///
    /// Camera problems are reported on the surface but do not fail the call,
    /// so manual token entry keeps working.
    #[instrument(level = "info", skip_all, fields(classroom = %classroom))]
    pub async fn request_scan(&self, classroom: ClassroomId) -> Result<()> {
        let generation = {
            let mut state = self.lock();
            if !state.registered {
                drop(state);
                self.emit(VerificationEvent::Alert(REGISTRATION_REQUIRED.into()));
                return Err(RollcallError::RegistrationRequired);
            }
            state.phase.transition(VerificationPhase::Scanning)?;
            state.classroom = Some(classroom);
            state.scan_generation += 1;
            state.scan_generation
        };
        self.emit(VerificationEvent::ScanSurfaceOpened);

        tokio::time::sleep(self.shared.timing.scan_warmup).await;
        if !self.scan_is_current(generation) {
            debug!("Scan surface closed during warm-up");
            return Ok(());
        }

        self.status(Surface::Scan, "Point camera at teacher QR code.", false);
        let mut scanner = match self.shared.camera.open_scanner().await {
            Ok(scanner) => scanner,
            Err(e) => {
                warn!(error = %e, "QR scanner unavailable");
                self.status(Surface::Scan, camera_failure(&e, SCANNER_START_FAILED), true);
                return Ok(());
            }
        };
        let events = scanner.take_events();

        let stale = {
            let mut state = self.lock();
            let current =
                state.scan_generation == generation && state.phase == VerificationPhase::Scanning;
            if current {
                state.scanner = Some(scanner);
                None
            } else {
                Some(scanner)
            }
        };
        if let Some(scanner) = stale {
            scanner.stop().await;
            return Ok(());
        }

        if let Some(events) = events {
            tokio::spawn(scan_listener(self.clone(), events, generation));
        }
        debug!("Scanner running");
        Ok(())
    }

    fn scan_is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        state.scan_generation == generation && state.phase == VerificationPhase::Scanning
    }

    fn capture_is_current(&self, generation: u64) -> bool {
        self.lock().capture_generation == generation
    }

    /// Validate a scanned or typed token.
    ///
    /// On success the pending handle is stored and, after the hand-off delay,
    /// the capture surface opens in attendance mode.
    #[instrument(level = "info", skip_all)]
    pub async fn submit_token(&self, text: &str) -> Result<()> {
        let token = text.trim();
        if token.is_empty() {
            self.status(Surface::Scan, RollcallError::EmptyToken.to_string(), true);
            return Err(RollcallError::EmptyToken);
        }

        let (scanner, generation, classroom) = {
            let mut state = self.lock();
            if state.phase == VerificationPhase::Validating {
                return Err(RollcallError::Busy("Validating QR"));
            }
            let classroom = state.classroom.ok_or(RollcallError::NoClassroomSelected)?;
            state.phase.transition(VerificationPhase::Validating)?;
            (state.scanner.take(), state.scan_generation, classroom)
        };
        if let Some(scanner) = scanner {
            scanner.stop().await;
        }

        self.status(Surface::Scan, "Validating QR...", false);
        let result = self.shared.gateway.validate_token(token, classroom).await;

        let current = {
            let mut state = self.lock();
            let current = state.scan_generation == generation
                && state.phase == VerificationPhase::Validating;
            if current {
                match &result {
                    Ok(accepted) => {
                        state.pending = Some(PendingVerification::new(
                            accepted.attendance_id.clone(),
                            classroom,
                        ));
                        state.phase = VerificationPhase::AwaitingCapture(CaptureMode::Attendance);
                        state.capture_mode = CaptureMode::Attendance;
                        state.handoff = true;
                    }
                    Err(_) => state.phase = VerificationPhase::Scanning,
                }
            }
            current
        };
        if !current {
            debug!("Discarding validation result for a closed scan surface");
            return Ok(());
        }

        if let Err(e) = result {
            let message = e.user_message(Operation::ValidateToken);
            warn!(error = %e, "Token validation failed");
            if e.is_membership_mismatch() {
                self.emit(VerificationEvent::Alert(message.clone()));
            }
            self.status(Surface::Scan, message, true);
            return Err(e);
        }

        info!(classroom = %classroom, "QR token accepted");
        self.status(Surface::Scan, "QR accepted. Starting face verification...", false);
        tokio::time::sleep(self.shared.timing.handoff_delay).await;

        let proceed = {
            let mut state = self.lock();
            state.handoff = false;
            state.phase == VerificationPhase::AwaitingCapture(CaptureMode::Attendance)
        };
        self.emit(VerificationEvent::ScanSurfaceClosed);
        if proceed {
            self.open_capture_surface(CaptureMode::Attendance).await;
        }
        Ok(())
    }

    /// Open the capture surface to enroll the student's face.
    #[instrument(level = "info", skip_all)]
    pub async fn open_registration(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.registered {
                drop(state);
                self.emit(VerificationEvent::Alert(ALREADY_REGISTERED.into()));
                return Err(RollcallError::AlreadyRegistered);
            }
            state
                .phase
                .transition(VerificationPhase::AwaitingCapture(CaptureMode::Register))?;
            state.capture_mode = CaptureMode::Register;
        }
        self.open_capture_surface(CaptureMode::Register).await;
        Ok(())
    }

    async fn open_capture_surface(&self, mode: CaptureMode) {
        let generation = {
            let mut state = self.lock();
            state.capture_generation += 1;
            state.capture_generation
        };
        self.emit(VerificationEvent::CaptureSurfaceOpened(mode));

        tokio::time::sleep(self.shared.timing.camera_warmup).await;
        if !self.capture_is_current(generation) {
            return;
        }

        let still = match self.shared.camera.open_still().await {
            Ok(still) => still,
            Err(e) => {
                warn!(error = %e, "Still camera unavailable");
                self.status(Surface::Capture, camera_failure(&e, CAMERA_START_FAILED), true);
                return;
            }
        };

        let stale = {
            let mut state = self.lock();
            if state.capture_generation == generation {
                state.still = Some(still);
                None
            } else {
                Some(still)
            }
        };
        if let Some(still) = stale {
            still.stop().await;
            return;
        }

        self.emit(VerificationEvent::CameraReady);
        self.status(
            Surface::Capture,
            "Camera ready. Position your face in the frame.",
            false,
        );
    }

    /// Capture one frame and submit it for the current capture mode.
    ///
    /// In attendance mode the pending handle is consumed once the frame is
    /// sent; a local capture failure hands it back for the retry.
    #[instrument(level = "info", skip_all)]
    pub async fn capture_and_submit(&self) -> Result<CaptureOutcome> {
        let (mode, pending, still, generation) = {
            let mut state = self.lock();
            if state.capturing {
                return Err(RollcallError::Busy("Face capture"));
            }
            let Some(mode) = state.phase.capture_mode() else {
                return Err(RollcallError::InvalidTransition {
                    from: format!("{:?}", state.phase),
                    to: format!("{:?}", VerificationPhase::Submitting(state.capture_mode)),
                });
            };
            if mode == CaptureMode::Attendance && state.pending.is_none() {
                drop(state);
                self.status(
                    Surface::Capture,
                    RollcallError::MissingPendingVerification.to_string(),
                    true,
                );
                return Err(RollcallError::MissingPendingVerification);
            }
            let Some(still) = state.still.take() else {
                return Err(CameraError::NoFrame.into());
            };
            state.phase.transition(VerificationPhase::Submitting(mode))?;
            state.capturing = true;
            let pending = match mode {
                CaptureMode::Attendance => state.pending.take(),
                CaptureMode::Register => None,
            };
            (mode, pending, still, state.capture_generation)
        };

        let captured = still.capture().await;
        let stale = {
            let mut state = self.lock();
            if state.capture_generation == generation {
                state.still = Some(still);
                None
            } else {
                Some(still)
            }
        };
        if let Some(still) = stale {
            still.stop().await;
        }

        let image = match captured {
            Ok(image) => image,
            Err(e) => {
                self.restore_after_failure(mode, generation, pending);
                self.status(Surface::Capture, e.to_string(), true);
                return Err(e);
            }
        };

        self.status(Surface::Capture, "Processing...", false);
        let result = match (mode, pending) {
            (CaptureMode::Register, _) => self
                .shared
                .gateway
                .register_face(&image)
                .await
                .map(|()| CaptureOutcome::Registered),
            (CaptureMode::Attendance, Some(pending)) => self
                .shared
                .gateway
                .verify_face(&image, pending.attendance_id())
                .await
                .map(|verdict| CaptureOutcome::Attendance(verdict.into())),
            (CaptureMode::Attendance, None) => Err(RollcallError::MissingPendingVerification),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let op = match mode {
                    CaptureMode::Register => Operation::RegisterFace,
                    CaptureMode::Attendance => Operation::VerifyFace,
                };
                warn!(error = %e, ?mode, "Face submission failed");
                if self.restore_after_failure(mode, generation, None) {
                    self.status(Surface::Capture, e.user_message(op), true);
                }
                return Err(e);
            }
        };

        match outcome {
            CaptureOutcome::Registered => {
                self.lock().registered = true;
                info!("Face registered");
                self.emit(VerificationEvent::RegistrationComplete);
                if self.capture_is_current(generation) {
                    self.status(Surface::Capture, "Face registered successfully!", false);
                }
                let delay = self.shared.timing.registration_reload_delay;
                self.close_capture_later(generation, delay, true);
            }
            CaptureOutcome::Attendance(result) => {
                info!(
                    matched = result.matched,
                    score = result.score,
                    "Face verification finished"
                );
                if self.capture_is_current(generation) {
                    self.status(Surface::Capture, result.message(), !result.matched);
                    self.emit(VerificationEvent::AttendanceResult(result));
                    let delay = self.shared.timing.result_close_delay;
                    self.close_capture_later(generation, delay, false);
                }
            }
        }
        Ok(outcome)
    }

    /// Re-enable capture after a failed submission, handing back a pending
    /// handle that never left the device. Returns false if the capture
    /// surface was closed in the meantime.
    fn restore_after_failure(
        &self,
        mode: CaptureMode,
        generation: u64,
        pending: Option<PendingVerification>,
    ) -> bool {
        let mut state = self.lock();
        if state.capture_generation != generation {
            return false;
        }
        state.capturing = false;
        state.phase = VerificationPhase::AwaitingCapture(mode);
        if pending.is_some() {
            state.pending = pending;
        }
        true
    }

    /// After `delay`, request a reload (if asked) and close the capture
    /// surface unless it was closed or reopened in the meantime.
    fn close_capture_later(&self, generation: u64, delay: std::time::Duration, reload: bool) {
        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if reload {
                controller.emit(VerificationEvent::ReloadRequested);
            }
            if controller.capture_is_current(generation) {
                controller.dismiss_capture_surface().await;
            }
        });
    }

    /// Close the capture surface: release the camera, drop the pending
    /// handle and return to `Idle`.
    #[instrument(level = "debug", skip_all)]
    pub async fn dismiss_capture_surface(&self) {
        let still = {
            let mut state = self.lock();
            state.capture_generation += 1;
            state.capturing = false;
            state.capture_mode = CaptureMode::Register;
            state.pending = None;
            if state.phase.capture_mode().is_some() {
                state.phase = VerificationPhase::Idle;
            }
            state.still.take()
        };
        if let Some(still) = still {
            still.stop().await;
        }
        self.emit(VerificationEvent::StatusCleared(Surface::Capture));
        self.emit(VerificationEvent::CaptureSurfaceClosed);
    }

    /// Close the scan surface and stop the scanner.
    ///
    /// Once a token has been accepted and the hand-off to capture is under
    /// way, the phase is left alone.
    #[instrument(level = "debug", skip_all)]
    pub async fn dismiss_scan_surface(&self) {
        let scanner = {
            let mut state = self.lock();
            if !state.handoff {
                state.scan_generation += 1;
                if matches!(
                    state.phase,
                    VerificationPhase::Scanning | VerificationPhase::Validating
                ) {
                    state.phase = VerificationPhase::Idle;
                }
            }
            state.scanner.take()
        };
        if let Some(scanner) = scanner {
            scanner.stop().await;
        }
        self.emit(VerificationEvent::StatusCleared(Surface::Scan));
        self.emit(VerificationEvent::ScanSurfaceClosed);
    }
}

/// Forwards the first decoded QR text of one scan surface to validation.
async fn scan_listener(
    controller: StudentVerificationController,
    mut events: mpsc::UnboundedReceiver<ScanEvent>,
    generation: u64,
) {
    let Some(event) = events.recv().await else {
        return;
    };
    if !controller.scan_is_current(generation) {
        return;
    }
    match event {
        ScanEvent::Decoded(text) => {
            if let Err(e) = controller.submit_token(&text).await {
                debug!(error = %e, "Scanned token not accepted");
            }
        }
        ScanEvent::Failed(reason) => {
            controller.status(Surface::Scan, reason, true);
        }
    }
}
