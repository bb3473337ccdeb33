//! Scripted gateway shared by the controller integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::{mpsc, Notify};

use rollcall_core::{
    AttendanceGateway, AttendanceId, ClassroomId, EncodedImage, ExportPayload, FaceVerdict,
    Result, RollcallError, ScanAcceptance, SessionGrant, SessionId, TokenGrant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Start,
    Refresh,
    Stop,
    Validate,
    Register,
    Verify,
    Export,
}

/// Gateway that replays queued responses, counts calls and can hold a call
/// in flight until the test releases it.
#[derive(Default)]
pub struct ScriptedGateway {
    starts: Mutex<VecDeque<Result<SessionGrant>>>,
    refreshes: Mutex<VecDeque<Result<TokenGrant>>>,
    stops: Mutex<VecDeque<Result<()>>>,
    validations: Mutex<VecDeque<Result<ScanAcceptance>>>,
    registrations: Mutex<VecDeque<Result<()>>>,
    verifications: Mutex<VecDeque<Result<FaceVerdict>>>,
    calls: Mutex<HashMap<Op, usize>>,
    gates: Mutex<HashMap<Op, Arc<Notify>>>,
    validated: Mutex<Vec<(String, ClassroomId)>>,
    verified: Mutex<Vec<AttendanceId>>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_start(&self, response: Result<SessionGrant>) {
        self.starts.lock().unwrap().push_back(response);
    }

    pub fn push_refresh(&self, response: Result<TokenGrant>) {
        self.refreshes.lock().unwrap().push_back(response);
    }

    pub fn push_stop(&self, response: Result<()>) {
        self.stops.lock().unwrap().push_back(response);
    }

    pub fn push_validate(&self, response: Result<ScanAcceptance>) {
        self.validations.lock().unwrap().push_back(response);
    }

    pub fn push_register(&self, response: Result<()>) {
        self.registrations.lock().unwrap().push_back(response);
    }

    pub fn push_verify(&self, response: Result<FaceVerdict>) {
        self.verifications.lock().unwrap().push_back(response);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    /// Hold every future call of `op` until the returned gate is notified.
    pub fn gate(&self, op: Op) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(op, gate.clone());
        gate
    }

    pub fn validated(&self) -> Vec<(String, ClassroomId)> {
        self.validated.lock().unwrap().clone()
    }

    pub fn verified(&self) -> Vec<AttendanceId> {
        self.verified.lock().unwrap().clone()
    }

    async fn enter(&self, op: Op) {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        let gate = self.gates.lock().unwrap().get(&op).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn next<T>(queue: &Mutex<VecDeque<Result<T>>>) -> Result<T> {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(server_error(500, None)))
    }
}

#[async_trait]
impl AttendanceGateway for ScriptedGateway {
    async fn start_session(&self, _classroom: ClassroomId) -> Result<SessionGrant> {
        self.enter(Op::Start).await;
        Self::next(&self.starts)
    }

    async fn refresh_token(&self, _session: &SessionId) -> Result<TokenGrant> {
        self.enter(Op::Refresh).await;
        Self::next(&self.refreshes)
    }

    async fn stop_session(&self, _session: &SessionId) -> Result<()> {
        self.enter(Op::Stop).await;
        Self::next(&self.stops)
    }

    async fn validate_token(&self, token: &str, classroom: ClassroomId) -> Result<ScanAcceptance> {
        self.validated.lock().unwrap().push((token.to_string(), classroom));
        self.enter(Op::Validate).await;
        Self::next(&self.validations)
    }

    async fn register_face(&self, _image: &EncodedImage) -> Result<()> {
        self.enter(Op::Register).await;
        Self::next(&self.registrations)
    }

    async fn verify_face(
        &self,
        image: &EncodedImage,
        attendance: &AttendanceId,
    ) -> Result<FaceVerdict> {
        assert!(image.as_str().starts_with("data:image/png;base64,"));
        self.verified.lock().unwrap().push(attendance.clone());
        self.enter(Op::Verify).await;
        Self::next(&self.verifications)
    }

    async fn download_export(&self, _classroom: ClassroomId) -> Result<ExportPayload> {
        self.enter(Op::Export).await;
        Err(server_error(404, Some("No attendance sessions found for this classroom.")))
    }
}

pub fn session_grant(id: &str, token: &str, ttl_secs: i64) -> SessionGrant {
    SessionGrant {
        session_id: id.into(),
        token: token.into(),
        expires_at: Utc::now() + Duration::seconds(ttl_secs),
    }
}

pub fn token_grant(token: &str, ttl_secs: i64) -> TokenGrant {
    TokenGrant {
        token: token.into(),
        expires_at: Utc::now() + Duration::seconds(ttl_secs),
    }
}

pub fn server_error(status: u16, message: Option<&str>) -> RollcallError {
    RollcallError::Status {
        status,
        error: message.map(str::to_string),
    }
}

/// Everything currently queued on an event channel.
pub fn drain<T>(events: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Let spawned tasks run up to their next suspension point.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
