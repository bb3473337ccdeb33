//! In-memory attendance backend for demos and tests.
//!
//! Mirrors the backend's validation rules closely enough to drive both
//! controllers end to end without a server.
//! WARNING: tokens are deterministic and no face is actually compared.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sha3::{Digest, Sha3_256};
use tracing::debug;

use super::{
    AttendanceGateway, AttendanceId, ClassroomId, ExportPayload, FaceVerdict, OpaqueId,
    ScanAcceptance, SessionGrant, SessionId, TokenGrant,
};
use crate::camera::EncodedImage;
use crate::error::{Result, RollcallError, MEMBERSHIP_MISMATCH};

/// Behaviour knobs for [`MockGateway`].
#[derive(Debug, Clone)]
pub struct MockBackendConfig {
    /// Lifetime of each issued token (default: 30s)
    pub token_ttl: Duration,
    /// Classrooms the student belongs to; `None` means every classroom.
    pub enrolled: Option<HashSet<ClassroomId>>,
    /// Similarity score returned by face verification (default: 0.8731)
    pub face_score: f64,
    /// Score at or above which a face matches (default: 0.70)
    pub match_threshold: f64,
    /// Whether the student already has a reference face
    pub face_registered: bool,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::seconds(30),
            enrolled: None,
            face_score: 0.8731,
            match_threshold: 0.70,
            face_registered: true,
        }
    }
}

#[derive(Debug)]
struct MockSession {
    classroom: ClassroomId,
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct MockAttendance {
    session: String,
    present: bool,
}

#[derive(Debug, Default)]
struct MockState {
    counter: u64,
    face_registered: bool,
    sessions: HashMap<String, MockSession>,
    /// Every session ever opened, with its classroom.
    history: Vec<(String, ClassroomId)>,
    attendance: HashMap<u64, MockAttendance>,
}

/// Deterministic in-memory backend.
pub struct MockGateway {
    seed: u64,
    config: MockBackendConfig,
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, MockBackendConfig::default())
    }

    pub fn with_config(seed: u64, config: MockBackendConfig) -> Self {
        let state = MockState {
            face_registered: config.face_registered,
            ..Default::default()
        };
        Self {
            seed,
            config,
            state: Mutex::new(state),
        }
    }

    /// Current token of the live session for a classroom, if any.
    pub fn live_token(&self, classroom: ClassroomId) -> Option<String> {
        let state = self.lock();
        state
            .sessions
            .values()
            .find(|s| s.classroom == classroom)
            .map(|s| s.token.clone())
    }

    /// Whether the student has a reference face on record.
    pub fn face_registered(&self) -> bool {
        self.lock().face_registered
    }

    /// Number of attendance records marked present.
    pub fn present_count(&self) -> usize {
        self.lock().attendance.values().filter(|a| a.present).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Derive the next token from the seed and a counter using SHA3.
    fn mint_token(&self, state: &mut MockState) -> String {
        state.counter += 1;
        let mut hasher = Sha3_256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(state.counter.to_le_bytes());
        hasher.update(b"rollcall-mock-token");
        hex::encode(&hasher.finalize()[..8])
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new(0x5EED_CAFE)
    }
}

fn reject(status: u16, message: &str) -> RollcallError {
    RollcallError::Status {
        status,
        error: Some(message.to_string()),
    }
}

#[async_trait]
impl AttendanceGateway for MockGateway {
    async fn start_session(&self, classroom: ClassroomId) -> Result<SessionGrant> {
        let mut state = self.lock();
        state.sessions.retain(|_, s| s.classroom != classroom);

        let token = self.mint_token(&mut state);
        let session_id = format!("session-{}", state.counter);
        let expires_at = Utc::now() + self.config.token_ttl;
        state.sessions.insert(
            session_id.clone(),
            MockSession {
                classroom,
                token: token.clone(),
                expires_at,
            },
        );
        state.history.push((session_id.clone(), classroom));
        debug!(%classroom, session_id = %session_id, "Mock session started");

        Ok(SessionGrant {
            session_id: OpaqueId::Text(session_id),
            token,
            expires_at,
        })
    }

    async fn refresh_token(&self, session: &SessionId) -> Result<TokenGrant> {
        let mut state = self.lock();
        let key = session.to_string();
        let now = Utc::now();

        let expired = match state.sessions.get(&key) {
            Some(s) => s.expires_at <= now,
            None => return Err(reject(404, "Attendance session not found.")),
        };
        let fresh = expired.then(|| self.mint_token(&mut state));

        let ttl = self.config.token_ttl;
        let Some(live) = state.sessions.get_mut(&key) else {
            return Err(reject(404, "Attendance session not found."));
        };
        if let Some(token) = fresh {
            live.token = token;
            live.expires_at = now + ttl;
        }
        Ok(TokenGrant {
            token: live.token.clone(),
            expires_at: live.expires_at,
        })
    }

    async fn stop_session(&self, session: &SessionId) -> Result<()> {
        let mut state = self.lock();
        match state.sessions.remove(&session.to_string()) {
            Some(_) => Ok(()),
            None => Err(reject(404, "Attendance session not found.")),
        }
    }

    async fn validate_token(&self, token: &str, classroom: ClassroomId) -> Result<ScanAcceptance> {
        let mut state = self.lock();
        let Some((session_id, live)) = state.sessions.iter().find(|(_, s)| s.token == token) else {
            return Err(reject(400, "Invalid QR token."));
        };
        if live.expires_at <= Utc::now() {
            return Err(reject(400, "QR token expired."));
        }
        if live.classroom != classroom {
            return Err(reject(400, "Scanned QR does not belong to selected class."));
        }
        if let Some(enrolled) = &self.config.enrolled {
            if !enrolled.contains(&classroom) {
                return Err(reject(403, MEMBERSHIP_MISMATCH));
            }
        }
        let session_id = session_id.clone();
        if state
            .attendance
            .values()
            .any(|a| a.session == session_id && a.present)
        {
            return Err(reject(
                400,
                "Attendance already marked as present for this session.",
            ));
        }

        state.counter += 1;
        let attendance_id = state.counter;
        state.attendance.insert(
            attendance_id,
            MockAttendance {
                session: session_id,
                present: false,
            },
        );
        Ok(ScanAcceptance {
            attendance_id: OpaqueId::Number(attendance_id),
        })
    }

    async fn register_face(&self, image: &EncodedImage) -> Result<()> {
        if image.as_str().is_empty() {
            return Err(reject(400, "No image provided"));
        }
        self.lock().face_registered = true;
        Ok(())
    }

    async fn verify_face(
        &self,
        image: &EncodedImage,
        attendance: &AttendanceId,
    ) -> Result<FaceVerdict> {
        if image.as_str().is_empty() {
            return Err(reject(400, "attendance_id and image are required."));
        }
        let mut state = self.lock();
        if !state.face_registered {
            return Err(reject(400, "No registered face embedding found for student."));
        }
        let OpaqueId::Number(id) = attendance else {
            return Err(reject(404, "Attendance record not found."));
        };
        let Some(record) = state.attendance.get_mut(id) else {
            return Err(reject(404, "Attendance record not found."));
        };

        let score = self.config.face_score;
        let matched = score >= self.config.match_threshold;
        if matched {
            record.present = true;
        }
        Ok(FaceVerdict { matched, score })
    }

    async fn download_export(&self, classroom: ClassroomId) -> Result<ExportPayload> {
        let state = self.lock();
        let sessions: Vec<&String> = state
            .history
            .iter()
            .filter(|(_, c)| *c == classroom)
            .map(|(id, _)| id)
            .collect();
        if sessions.is_empty() {
            return Err(reject(404, "No attendance sessions found for this classroom."));
        }

        let mut sheet = String::from("session\trecord\tstatus\n");
        let mut records: Vec<(&u64, &MockAttendance)> = state
            .attendance
            .iter()
            .filter(|(_, a)| sessions.contains(&&a.session))
            .collect();
        records.sort_by_key(|(id, _)| **id);
        for (id, record) in records {
            let status = if record.present { "present" } else { "pending" };
            sheet.push_str(&format!("{}\t{id}\t{status}\n", record.session));
        }

        Ok(ExportPayload {
            bytes: sheet.into_bytes(),
            content_type: Some("application/vnd.ms-excel".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> EncodedImage {
        EncodedImage::from_data_url("data:image/png;base64,AAAA")
    }

    #[test]
    fn test_tokens_deterministic_per_seed() {
        let a = MockGateway::new(42);
        let b = MockGateway::new(42);
        let mut sa = a.lock();
        let mut sb = b.lock();
        assert_eq!(a.mint_token(&mut sa), b.mint_token(&mut sb));
        assert_ne!(a.mint_token(&mut sa), MockGateway::new(7).mint_token(&mut sb));
    }

    #[tokio::test]
    async fn test_full_mock_round_trip() {
        let gateway = MockGateway::default();
        let classroom = ClassroomId(7);

        let grant = gateway.start_session(classroom).await.unwrap();
        assert_eq!(gateway.live_token(classroom), Some(grant.token.clone()));

        let accepted = gateway.validate_token(&grant.token, classroom).await.unwrap();
        let verdict = gateway
            .verify_face(&image(), &accepted.attendance_id)
            .await
            .unwrap();
        assert!(verdict.matched);
        assert_eq!(gateway.present_count(), 1);

        let again = gateway.validate_token(&grant.token, classroom).await.unwrap_err();
        assert_eq!(
            again.server_message(),
            Some("Attendance already marked as present for this session.")
        );

        gateway.stop_session(&grant.session_id).await.unwrap();
        assert!(gateway.refresh_token(&grant.session_id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_membership_mismatch() {
        let gateway = MockGateway::with_config(
            1,
            MockBackendConfig {
                enrolled: Some(HashSet::from([ClassroomId(1)])),
                ..Default::default()
            },
        );
        let grant = gateway.start_session(ClassroomId(2)).await.unwrap();
        let err = gateway
            .validate_token(&grant.token, ClassroomId(2))
            .await
            .unwrap_err();
        assert!(err.is_membership_mismatch());
        assert_eq!(err.status(), Some(403));
    }

    #[tokio::test]
    async fn test_wrong_classroom_and_unknown_token() {
        let gateway = MockGateway::default();
        let grant = gateway.start_session(ClassroomId(1)).await.unwrap();

        let err = gateway.validate_token(&grant.token, ClassroomId(2)).await.unwrap_err();
        assert_eq!(
            err.server_message(),
            Some("Scanned QR does not belong to selected class.")
        );

        let err = gateway.validate_token("bogus", ClassroomId(1)).await.unwrap_err();
        assert_eq!(err.server_message(), Some("Invalid QR token."));
    }

    #[tokio::test]
    async fn test_refresh_rotates_expired_token() {
        let gateway = MockGateway::with_config(
            3,
            MockBackendConfig {
                token_ttl: Duration::zero(),
                ..Default::default()
            },
        );
        let grant = gateway.start_session(ClassroomId(1)).await.unwrap();
        let refreshed = gateway.refresh_token(&grant.session_id).await.unwrap();
        assert_ne!(refreshed.token, grant.token);
    }

    #[tokio::test]
    async fn test_export_requires_history() {
        let gateway = MockGateway::default();
        assert!(gateway.download_export(ClassroomId(9)).await.is_err());

        gateway.start_session(ClassroomId(9)).await.unwrap();
        let export = gateway.download_export(ClassroomId(9)).await.unwrap();
        assert!(String::from_utf8(export.bytes).unwrap().starts_with("session\t"));
    }

    #[tokio::test]
    async fn test_unregistered_face_cannot_verify() {
        let gateway = MockGateway::with_config(
            1,
            MockBackendConfig {
                face_registered: false,
                ..Default::default()
            },
        );
        let grant = gateway.start_session(ClassroomId(1)).await.unwrap();
        let accepted = gateway.validate_token(&grant.token, ClassroomId(1)).await.unwrap();
        assert!(gateway.verify_face(&image(), &accepted.attendance_id).await.is_err());

        gateway.register_face(&image()).await.unwrap();
        assert!(gateway.face_registered());
        assert!(gateway.verify_face(&image(), &accepted.attendance_id).await.is_ok());
    }
}
