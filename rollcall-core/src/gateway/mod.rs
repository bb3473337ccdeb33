//! Backend gateway abstraction.
//!
//! The attendance backend is an external collaborator reached over
//! HTTP/JSON. Controllers only see the [`AttendanceGateway`] trait, so they
//! can run against the live HTTP client or the in-memory [`MockGateway`].
//!
//! ## Failure shapes
//!
//! Every JSON endpoint distinguishes three failures:
//!
//! - non-2xx status → [`RollcallError::Status`] (carrying the body's `error`, if any)
//! - missing or malformed JSON → [`RollcallError::MalformedResponse`]
//! - `success: false` → [`RollcallError::Rejected`]

#[cfg(feature = "http")]
mod http;
mod mock;

#[cfg(feature = "http")]
pub use http::{is_transient_error, is_transient_status, HttpGateway};
pub use mock::{MockBackendConfig, MockGateway};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::camera::EncodedImage;
use crate::error::{Result, RollcallError};

/// Backend identifier that is opaque to the client.
///
/// The backend may hand out numbers or strings; either form is sent back
/// exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpaqueId {
    Number(u64),
    Text(String),
}

impl std::fmt::Display for OpaqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for OpaqueId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<u64> for OpaqueId {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

/// Attendance session handle assigned by the backend.
pub type SessionId = OpaqueId;

/// Pending attendance record handle returned by token validation.
pub type AttendanceId = OpaqueId;

/// Classroom identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassroomId(pub u64);

impl std::fmt::Display for ClassroomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Successful start-session response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionGrant {
    pub session_id: SessionId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Successful refresh response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Successful token validation response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScanAcceptance {
    pub attendance_id: AttendanceId,
}

/// Face verification verdict. A non-match is still a successful exchange.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FaceVerdict {
    #[serde(rename = "match")]
    pub matched: bool,
    pub score: f64,
}

/// Raw attendance export as served by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportPayload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ValidateTokenRequest<'a> {
    pub token: &'a str,
    pub classroom_id: ClassroomId,
}

#[derive(Debug, Serialize)]
pub(crate) struct RegisterFaceRequest<'a> {
    pub image: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct VerifyFaceRequest<'a> {
    pub image: &'a str,
    pub attendance_id: &'a AttendanceId,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Acknowledgement {}

/// Trait for the attendance backend.
///
/// Implementations must be thread-safe (`Send + Sync`); controllers share
/// one gateway between their timer tasks.
#[async_trait]
pub trait AttendanceGateway: Send + Sync {
    /// Open a session for a classroom and issue its first token.
    async fn start_session(&self, classroom: ClassroomId) -> Result<SessionGrant>;

    /// Fetch the session's current token and expiry.
    async fn refresh_token(&self, session: &SessionId) -> Result<TokenGrant>;

    /// Close a session.
    async fn stop_session(&self, session: &SessionId) -> Result<()>;

    /// Check a scanned token against the student's classroom membership.
    async fn validate_token(&self, token: &str, classroom: ClassroomId) -> Result<ScanAcceptance>;

    /// Enroll the student's reference face.
    async fn register_face(&self, image: &EncodedImage) -> Result<()>;

    /// Compare a live capture against the reference for a pending record.
    async fn verify_face(&self, image: &EncodedImage, attendance: &AttendanceId)
        -> Result<FaceVerdict>;

    /// Download the classroom's attendance spreadsheet.
    async fn download_export(&self, classroom: ClassroomId) -> Result<ExportPayload>;
}

/// Decode a JSON `{success, error, ...}` envelope into `T`.
pub(crate) fn decode_envelope<T: DeserializeOwned>(status: u16, body: &[u8]) -> Result<T> {
    let value: Option<serde_json::Value> = serde_json::from_slice(body).ok();

    if !(200..300).contains(&status) {
        return Err(RollcallError::Status {
            status,
            error: value.as_ref().and_then(error_field),
        });
    }

    let value = match value {
        Some(v @ serde_json::Value::Object(_)) => v,
        Some(_) => {
            return Err(RollcallError::MalformedResponse(
                "expected a JSON object".into(),
            ))
        }
        None => {
            return Err(RollcallError::MalformedResponse(
                "response body is not JSON".into(),
            ))
        }
    };

    let success = value
        .get("success")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if !success {
        return Err(RollcallError::Rejected {
            message: error_field(&value),
        });
    }

    serde_json::from_value(value).map_err(|e| RollcallError::MalformedResponse(e.to_string()))
}

/// Decode a verify-face response, where `success: false` with `match: false`
/// is a verdict rather than a failure.
pub(crate) fn decode_face_verdict(status: u16, body: &[u8]) -> Result<FaceVerdict> {
    if (200..300).contains(&status) {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            let unmatched = value.get("match").and_then(serde_json::Value::as_bool) == Some(false);
            let succeeded = value.get("success").and_then(serde_json::Value::as_bool) == Some(true);
            if unmatched && !succeeded {
                return serde_json::from_value(value)
                    .map_err(|e| RollcallError::MalformedResponse(e.to_string()));
            }
        }
    }
    decode_envelope(status, body)
}

fn error_field(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}
