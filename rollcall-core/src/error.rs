use thiserror::Error;

use crate::camera::{CameraBlockReason, CameraError};

/// Server-reported error string that is escalated to a blocking alert.
pub const MEMBERSHIP_MISMATCH: &str = "You don't belong to this class.";

#[derive(Error, Debug)]
pub enum RollcallError {
    #[error("Token cannot be empty.")]
    EmptyToken,

    #[error("Missing attendance context. Scan QR again.")]
    MissingPendingVerification,

    #[error("{0}")]
    CameraBlocked(CameraBlockReason),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Please register facial biometrics first.")]
    RegistrationRequired,

    #[error("Your face is already verified!")]
    AlreadyRegistered,

    #[error("No classroom selected for attendance.")]
    NoClassroomSelected,

    #[error("Cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{0} is already in progress")]
    Busy(&'static str),

    #[error("Image encoding error: {0}")]
    ImageEncoding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[cfg(feature = "http")]
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned status {status}")]
    Status { status: u16, error: Option<String> },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("{}", .message.as_deref().unwrap_or("Request rejected by server"))]
    Rejected { message: Option<String> },
}

pub type Result<T> = std::result::Result<T, RollcallError>;

/// Coarse error category, used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before reaching the network.
    Local,
    /// Network unreachable, non-2xx without a server message, unreadable body.
    Transport,
    /// The server answered with an explanation.
    Server,
}

impl RollcallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Status { error: Some(_), .. } | Self::Rejected { .. } => ErrorKind::Server,
            Self::Status { error: None, .. } | Self::MalformedResponse(_) => ErrorKind::Transport,
            #[cfg(feature = "http")]
            Self::Http(_) => ErrorKind::Transport,
            _ => ErrorKind::Local,
        }
    }

    /// The `error` string the server sent, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Status { error, .. } => error.as_deref(),
            Self::Rejected { message } => message.as_deref(),
            _ => None,
        }
    }

    /// HTTP status of a non-2xx response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            #[cfg(feature = "http")]
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_membership_mismatch(&self) -> bool {
        self.server_message() == Some(MEMBERSHIP_MISMATCH)
    }

    /// Text shown to the user when `op` fails with this error.
    ///
    /// Server messages are shown verbatim; transport failures fall back to the
    /// operation's generic or network wording.
    pub fn user_message(&self, op: Operation) -> String {
        if let Some(message) = self.server_message() {
            return message.to_string();
        }
        match self {
            Self::Status { .. } | Self::Rejected { .. } => op.failure_message().to_string(),
            Self::MalformedResponse(_) => op.network_message().to_string(),
            #[cfg(feature = "http")]
            Self::Http(_) => op.network_message().to_string(),
            other => other.to_string(),
        }
    }
}

/// Gateway operations, each with its own fallback wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StartSession,
    RefreshToken,
    StopSession,
    ValidateToken,
    RegisterFace,
    VerifyFace,
    DownloadExport,
}

impl Operation {
    pub fn failure_message(self) -> &'static str {
        match self {
            Self::StartSession => "Could not start attendance.",
            Self::RefreshToken => "Failed to refresh QR.",
            Self::StopSession => "Failed to stop session.",
            Self::ValidateToken => "QR scan failed.",
            Self::RegisterFace | Self::VerifyFace => "Request failed",
            Self::DownloadExport => "Unable to download attendance right now.",
        }
    }

    pub fn network_message(self) -> &'static str {
        match self {
            Self::StartSession => "Network error while starting attendance.",
            Self::RefreshToken => "Network error while refreshing QR.",
            Self::StopSession => "Network error while stopping session.",
            Self::ValidateToken => "Network error while validating QR.",
            Self::RegisterFace | Self::VerifyFace => "Network error while submitting face capture.",
            Self::DownloadExport => "Network error while downloading attendance.",
        }
    }
}
