//! Exit codes following sysexits.h conventions.
//!
//! Scripts driving the client can tell a refused token apart from an
//! unreachable backend without parsing the error text.

use rollcall_core::{ErrorKind, RollcallError};

/// General error (catch-all).
pub const GENERAL_ERROR: i32 = 1;

/// Command line usage error (invalid arguments, missing token).
/// Maps to EX_USAGE from sysexits.h.
pub const USAGE_ERROR: i32 = 64;

/// The backend refused the data we sent (bad token, face not matched).
/// Maps to EX_DATAERR from sysexits.h.
pub const REJECTED: i32 = 65;

/// Cannot open input file or camera source.
/// Maps to EX_NOINPUT from sysexits.h.
pub const INPUT_ERROR: i32 = 66;

/// Backend unreachable or answering without an explanation.
/// Maps to EX_UNAVAILABLE from sysexits.h.
pub const NETWORK_ERROR: i32 = 69;

/// I/O error (cannot write output file).
/// Maps to EX_IOERR from sysexits.h.
pub const IO_ERROR: i32 = 74;

/// Represents an exit code with optional error context.
pub struct ExitCode {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitCode {
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");

        // Typed errors from the client core first, then the CLI's own context strings
        let code = match err.chain().find_map(|e| e.downcast_ref::<RollcallError>()) {
            Some(core) => classify(core),
            None if message.contains("Failed to read") || message.contains("Failed to decode") => {
                INPUT_ERROR
            }
            None if message.contains("Failed to write") => IO_ERROR,
            None if message.contains("Face not matched") => REJECTED,
            None if message.contains("is required") => USAGE_ERROR,
            None => GENERAL_ERROR,
        };

        Self {
            code,
            message: Some(message),
        }
    }
}

fn classify(err: &RollcallError) -> i32 {
    match err.kind() {
        ErrorKind::Transport => NETWORK_ERROR,
        ErrorKind::Server => REJECTED,
        ErrorKind::Local => match err {
            RollcallError::Camera(_)
            | RollcallError::CameraBlocked(_)
            | RollcallError::ImageEncoding(_) => INPUT_ERROR,
            RollcallError::EmptyToken
            | RollcallError::NoClassroomSelected
            | RollcallError::RegistrationRequired
            | RollcallError::AlreadyRegistered
            | RollcallError::Config(_) => USAGE_ERROR,
            _ => GENERAL_ERROR,
        },
    }
}
