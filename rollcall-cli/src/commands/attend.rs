//! Attend command implementation.
//!
//! Drives the same handshake a student device runs: select the classroom,
//! submit the token, then send one face capture for the pending record.
//! Tokens are entered by hand; the QR decoder is never started.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use rollcall_core::{
    AttendanceGateway, CameraAdapter, CaptureOutcome, ClassroomId, MockBackendConfig, Operation,
    StudentVerificationController, VerificationTiming,
};
use tracing::{debug, info, warn};

use crate::camera::FileCamera;
use crate::utils::{ensure_camera, failed, mock_gateway, BackendOptions};

/// Read the token from stdin, prompting on stderr.
fn prompt_token(quiet: bool) -> Result<String> {
    if !quiet {
        eprint!("Token: ");
        std::io::stderr().flush().ok();
    }
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read token from stdin")?;
    if line.is_empty() {
        bail!("A token is required without --mock (pass --token or type it)");
    }
    Ok(line)
}

/// Execute the attend command.
pub async fn execute(
    options: &BackendOptions,
    classroom: u64,
    token: Option<String>,
    face: PathBuf,
    use_mock: bool,
    mock_score: Option<f64>,
) -> Result<()> {
    let classroom = ClassroomId(classroom);
    let device = FileCamera::load(&face)?;

    let (backend, token) = if use_mock {
        let mut config = MockBackendConfig::default();
        if let Some(score) = mock_score {
            config.face_score = score;
        }
        let mock = mock_gateway(config);
        let token = match token {
            Some(token) => token,
            None => {
                let grant = mock.start_session(classroom).await?;
                debug!(session_id = %grant.session_id, "Opened mock session for its token");
                grant.token
            }
        };
        (options.mock(mock), token)
    } else {
        let token = match token {
            Some(token) => token,
            None => prompt_token(options.quiet)?,
        };
        (options.http()?, token)
    };

    let camera = CameraAdapter::new(Arc::new(device), backend.secure_context);
    ensure_camera(&camera)?;

    let (student, _events) = StudentVerificationController::new(
        backend.gateway,
        camera,
        VerificationTiming::immediate(),
        true,
    );

    student
        .request_scan(classroom)
        .await
        .map_err(failed(Operation::ValidateToken))?;
    student
        .submit_token(&token)
        .await
        .map_err(failed(Operation::ValidateToken))?;

    info!(%classroom, "Token accepted, capturing face");

    let outcome = student
        .capture_and_submit()
        .await
        .map_err(failed(Operation::VerifyFace))?;

    let CaptureOutcome::Attendance(result) = outcome else {
        bail!("Backend answered an attendance check with a registration");
    };

    if result.matched {
        info!(score = result.score, "Attendance marked");
        if !options.quiet {
            println!();
            println!("{}", result.message().green().bold());
        }
        Ok(())
    } else {
        warn!(score = result.score, "Face did not match");
        if !options.quiet {
            println!();
            println!("{}", result.message().red().bold());
        }
        bail!("Face not matched (score {:.4})", result.score)
    }
}
