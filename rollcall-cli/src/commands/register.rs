//! Register command implementation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use colored::Colorize;
use rollcall_core::{
    CameraAdapter, CaptureOutcome, MockBackendConfig, Operation, StudentVerificationController,
    VerificationTiming,
};
use tracing::info;

use crate::camera::FileCamera;
use crate::utils::{ensure_camera, failed, mock_gateway, BackendOptions};

/// Execute the register command.
pub async fn execute(options: &BackendOptions, face: PathBuf, use_mock: bool) -> Result<()> {
    // Read the image before touching the backend
    let device = FileCamera::load(&face)?;

    let backend = if use_mock {
        options.mock(mock_gateway(MockBackendConfig {
            face_registered: false,
            ..Default::default()
        }))
    } else {
        options.http()?
    };

    let camera = CameraAdapter::new(Arc::new(device), backend.secure_context);
    ensure_camera(&camera)?;

    let (student, _events) = StudentVerificationController::new(
        backend.gateway,
        camera,
        VerificationTiming::immediate(),
        false,
    );

    student
        .open_registration()
        .await
        .map_err(failed(Operation::RegisterFace))?;
    let outcome = student
        .capture_and_submit()
        .await
        .map_err(failed(Operation::RegisterFace))?;

    let CaptureOutcome::Registered = outcome else {
        bail!("Backend answered a registration with an attendance verdict");
    };

    info!(path = %face.display(), "Face registered");

    if !options.quiet {
        println!();
        println!("{}", "Face registered successfully.".green().bold());
        println!("   {} {}", "Image:".dimmed(), face.display());
    }

    Ok(())
}
