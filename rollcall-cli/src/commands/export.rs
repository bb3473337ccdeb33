//! Export command implementation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::Colorize;
use rollcall_core::{
    AttendanceGateway, ClassroomId, MockBackendConfig, MockGateway, Operation, SessionTiming,
    TeacherSessionController,
};
use tracing::{debug, info};

use crate::utils::{failed, mock_gateway, BackendOptions};

/// Execute the export command.
pub async fn execute(
    options: &BackendOptions,
    classroom: u64,
    name: Option<String>,
    out_dir: PathBuf,
    use_mock: bool,
) -> Result<()> {
    let classroom = ClassroomId(classroom);
    let backend = if use_mock {
        let mock = mock_gateway(MockBackendConfig::default());
        seed_mock_history(&mock, classroom).await?;
        options.mock(mock)
    } else {
        options.http()?
    };

    let (controller, _events) =
        TeacherSessionController::new(backend.gateway, SessionTiming::default());
    let export = controller
        .download_export(classroom, name.as_deref())
        .await
        .map_err(failed(Operation::DownloadExport))?;

    let path = out_dir.join(&export.filename);
    std::fs::write(&path, &export.bytes)
        .with_context(|| format!("Failed to write attendance file: {}", path.display()))?;

    info!(path = %path.display(), bytes = export.bytes.len(), "Attendance saved");

    if !options.quiet {
        println!();
        println!("{}", "Attendance downloaded".green().bold());
        println!();
        println!("   {} {}", "Saved:".dimmed(), path.display());
        println!("   {} {} bytes", "Size:".dimmed(), export.bytes.len());
    }

    Ok(())
}

/// The mock backend only exports classrooms that have held a session.
async fn seed_mock_history(mock: &MockGateway, classroom: ClassroomId) -> Result<()> {
    let grant = mock.start_session(classroom).await?;
    mock.stop_session(&grant.session_id).await?;
    debug!(session_id = %grant.session_id, "Seeded mock session history");
    Ok(())
}
