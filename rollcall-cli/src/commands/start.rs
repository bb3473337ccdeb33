//! Start command implementation.

use std::time::Duration;

use anyhow::{bail, Result};
use colored::Colorize;
use rollcall_core::{
    ClassroomId, MockBackendConfig, Operation, SessionEvent, SessionTiming, StopOutcome,
    TeacherSessionController,
};
use tracing::{debug, info, warn};

use crate::utils::{failed, format_expiry, mock_gateway, BackendOptions};

/// Execute the start command.
///
/// Keeps the session open for `duration` seconds (or until Ctrl-C), printing
/// each rotated token, then stops it.
pub async fn execute(
    options: &BackendOptions,
    classroom: u64,
    duration: u64,
    use_mock: bool,
) -> Result<()> {
    let classroom = ClassroomId(classroom);
    let backend = if use_mock {
        options.mock(mock_gateway(MockBackendConfig::default()))
    } else {
        options.http()?
    };

    let (controller, mut events) =
        TeacherSessionController::new(backend.gateway, SessionTiming::default());

    let session = controller
        .start(classroom)
        .await
        .map_err(failed(Operation::StartSession))?;

    info!(session_id = %session.session_id, %classroom, "Attendance session open");

    if !options.quiet {
        println!();
        println!("{}", "Attendance session started".green().bold());
        println!();
        println!("   {} {}", "Classroom:".dimmed(), classroom);
        println!("   {} {}", "Session:".dimmed(), session.session_id);
        println!("   {} {}", "Token:".dimmed(), session.token.bold());
        println!("   {} {}", "Expires:".dimmed(), format_expiry(session.expires_at));
        println!();
    }

    let mut shown_token = session.token;
    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(deadline, interrupt);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!(seconds = duration, "Session duration elapsed");
                break;
            }
            _ = &mut interrupt => {
                info!("Interrupted, stopping session");
                break;
            }
            event = events.recv() => match event {
                Some(SessionEvent::TokenRefreshed { token, expires_at }) => {
                    if token != shown_token {
                        if !options.quiet {
                            println!(
                                "   {} {} (expires {})",
                                "Token:".dimmed(),
                                token.bold(),
                                format_expiry(expires_at)
                            );
                        }
                        shown_token = token;
                    }
                }
                Some(SessionEvent::Countdown { seconds_left: Some(seconds) }) => {
                    debug!(seconds_left = seconds, "Countdown");
                }
                Some(SessionEvent::Status { message, is_error: true }) => {
                    warn!(%message, "Session status");
                    if !options.quiet {
                        eprintln!("{}", message.yellow());
                    }
                }
                Some(SessionEvent::Ended { reason, .. }) => {
                    bail!("Attendance session ended by the server: {reason}");
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    let outcome = controller
        .stop()
        .await
        .map_err(failed(Operation::StopSession))?;

    if !options.quiet {
        match outcome {
            StopOutcome::Stopped => println!("{}", "Session stopped.".green()),
            StopOutcome::NoActiveSession | StopOutcome::AlreadyStopping => {
                println!("{}", "No active session to stop.".dimmed())
            }
        }
    }

    Ok(())
}
