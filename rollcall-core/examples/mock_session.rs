//! Example demonstrating a full attendance round trip with tracing output.
//!
//! Run with: cargo run -p rollcall-core --example mock_session

use std::sync::Arc;
use std::time::Duration;

use rollcall_core::{
    CameraAdapter, CaptureOutcome, ClassroomId, MockCameraDevice, MockGateway, SessionEvent,
    SessionTiming, StudentVerificationController, TeacherSessionController, VerificationTiming,
};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::new("rollcall_core=debug,info"))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    println!("=== Rollcall Mock Session Demo ===\n");

    let gateway = Arc::new(MockGateway::default());
    let classroom = ClassroomId(7);

    let timing = SessionTiming {
        poll_interval: Duration::from_millis(500),
        ..Default::default()
    };
    let (teacher, mut teacher_events) = TeacherSessionController::new(gateway.clone(), timing);

    let session = match teacher.start(classroom).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to start session: {}", e);
            return;
        }
    };
    println!("Session {} started, token {}\n", session.session_id, session.token);

    let camera = CameraAdapter::new(Arc::new(MockCameraDevice::new()), true);
    let (student, _student_events) = StudentVerificationController::new(
        gateway.clone(),
        camera,
        VerificationTiming::immediate(),
        gateway.face_registered(),
    );

    let result = async {
        student.request_scan(classroom).await?;
        student.submit_token(&session.token).await?;
        student.capture_and_submit().await
    }
    .await;

    match result {
        Ok(CaptureOutcome::Attendance(verdict)) => println!("\n✅ {}", verdict.message()),
        Ok(other) => println!("\nUnexpected outcome: {:?}", other),
        Err(e) => println!("\n❌ Failed: {}", e),
    }

    tokio::time::sleep(Duration::from_millis(1200)).await;
    match teacher.dismiss_display().await {
        Ok(outcome) => println!("Stop outcome: {:?}", outcome),
        Err(e) => println!("Stop failed: {}", e),
    }

    while let Ok(event) = teacher_events.try_recv() {
        if let SessionEvent::TokenRefreshed { token, .. } = event {
            println!("   rotated token: {}", token);
        }
    }
    println!("   present: {}", gateway.present_count());
}
