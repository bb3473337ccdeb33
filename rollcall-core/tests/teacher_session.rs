//! Teacher session lifecycle tests on a paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{drain, server_error, session_grant, settle, token_grant, Op, ScriptedGateway};
use rollcall_core::{
    ClassroomId, OpaqueId, RollcallError, SessionEvent, SessionState, SessionTiming, StopOutcome,
    TeacherSessionController,
};
use tokio::time::sleep;

fn fixed_cadence() -> SessionTiming {
    SessionTiming {
        refresh_backoff_cap: None,
        ..Default::default()
    }
}

fn countdowns(events: &[SessionEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Countdown { seconds_left } => *seconds_left,
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_start_then_poll_replaces_token() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    gateway.push_refresh(Ok(token_grant("def", 33)));

    let (controller, mut events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    let session = controller.start(ClassroomId(7)).await.unwrap();
    assert_eq!(session.token, "abc");
    assert_eq!(session.session_id, OpaqueId::from("s1"));
    assert_eq!(controller.seconds_left(), Some(30));

    sleep(Duration::from_millis(2900)).await;
    assert_eq!(gateway.calls(Op::Refresh), 0);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(gateway.calls(Op::Refresh), 1);
    let snapshot = controller.snapshot().unwrap();
    assert_eq!(snapshot.token, "def");
    assert_eq!(snapshot.state, SessionState::Active);
    assert_eq!(controller.seconds_left(), Some(33));

    let events = drain(&mut events);
    assert!(events.contains(&SessionEvent::Status {
        message: "QR updated.".into(),
        is_error: false,
    }));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::TokenRefreshed { token, .. } if token == "def")));
}

#[tokio::test(start_paused = true)]
async fn test_countdown_only_rises_on_new_token() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    gateway.push_refresh(Ok(token_grant("def", 33)));

    let (controller, mut events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    controller.start(ClassroomId(7)).await.unwrap();

    sleep(Duration::from_millis(2900)).await;
    let before = countdowns(&drain(&mut events));
    assert!(before.len() >= 5);
    assert_eq!(before.first(), Some(&30));
    assert!(before.windows(2).all(|w| w[0] >= w[1]));

    sleep(Duration::from_millis(700)).await;
    let after = drain(&mut events);
    let refreshed_at = after
        .iter()
        .position(|e| matches!(e, SessionEvent::TokenRefreshed { .. }))
        .unwrap();
    let later = countdowns(&after[refreshed_at..]);
    assert!(later.iter().all(|&s| s >= 32));
    assert!(later.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test(start_paused = true)]
async fn test_start_failure_raises_alert_and_allows_retry() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Err(server_error(403, Some("Not your classroom."))));
    gateway.push_start(Err(server_error(500, None)));
    gateway.push_start(Ok(session_grant("s2", "xyz", 30)));

    let (controller, mut events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());

    assert!(controller.start(ClassroomId(1)).await.is_err());
    assert!(controller.snapshot().is_none());
    assert!(controller.start(ClassroomId(1)).await.is_err());

    let alerts: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Alert(message) => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(alerts, vec!["Not your classroom.", "Could not start attendance."]);

    let session = controller.start(ClassroomId(1)).await.unwrap();
    assert_eq!(session.token, "xyz");
}

#[tokio::test(start_paused = true)]
async fn test_second_start_in_flight_is_rejected() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    let gate = gateway.gate(Op::Start);

    let (controller, _events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    let first = tokio::spawn({
        let controller = controller.clone();
        async move { controller.start(ClassroomId(7)).await }
    });
    settle().await;

    let err = controller.start(ClassroomId(7)).await.unwrap_err();
    assert!(matches!(err, RollcallError::Busy(_)));
    assert_eq!(gateway.calls(Op::Start), 1);

    gate.notify_one();
    assert!(first.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_stops_make_one_call() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    gateway.push_stop(Ok(()));

    let (controller, mut events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    controller.start(ClassroomId(7)).await.unwrap();
    let gate = gateway.gate(Op::Stop);

    let first = tokio::spawn({
        let controller = controller.clone();
        async move { controller.stop().await }
    });
    settle().await;
    assert!(controller.is_stopping());
    assert_eq!(controller.snapshot().unwrap().state, SessionState::Stopping);

    let second = controller.stop().await.unwrap();
    assert_eq!(second, StopOutcome::AlreadyStopping);
    assert!(!second.completed());

    gate.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), StopOutcome::Stopped);
    assert_eq!(gateway.calls(Op::Stop), 1);
    assert!(controller.snapshot().is_none());

    let events = drain(&mut events);
    assert!(events.contains(&SessionEvent::Stopped {
        session_id: "s1".into()
    }));
    assert!(events.contains(&SessionEvent::DisplayCleared));
}

#[tokio::test(start_paused = true)]
async fn test_timers_cancelled_before_stop_request() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    gateway.push_stop(Ok(()));

    let (controller, mut events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    controller.start(ClassroomId(7)).await.unwrap();
    let gate = gateway.gate(Op::Stop);

    let stopping = tokio::spawn({
        let controller = controller.clone();
        async move { controller.stop().await }
    });
    settle().await;
    drain(&mut events);
    assert_eq!(controller.seconds_left(), None);

    // The stop request is held while well past several poll periods.
    sleep(Duration::from_secs(10)).await;
    assert_eq!(gateway.calls(Op::Refresh), 0);
    assert!(countdowns(&drain(&mut events)).is_empty());

    gate.notify_one();
    stopping.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_stop_freezes_token_and_allows_retry() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    gateway.push_stop(Err(server_error(500, None)));
    gateway.push_stop(Ok(()));

    let (controller, mut events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    controller.start(ClassroomId(7)).await.unwrap();

    let err = controller.stop().await.unwrap_err();
    assert_eq!(err.status(), Some(500));
    let session = controller.snapshot().unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert!(!session.polling);
    assert_eq!(session.token, "abc");
    assert!(drain(&mut events).contains(&SessionEvent::Status {
        message: "Failed to stop session.".into(),
        is_error: true,
    }));

    sleep(Duration::from_secs(10)).await;
    assert_eq!(gateway.calls(Op::Refresh), 0);

    assert_eq!(controller.stop().await.unwrap(), StopOutcome::Stopped);
    assert_eq!(gateway.calls(Op::Stop), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_stop_restores_session() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    let _gate = gateway.gate(Op::Stop);

    let (controller, _events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    controller.start(ClassroomId(7)).await.unwrap();

    let abandoned = tokio::time::timeout(Duration::from_secs(1), controller.stop()).await;
    assert!(abandoned.is_err());

    assert!(!controller.is_stopping());
    let session = controller.snapshot().unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert!(!session.polling);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_failure_keeps_polling_with_backoff() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    gateway.push_refresh(Err(server_error(502, None)));
    gateway.push_refresh(Err(server_error(502, None)));
    gateway.push_refresh(Ok(token_grant("ghi", 30)));

    let timing = SessionTiming {
        refresh_backoff_cap: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let (controller, mut events) = TeacherSessionController::new(gateway.clone(), timing);
    controller.start(ClassroomId(7)).await.unwrap();

    // Failures at 3s and 6s, then a widened 6s gap before the next attempt.
    sleep(Duration::from_millis(6100)).await;
    assert_eq!(gateway.calls(Op::Refresh), 2);
    assert!(drain(&mut events).contains(&SessionEvent::Status {
        message: "Failed to refresh QR.".into(),
        is_error: true,
    }));
    assert_eq!(controller.snapshot().unwrap().token, "abc");

    sleep(Duration::from_millis(5000)).await;
    assert_eq!(gateway.calls(Op::Refresh), 2);

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(gateway.calls(Op::Refresh), 3);
    assert_eq!(controller.snapshot().unwrap().token, "ghi");
}

#[tokio::test(start_paused = true)]
async fn test_session_not_found_ends_session() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    gateway.push_refresh(Err(server_error(404, Some("Attendance session not found."))));

    let (controller, mut events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    controller.start(ClassroomId(7)).await.unwrap();

    sleep(Duration::from_millis(3100)).await;
    assert!(controller.snapshot().is_none());
    assert_eq!(
        controller.last_stopped().map(|s| s.state),
        Some(SessionState::Stopped)
    );
    assert_eq!(controller.seconds_left(), None);
    assert!(drain(&mut events).contains(&SessionEvent::Ended {
        session_id: "s1".into(),
        reason: "Attendance session not found.".into(),
    }));

    sleep(Duration::from_secs(20)).await;
    assert_eq!(gateway.calls(Op::Refresh), 1);
    assert!(countdowns(&drain(&mut events)).is_empty());
    assert_eq!(controller.stop().await.unwrap(), StopOutcome::NoActiveSession);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_in_flight_is_dropped_by_stop() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    gateway.push_refresh(Ok(token_grant("late", 30)));
    gateway.push_stop(Ok(()));
    let refresh_gate = gateway.gate(Op::Refresh);

    let (controller, mut events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    controller.start(ClassroomId(7)).await.unwrap();

    sleep(Duration::from_millis(3100)).await;
    assert_eq!(gateway.calls(Op::Refresh), 1);

    assert_eq!(controller.stop().await.unwrap(), StopOutcome::Stopped);
    refresh_gate.notify_one();
    settle().await;

    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, SessionEvent::TokenRefreshed { .. })));
    assert!(controller.snapshot().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_restart_supersedes_active_session() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    gateway.push_start(Ok(session_grant("s2", "def", 30)));
    gateway.push_refresh(Ok(token_grant("s2-next", 30)));

    let (controller, _events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    controller.start(ClassroomId(7)).await.unwrap();
    sleep(Duration::from_millis(1500)).await;
    controller.start(ClassroomId(7)).await.unwrap();

    // Only the new session's poll timer is running.
    sleep(Duration::from_millis(1600)).await;
    assert_eq!(gateway.calls(Op::Refresh), 0);
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(gateway.calls(Op::Refresh), 1);
    assert_eq!(controller.snapshot().unwrap().session_id, OpaqueId::from("s2"));
}

#[tokio::test(start_paused = true)]
async fn test_dismiss_display_stops_session() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    gateway.push_stop(Ok(()));

    let (controller, _events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    controller.start(ClassroomId(7)).await.unwrap();

    assert_eq!(controller.dismiss_display().await.unwrap(), StopOutcome::Stopped);
    assert_eq!(gateway.calls(Op::Stop), 1);
    assert!(controller.snapshot().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stopped_session_is_kept_until_next_start() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));
    gateway.push_stop(Ok(()));
    gateway.push_start(Ok(session_grant("s2", "xyz", 30)));

    let (controller, _events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    controller.start(ClassroomId(7)).await.unwrap();
    assert!(controller.last_stopped().is_none());

    controller.stop().await.unwrap();
    let stopped = controller.last_stopped().unwrap();
    assert_eq!(stopped.session_id, OpaqueId::from("s1"));
    assert_eq!(stopped.token, "abc");
    assert_eq!(stopped.state, SessionState::Stopped);
    assert!(!stopped.polling);
    assert!(controller.snapshot().is_none());

    controller.start(ClassroomId(7)).await.unwrap();
    assert!(controller.last_stopped().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_export_failure_raises_alert() {
    let gateway = ScriptedGateway::new();
    let (controller, mut events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());

    let err = controller.download_export(ClassroomId(9), None).await.unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Alert(
            "No attendance sessions found for this classroom.".into()
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn test_dropping_controller_stops_timers() {
    let gateway = ScriptedGateway::new();
    gateway.push_start(Ok(session_grant("s1", "abc", 30)));

    let (controller, _events) = TeacherSessionController::new(gateway.clone(), fixed_cadence());
    controller.start(ClassroomId(7)).await.unwrap();
    drop(controller);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(gateway.calls(Op::Refresh), 0);
    assert_eq!(Arc::strong_count(&gateway), 1);
}
