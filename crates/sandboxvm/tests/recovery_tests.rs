//! Convergence after interrupted calls, lost instances and stray creates.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use chrono::Utc;

use sandboxvm::session::{SessionError, SessionService, SessionState};

mod common;
use common::{FakeRuntime, send, test_app, test_config, test_service};

/// Poll `done` every 5ms for up to two seconds.
async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn only_session(service: &SessionService) -> String {
    let entries = service.registry().entries();
    assert_eq!(entries.len(), 1);
    entries[0].id().to_string()
}

#[tokio::test]
async fn test_aborted_start_is_failed_by_sweep() {
    let runtime = FakeRuntime::new();
    runtime.set_start_delay(Duration::from_secs(60));
    let service = test_service(&test_config(), Arc::clone(&runtime));

    let task = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.start("10.0.0.1").await }
    });
    wait_until(|| runtime.instance_count() == 1).await;
    task.abort();
    let _ = task.await;

    let id = only_session(&service);
    assert_eq!(
        service.registry().get(&id).unwrap().state(),
        SessionState::Provisioning
    );
    assert_eq!(service.limiter().active_total(), 1);

    let report = service.sweep(Utc::now()).await;
    assert_eq!(report.abandoned, 1);

    let session = service.registry().get(&id).unwrap().snapshot();
    assert_eq!(session.state, SessionState::Destroyed);
    assert_eq!(session.error_message.as_deref(), Some("provisioning abandoned"));
    assert_eq!(runtime.instance_count(), 0);
    assert_eq!(service.limiter().active_total(), 0);

    runtime.set_start_delay(Duration::ZERO);
    service.start("10.0.0.1").await.unwrap();
}

#[tokio::test]
async fn test_aborted_stop_is_finished_by_next_stop() {
    let runtime = FakeRuntime::new();
    let service = test_service(&test_config(), Arc::clone(&runtime));
    let id = service.start("10.0.0.1").await.unwrap().session.session_id;

    runtime.set_stop_delay(Duration::from_secs(60));
    let task = tokio::spawn({
        let service = Arc::clone(&service);
        let id = id.clone();
        async move { service.stop("10.0.0.1", &id).await }
    });
    wait_until(|| runtime.stops.load(Ordering::SeqCst) == 1).await;
    task.abort();
    let _ = task.await;

    assert_eq!(
        service.registry().get(&id).unwrap().state(),
        SessionState::Stopping
    );
    assert_eq!(service.limiter().active_total(), 1);

    runtime.set_stop_delay(Duration::ZERO);
    service.stop("10.0.0.1", &id).await.unwrap();

    assert_eq!(
        service.status("10.0.0.1", &id).unwrap().state,
        SessionState::Destroyed
    );
    assert_eq!(runtime.instance_count(), 0);
    assert_eq!(service.limiter().active_total(), 0);
}

#[tokio::test]
async fn test_aborted_stop_is_finished_by_sweep() {
    let runtime = FakeRuntime::new();
    let service = test_service(&test_config(), Arc::clone(&runtime));
    let id = service.start("10.0.0.1").await.unwrap().session.session_id;

    runtime.set_stop_delay(Duration::from_secs(60));
    let task = tokio::spawn({
        let service = Arc::clone(&service);
        let id = id.clone();
        async move { service.stop("10.0.0.1", &id).await }
    });
    wait_until(|| runtime.stops.load(Ordering::SeqCst) == 1).await;
    task.abort();
    let _ = task.await;

    runtime.set_stop_delay(Duration::ZERO);
    let report = service.sweep(Utc::now()).await;
    assert_eq!(report.abandoned, 1);
    assert_eq!(
        service.registry().get(&id).unwrap().state(),
        SessionState::Destroyed
    );
    assert_eq!(runtime.instance_count(), 0);
    assert_eq!(service.limiter().active_total(), 0);
}

#[tokio::test]
async fn test_busy_session_is_not_treated_as_abandoned() {
    let runtime = FakeRuntime::new();
    runtime.set_start_delay(Duration::from_millis(200));
    let service = test_service(&test_config(), Arc::clone(&runtime));

    let task = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.start("10.0.0.1").await }
    });
    wait_until(|| runtime.instance_count() == 1).await;

    let report = service.sweep(Utc::now()).await;
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.orphans, 0);

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.session.state, SessionState::Running);
    assert_eq!(runtime.instance_count(), 1);
}

#[tokio::test]
async fn test_dropped_start_request_still_provisions() {
    let (app, service, runtime) = test_app(&test_config());
    runtime.set_start_delay(Duration::from_millis(100));

    let request = send(&app, "10.0.0.1", Method::POST, "/vm/start", None);
    assert!(
        tokio::time::timeout(Duration::from_millis(10), request)
            .await
            .is_err()
    );

    wait_until(|| {
        service
            .registry()
            .entries()
            .first()
            .is_some_and(|entry| entry.state() == SessionState::Running)
    })
    .await;
    assert_eq!(service.limiter().active_total(), 1);

    let (response, body) = send(&app, "10.0.0.1", Method::POST, "/vm/start", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body["reused"], true);
}

#[tokio::test]
async fn test_execute_on_exited_instance_fails_session() {
    let runtime = FakeRuntime::new();
    let service = test_service(&test_config(), Arc::clone(&runtime));
    let id = service.start("10.0.0.1").await.unwrap().session.session_id;
    let handle = service.registry().get(&id).unwrap().handle().unwrap();

    runtime.exit(handle.as_str());
    let err = service.execute("10.0.0.1", &id, "echo hi").await.unwrap_err();
    assert!(matches!(err, SessionError::RuntimeFailed(_)));

    let session = service.registry().get(&id).unwrap().snapshot();
    assert!(session.state.is_terminal());
    assert!(session.error_message.unwrap().starts_with("instance lost"));
    assert_eq!(runtime.instance_count(), 0);
    assert_eq!(service.limiter().active_total(), 0);

    assert!(matches!(
        service.execute("10.0.0.1", &id, "echo hi").await.unwrap_err(),
        SessionError::Gone(_)
    ));
}

#[tokio::test]
async fn test_exited_instance_is_failed_by_sweep() {
    let runtime = FakeRuntime::new();
    let service = test_service(&test_config(), Arc::clone(&runtime));
    let id = service.start("10.0.0.1").await.unwrap().session.session_id;
    let handle = service.registry().get(&id).unwrap().handle().unwrap();

    runtime.exit(handle.as_str());
    let report = service.sweep(Utc::now()).await;
    assert_eq!(report.missing, 1);

    let session = service.registry().get(&id).unwrap().snapshot();
    assert!(session.state.is_terminal());
    assert!(session.error_message.unwrap().contains("stopped running"));
    assert!(!runtime.exists(handle.as_str()));
    assert_eq!(service.limiter().active_total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_creates_leave_no_instances() {
    let mut config = test_config();
    config.lifecycle.runtime_call_timeout_seconds = 1;
    let runtime = FakeRuntime::new();
    runtime.set_create_delay(Duration::from_secs(60));
    let service = test_service(&config, Arc::clone(&runtime));

    let err = service.start("10.0.0.1").await.unwrap_err();
    assert!(matches!(err, SessionError::RuntimeTransient(_)));
    assert_eq!(
        runtime.creates.load(Ordering::SeqCst),
        config.lifecycle.retry_max_attempts as usize
    );
    assert_eq!(runtime.instance_count(), 0);
    assert_eq!(service.limiter().active_total(), 0);
}

#[tokio::test]
async fn test_sweep_removes_instances_without_live_session() {
    let runtime = FakeRuntime::new();
    let service = test_service(&test_config(), Arc::clone(&runtime));
    let live = service.start("10.0.0.1").await.unwrap().session.session_id;
    let ended = service.start("10.0.0.2").await.unwrap().session.session_id;
    service.stop("10.0.0.2", &ended).await.unwrap();

    // A create that finished after its session ended, and an unlabelled one.
    runtime.inject_orphan("late-1", Some(&ended));
    runtime.inject_orphan("stray-1", None);
    // Labelled with a live session: still being provisioned, left alone.
    runtime.inject_orphan("pending-1", Some(&live));

    let report = service.sweep(Utc::now()).await;
    assert_eq!(report.orphans, 2);
    assert!(!runtime.exists("late-1"));
    assert!(!runtime.exists("stray-1"));
    assert!(runtime.exists("pending-1"));
    assert_eq!(runtime.instance_count(), 2);
}
