//! FILENAME: tests/test_supervisor.rs
//! Integration tests for the supervisor lifecycle. The "server" is a shell
//! script standing in for the environment's interpreter.
#![cfg(unix)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{
    failed, healthy_python, http_server, pid_alive, write_script, FakeRunner, ServerFixture,
    READY_BANNER,
};
use ddt_manager::{SupervisorErrorKind, SupervisorState};

const SLEEP_FOREVER: &str = "exec sleep 30";

fn ready_server() -> String {
    format!("{READY_BANNER}\n{SLEEP_FOREVER}")
}

// ============================================================================
// STARTUP
// ============================================================================

#[tokio::test]
async fn test_ready_via_log_banner() {
    let fixture = ServerFixture::new(&ready_server()).await;
    let supervisor = fixture.supervisor();

    let endpoint = supervisor.ensure_running().await.unwrap();

    assert!(!endpoint.external);
    assert_eq!(endpoint.url, supervisor.endpoint_url());
    let status = supervisor.status();
    assert_eq!(status.state, SupervisorState::Ready);
    assert!(status.pid.is_some());
    assert!(status.degraded.is_none());
    assert_eq!(fixture.spawn_count(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_callers_share_one_launch() {
    let fixture = ServerFixture::new(&format!("sleep 0.3\n{}", ready_server())).await;
    let supervisor = fixture.supervisor();

    let (first, second) = tokio::join!(supervisor.ensure_running(), supervisor.ensure_running());

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(fixture.spawn_count(), 1);

    let again = supervisor.ensure_running().await.unwrap();
    assert!(!again.external);
    assert_eq!(fixture.spawn_count(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_server_output_lands_in_server_log() {
    let fixture = ServerFixture::new(&format!(
        "echo 'Performing system checks...'\n{}",
        ready_server()
    ))
    .await;
    let supervisor = fixture.supervisor();

    supervisor.ensure_running().await.unwrap();
    supervisor.shutdown().await;

    let log = std::fs::read_to_string(fixture.root().join("logs/server.log")).unwrap();
    assert!(log.contains("Performing system checks..."));
}

#[tokio::test]
async fn test_launch_env_carries_settings_module() {
    let fixture = ServerFixture::new(&format!(
        "echo \"settings=$DJANGO_SETTINGS_MODULE\"\n{}",
        ready_server()
    ))
    .await;
    let supervisor = fixture.supervisor();

    supervisor.ensure_running().await.unwrap();
    supervisor.shutdown().await;

    let log = std::fs::read_to_string(fixture.root().join("logs/server.log")).unwrap();
    assert!(log.contains("settings=config.settings.production"));
}

#[tokio::test]
async fn test_bind_address_is_passed_to_the_server() {
    let fixture = ServerFixture::new(&format!("echo \"args=$*\"\n{}", ready_server())).await;
    let supervisor = fixture.supervisor();

    supervisor.ensure_running().await.unwrap();
    supervisor.shutdown().await;

    let log = std::fs::read_to_string(fixture.root().join("logs/server.log")).unwrap();
    let expected = format!(
        "manage.py runserver --noreload 127.0.0.1:{}",
        fixture.config.port
    );
    assert!(log.contains(&expected), "missing `{expected}` in:\n{log}");
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn test_early_exit_reports_stderr_tail() {
    let fixture = ServerFixture::new(
        "echo \"ModuleNotFoundError: No module named 'whitenoise'\" >&2\nexit 3",
    )
    .await;
    let supervisor = fixture.supervisor();

    let err = supervisor.ensure_running().await.unwrap_err();

    match &err.kind {
        SupervisorErrorKind::ExitedEarly { code, stderr_tail } => {
            assert_eq!(*code, Some(3));
            assert!(stderr_tail.contains("No module named 'whitenoise'"));
        }
        other => panic!("expected ExitedEarly, got {other:?}"),
    }
    assert_eq!(err.state, SupervisorState::WaitingHealthy);
    let status = supervisor.status();
    assert_eq!(status.state, SupervisorState::Failed);
    assert!(status.last_error.unwrap().contains("whitenoise"));
}

#[tokio::test]
async fn test_timeout_keeps_the_process_for_the_next_call() {
    let mut fixture = ServerFixture::new(SLEEP_FOREVER).await;
    fixture.config.startup_timeout_ms = 300;
    let supervisor = fixture.supervisor();

    let err = supervisor.ensure_running().await.unwrap_err();
    assert!(matches!(err.kind, SupervisorErrorKind::Timeout(_)));
    let pid = supervisor.status().pid.unwrap();
    assert!(pid_alive(pid));

    let err = supervisor.ensure_running().await.unwrap_err();
    assert!(matches!(err.kind, SupervisorErrorKind::Timeout(_)));
    assert_eq!(supervisor.status().pid, Some(pid));
    assert_eq!(fixture.spawn_count(), 1);

    supervisor.shutdown().await;
    assert!(!pid_alive(pid));
}

#[tokio::test]
async fn test_failed_provisioning_runs_degraded_on_system_interpreter() {
    let mut fixture = ServerFixture::new(&ready_server()).await;
    let system_python = fixture.root().join("system/python3");
    write_script(
        &system_python,
        &format!("echo spawn >> \"$DDT_SPAWN_LOG\"\n{}", ready_server()),
    );
    std::fs::remove_dir_all(fixture.root().join("venv")).unwrap();
    fixture.config.interpreter = Some(system_python.to_string_lossy().to_string());
    fixture.runner = FakeRunner::new(|spec| {
        if spec.args.get(1).map(String::as_str) == Some("venv") {
            return failed(1, "The virtual environment was not created successfully");
        }
        healthy_python(spec)
    });
    let supervisor = fixture.supervisor();

    supervisor.ensure_running().await.unwrap();

    let status = supervisor.status();
    assert_eq!(status.state, SupervisorState::Ready);
    assert!(status
        .degraded
        .unwrap()
        .contains("environment creation failed"));
    assert_eq!(
        status.interpreter.as_deref(),
        Some(system_python.to_string_lossy().as_ref())
    );
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_failed_provisioning_without_degraded_mode_fails() {
    let mut fixture = ServerFixture::new(&ready_server()).await;
    std::fs::remove_dir_all(fixture.root().join("venv")).unwrap();
    fixture.config.allow_degraded = false;
    fixture.runner = FakeRunner::new(|spec| {
        if spec.args.get(1).map(String::as_str) == Some("venv") {
            return failed(1, "ensurepip is not available");
        }
        healthy_python(spec)
    });
    let supervisor = fixture.supervisor();

    let err = supervisor.ensure_running().await.unwrap_err();

    assert_eq!(err.state, SupervisorState::Provisioning);
    assert!(matches!(err.kind, SupervisorErrorKind::Provision(_)));
    assert_eq!(fixture.spawn_count(), 0);
}

// ============================================================================
// EXTERNAL SERVERS
// ============================================================================

#[tokio::test]
async fn test_reachable_endpoint_is_adopted_without_launch() {
    let mut fixture = ServerFixture::new(&ready_server()).await;
    let (port, server) = http_server("200 OK").await;
    fixture.config.port = port;
    let supervisor = fixture.supervisor();

    let endpoint = supervisor.ensure_running().await.unwrap();

    assert!(endpoint.external);
    assert!(supervisor.status().external);
    assert_eq!(fixture.spawn_count(), 0);
    assert!(fixture.runner.calls().is_empty());

    let err = supervisor.restart().await.unwrap_err();
    assert!(matches!(err.kind, SupervisorErrorKind::ExternalServer(_)));
    server.abort();
}

// ============================================================================
// SHUTDOWN, RESTART AND MAINTENANCE
// ============================================================================

#[tokio::test]
async fn test_shutdown_during_wait_cancels_and_kills() {
    let fixture = ServerFixture::new(SLEEP_FOREVER).await;
    let supervisor = Arc::new(fixture.supervisor());

    let waiter = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.ensure_running().await })
    };

    let mut status = supervisor.subscribe();
    let status = status
        .wait_for(|s| s.state == SupervisorState::WaitingHealthy)
        .await
        .unwrap()
        .clone();
    let pid = status.pid.unwrap();

    let started = Instant::now();
    supervisor.shutdown().await;
    let err = waiter.await.unwrap().unwrap_err();

    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!pid_alive(pid));
    assert_eq!(supervisor.status().state, SupervisorState::Stopped);
    assert_eq!(supervisor.status().pid, None);

    let err = supervisor.ensure_running().await.unwrap_err();
    assert!(matches!(err.kind, SupervisorErrorKind::ShuttingDown));
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let fixture = ServerFixture::new(&ready_server()).await;
    let supervisor = fixture.supervisor();
    supervisor.ensure_running().await.unwrap();
    let pid = supervisor.status().pid.unwrap();

    supervisor.shutdown().await;
    supervisor.shutdown().await;

    assert!(!pid_alive(pid));
    assert!(supervisor.is_shutting_down());
    assert_eq!(supervisor.status().state, SupervisorState::Stopped);
}

#[tokio::test]
async fn test_restart_launches_a_new_process() {
    let fixture = ServerFixture::new(&ready_server()).await;
    let supervisor = fixture.supervisor();
    supervisor.ensure_running().await.unwrap();
    let first = supervisor.status().pid.unwrap();

    supervisor.restart().await.unwrap();

    let second = supervisor.status().pid.unwrap();
    assert_ne!(first, second);
    assert!(!pid_alive(first));
    assert_eq!(fixture.spawn_count(), 2);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_exited_server_is_relaunched_on_next_call() {
    let fixture = ServerFixture::new(&ready_server()).await;
    let supervisor = fixture.supervisor();
    supervisor.ensure_running().await.unwrap();
    let pid = supervisor.status().pid.unwrap();

    std::process::Command::new("kill")
        .args(["-KILL", &pid.to_string()])
        .status()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    supervisor.ensure_running().await.unwrap();
    assert_ne!(supervisor.status().pid, Some(pid));
    assert_eq!(fixture.spawn_count(), 2);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_with_server_stopped_restarts_afterwards() {
    let fixture = ServerFixture::new(&ready_server()).await;
    let supervisor = fixture.supervisor();
    supervisor.ensure_running().await.unwrap();
    let seen = Arc::new(Mutex::new(None));

    let recorded = seen.clone();
    let status = supervisor.subscribe();
    let value = supervisor
        .with_server_stopped(move || async move {
            *recorded.lock().unwrap() = Some(status.borrow().state);
            42
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(*seen.lock().unwrap(), Some(SupervisorState::Stopped));
    assert_eq!(supervisor.status().state, SupervisorState::Ready);
    assert_eq!(fixture.spawn_count(), 2);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_status_callback_sees_every_transition() {
    let fixture = ServerFixture::new(&ready_server()).await;
    let supervisor = fixture.supervisor();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let task = supervisor.on_status_change(move |status| {
        let _ = tx.send(status.state);
    });

    supervisor.ensure_running().await.unwrap();

    let mut states = Vec::new();
    while let Ok(Some(state)) = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
        states.push(state);
        if state == SupervisorState::Ready {
            break;
        }
    }
    assert!(!states.is_empty());
    assert_eq!(states.last(), Some(&SupervisorState::Ready));

    task.abort();
    supervisor.shutdown().await;
}
