//! Tests for the runtime handle plumbing.
//!
//! Validates state parsing, the exec exit-code convention, runtime log
//! error extraction, and log rotation.

use silo::runtime::{exec_exit_code, rotate_runtime_log, runtime_log_errors, RuntimeState};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tempfile::TempDir;

// =============================================================================
// State Parsing Tests
// =============================================================================

#[test]
fn test_state_parsing() {
    assert_eq!(RuntimeState::parse("RUNNING"), RuntimeState::Running);
    assert_eq!(RuntimeState::parse("stopped\n"), RuntimeState::Stopped);
    assert_eq!(RuntimeState::parse("Frozen"), RuntimeState::Frozen);
    assert_eq!(RuntimeState::parse("garbage"), RuntimeState::Error);
}

#[test]
fn test_is_running_covers_frozen() {
    assert!(RuntimeState::Running.is_running());
    assert!(RuntimeState::Frozen.is_running());
    assert!(RuntimeState::Freezing.is_running());
    assert!(!RuntimeState::Stopped.is_running());
    assert!(!RuntimeState::Starting.is_running());
}

// =============================================================================
// Exec Exit Code Tests
// =============================================================================

#[test]
fn test_exec_exit_codes() {
    // Normal exits surface the child status.
    assert_eq!(exec_exit_code(ExitStatus::from_raw(0)), 0);
    assert_eq!(exec_exit_code(ExitStatus::from_raw(3 << 8)), 3);

    // Signal death maps to 128 + N (raw wait status: low byte = signal).
    assert_eq!(exec_exit_code(ExitStatus::from_raw(9)), 128 + 9);
    assert_eq!(exec_exit_code(ExitStatus::from_raw(15)), 128 + 15);
}

// =============================================================================
// Runtime Log Tests
// =============================================================================

#[tokio::test]
async fn test_log_error_extraction() {
    let temp = TempDir::new().unwrap();
    let log = temp.path().join("lxc.log");
    std::fs::write(
        &log,
        "lxc 20260802 INFO start - starting\n\
         lxc 20260802 ERROR conf - Failed to mount rootfs\n\
         lxc 20260802 WARN cgroup - ignoring\n\
         lxc 20260802 ERROR start - Aborting\n",
    )
    .unwrap();

    let errors = runtime_log_errors(&log).await.unwrap();
    assert!(errors.contains("Failed to mount rootfs"));
    assert!(errors.contains("Aborting"));
    assert!(!errors.contains("starting"));
    assert!(!errors.contains("ignoring"));
}

#[tokio::test]
async fn test_log_without_errors_is_none() {
    let temp = TempDir::new().unwrap();
    let log = temp.path().join("lxc.log");
    std::fs::write(&log, "lxc 20260802 INFO start - fine\n").unwrap();
    assert!(runtime_log_errors(&log).await.is_none());
}

#[tokio::test]
async fn test_missing_log_is_none() {
    let temp = TempDir::new().unwrap();
    assert!(runtime_log_errors(&temp.path().join("nope.log")).await.is_none());
}

#[tokio::test]
async fn test_log_rotation_keeps_one_old() {
    let temp = TempDir::new().unwrap();
    let current = temp.path().join("lxc.log");

    std::fs::write(&current, "first boot").unwrap();
    rotate_runtime_log(temp.path()).await.unwrap();
    assert!(!current.exists());
    assert_eq!(
        std::fs::read_to_string(temp.path().join("lxc.log.old")).unwrap(),
        "first boot"
    );

    std::fs::write(&current, "second boot").unwrap();
    rotate_runtime_log(temp.path()).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(temp.path().join("lxc.log.old")).unwrap(),
        "second boot"
    );

    // Rotating with no current log is a no-op.
    rotate_runtime_log(temp.path()).await.unwrap();
}
