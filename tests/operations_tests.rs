//! Tests for the operation registry.
//!
//! Validates the at-most-one invariant, reuse semantics, the idle
//! deadline, and waiter completion.

use silo::{Error, OperationRegistry};
use std::sync::Arc;

// =============================================================================
// At-Most-One Tests
// =============================================================================

#[tokio::test]
async fn test_single_operation_per_instance() {
    let registry = OperationRegistry::new();

    let op = registry.create(1, "c1", "start", false, false).unwrap();
    let second = registry.create(1, "c1", "stop", false, false);
    assert!(matches!(second, Err(Error::Busy { .. })));

    // A different instance is unaffected.
    assert!(registry.create(2, "c2", "start", false, false).is_ok());

    registry.complete(&op, Ok(()));
    assert!(registry.create(1, "c1", "stop", false, false).is_ok());
}

#[tokio::test]
async fn test_busy_error_names_running_action() {
    let registry = OperationRegistry::new();
    let _op = registry.create(1, "c1", "update", false, false).unwrap();

    let err = registry.create(1, "c1", "delete", false, false).unwrap_err();
    assert!(err.to_string().contains("update"));
    assert!(err.to_string().contains("c1"));
}

// =============================================================================
// Reuse Tests
// =============================================================================

#[tokio::test]
async fn test_reusable_operation_is_shared() {
    let registry = OperationRegistry::new();

    let first = registry.create(1, "c1", "shutdown", true, true).unwrap();
    let second = registry.create(1, "c1", "shutdown", true, true).unwrap();
    assert_eq!(first.id(), second.id());
}

#[tokio::test]
async fn test_reuse_requires_matching_action() {
    let registry = OperationRegistry::new();
    let _shutdown = registry.create(1, "c1", "shutdown", true, true).unwrap();

    let other = registry.create(1, "c1", "stop", false, true);
    assert!(matches!(other, Err(Error::Busy { .. })));
}

#[tokio::test]
async fn test_reset_rejected_for_non_reusable() {
    let registry = OperationRegistry::new();
    let op = registry.create(1, "c1", "start", false, false).unwrap();
    assert!(op.reset().is_err());
}

// =============================================================================
// Completion Tests
// =============================================================================

#[tokio::test]
async fn test_waiters_observe_completion() {
    let registry = Arc::new(OperationRegistry::new());
    let op = registry.create(1, "c1", "start", false, false).unwrap();

    let waiter = {
        let op = op.clone();
        tokio::spawn(async move { op.wait().await })
    };

    registry.complete(&op, Ok(()));
    assert!(waiter.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_waiters_observe_failure() {
    let registry = OperationRegistry::new();
    let op = registry.create(1, "c1", "start", false, false).unwrap();

    registry.complete(&op, Err(Error::Internal("boom".into())));
    let err = op.wait().await.unwrap_err();
    assert!(err.to_string().contains("boom"));
}

#[tokio::test]
async fn test_first_completion_wins() {
    let registry = OperationRegistry::new();
    let op = registry.create(1, "c1", "start", false, false).unwrap();

    registry.complete(&op, Ok(()));
    op.done(Err(Error::Internal("late".into())));
    assert!(op.wait().await.is_ok());
}

// =============================================================================
// Deadline Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_idle_deadline_fires_timeout() {
    let registry = OperationRegistry::new();
    let op = registry.create(1, "c1", "start", false, false).unwrap();

    // Nobody completes the operation; the deadline does.
    let err = op.wait().await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_reset_pushes_deadline_back() {
    let registry = OperationRegistry::new();
    let op = registry.create(1, "c1", "shutdown", true, false).unwrap();

    // Keep resetting past several deadline windows.
    for _ in 0..5 {
        tokio::time::sleep(std::time::Duration::from_secs(20)).await;
        assert!(!op.is_done(), "operation must survive while being reset");
        op.reset().unwrap();
    }

    registry.complete(&op, Ok(()));
    assert!(op.wait().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_slot_is_reclaimed() {
    let registry = OperationRegistry::new();
    let op = registry.create(1, "c1", "start", false, false).unwrap();

    let _ = op.wait().await; // deadline fired
    assert!(op.is_done());

    // The stale slot does not block new operations.
    assert!(registry.create(1, "c1", "stop", false, false).is_ok());
}
