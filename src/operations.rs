//! Per-instance operation locking.
//!
//! At most one long-running action (start, stop, shutdown, restore,
//! update, rename, delete) may be alive per instance at a time. Each
//! operation carries a 30-second idle deadline that completes it with a
//! timeout error unless the creator finishes first; reusable operations
//! (shutdown) may push the deadline back indefinitely.

use crate::constants::OPERATION_IDLE_TIMEOUT;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

/// A single live operation against one instance.
///
/// Cloneable handle; completion is broadcast to every waiter.
#[derive(Clone, Debug)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

#[derive(Debug)]
struct OperationInner {
    id: Uuid,
    instance_id: i64,
    instance_name: String,
    action: String,
    reusable: bool,
    reset_tx: mpsc::Sender<()>,
    done_tx: watch::Sender<Option<DoneState>>,
}

#[derive(Clone, Debug)]
enum DoneState {
    Ok,
    Err(String),
}

impl Operation {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn action(&self) -> &str {
        &self.inner.action
    }

    pub fn reusable(&self) -> bool {
        self.inner.reusable
    }

    /// Pushes the idle deadline back. Only reusable operations may reset.
    pub fn reset(&self) -> Result<()> {
        if !self.inner.reusable {
            return Err(Error::Internal(
                "can't reset a non-reusable operation".into(),
            ));
        }
        // A full reset channel means a reset is already pending; that
        // still pushes the deadline, so it is not an error.
        let _ = self.inner.reset_tx.try_send(());
        Ok(())
    }

    /// Completes the operation. The first call wins; later calls are
    /// ignored.
    pub fn done(&self, result: Result<()>) {
        self.inner.done(result)
    }

    /// True once the operation has completed.
    pub fn is_done(&self) -> bool {
        self.inner.done_tx.borrow().is_some()
    }

    /// Blocks until the operation completes, returning its result.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.inner.done_tx.subscribe();
        loop {
            if let Some(state) = rx.borrow().clone() {
                return match state {
                    DoneState::Ok => Ok(()),
                    DoneState::Err(e) => Err(Error::Internal(e)),
                };
            }
            if rx.changed().await.is_err() {
                return Err(Error::Internal("operation abandoned".into()));
            }
        }
    }
}

impl OperationInner {
    fn done(&self, result: Result<()>) {
        let state = match result {
            Ok(()) => DoneState::Ok,
            Err(e) => DoneState::Err(e.to_string()),
        };
        self.done_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(state);
            true
        });
    }
}

/// Process-wide registry of live operations, keyed by instance id.
pub struct OperationRegistry {
    ops: Mutex<HashMap<i64, Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        OperationRegistry {
            ops: Mutex::new(HashMap::new()),
        }
    }

    /// Creates (or reuses) the operation for an instance.
    ///
    /// If an operation is already alive: when `reuse` is set and the live
    /// operation is reusable with the same action, its deadline is reset
    /// and it is returned; otherwise the call fails `Busy`.
    pub fn create(
        &self,
        instance_id: i64,
        instance_name: &str,
        action: &str,
        reusable: bool,
        reuse: bool,
    ) -> Result<Operation> {
        let mut ops = self.lock();

        if let Some(existing) = ops.get(&instance_id) {
            // A timed-out operation still occupies the slot until someone
            // observes it; clear it here.
            if existing.is_done() {
                ops.remove(&instance_id);
            } else if reuse && existing.reusable() && existing.action() == action {
                existing.reset()?;
                return Ok(existing.clone());
            } else {
                return Err(Error::Busy {
                    instance: instance_name.to_string(),
                    action: existing.action().to_string(),
                });
            }
        }

        let (reset_tx, reset_rx) = mpsc::channel(1);
        let (done_tx, _) = watch::channel(None);

        let op = Operation {
            inner: Arc::new(OperationInner {
                id: Uuid::new_v4(),
                instance_id,
                instance_name: instance_name.to_string(),
                action: action.to_string(),
                reusable,
                reset_tx,
                done_tx,
            }),
        };

        ops.insert(instance_id, op.clone());
        debug!(
            instance = %instance_name,
            action = %action,
            op = %op.id(),
            "created operation"
        );

        tokio::spawn(Self::deadline_task(op.clone(), reset_rx));

        Ok(op)
    }

    /// Returns the live operation for an instance when its action matches.
    pub fn get(&self, instance_id: i64, action: &str) -> Option<Operation> {
        let ops = self.lock();
        ops.get(&instance_id)
            .filter(|op| op.action() == action)
            .cloned()
    }

    /// Completes an operation and drops it from the registry.
    pub fn complete(&self, op: &Operation, result: Result<()>) {
        {
            let mut ops = self.lock();
            match ops.get(&op.inner.instance_id) {
                Some(live) if live.id() == op.id() => {
                    ops.remove(&op.inner.instance_id);
                }
                _ => return,
            }
        }
        op.done(result);
        debug!(
            instance = %op.inner.instance_name,
            action = %op.action(),
            op = %op.id(),
            "completed operation"
        );
    }

    /// Drops every live operation, completing waiters with an error.
    pub fn shutdown(&self) {
        let drained: Vec<Operation> = {
            let mut ops = self.lock();
            ops.drain().map(|(_, op)| op).collect()
        };
        for op in drained {
            op.done(Err(Error::Internal("operation registry shut down".into())));
        }
    }

    async fn deadline_task(op: Operation, mut reset_rx: mpsc::Receiver<()>) {
        let mut done_rx = op.inner.done_tx.subscribe();
        loop {
            tokio::select! {
                _ = done_rx.changed() => return,
                reset = reset_rx.recv() => {
                    if reset.is_none() {
                        return;
                    }
                }
                _ = tokio::time::sleep(OPERATION_IDLE_TIMEOUT) => {
                    op.done(Err(Error::Timeout(format!(
                        "operation {} timed out after {:?}",
                        op.action(),
                        OPERATION_IDLE_TIMEOUT
                    ))));
                    return;
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Operation>> {
        self.ops.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
