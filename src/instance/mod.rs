//! Per-container instance driver.
//!
//! The [`InstanceDriver`] owns the container object: its expanded
//! configuration, device list, identity-mapping state, storage handle and
//! the runtime handle while one exists. It implements the full lifecycle
//! state machine and negotiates with the hooks the low-level runtime
//! calls back into.

mod driver;
mod start;
mod update;

pub use driver::{root_disk_device, BusView, Host, InstanceDriver, Notification, RuntimeFactory};
pub use update::{diff_devices, DeviceDiff, UpdateArgs};

use crate::config::{ConfigMap, Devices};
use crate::constants::SNAPSHOT_SEPARATOR;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// State Machine
// =============================================================================

/// Lifecycle states of an instance.
///
/// ```text
///   Stopped ──▶ Starting ──▶ Running ──▶ Stopping ──▶ Stopped
///                               │  ▲
///                        freeze │  │ unfreeze
///                               ▼  │
///                              Frozen
/// ```
///
/// Snapshots always report `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Frozen,
    Aborting,
    Error,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Stopped => "stopped",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Frozen => "frozen",
            InstanceState::Aborting => "aborting",
            InstanceState::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl From<crate::runtime::RuntimeState> for InstanceState {
    fn from(state: crate::runtime::RuntimeState) -> Self {
        use crate::runtime::RuntimeState as R;
        match state {
            R::Stopped => InstanceState::Stopped,
            R::Starting => InstanceState::Starting,
            R::Running | R::Thawed => InstanceState::Running,
            R::Stopping => InstanceState::Stopping,
            R::Aborting => InstanceState::Aborting,
            R::Freezing | R::Frozen => InstanceState::Frozen,
            R::Error => InstanceState::Error,
        }
    }
}

// =============================================================================
// Record
// =============================================================================

/// The persisted description of an instance (or snapshot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Stable integer id.
    pub id: i64,
    pub project: String,
    /// Instance name; snapshots use `<parent>/<snap>`.
    pub name: String,
    pub architecture: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub is_snapshot: bool,
    /// Ordered profile names.
    #[serde(default)]
    pub profiles: Vec<String>,
    /// Local configuration layer.
    #[serde(default)]
    pub config: ConfigMap,
    /// Local device layer.
    #[serde(default)]
    pub devices: Devices,
}

impl InstanceRecord {
    /// `<project>_<name>` form the runtime and the on-disk layout use.
    pub fn scoped_name(&self) -> String {
        scoped_name(&self.project, &self.name)
    }

    /// Parent and snapshot components, when this is a snapshot record.
    pub fn snapshot_parts(&self) -> Option<(&str, &str)> {
        if self.is_snapshot {
            self.name.split_once(SNAPSHOT_SEPARATOR)
        } else {
            None
        }
    }
}

/// Scoped on-disk/runtime name for a project-qualified instance.
pub fn scoped_name(project: &str, name: &str) -> String {
    format!("{project}_{}", name.replace(SNAPSHOT_SEPARATOR, "-"))
}
