//! Constants for the container lifecycle engine.
//!
//! All limits, timeouts, modes and well-known key names are defined here
//! to ensure consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Timeouts
// =============================================================================

/// Idle deadline for a long-running operation. Fires `Done` with a timeout
/// error unless the creator completes or resets it first.
pub const OPERATION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on low-level runtime state queries. Exceeding it reports a hung
/// monitor without blocking the caller.
pub const STATE_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a container to be observed not-running.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default graceful shutdown period when the caller supplies none.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Event Bus
// =============================================================================

/// Receive buffer for a single kernel uevent datagram.
pub const UEVENT_BUFFER_SIZE: usize = 4096;

/// Capacity of the CPU rebalance request channel. Requests beyond this
/// coalesce by being dropped.
pub const REBALANCE_CHANNEL_CAPACITY: usize = 2;

/// Netlink protocol number for kobject uevents.
pub const NETLINK_KOBJECT_UEVENT: i32 = 15;

/// Multicast group carrying kernel uevents.
pub const UEVENT_MULTICAST_GROUP: u32 = 1;

// =============================================================================
// On-Disk Layout
// =============================================================================

/// Default daemon state directory.
pub const DEFAULT_VAR_DIR: &str = "/var/lib/silo";

/// Subdirectory holding per-instance container paths.
pub const CONTAINERS_DIR: &str = "containers";

/// Subdirectory holding per-instance log directories.
pub const LOGS_DIR: &str = "logs";

/// Subdirectory holding persisted instance records.
pub const DATABASE_DIR: &str = "database";

/// Subdirectory holding materialised device nodes.
pub const DEVICES_DIR: &str = "devices";

/// Subdirectory holding the shared-mounts injection surface.
pub const SHMOUNTS_DIR: &str = "shmounts";

/// Subdirectory holding generated seccomp profiles.
pub const SECCOMP_DIR: &str = "security/seccomp";

/// Checkpoint directory name inside the container path, used by stateful
/// stop/start.
pub const STATE_DIR: &str = "state";

/// Image template directory name inside the container path.
pub const TEMPLATES_DIR: &str = "templates";

/// Name of the on-disk manifest written next to the rootfs.
pub const BACKUP_FILE: &str = "backup.yaml";

/// Image metadata file name inside the container path.
pub const METADATA_FILE: &str = "metadata.yaml";

/// Low-level runtime log file name.
pub const RUNTIME_LOG_FILE: &str = "lxc.log";

/// Console log file name.
pub const CONSOLE_LOG_FILE: &str = "console.log";

// =============================================================================
// Directory and File Modes
// =============================================================================

/// Mode of the per-instance log directory.
pub const LOG_DIR_MODE: u32 = 0o700;

/// Mode of the per-instance devices directory.
pub const DEVICES_DIR_MODE: u32 = 0o711;

/// Mode of the per-instance shmounts directory.
pub const SHMOUNTS_DIR_MODE: u32 = 0o711;

/// Container path mode for privileged instances.
pub const CONTAINER_PATH_MODE_PRIVILEGED: u32 = 0o700;

/// Container path mode for unprivileged instances. The extra execute bits
/// let the mapped root traverse into the rootfs.
pub const CONTAINER_PATH_MODE_UNPRIVILEGED: u32 = 0o711;

/// Mode of the backup manifest.
pub const BACKUP_FILE_MODE: u32 = 0o400;

// =============================================================================
// Volatile Keys
// =============================================================================

/// Prefix marking engine-owned configuration keys.
pub const VOLATILE_PREFIX: &str = "volatile.";

/// Idmap the engine intends to use at next start.
pub const VOLATILE_IDMAP_NEXT: &str = "volatile.idmap.next";

/// Idmap the running container currently uses.
pub const VOLATILE_IDMAP_CURRENT: &str = "volatile.idmap.current";

/// Base host id of an isolated allocation.
pub const VOLATILE_IDMAP_BASE: &str = "volatile.idmap.base";

/// Idmap the rootfs on disk is currently shifted under.
pub const VOLATILE_LAST_STATE_IDMAP: &str = "volatile.last_state.idmap";

/// Power state recorded on clean stop.
pub const VOLATILE_LAST_STATE_POWER: &str = "volatile.last_state.power";

/// Deferred template trigger, applied at next start.
pub const VOLATILE_APPLY_TEMPLATE: &str = "volatile.apply_template";

/// Deferred root-disk quota change, applied at next start.
pub const VOLATILE_APPLY_QUOTA: &str = "volatile.apply_quota";

// =============================================================================
// Idmap Defaults
// =============================================================================

/// Default isolated idmap range size.
pub const DEFAULT_IDMAP_SIZE: u64 = 65536;

/// Prefix of stable MAC addresses reserved for container NICs.
pub const NIC_MAC_PREFIX: &str = "00:16:3e";

// =============================================================================
// Environment
// =============================================================================

/// When set, the deployment refuses privileged containers and the
/// privileged subset of `raw.lxc`.
pub const ENV_UNPRIVILEGED_ONLY: &str = "SILO_UNPRIVILEGED_ONLY";

/// Override for the low-level runtime template configuration path.
pub const ENV_LXC_TEMPLATE_CONFIG: &str = "SILO_LXC_TEMPLATE_CONFIG";

/// Override for the hook script invoked by the low-level runtime.
pub const ENV_LXC_HOOK: &str = "SILO_LXC_HOOK";

// =============================================================================
// Validation
// =============================================================================

/// Valid characters for instance names.
pub const INSTANCE_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-";

/// Separator between a parent instance name and a snapshot name.
pub const SNAPSHOT_SEPARATOR: &str = "/";

/// Soft memory limit as a fraction of the hard limit, applied when a
/// memory limit is set without an explicit soft value.
pub const SOFT_MEMORY_LIMIT_FACTOR: f64 = 0.9;
