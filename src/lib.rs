//! # silo
//!
//! **Core lifecycle engine for Linux system containers**
//!
//! This crate implements the per-container heart of a system-container
//! management daemon: the instance driver that walks a container through
//! its full state machine, the device scheduler that reacts to host
//! kernel events, and the plumbing both need (identity mapping, control
//! groups, storage and runtime contracts).
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              silo                                   │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                     InstanceDriver                          │    │
//! │  │  start(stateful) → stop(stateful) → shutdown(timeout)       │    │
//! │  │  freeze/unfreeze │ restore │ update │ rename │ delete       │    │
//! │  └──────┬────────────────┬──────────────────┬──────────────────┘    │
//! │         │                │                  │                       │
//! │  ┌──────┴──────┐  ┌──────┴───────┐  ┌───────┴────────┐              │
//! │  │ DeviceRegistry│ │ StorageHandle │  │ RuntimeHandle │              │
//! │  │ disk nic usb │  │ mount/quota/  │  │ fork helpers, │              │
//! │  │ unix-char/blk│  │ snapshot/...  │  │ config render │              │
//! │  └──────────────┘  └──────────────┘  └────────────────┘              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                          EventBus                                   │
//! │   netlink uevents (cpu / net / usb)  +  inotify ancestor watches    │
//! │   → CPU rebalance │ net_prio update │ USB hotplug │ disk hotplug    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle State Machine
//!
//! ```text
//!   Stopped ──▶ Starting ──▶ Running ──▶ Stopping ──▶ Stopped
//!                               │  ▲
//!                        freeze │  │ unfreeze
//!                               ▼  │
//!                              Frozen
//! ```
//!
//! Snapshots always report `Stopped`. Ephemeral instances delete
//! themselves after the post-stop hooks finish.
//!
//! # Global State
//!
//! Mutable process-wide state is limited to three named singletons, each
//! with an explicit init/shutdown pair and passed by reference:
//!
//! - [`operations::OperationRegistry`] — at most one long-running action
//!   per instance, with a 30-second idle deadline
//! - [`idmap::IdmapPlanner`] — isolated uid/gid range allocation under a
//!   process-wide mutex
//! - [`events::EventBus`] — the single task observing kernel events
//!
//! # Out of Scope
//!
//! The HTTP surface, clustering, image handling, profile storage and the
//! concrete storage-pool drivers live outside this crate; the engine
//! consumes them through the narrow [`storage::StorageHandle`] and
//! profile types.

// =============================================================================
// Internal Modules
// =============================================================================

pub mod backup;
pub mod cgroup;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod events;
pub mod idmap;
pub mod instance;
pub mod operations;
pub mod runtime;
pub mod storage;
pub mod template;

// =============================================================================
// Facade Re-exports
// =============================================================================

pub use config::{expand_config, expand_devices, ConfigMap, Devices, Profile};
pub use error::{Error, Result};
pub use events::EventBus;
pub use idmap::{IdmapEntry, IdmapKind, IdmapPlanner, IdmapSet};
pub use instance::{
    Host, InstanceDriver, InstanceRecord, InstanceState, RuntimeFactory, UpdateArgs,
};
pub use operations::{Operation, OperationRegistry};
pub use runtime::{ForkRuntime, RuntimeHandle, RuntimeState};
pub use storage::{DirStorage, StorageHandle};
