//! Device registry and capability interface.
//!
//! Every device kind implements the same lifecycle capability: validate,
//! add (persistent host-side preparation), start (produce a
//! [`RunConfig`]), live update, stop (produce a teardown `RunConfig`),
//! remove. The driver loads devices through [`load_device`], keeps the
//! returned `RunConfig`, and translates its mounts into runtime config
//! entries or live bind-mounts.
//!
//! Devices never hold a reference back to their instance. They receive a
//! [`DeviceContext`] carrying only what they need: device-scoped volatile
//! access, the idmap, identity fields and the host paths to materialise
//! nodes under.

mod disk;
mod infiniband;
mod nic;
mod unix;
mod usb;

pub use disk::DiskDevice;
pub use infiniband::InfinibandDevice;
pub use nic::NicDevice;
pub use unix::UnixDevice;
pub use usb::{enumerate_usb, usb_config_matches, zero_pad, ObservedUsb, UsbDevice};

use crate::config::ConfigMap;
use crate::error::{Error, Result};
use crate::idmap::IdmapSet;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

// =============================================================================
// Run Configuration
// =============================================================================

/// One mount the runtime should perform (or the driver should inject live).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Device name the mount belongs to, for teardown bookkeeping.
    pub device: String,
    /// Host-side source path.
    pub source: PathBuf,
    /// Target path relative to the container rootfs.
    pub target: String,
    /// Filesystem type ("none" for bind mounts).
    pub fstype: String,
    /// Mount options handed to the runtime.
    pub opts: Vec<String>,
    /// Whether the source ownership must be shifted into the container's
    /// idmap before mounting.
    pub shift: bool,
}

impl MountEntry {
    /// Renders the runtime's `lxc.mount.entry` value.
    pub fn to_runtime_entry(&self) -> String {
        format!(
            "{} {} {} {} 0 0",
            self.source.display(),
            self.target.trim_start_matches('/'),
            self.fstype,
            self.opts.join(",")
        )
    }
}

/// One cgroup rule the runtime should apply, e.g. `devices.allow` =
/// `c 189:* rwm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupRule {
    pub key: String,
    pub value: String,
}

/// A declarative host-side action to run after the container started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostHook {
    /// Write `net_prio.ifpriomap` for one interface.
    NetworkPriority { iface: String, priority: u32 },
    /// Apply traffic-shaping limits to a host-side interface.
    NetworkLimits {
        iface: String,
        ingress_bps: Option<u64>,
        egress_bps: Option<u64>,
    },
    /// Run a host command.
    Command { program: String, args: Vec<String> },
}

/// Everything a device contributes to a container run.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub mounts: Vec<MountEntry>,
    pub cgroup_rules: Vec<CgroupRule>,
    /// Key/value pairs for the runtime's per-NIC configuration
    /// (`type`, `link`, `name`, `hwaddr`, ...).
    pub network_interface: Vec<(String, String)>,
    pub post_hooks: Vec<PostHook>,
}

impl RunConfig {
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
            && self.cgroup_rules.is_empty()
            && self.network_interface.is_empty()
            && self.post_hooks.is_empty()
    }
}

// =============================================================================
// Context
// =============================================================================

/// Host services a device is allowed to use, injected by the driver.
///
/// This breaks the instance↔device cycle: devices see a narrow capability
/// handle, not the instance.
pub trait DeviceHost: Send + Sync {
    /// Instance name.
    fn instance_name(&self) -> String;

    /// Project the instance belongs to.
    fn project(&self) -> String;

    /// True when the container runs privileged (no idmap).
    fn is_privileged(&self) -> bool;

    /// Directory where device nodes for this instance are materialised.
    fn devices_dir(&self) -> PathBuf;

    /// Current idmap, when unprivileged.
    fn idmap(&self) -> Option<IdmapSet>;

    /// Reads a device-scoped volatile value (`volatile.<dev>.<key>`).
    fn volatile_get(&self, device: &str, key: &str) -> Option<String>;

    /// Writes device-scoped volatile values.
    fn volatile_set(&self, device: &str, changes: BTreeMap<String, String>) -> Result<()>;
}

/// Per-device view over a [`DeviceHost`].
#[derive(Clone)]
pub struct DeviceContext {
    host: Arc<dyn DeviceHost>,
    device: String,
}

impl DeviceContext {
    pub fn new(host: Arc<dyn DeviceHost>, device: &str) -> Self {
        DeviceContext {
            host,
            device: device.to_string(),
        }
    }

    pub fn instance_name(&self) -> String {
        self.host.instance_name()
    }

    pub fn project(&self) -> String {
        self.host.project()
    }

    pub fn is_privileged(&self) -> bool {
        self.host.is_privileged()
    }

    pub fn devices_dir(&self) -> PathBuf {
        self.host.devices_dir()
    }

    pub fn idmap(&self) -> Option<IdmapSet> {
        self.host.idmap()
    }

    pub fn volatile_get(&self, key: &str) -> Option<String> {
        self.host.volatile_get(&self.device, key)
    }

    pub fn volatile_set_one(&self, key: &str, value: &str) -> Result<()> {
        let mut changes = BTreeMap::new();
        changes.insert(key.to_string(), value.to_string());
        self.host.volatile_set(&self.device, changes)
    }
}

// =============================================================================
// Capability Trait
// =============================================================================

/// Uniform lifecycle capability implemented by every device kind.
#[async_trait]
pub trait Device: Send + Sync {
    /// The `type` property this device was loaded from.
    fn kind(&self) -> &'static str;

    /// Device name within the instance.
    fn name(&self) -> &str;

    /// Refuses malformed configuration.
    fn validate(&self) -> Result<()>;

    /// Persistent host-side preparation, called at instance create and
    /// config update (e.g. reserving a MAC in volatile).
    async fn add(&self) -> Result<()> {
        Ok(())
    }

    /// Produces the device's contribution to a (starting or running)
    /// container. May fail with `UnsupportedDevType` to fall back to the
    /// legacy path for the kind.
    async fn start(&self, is_running: bool) -> Result<RunConfig>;

    /// Whether the kind supports insert/remove on a running container,
    /// and which fields are live-updatable without an add/remove cycle.
    fn can_hot_plug(&self) -> (bool, &'static [&'static str]);

    /// Applies a live update from `old` config to this device's config.
    async fn update(&self, _old: &ConfigMap, _is_running: bool) -> Result<()> {
        Ok(())
    }

    /// Produces the teardown contribution. When `netns_path` is given the
    /// container is already gone but its network namespace persists, so
    /// interfaces can still be moved back to the host.
    async fn stop(&self, netns_path: Option<&str>) -> Result<RunConfig>;

    /// Persistent host-side teardown.
    async fn remove(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Device kinds with a typed implementation.
pub const TYPED_KINDS: &[&str] = &["disk", "nic", "infiniband", "unix-char", "unix-block", "usb"];

/// Device kinds recognized but handled by the legacy code path.
pub const LEGACY_KINDS: &[&str] = &["gpu", "proxy", "none"];

/// Loads a typed device object from raw config.
///
/// Unknown `type` values are a validation error; known-but-untyped kinds
/// load as [`LegacyDevice`] whose `start` yields `UnsupportedDevType`.
pub fn load_device(
    name: &str,
    config: &ConfigMap,
    ctx: DeviceContext,
) -> Result<Box<dyn Device>> {
    let kind = config
        .get("type")
        .ok_or_else(|| Error::Validation(format!("device '{name}' has no type")))?;

    let device: Box<dyn Device> = match kind.as_str() {
        "disk" => Box::new(DiskDevice::new(name, config.clone(), ctx)),
        "nic" => Box::new(NicDevice::new(name, config.clone(), ctx)),
        "infiniband" => Box::new(InfinibandDevice::new(name, config.clone(), ctx)),
        "unix-char" => Box::new(UnixDevice::new(name, config.clone(), ctx, false)),
        "unix-block" => Box::new(UnixDevice::new(name, config.clone(), ctx, true)),
        "usb" => Box::new(UsbDevice::new(name, config.clone(), ctx)),
        other if LEGACY_KINDS.contains(&other) => {
            Box::new(LegacyDevice::new(name, other, config.clone()))
        }
        other => {
            return Err(Error::Validation(format!(
                "device '{name}' has invalid type '{other}'"
            )))
        }
    };

    device.validate()?;
    Ok(device)
}

/// Validates a raw device entry without materialising host state.
pub fn validate_device(name: &str, config: &ConfigMap, ctx: DeviceContext) -> Result<()> {
    load_device(name, config, ctx).map(|_| ())
}

// =============================================================================
// Legacy Fallback
// =============================================================================

/// Placeholder for kinds without a typed implementation. Its lifecycle
/// methods return the `UnsupportedDevType` sentinel so the driver routes
/// the device through the legacy path.
pub struct LegacyDevice {
    name: String,
    kind: &'static str,
}

impl LegacyDevice {
    fn new(name: &str, kind: &str, _config: ConfigMap) -> Self {
        let kind = LEGACY_KINDS
            .iter()
            .find(|k| **k == kind)
            .copied()
            .unwrap_or("none");
        LegacyDevice {
            name: name.to_string(),
            kind,
        }
    }
}

#[async_trait]
impl Device for LegacyDevice {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _is_running: bool) -> Result<RunConfig> {
        Err(Error::UnsupportedDevType(self.kind.to_string()))
    }

    fn can_hot_plug(&self) -> (bool, &'static [&'static str]) {
        (false, &[])
    }

    async fn stop(&self, _netns_path: Option<&str>) -> Result<RunConfig> {
        Err(Error::UnsupportedDevType(self.kind.to_string()))
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Builds the cgroup device rule value for a node.
pub(crate) fn device_rule(block: bool, major: u32, minor: u32) -> String {
    let class = if block { 'b' } else { 'c' };
    format!("{class} {major}:{minor} rwm")
}

/// Escapes a device path into the flat name used under the instance's
/// devices directory.
pub(crate) fn escape_device_path(prefix: &str, path: &str) -> String {
    format!(
        "{}.{}",
        prefix,
        path.trim_start_matches('/').replace('/', "-")
    )
}
