//! Live configuration update.
//!
//! The update pipeline snapshots the old state, applies and re-expands
//! the new one, computes config and device diffs, pushes live effects
//! into the running container, and commits atomically. Any failure after
//! the snapshot restores the in-memory state and releases the runtime
//! handle so nothing stale survives.

use super::driver::{root_disk_device, Notification};
use super::{InstanceDriver, InstanceRecord};
use crate::cgroup::{apply_memory_limit, parse_cpu_allowance};
use crate::config::{self, ConfigMap, Devices, Profile};
use crate::constants::*;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Arguments
// =============================================================================

/// Fields an update may change. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct UpdateArgs {
    pub architecture: Option<String>,
    pub description: Option<String>,
    pub ephemeral: Option<bool>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub config: Option<ConfigMap>,
    pub devices: Option<Devices>,
    pub profiles: Option<Vec<Profile>>,
}

// =============================================================================
// Device Diff
// =============================================================================

/// Result of classifying device changes between two expanded maps.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeviceDiff {
    pub removed: Vec<String>,
    pub added: Vec<String>,
    pub updated: Vec<String>,
}

/// Classifies device changes. An entry counts as `updated` only when the
/// type and nictype are unchanged and every differing field is in the
/// kind's advertised live-updatable set; otherwise it is a remove+add
/// pair.
pub fn diff_devices(
    old: &Devices,
    new: &Devices,
    updatable: impl Fn(&str, &ConfigMap) -> Vec<&'static str>,
) -> DeviceDiff {
    let mut diff = DeviceDiff::default();

    for name in old.keys() {
        if !new.contains_key(name) {
            diff.removed.push(name.clone());
        }
    }

    for (name, new_entry) in new {
        let Some(old_entry) = old.get(name) else {
            diff.added.push(name.clone());
            continue;
        };
        if old_entry == new_entry {
            continue;
        }

        let same_type = old_entry.get("type") == new_entry.get("type");
        let same_nictype = old_entry.get("nictype") == new_entry.get("nictype");

        let mut changed_fields = BTreeSet::new();
        for (key, value) in new_entry {
            if old_entry.get(key) != Some(value) {
                changed_fields.insert(key.clone());
            }
        }
        for key in old_entry.keys() {
            if !new_entry.contains_key(key) {
                changed_fields.insert(key.clone());
            }
        }

        let allowed = updatable(name, new_entry);
        let live_updatable = same_type
            && same_nictype
            && changed_fields.iter().all(|f| allowed.contains(&f.as_str()));

        if live_updatable {
            diff.updated.push(name.clone());
        } else {
            diff.removed.push(name.clone());
            diff.added.push(name.clone());
        }
    }

    diff
}

// =============================================================================
// Snapshot of the Old State
// =============================================================================

struct UpdateSnapshot {
    record: InstanceRecord,
    profiles: Vec<Profile>,
    expanded_config: ConfigMap,
    expanded_devices: Devices,
}

// =============================================================================
// Pipeline
// =============================================================================

impl InstanceDriver {
    /// Applies a configuration update, live when the container runs.
    ///
    /// `user_requested` updates reject changes to engine-owned
    /// (`volatile.*`) and image-sourced (`image.*`) keys.
    pub async fn update(
        self: &Arc<Self>,
        args: UpdateArgs,
        user_requested: bool,
    ) -> Result<()> {
        if self.is_snapshot() {
            return Err(Error::Validation("cannot update a snapshot".into()));
        }

        let op = self
            .host
            .operations
            .create(self.id(), &self.name(), "update", false, false)?;

        let result = self.update_inner(args, user_requested).await;
        self.host.operations.complete(&op, match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(Error::Internal(e.to_string())),
        });
        result
    }

    async fn update_inner(
        self: &Arc<Self>,
        args: UpdateArgs,
        user_requested: bool,
    ) -> Result<()> {
        // 1. Up-front validation against the incoming layers.
        if let Some(architecture) = &args.architecture {
            config::validate_architecture(architecture)?;
        }
        if let Some(new_config) = &args.config {
            config::validate_config(new_config)?;
            if user_requested {
                config::check_user_keys(&self.record().config, new_config)?;
            }
        }

        // 2. Snapshot the old state; restored on any failure below.
        let snapshot = {
            let state = self.lock();
            UpdateSnapshot {
                record: state.record.clone(),
                profiles: state.profiles.clone(),
                expanded_config: state.expanded_config.clone(),
                expanded_devices: state.expanded_devices.clone(),
            }
        };

        let result = self.apply_update(&args, &snapshot).await;
        if let Err(e) = result {
            warn!(instance = %self.name(), err = %e, "update failed, reverting");
            let mut state = self.lock();
            state.record = snapshot.record;
            state.profiles = snapshot.profiles;
            state.expanded_config = snapshot.expanded_config;
            state.expanded_devices = snapshot.expanded_devices;
            drop(state);
            // A reconfigured handle may carry applied-but-reverted state.
            self.release_runtime();
            return Err(e);
        }

        info!(instance = %self.name(), "configuration updated");
        Ok(())
    }

    async fn apply_update(
        self: &Arc<Self>,
        args: &UpdateArgs,
        snapshot: &UpdateSnapshot,
    ) -> Result<()> {
        // 3. Apply the new fields and re-expand.
        {
            let mut state = self.lock();
            if let Some(architecture) = &args.architecture {
                state.record.architecture = architecture.clone();
            }
            if let Some(description) = &args.description {
                state.record.description = description.clone();
            }
            if let Some(ephemeral) = args.ephemeral {
                state.record.ephemeral = ephemeral;
            }
            if let Some(expires_at) = &args.expires_at {
                state.record.expires_at = *expires_at;
            }
            if let Some(new_config) = &args.config {
                state.record.config = new_config.clone();
            }
            if let Some(new_devices) = &args.devices {
                state.record.devices = new_devices.clone();
            }
            if let Some(profiles) = &args.profiles {
                state.record.profiles = profiles.iter().map(|p| p.name.clone()).collect();
                state.profiles = profiles.clone();
            }

            state.expanded_config =
                config::expand_config(&state.record.config, &state.profiles);
            state.expanded_devices =
                config::expand_devices(&state.record.devices, &state.profiles);
        }

        let new_config = self.expanded_config();
        let new_devices = self.expanded_devices();

        // Config diff.
        let mut changed_keys: BTreeSet<String> = BTreeSet::new();
        for (key, value) in &new_config {
            if snapshot.expanded_config.get(key) != Some(value) {
                changed_keys.insert(key.clone());
            }
        }
        for key in snapshot.expanded_config.keys() {
            if !new_config.contains_key(key) {
                changed_keys.insert(key.clone());
            }
        }

        // Device diff: "updated" gated on advertised live fields.
        let diff = diff_devices(&snapshot.expanded_devices, &new_devices, |name, entry| {
            self.load_device_entry(name, entry)
                .map(|d| d.can_hot_plug().1.to_vec())
                .unwrap_or_default()
        });

        // 4. Re-validate the expanded result.
        config::validate_config(&new_config)?;
        self.validate_expanded_devices()?;

        // 5. Idmap-affecting changes re-run the planner.
        let idmap_keys = [
            "security.idmap.isolated",
            "security.idmap.base",
            "security.idmap.size",
            "raw.idmap",
            "security.privileged",
        ];
        if idmap_keys.iter().any(|k| changed_keys.contains(*k)) {
            if !config::config_is_true(&new_config, "security.privileged") {
                let plan = self.plan_idmap().await?;
                let mut changes = ConfigMap::new();
                changes.insert(VOLATILE_IDMAP_NEXT.into(), plan.set.to_json()?);
                changes.insert(VOLATILE_IDMAP_BASE.into(), plan.base.to_string());
                self.volatile_set(changes)?;
            } else {
                let mut changes = ConfigMap::new();
                changes.insert(VOLATILE_IDMAP_NEXT.into(), String::new());
                self.volatile_set(changes)?;
            }
        }

        // 6. Root disk invariants.
        let (_, new_root) = root_disk_device(&new_devices)?;
        if let Ok((_, old_root)) = root_disk_device(&snapshot.expanded_devices) {
            if old_root.get("pool") != new_root.get("pool") {
                return Err(Error::Validation(
                    "the root disk pool can only change through a move".into(),
                ));
            }

            // 7. Root disk size change: live apply or defer.
            if old_root.get("size") != new_root.get("size") {
                if let Some(size) = new_root.get("size") {
                    let bytes = config::parse_byte_size(size)?;
                    let running = self.is_running().await;
                    if running && self.storage.quota_requires_stopped() {
                        let mut changes = ConfigMap::new();
                        changes.insert(VOLATILE_APPLY_QUOTA.into(), size.clone());
                        self.volatile_set(changes)?;
                        debug!(instance = %self.name(), size = %size, "quota change deferred to next start");
                    } else {
                        self.storage.set_quota(bytes).await?;
                    }
                }
            }
        }

        // 8. Live config effects.
        let running = self.is_running().await;
        if running {
            self.apply_live_config(&changed_keys, &snapshot.expanded_config, &new_config)
                .await?;
        }

        // 9. Device diff application; disk throttles are recomputed in
        //    one pass over every disk afterwards.
        self.apply_device_diff(&diff, &snapshot.expanded_devices, &new_devices, running)
            .await?;

        let is_disk = |devices: &Devices, name: &String| {
            devices
                .get(name)
                .and_then(|e| e.get("type"))
                .map(String::as_str)
                == Some("disk")
        };
        let disks_changed = diff
            .updated
            .iter()
            .chain(diff.added.iter())
            .any(|name| is_disk(&new_devices, name))
            || diff
                .removed
                .iter()
                .any(|name| is_disk(&snapshot.expanded_devices, name));
        if running && disks_changed {
            self.apply_disk_limits().await?;
        }

        // 10. Orphan per-device volatile keys.
        self.clean_orphan_volatile(&new_devices)?;

        // 11. Commit.
        self.persist()?;

        // 12. Guest-visible notifications.
        let instance = self.name();
        for key in &changed_keys {
            if key.starts_with("user.") {
                self.host.notify(Notification::Config {
                    instance: instance.clone(),
                    key: key.clone(),
                });
            }
        }
        for (names, action) in [
            (&diff.removed, "removed"),
            (&diff.added, "added"),
            (&diff.updated, "updated"),
        ] {
            for name in names {
                self.host.notify(Notification::Device {
                    instance: instance.clone(),
                    device: name.clone(),
                    action,
                });
            }
        }

        Ok(())
    }

    /// Pushes changed config keys with a live effect into the running
    /// container.
    async fn apply_live_config(
        self: &Arc<Self>,
        changed: &BTreeSet<String>,
        old_config: &ConfigMap,
        new_config: &ConfigMap,
    ) -> Result<()> {
        for key in changed {
            match key.as_str() {
                "limits.memory" => {
                    if !self.host.support.memory {
                        continue;
                    }
                    let limit = new_config
                        .get(key)
                        .map(|v| config::parse_byte_size(v))
                        .transpose()?
                        .unwrap_or(u64::MAX);
                    apply_memory_limit(
                        self.host.cgroup.as_ref(),
                        &self.cgroup_path(),
                        limit,
                        self.host.support.memsw,
                    )
                    .await?;
                }
                "limits.cpu" => {
                    // Pinning is recomputed host-wide.
                    if let Some(bus) = self.host.bus() {
                        bus.request_rebalance("limits.cpu changed");
                    }
                }
                "limits.cpu.allowance" | "limits.cpu.priority" => {
                    let cpu = parse_cpu_allowance(
                        new_config
                            .get("limits.cpu.allowance")
                            .map(String::as_str)
                            .unwrap_or(""),
                        new_config
                            .get("limits.cpu.priority")
                            .map(String::as_str)
                            .unwrap_or(""),
                    )?;
                    self.cgroup_set_key("cpu.shares", &cpu.shares.to_string())
                        .await?;
                    self.cgroup_set_key("cpu.cfs_quota_us", &cpu.quota_us.to_string())
                        .await?;
                    self.cgroup_set_key("cpu.cfs_period_us", &cpu.period_us.to_string())
                        .await?;
                }
                "limits.processes" => {
                    if !self.host.support.pids {
                        continue;
                    }
                    let value = new_config
                        .get(key)
                        .cloned()
                        .unwrap_or_else(|| "-1".into());
                    self.cgroup_set_key("pids.max", &value).await?;
                }
                "limits.disk.priority" => {
                    if !self.host.support.blkio {
                        continue;
                    }
                    let priority: u64 = new_config
                        .get(key)
                        .map(String::as_str)
                        .unwrap_or("5")
                        .parse()
                        .map_err(|_| {
                            Error::Validation("invalid limits.disk.priority".into())
                        })?;
                    self.cgroup_set_key("blkio.weight", &(priority * 100).to_string())
                        .await?;
                }
                "limits.network.priority" => {
                    if !self.host.support.net_prio {
                        continue;
                    }
                    let Some(priority) = new_config.get(key) else {
                        continue;
                    };
                    let Ok(priority) = priority.parse::<u32>() else {
                        continue;
                    };
                    for (dev, _) in self.expanded_devices() {
                        if let Some(host_name) =
                            new_config.get(&format!("volatile.{dev}.host_name"))
                        {
                            self.cgroup_set_key(
                                "net_prio.ifpriomap",
                                &format!("{host_name} {priority}"),
                            )
                            .await?;
                        }
                    }
                }
                "linux.kernel_modules" => {
                    if new_config.get(key).is_some() {
                        self.load_kernel_modules().await?;
                    }
                }
                _ => {
                    let _ = old_config;
                }
            }
        }
        Ok(())
    }

    /// Stops removed devices, starts added ones, updates the rest.
    async fn apply_device_diff(
        self: &Arc<Self>,
        diff: &DeviceDiff,
        old_devices: &Devices,
        new_devices: &Devices,
        running: bool,
    ) -> Result<()> {
        for name in &diff.removed {
            let Some(entry) = old_devices.get(name) else {
                continue;
            };
            let device = self.load_device_entry(name, entry)?;
            if running {
                let (hot_pluggable, _) = device.can_hot_plug();
                if !hot_pluggable {
                    return Err(Error::Unsupported(format!(
                        "device '{name}' cannot be removed from a running container"
                    )));
                }
                match device.stop(None).await {
                    Ok(run) => self.apply_live_runconfig(&run, true).await?,
                    Err(e) if e.is_unsupported_dev_type() => {}
                    Err(e) => return Err(e),
                }
            }
            device.remove().await?;
        }

        for name in &diff.added {
            let Some(entry) = new_devices.get(name) else {
                continue;
            };
            let device = self.load_device_entry(name, entry)?;
            device.add().await?;
            if running {
                let (hot_pluggable, _) = device.can_hot_plug();
                if !hot_pluggable {
                    return Err(Error::Unsupported(format!(
                        "device '{name}' cannot be added to a running container"
                    )));
                }
                match device.start(true).await {
                    Ok(run) => self.apply_live_runconfig(&run, false).await?,
                    Err(e) if e.is_unsupported_dev_type() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        for name in &diff.updated {
            let (Some(old_entry), Some(entry)) = (old_devices.get(name), new_devices.get(name))
            else {
                continue;
            };
            let device = self.load_device_entry(name, entry)?;
            device.update(old_entry, running).await?;
        }

        Ok(())
    }

    /// Recomputes block I/O throttles across every disk in one pass and
    /// writes them per block device. Zero means unlimited; a disk without
    /// limits clears any bound on its block device.
    async fn apply_disk_limits(self: &Arc<Self>) -> Result<()> {
        use crate::cgroup::{apply_disk_throttle, fs_block_device, parse_disk_limits, DiskLimits};

        if !self.host.support.blkio {
            return Ok(());
        }

        let devices = self.expanded_devices();
        let mut per_block: std::collections::BTreeMap<String, DiskLimits> = Default::default();

        for (name, entry) in &devices {
            if entry.get("type").map(String::as_str) != Some("disk") {
                continue;
            }

            let max = entry.get("limits.max").map(String::as_str).unwrap_or("");
            let read = entry
                .get("limits.read")
                .map(String::as_str)
                .unwrap_or(max);
            let write = entry
                .get("limits.write")
                .map(String::as_str)
                .unwrap_or(max);
            let limits = parse_disk_limits(read, write)?;

            let path = if entry.get("path").map(String::as_str) == Some("/") {
                self.storage.path()
            } else {
                std::path::PathBuf::from(
                    entry.get("source").map(String::as_str).unwrap_or(""),
                )
            };

            let block = match fs_block_device(&path) {
                Ok(block) => block,
                Err(e) => {
                    warn!(device = %name, err = %e, "cannot resolve block device");
                    continue;
                }
            };

            per_block
                .entry(block)
                .and_modify(|existing| existing.merge(&limits))
                .or_insert(limits);
        }

        for (block, limits) in per_block {
            apply_disk_throttle(
                self.host.cgroup.as_ref(),
                &self.cgroup_path(),
                &block,
                &limits,
            )
            .await?;
        }
        Ok(())
    }

    /// Removes `volatile.<dev>.*` keys whose device no longer exists.
    fn clean_orphan_volatile(&self, devices: &Devices) -> Result<()> {
        let orphans: Vec<String> = {
            let state = self.lock();
            state
                .record
                .config
                .keys()
                .filter(|key| {
                    let Some(rest) = key.strip_prefix(VOLATILE_PREFIX) else {
                        return false;
                    };
                    let Some((dev, _)) = rest.split_once('.') else {
                        return false;
                    };
                    // Non-device volatile namespaces stay.
                    if matches!(dev, "idmap" | "last_state" | "apply_template" | "apply_quota") {
                        return false;
                    }
                    !devices.contains_key(dev)
                })
                .cloned()
                .collect()
        };

        if orphans.is_empty() {
            return Ok(());
        }

        let mut changes = ConfigMap::new();
        for key in orphans {
            debug!(key = %key, "dropping orphan volatile key");
            changes.insert(key, String::new());
        }
        self.volatile_set(changes)
    }

}
