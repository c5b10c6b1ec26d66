//! Driver state, host wiring, hooks, and the small lifecycle operations.
//!
//! The start/stop pipeline lives in `start.rs`, live update in
//! `update.rs`.

use super::{scoped_name, InstanceRecord, InstanceState};
use crate::cgroup::{CgroupSupport, CgroupWriter};
use crate::config::{self, ConfigMap, Devices, Profile};
use crate::constants::*;
use crate::device::{
    load_device, Device, DeviceContext, DeviceHost, ObservedUsb, RunConfig, UsbDevice,
};
use crate::error::{Error, Result};
use crate::events::{BusInstance, EventBus};
use crate::idmap::{AllocatedRange, IdmapPlanner, IdmapRequest, IdmapSet};
use crate::operations::OperationRegistry;
use crate::runtime::{query_state_bounded, RuntimeHandle};
use crate::storage::StorageHandle;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

// =============================================================================
// Host Context
// =============================================================================

/// Builds runtime handles; the driver recreates the handle on every full
/// config reload.
pub trait RuntimeFactory: Send + Sync {
    fn create(&self, scoped_name: &str, log_dir: &Path) -> crate::error::Result<Arc<dyn RuntimeHandle>>;
}

/// A guest-visible change pushed out on the in-container notification
/// socket by the surface that serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A `user.*` config key changed.
    Config { instance: String, key: String },
    /// A device was added, removed or updated.
    Device {
        instance: String,
        device: String,
        action: &'static str,
    },
}

/// Daemon-wide context handed to every instance driver: on-disk layout
/// roots, the cgroup writer, and the three named singletons.
pub struct Host {
    pub var_dir: PathBuf,
    pub cgroup: Arc<dyn CgroupWriter>,
    pub support: CgroupSupport,
    pub operations: Arc<OperationRegistry>,
    pub idmap: Arc<IdmapPlanner>,
    pub runtime_factory: Arc<dyn RuntimeFactory>,
    notifications: tokio::sync::broadcast::Sender<Notification>,
    bus: RwLock<Option<EventBus>>,
    store: RwLock<Option<Arc<dyn crate::events::InstanceStore>>>,
}

impl Host {
    pub fn new(
        var_dir: impl Into<PathBuf>,
        cgroup: Arc<dyn CgroupWriter>,
        support: CgroupSupport,
        idmap: Arc<IdmapPlanner>,
        runtime_factory: Arc<dyn RuntimeFactory>,
    ) -> Arc<Self> {
        let (notifications, _) = tokio::sync::broadcast::channel(64);
        Arc::new(Host {
            var_dir: var_dir.into(),
            cgroup,
            support,
            operations: Arc::new(OperationRegistry::new()),
            idmap,
            runtime_factory,
            notifications,
            bus: RwLock::new(None),
            store: RwLock::new(None),
        })
    }

    /// Subscribes to guest-visible change notifications.
    pub fn subscribe_notifications(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub(crate) fn notify(&self, notification: Notification) {
        // No subscriber is fine; the surface may not be up yet.
        let _ = self.notifications.send(notification);
    }

    /// Wires in the event bus once it exists (it needs the instance
    /// store, which needs drivers, which need this host).
    pub fn attach_bus(&self, bus: EventBus) {
        *self.bus.write().unwrap_or_else(|p| p.into_inner()) = Some(bus);
    }

    pub fn bus(&self) -> Option<EventBus> {
        self.bus.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn attach_store(&self, store: Arc<dyn crate::events::InstanceStore>) {
        *self.store.write().unwrap_or_else(|p| p.into_inner()) = Some(store);
    }

    pub fn store(&self) -> Option<Arc<dyn crate::events::InstanceStore>> {
        self.store.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn logs_dir(&self, scoped: &str) -> PathBuf {
        self.var_dir.join(LOGS_DIR).join(scoped)
    }

    pub fn devices_dir(&self, scoped: &str) -> PathBuf {
        self.var_dir.join(DEVICES_DIR).join(scoped)
    }

    pub fn shmounts_dir(&self, scoped: &str) -> PathBuf {
        self.var_dir.join(SHMOUNTS_DIR).join(scoped)
    }

    pub fn seccomp_profile_path(&self, scoped: &str) -> PathBuf {
        self.var_dir.join(SECCOMP_DIR).join(scoped)
    }

    pub fn record_path(&self, scoped: &str) -> PathBuf {
        self.var_dir.join(DATABASE_DIR).join(format!("{scoped}.json"))
    }

    /// Runtime state directory (the runtime's `lxcpath`).
    pub fn runtime_path(&self) -> PathBuf {
        self.var_dir.join(CONTAINERS_DIR)
    }
}

// =============================================================================
// Driver
// =============================================================================

pub(super) struct DriverState {
    pub record: InstanceRecord,
    pub profiles: Vec<Profile>,
    pub expanded_config: ConfigMap,
    pub expanded_devices: Devices,
    pub idmap: Option<IdmapSet>,
    pub snapshots: Vec<InstanceRecord>,
    pub runtime: Option<Arc<dyn RuntimeHandle>>,
}

/// Per-container lifecycle driver.
pub struct InstanceDriver {
    pub(super) host: Arc<Host>,
    pub(super) storage: Arc<dyn StorageHandle>,
    pub(super) state: Mutex<DriverState>,
}

impl InstanceDriver {
    /// Loads a driver over an existing record, expanding config and
    /// devices through the resolved profiles.
    pub fn load(
        host: Arc<Host>,
        record: InstanceRecord,
        profiles: Vec<Profile>,
        storage: Arc<dyn StorageHandle>,
    ) -> Result<Arc<Self>> {
        config::validate_instance_name(
            record
                .name
                .split(SNAPSHOT_SEPARATOR)
                .next()
                .unwrap_or(&record.name),
        )?;
        config::validate_architecture(&record.architecture)?;
        config::validate_config(&record.config)?;

        let expanded_config = config::expand_config(&record.config, &profiles);
        let expanded_devices = config::expand_devices(&record.devices, &profiles);

        let idmap = match expanded_config.get(VOLATILE_IDMAP_CURRENT) {
            Some(raw) if !raw.is_empty() => Some(IdmapSet::from_json(raw)?),
            _ => None,
        };

        let driver = Arc::new(InstanceDriver {
            host,
            storage,
            state: Mutex::new(DriverState {
                record,
                profiles,
                expanded_config,
                expanded_devices,
                idmap,
                snapshots: Vec::new(),
                runtime: None,
            }),
        });

        driver.validate_expanded_devices()?;
        Ok(driver)
    }

    /// Creates a new instance: validates, plans the initial idmap, writes
    /// the record, prepares devices, and defers templates.
    pub async fn create(
        host: Arc<Host>,
        record: InstanceRecord,
        profiles: Vec<Profile>,
        storage: Arc<dyn StorageHandle>,
    ) -> Result<Arc<Self>> {
        let driver = Self::load(host, record, profiles, storage)?;

        // Initial idmap allocation for unprivileged instances.
        if !driver.is_privileged() {
            let plan = driver.plan_idmap().await?;
            let mut changes = ConfigMap::new();
            changes.insert(VOLATILE_IDMAP_NEXT.into(), plan.set.to_json()?);
            changes.insert(VOLATILE_IDMAP_BASE.into(), plan.base.to_string());
            driver.volatile_set(changes)?;
        }

        // Persistent device preparation (MAC reservation and friends).
        for (name, entry) in driver.expanded_devices() {
            let device = driver.load_device_entry(&name, &entry)?;
            device.add().await?;
        }

        // Defer template application to first start.
        let mut changes = ConfigMap::new();
        changes.insert(VOLATILE_APPLY_TEMPLATE.into(), "create".into());
        driver.volatile_set(changes)?;

        driver.persist()?;
        info!(instance = %driver.name(), project = %driver.project(), "created instance");
        Ok(driver)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub(super) fn lock(&self) -> std::sync::MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn name(&self) -> String {
        self.lock().record.name.clone()
    }

    pub fn project(&self) -> String {
        self.lock().record.project.clone()
    }

    pub fn id(&self) -> i64 {
        self.lock().record.id
    }

    pub fn scoped_name(&self) -> String {
        self.lock().record.scoped_name()
    }

    pub fn record(&self) -> InstanceRecord {
        self.lock().record.clone()
    }

    pub fn snapshots(&self) -> Vec<InstanceRecord> {
        self.lock().snapshots.clone()
    }

    pub fn is_snapshot(&self) -> bool {
        self.lock().record.is_snapshot
    }

    pub fn is_ephemeral(&self) -> bool {
        self.lock().record.ephemeral
    }

    pub fn is_stateful(&self) -> bool {
        self.lock().record.stateful
    }

    pub fn expanded_config(&self) -> ConfigMap {
        self.lock().expanded_config.clone()
    }

    pub fn expanded_devices(&self) -> Devices {
        self.lock().expanded_devices.clone()
    }

    pub fn is_privileged(&self) -> bool {
        config::config_is_true(&self.lock().expanded_config, "security.privileged")
    }

    pub fn storage(&self) -> Arc<dyn StorageHandle> {
        Arc::clone(&self.storage)
    }

    pub fn current_idmap(&self) -> Option<IdmapSet> {
        self.lock().idmap.clone()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.host.logs_dir(&self.scoped_name())
    }

    pub fn devices_dir_path(&self) -> PathBuf {
        self.host.devices_dir(&self.scoped_name())
    }

    pub fn shmounts_dir_path(&self) -> PathBuf {
        self.host.shmounts_dir(&self.scoped_name())
    }

    /// Checkpoint directory used by stateful stop/start.
    pub fn state_path(&self) -> PathBuf {
        self.storage.path().join(STATE_DIR)
    }

    pub fn templates_path(&self) -> PathBuf {
        self.storage.path().join(TEMPLATES_DIR)
    }

    /// Cgroup path of the container, relative to each controller root.
    pub fn cgroup_path(&self) -> String {
        format!("/lxc/{}", self.scoped_name())
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Current lifecycle state. Snapshots are always `Stopped`; a hung
    /// monitor reports `Error` rather than blocking.
    pub async fn state(&self) -> InstanceState {
        if self.is_snapshot() {
            return InstanceState::Stopped;
        }
        let runtime = self.lock().runtime.clone();
        let Some(runtime) = runtime else {
            return InstanceState::Stopped;
        };
        match query_state_bounded(runtime.as_ref()).await {
            Ok(state) => InstanceState::from(state),
            Err(Error::Timeout(_)) => {
                warn!(instance = %self.name(), "monitor hung");
                InstanceState::Error
            }
            Err(_) => InstanceState::Stopped,
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(
            self.state().await,
            InstanceState::Running | InstanceState::Starting | InstanceState::Frozen
        )
    }

    pub async fn is_frozen(&self) -> bool {
        self.state().await == InstanceState::Frozen
    }

    // =========================================================================
    // Runtime Handle
    // =========================================================================

    /// Resolves the runtime handle, creating it when absent. Idempotent.
    pub(super) fn init_runtime(&self) -> Result<Arc<dyn RuntimeHandle>> {
        let mut state = self.lock();
        if let Some(runtime) = &state.runtime {
            return Ok(Arc::clone(runtime));
        }
        let runtime = self
            .host
            .runtime_factory
            .create(&state.record.scoped_name(), &self.host.logs_dir(&state.record.scoped_name()))?;
        state.runtime = Some(Arc::clone(&runtime));
        Ok(runtime)
    }

    pub(super) fn runtime(&self) -> Option<Arc<dyn RuntimeHandle>> {
        self.lock().runtime.clone()
    }

    /// Drops the cached handle so the next user re-reads a fresh config.
    pub(super) fn release_runtime(&self) {
        self.lock().runtime = None;
    }

    // =========================================================================
    // Persistence and Volatile Keys
    // =========================================================================

    /// Writes the record (and snapshot list) atomically: temp file then
    /// rename.
    pub fn persist(&self) -> Result<()> {
        let (record, snapshots) = {
            let state = self.lock();
            (state.record.clone(), state.snapshots.clone())
        };

        let path = self.host.record_path(&record.scoped_name());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        #[derive(serde::Serialize)]
        struct PersistedInstance<'a> {
            #[serde(flatten)]
            record: &'a InstanceRecord,
            snapshots: &'a [InstanceRecord],
        }

        let rendered = serde_json::to_vec_pretty(&PersistedInstance {
            record: &record,
            snapshots: &snapshots,
        })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, rendered)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Engine-side volatile writes; re-expands so the new values are
    /// visible through the expanded config.
    pub fn volatile_set(&self, changes: ConfigMap) -> Result<()> {
        {
            let mut state = self.lock();
            for (key, value) in changes {
                if !config::is_volatile(&key) {
                    return Err(Error::Internal(format!(
                        "volatile_set called with non-volatile key '{key}'"
                    )));
                }
                if value.is_empty() {
                    state.record.config.remove(&key);
                } else {
                    state.record.config.insert(key, value);
                }
            }
            state.expanded_config =
                config::expand_config(&state.record.config, &state.profiles);
        }
        self.persist()
    }

    // =========================================================================
    // Devices
    // =========================================================================

    pub(super) fn device_context(self: &Arc<Self>, device: &str) -> DeviceContext {
        DeviceContext::new(
            Arc::new(DriverDeviceHost {
                driver: Arc::clone(self),
            }),
            device,
        )
    }

    pub(super) fn load_device_entry(
        self: &Arc<Self>,
        name: &str,
        entry: &ConfigMap,
    ) -> Result<Box<dyn Device>> {
        load_device(name, entry, self.device_context(name))
    }

    /// Validates the expanded device list: every entry must load, and
    /// exactly one disk must be the root disk.
    pub(super) fn validate_expanded_devices(self: &Arc<Self>) -> Result<()> {
        let devices = self.expanded_devices();
        for (name, entry) in &devices {
            self.load_device_entry(name, entry)?;
        }
        if !self.is_snapshot() {
            root_disk_device(&devices)?;
        }
        Ok(())
    }

    // =========================================================================
    // Cgroups
    // =========================================================================

    pub async fn cgroup_get(&self, key: &str) -> Result<String> {
        let controller = cgroup_controller(key)?;
        self.host
            .cgroup
            .get(controller, &self.cgroup_path(), key)
            .await
    }

    pub async fn cgroup_set_key(&self, key: &str, value: &str) -> Result<()> {
        let controller = cgroup_controller(key)?;
        self.host
            .cgroup
            .set(controller, &self.cgroup_path(), key, value)
            .await
    }

    // =========================================================================
    // Freeze / Unfreeze
    // =========================================================================

    pub async fn freeze(&self) -> Result<()> {
        if !self.host.support.freezer {
            return Err(Error::Unsupported(
                "host kernel has no freezer cgroup".into(),
            ));
        }
        if self.is_snapshot() {
            return Err(Error::Validation("cannot freeze a snapshot".into()));
        }

        let state = self.state().await;
        if state != InstanceState::Running {
            return Err(Error::InvalidState {
                instance: self.name(),
                state: state.to_string(),
                expected: "running".into(),
            });
        }

        let runtime = self
            .runtime()
            .ok_or_else(|| Error::Internal("no runtime handle".into()))?;
        info!(instance = %self.name(), "freezing container");
        runtime.freeze().await
    }

    pub async fn unfreeze(&self) -> Result<()> {
        let state = self.state().await;
        if state != InstanceState::Frozen {
            return Err(Error::InvalidState {
                instance: self.name(),
                state: state.to_string(),
                expected: "frozen".into(),
            });
        }

        let runtime = self
            .runtime()
            .ok_or_else(|| Error::Internal("no runtime handle".into()))?;
        info!(instance = %self.name(), "unfreezing container");
        runtime.unfreeze().await
    }

    // =========================================================================
    // Delete / Rename / Snapshot / Restore
    // =========================================================================

    pub async fn delete(self: &Arc<Self>) -> Result<()> {
        if config::config_is_true(&self.expanded_config(), "security.protection.delete")
            && !self.is_snapshot()
        {
            return Err(Error::Protected {
                instance: self.name(),
                action: "delete".into(),
            });
        }

        if self.is_running().await {
            return Err(Error::InvalidState {
                instance: self.name(),
                state: "running".into(),
                expected: "stopped".into(),
            });
        }

        let op = self
            .host
            .operations
            .create(self.id(), &self.name(), "delete", false, false)?;

        let result = self.delete_inner().await;
        self.host.operations.complete(&op, match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(Error::Internal(e.to_string())),
        });
        result
    }

    async fn delete_inner(self: &Arc<Self>) -> Result<()> {
        info!(instance = %self.name(), project = %self.project(), "deleting instance");

        // Persistent device teardown.
        for (name, entry) in self.expanded_devices() {
            match self.load_device_entry(&name, &entry) {
                Ok(device) => {
                    if let Err(e) = device.remove().await {
                        warn!(device = %name, err = %e, "device remove failed");
                    }
                }
                Err(e) => debug!(device = %name, err = %e, "skipping invalid device on delete"),
            }
        }

        self.storage.delete().await?;

        let scoped = self.scoped_name();
        for dir in [
            self.host.logs_dir(&scoped),
            self.host.devices_dir(&scoped),
            self.host.shmounts_dir(&scoped),
        ] {
            if dir.exists() {
                let _ = std::fs::remove_dir_all(&dir);
            }
        }
        let record_path = self.host.record_path(&scoped);
        if record_path.exists() {
            std::fs::remove_file(&record_path)?;
        }
        let seccomp = self.host.seccomp_profile_path(&scoped);
        if seccomp.exists() {
            let _ = std::fs::remove_file(&seccomp);
        }

        if let Some(bus) = self.host.bus() {
            bus.request_rebalance("instance deleted");
        }
        Ok(())
    }

    /// Renames a stopped instance, moving storage and log paths.
    pub async fn rename(self: &Arc<Self>, new_name: &str) -> Result<()> {
        config::validate_instance_name(new_name)?;
        if self.is_running().await {
            return Err(Error::InvalidState {
                instance: self.name(),
                state: "running".into(),
                expected: "stopped".into(),
            });
        }

        let op = self
            .host
            .operations
            .create(self.id(), &self.name(), "rename", false, false)?;
        let result = self.rename_inner(new_name).await;
        self.host.operations.complete(&op, match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(Error::Internal(e.to_string())),
        });
        result
    }

    async fn rename_inner(self: &Arc<Self>, new_name: &str) -> Result<()> {
        let old_scoped = self.scoped_name();
        let project = self.project();
        let new_scoped = scoped_name(&project, new_name);

        info!(instance = %self.name(), new = %new_name, "renaming instance");

        self.storage.rename(&new_scoped).await?;

        let old_logs = self.host.logs_dir(&old_scoped);
        if old_logs.exists() {
            tokio::fs::rename(&old_logs, self.host.logs_dir(&new_scoped)).await?;
        }

        let old_record = self.host.record_path(&old_scoped);
        {
            let mut state = self.lock();
            let old_name = state.record.name.clone();
            state.record.name = new_name.to_string();
            // Snapshots keep the `<parent>/<snap>` shape.
            for snapshot in &mut state.snapshots {
                if let Some((_, snap)) = snapshot.name.clone().split_once(SNAPSHOT_SEPARATOR) {
                    snapshot.name = format!("{new_name}{SNAPSHOT_SEPARATOR}{snap}");
                }
            }
            debug!(old = %old_name, new = %new_name, "record renamed");
        }
        self.persist()?;
        if old_record.exists() {
            std::fs::remove_file(&old_record)?;
        }

        // Stale handle would carry the old name.
        self.release_runtime();
        Ok(())
    }

    /// Creates a named snapshot of the stopped or running instance.
    pub async fn snapshot(self: &Arc<Self>, snap_name: &str) -> Result<()> {
        if snap_name.is_empty() || snap_name.contains(SNAPSHOT_SEPARATOR) {
            return Err(Error::Validation(format!(
                "invalid snapshot name '{snap_name}'"
            )));
        }

        self.storage.snapshot(snap_name).await?;

        let mut state = self.lock();
        let mut record = state.record.clone();
        record.name = format!("{}{SNAPSHOT_SEPARATOR}{snap_name}", record.name);
        record.is_snapshot = true;
        record.created_at = chrono::Utc::now();
        state.snapshots.push(record);
        drop(state);

        self.persist()
    }

    /// Rolls the instance back to a snapshot; a running instance is
    /// restarted around the rollback.
    ///
    /// The rollback itself holds the restore operation; the surrounding
    /// stop and start own theirs, as they do everywhere else.
    pub async fn restore(self: &Arc<Self>, snap_name: &str, stateful: bool) -> Result<()> {
        let snapshot = self
            .snapshots()
            .into_iter()
            .find(|s| {
                s.snapshot_parts()
                    .map(|(_, snap)| snap == snap_name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| Error::NotFound(format!("snapshot '{snap_name}'")))?;

        let was_running = self.is_running().await;
        if was_running {
            info!(instance = %self.name(), "stopping before restore");
            self.stop(false).await?;
        }

        let op = self
            .host
            .operations
            .create(self.id(), &self.name(), "restore", false, false)?;

        let result = self.restore_rollback(&snapshot).await;
        self.host.operations.complete(&op, match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(Error::Internal(e.to_string())),
        });
        result?;

        if stateful || was_running {
            return self.start(stateful).await;
        }
        Ok(())
    }

    async fn restore_rollback(self: &Arc<Self>, snapshot: &InstanceRecord) -> Result<()> {
        let (_, snap_name) = snapshot
            .snapshot_parts()
            .ok_or_else(|| Error::Internal("restore source is not a snapshot".into()))?;

        info!(instance = %self.name(), snapshot = %snap_name, "restoring rootfs and config");
        self.storage.restore(snap_name).await?;

        // Roll config and devices back, keeping engine-owned keys.
        {
            let mut state = self.lock();
            let volatile: ConfigMap = state
                .record
                .config
                .iter()
                .filter(|(k, _)| config::is_volatile(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            state.record.config = snapshot.config.clone();
            state.record.config.extend(volatile);
            state.record.devices = snapshot.devices.clone();
            state.record.architecture = snapshot.architecture.clone();
            state.expanded_config =
                config::expand_config(&state.record.config, &state.profiles);
            state.expanded_devices =
                config::expand_devices(&state.record.devices, &state.profiles);
        }
        self.persist()?;
        self.release_runtime();
        Ok(())
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// `pre-start` callback from the runtime: applies deferred and start
    /// templates, stamps last-used, and requests a CPU rebalance.
    pub async fn on_start(self: &Arc<Self>) -> Result<()> {
        // Deferred template trigger from create/copy.
        let deferred = self.expanded_config().get(VOLATILE_APPLY_TEMPLATE).cloned();
        if let Some(trigger) = deferred {
            if !trigger.is_empty() {
                crate::template::apply_templates(self, trigger.parse()?).await?;
                let mut changes = ConfigMap::new();
                changes.insert(VOLATILE_APPLY_TEMPLATE.into(), String::new());
                self.volatile_set(changes)?;
            }
        }
        crate::template::apply_templates(self, crate::template::Trigger::Start).await?;

        {
            let mut state = self.lock();
            state.record.last_used_at = Some(chrono::Utc::now());
        }
        self.persist()?;

        if let Some(bus) = self.host.bus() {
            bus.request_rebalance("instance started");
        }
        Ok(())
    }

    /// `stop` callback (`OnStopNS`): the namespaces are still open, so
    /// NICs can be detached back to the host through the netns path.
    pub async fn on_stopns(self: &Arc<Self>, target: &str, netns: &str) -> Result<()> {
        debug!(instance = %self.name(), target, netns, "stop hook (namespace phase)");

        for (name, entry) in self.expanded_devices() {
            let kind = entry.get("type").map(String::as_str).unwrap_or("");
            if kind != "nic" && kind != "infiniband" {
                continue;
            }
            match self.load_device_entry(&name, &entry) {
                Ok(device) => match device.stop(Some(netns)).await {
                    Ok(run) => {
                        if let Err(e) = self.detach_nic(&run, Some(netns)).await {
                            warn!(device = %name, err = %e, "nic detach failed");
                        }
                    }
                    Err(e) if e.is_unsupported_dev_type() => {}
                    Err(e) => warn!(device = %name, err = %e, "device stop failed"),
                },
                Err(e) => debug!(device = %name, err = %e, "skipping invalid device"),
            }
        }
        Ok(())
    }

    /// `post-stop` callback (`OnStop`): tears down the remaining devices,
    /// drops the storage reference, records the power state, and handles
    /// reboot/ephemeral endings.
    pub async fn on_stop(self: &Arc<Self>, target: &str) -> Result<()> {
        info!(instance = %self.name(), target, "container stopped");

        let op = self.host.operations.get(self.id(), "stop").or_else(|| {
            self.host
                .operations
                .get(self.id(), "shutdown")
                .or_else(|| self.host.operations.get(self.id(), "restore"))
        });

        // Tear down every non-network device; networks went away with the
        // namespace phase.
        for (name, entry) in self.expanded_devices() {
            let kind = entry.get("type").map(String::as_str).unwrap_or("");
            if kind == "nic" || kind == "infiniband" {
                continue;
            }
            match self.load_device_entry(&name, &entry) {
                Ok(device) => {
                    if let Err(e) = device.stop(None).await {
                        if !e.is_unsupported_dev_type() {
                            warn!(device = %name, err = %e, "device stop failed");
                        }
                    }
                }
                Err(e) => debug!(device = %name, err = %e, "skipping invalid device"),
            }
        }

        // Leftover materialised nodes.
        let devices_dir = self.devices_dir_path();
        if devices_dir.exists() {
            let _ = std::fs::remove_dir_all(&devices_dir);
        }

        if let Err(e) = self.storage.unmount().await {
            warn!(instance = %self.name(), err = %e, "storage release failed");
        }

        let mut changes = ConfigMap::new();
        changes.insert(VOLATILE_LAST_STATE_POWER.into(), "STOPPED".into());
        self.volatile_set(changes)?;

        self.release_runtime();

        if let Some(bus) = self.host.bus() {
            bus.request_rebalance("instance stopped");
        }

        if let Some(op) = &op {
            self.host.operations.complete(op, Ok(()));
        }

        if target == "reboot" {
            info!(instance = %self.name(), "rebooting");
            return self.start(false).await;
        }

        if self.is_ephemeral() && !self.is_snapshot() {
            // Deletion happens after the hook chain; failures only log.
            let driver = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = driver.delete().await {
                    warn!(instance = %driver.name(), err = %e, "ephemeral auto-delete failed");
                }
            });
        }

        Ok(())
    }

    // =========================================================================
    // Shared Helpers
    // =========================================================================

    pub(super) async fn plan_idmap(&self) -> Result<crate::idmap::IdmapPlan> {
        let config = self.expanded_config();
        let request = IdmapRequest {
            instance: self.name(),
            isolated: config::config_is_true(&config, "security.idmap.isolated"),
            base: config
                .get("security.idmap.base")
                .and_then(|v| v.parse().ok()),
            size: config
                .get("security.idmap.size")
                .and_then(|v| v.parse().ok()),
            raw_idmap: config.get("raw.idmap").cloned().unwrap_or_default(),
        };

        let peers = self.peer_allocations();
        self.host.idmap.plan(&request, &peers).await
    }

    /// Isolated ranges held by every other isolated non-privileged
    /// instance.
    fn peer_allocations(&self) -> Vec<AllocatedRange> {
        let Some(store) = self.host.store() else {
            return Vec::new();
        };
        let own_key = self.scoped_name();

        let mut peers = Vec::new();
        for instance in store.instances() {
            if instance.key() == own_key {
                continue;
            }
            let config = instance.expanded_config();
            if config::config_is_true(&config, "security.privileged") {
                continue;
            }
            if !config::config_is_true(&config, "security.idmap.isolated") {
                continue;
            }
            let base = config
                .get(VOLATILE_IDMAP_BASE)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let size = config
                .get("security.idmap.size")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_IDMAP_SIZE);
            peers.push(AllocatedRange { base, size });
        }
        peers
    }

    pub(super) async fn detach_nic(&self, run: &RunConfig, netns: Option<&str>) -> Result<()> {
        let kv: BTreeMap<&str, &str> = run
            .network_interface
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let (Some(name), Some(host_name)) = (kv.get("name"), kv.get("host_name")) else {
            return Ok(());
        };

        if let Some(runtime) = self.runtime() {
            runtime.detach_interface(name, host_name).await?;
        } else if netns.is_none() {
            debug!(iface = %name, "no runtime handle and no netns, skipping detach");
        }
        Ok(())
    }

}

// =============================================================================
// Root Disk
// =============================================================================

/// Finds the single root disk device in an expanded device map.
pub fn root_disk_device(devices: &Devices) -> Result<(String, ConfigMap)> {
    let mut root = None;
    for (name, entry) in devices {
        if entry.get("type").map(String::as_str) != Some("disk") {
            continue;
        }
        if entry.get("path").map(String::as_str) != Some("/") {
            continue;
        }
        if root.is_some() {
            return Err(Error::Validation(
                "more than one root disk device".into(),
            ));
        }
        root = Some((name.clone(), entry.clone()));
    }
    root.ok_or_else(|| Error::Validation("no root disk device".into()))
}

/// Controller a cgroup key belongs to.
pub(super) fn cgroup_controller(key: &str) -> Result<&'static str> {
    let controller = key.split('.').next().unwrap_or("");
    Ok(match controller {
        "memory" => "memory",
        "cpuset" => "cpuset",
        "cpu" => "cpu",
        "pids" => "pids",
        "freezer" => "freezer",
        "devices" => "devices",
        "net_prio" => "net_prio",
        "blkio" => "blkio",
        _ => {
            return Err(Error::Validation(format!(
                "unknown cgroup key '{key}'"
            )))
        }
    })
}

// =============================================================================
// Device Host Adapter
// =============================================================================

struct DriverDeviceHost {
    driver: Arc<InstanceDriver>,
}

impl DeviceHost for DriverDeviceHost {
    fn instance_name(&self) -> String {
        self.driver.name()
    }

    fn project(&self) -> String {
        self.driver.project()
    }

    fn is_privileged(&self) -> bool {
        self.driver.is_privileged()
    }

    fn devices_dir(&self) -> PathBuf {
        self.driver.devices_dir_path()
    }

    fn idmap(&self) -> Option<IdmapSet> {
        self.driver.current_idmap()
    }

    fn volatile_get(&self, device: &str, key: &str) -> Option<String> {
        self.driver
            .lock()
            .expanded_config
            .get(&format!("volatile.{device}.{key}"))
            .cloned()
    }

    fn volatile_set(&self, device: &str, changes: BTreeMap<String, String>) -> Result<()> {
        let prefixed: ConfigMap = changes
            .into_iter()
            .map(|(k, v)| (format!("volatile.{device}.{k}"), v))
            .collect();
        self.driver.volatile_set(prefixed)
    }
}

// =============================================================================
// Event Bus View
// =============================================================================

/// Event-bus view over a driver. The wrapper keeps an owned `Arc` so
/// hotplug paths can hand device contexts out without a back-reference.
pub struct BusView(pub Arc<InstanceDriver>);

#[async_trait]
impl BusInstance for BusView {
    fn key(&self) -> String {
        self.0.scoped_name()
    }

    async fn is_running(&self) -> bool {
        self.0.is_running().await
    }

    fn expanded_config(&self) -> ConfigMap {
        self.0.expanded_config()
    }

    fn expanded_devices(&self) -> Devices {
        self.0.expanded_devices()
    }

    async fn cgroup_set(&self, key: &str, value: &str) -> Result<()> {
        self.0.cgroup_set_key(key, value).await
    }

    async fn hotplug_usb(
        &self,
        added: bool,
        observed: &ObservedUsb,
        payload: &[u8],
    ) -> Result<()> {
        self.0.hotplug_usb_impl(added, observed, payload).await
    }

    async fn hotplug_device(&self, device: &str, present: bool) -> Result<()> {
        self.0.hotplug_device_impl(device, present).await
    }
}

impl InstanceDriver {
    pub(super) async fn hotplug_usb_impl(
        self: &Arc<Self>,
        added: bool,
        observed: &ObservedUsb,
        payload: &[u8],
    ) -> Result<()> {
        for (name, entry) in self.expanded_devices() {
            if !crate::device::usb_config_matches(&entry, &observed.vendor, &observed.product) {
                continue;
            }

            let ctx = self.device_context(&name);
            let usb = UsbDevice::new(&name, entry.clone(), ctx);
            let run = if added {
                usb.materialise(observed)?
            } else {
                usb.dematerialise(observed)?
            };

            self.apply_live_runconfig(&run, !added).await?;
            info!(
                instance = %self.name(),
                device = %name,
                vendor = %observed.vendor,
                product = %observed.product,
                added,
                "usb hotplug applied"
            );
        }

        // Let in-guest udev observe the event too.
        if let Some(runtime) = self.runtime() {
            runtime.inject_uevent(payload).await?;
        }
        Ok(())
    }

    pub(super) async fn hotplug_device_impl(
        self: &Arc<Self>,
        device_name: &str,
        present: bool,
    ) -> Result<()> {
        let devices = self.expanded_devices();
        let Some(entry) = devices.get(device_name) else {
            return Err(Error::NotFound(format!("device '{device_name}'")));
        };

        let device = self.load_device_entry(device_name, entry)?;
        let (hot_pluggable, _) = device.can_hot_plug();
        if !hot_pluggable {
            return Err(Error::Unsupported(format!(
                "device '{device_name}' cannot be hot-plugged"
            )));
        }

        if present {
            match device.start(true).await {
                Ok(run) => self.apply_live_runconfig(&run, false).await?,
                Err(e) if e.is_unsupported_dev_type() => return Ok(()),
                Err(e) => return Err(e),
            }
            info!(instance = %self.name(), device = %device_name, "hot-plugged device");
        } else {
            let run = device.stop(None).await?;
            self.apply_live_runconfig(&run, true).await?;
            info!(instance = %self.name(), device = %device_name, "hot-unplugged device");
        }
        Ok(())
    }

    /// Applies a RunConfig to a running container: live mounts through
    /// the runtime, cgroup rules through the cgroup writer.
    pub(super) async fn apply_live_runconfig(
        self: &Arc<Self>,
        run: &RunConfig,
        teardown: bool,
    ) -> Result<()> {
        let runtime = self.runtime();

        for mount in &run.mounts {
            let Some(runtime) = &runtime else { break };
            if teardown {
                if let Err(e) = runtime.umount_from(&mount.target).await {
                    warn!(target = %mount.target, err = %e, "live unmount failed");
                }
                if mount.source.starts_with(self.devices_dir_path()) && mount.source.exists() {
                    let _ = std::fs::remove_file(&mount.source);
                }
            } else {
                runtime
                    .mount_into(&mount.source, &mount.target, &mount.fstype, &mount.opts)
                    .await?;
            }
        }

        for rule in &run.cgroup_rules {
            if let Err(e) = self.cgroup_set_key(&rule.key, &rule.value).await {
                if teardown {
                    warn!(key = %rule.key, err = %e, "cgroup teardown rule failed");
                } else {
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}
