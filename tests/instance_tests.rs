//! Tests for the instance driver lifecycle.
//!
//! Drives create/start/stop/update/rename/restore/delete against an
//! in-memory runtime double and a directory storage backend, asserting
//! the state machine, volatile bookkeeping and the on-disk layout.

use async_trait::async_trait;
use silo::cgroup::{CgroupSupport, CgroupWriter};
use silo::config::{ConfigMap, Devices};
use silo::events::BusInstance;
use silo::idmap::{IdmapEntry, IdmapKind, IdmapPlanner, IdmapSet};
use silo::instance::{BusView, Host, InstanceRecord, UpdateArgs};
use silo::runtime::{RuntimeHandle, RuntimeState};
use silo::{DirStorage, Error, InstanceDriver, InstanceState, Result, RuntimeFactory};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Doubles
// =============================================================================

/// In-memory cgroup hierarchy recording every write.
struct MemCgroup {
    values: Mutex<HashMap<(String, String), String>>,
    writes: Mutex<Vec<(String, String)>>,
}

impl MemCgroup {
    fn new() -> Arc<Self> {
        Arc::new(MemCgroup {
            values: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
        })
    }

    fn seed(&self, path: &str, key: &str, value: &str) {
        self.values
            .lock()
            .unwrap()
            .insert((path.to_string(), key.to_string()), value.to_string());
    }

    fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CgroupWriter for MemCgroup {
    async fn get(&self, _controller: &str, path: &str, key: &str) -> Result<String> {
        self.values
            .lock()
            .unwrap()
            .get(&(path.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{path}/{key}")))
    }

    async fn set(&self, _controller: &str, path: &str, key: &str, value: &str) -> Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        self.values
            .lock()
            .unwrap()
            .insert((path.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

/// Runtime double flipping states on request.
struct MockRuntime {
    state: Mutex<RuntimeState>,
    config: Mutex<Vec<(String, String)>>,
    config_dir: PathBuf,
    live_mounts: Mutex<Vec<String>>,
    injected_uevents: Mutex<Vec<Vec<u8>>>,
}

impl MockRuntime {
    fn new(config_dir: PathBuf) -> Arc<Self> {
        Arc::new(MockRuntime {
            state: Mutex::new(RuntimeState::Stopped),
            config: Mutex::new(Vec::new()),
            config_dir,
            live_mounts: Mutex::new(Vec::new()),
            injected_uevents: Mutex::new(Vec::new()),
        })
    }

    fn set_state(&self, state: RuntimeState) {
        *self.state.lock().unwrap() = state;
    }

    fn config_items(&self) -> Vec<(String, String)> {
        self.config.lock().unwrap().clone()
    }

    fn live_mounts(&self) -> Vec<String> {
        self.live_mounts.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuntimeHandle for MockRuntime {
    async fn set_config_item(&self, key: &str, value: &str) -> Result<()> {
        self.config
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn clear_config(&self) -> Result<()> {
        self.config.lock().unwrap().clear();
        Ok(())
    }

    async fn render_config(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.config_dir)?;
        let path = self.config_dir.join("lxc.conf");
        let rendered: String = self
            .config
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| format!("{k} = {v}\n"))
            .collect();
        std::fs::write(&path, rendered)?;
        Ok(path)
    }

    async fn start(&self, _config_path: &Path) -> Result<()> {
        self.set_state(RuntimeState::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.set_state(RuntimeState::Stopped);
        Ok(())
    }

    async fn shutdown(&self, _timeout: Duration) -> Result<()> {
        self.set_state(RuntimeState::Stopped);
        Ok(())
    }

    async fn freeze(&self) -> Result<()> {
        self.set_state(RuntimeState::Frozen);
        Ok(())
    }

    async fn unfreeze(&self) -> Result<()> {
        self.set_state(RuntimeState::Running);
        Ok(())
    }

    async fn attach_interface(&self, _host_name: &str, _guest_name: &str) -> Result<()> {
        Ok(())
    }

    async fn detach_interface(&self, _guest_name: &str, _host_name: &str) -> Result<()> {
        Ok(())
    }

    async fn state(&self) -> Result<RuntimeState> {
        Ok(*self.state.lock().unwrap())
    }

    async fn init_pid(&self) -> Result<Option<i32>> {
        Ok(match *self.state.lock().unwrap() {
            RuntimeState::Running | RuntimeState::Frozen => Some(4242),
            _ => None,
        })
    }

    async fn inject_uevent(&self, payload: &[u8]) -> Result<()> {
        self.injected_uevents.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    async fn checkpoint(&self, state_dir: &Path, stop: bool) -> Result<()> {
        std::fs::create_dir_all(state_dir)?;
        std::fs::write(state_dir.join("dump.img"), b"state")?;
        if stop {
            self.set_state(RuntimeState::Stopped);
        }
        Ok(())
    }

    async fn restore_checkpoint(&self, _state_dir: &Path, _config_path: &Path) -> Result<()> {
        self.set_state(RuntimeState::Running);
        Ok(())
    }

    async fn mount_into(
        &self,
        _source: &Path,
        target: &str,
        _fstype: &str,
        _opts: &[String],
    ) -> Result<()> {
        self.live_mounts.lock().unwrap().push(target.to_string());
        Ok(())
    }

    async fn umount_from(&self, target: &str) -> Result<()> {
        self.live_mounts.lock().unwrap().retain(|t| t != target);
        Ok(())
    }
}

/// Factory handing out one shared mock per scoped name.
struct MockFactory {
    dir: PathBuf,
    runtimes: Mutex<HashMap<String, Arc<MockRuntime>>>,
}

impl MockFactory {
    fn new(dir: PathBuf) -> Arc<Self> {
        Arc::new(MockFactory {
            dir,
            runtimes: Mutex::new(HashMap::new()),
        })
    }

    fn runtime(&self, scoped: &str) -> Option<Arc<MockRuntime>> {
        self.runtimes.lock().unwrap().get(scoped).cloned()
    }
}

impl RuntimeFactory for MockFactory {
    fn create(&self, scoped_name: &str, _log_dir: &Path) -> Result<Arc<dyn RuntimeHandle>> {
        let mut runtimes = self.runtimes.lock().unwrap();
        let runtime = runtimes
            .entry(scoped_name.to_string())
            .or_insert_with(|| MockRuntime::new(self.dir.join(scoped_name)))
            .clone();
        Ok(runtime)
    }
}

// =============================================================================
// Fixture
// =============================================================================

struct Fixture {
    _temp: TempDir,
    host: Arc<Host>,
    cgroup: Arc<MemCgroup>,
    factory: Arc<MockFactory>,
    pool_dir: PathBuf,
}

fn host_map() -> IdmapSet {
    IdmapSet {
        entries: vec![
            IdmapEntry {
                kind: IdmapKind::Uid,
                host_base: 100_000,
                ns_base: 0,
                range: 1_000_000,
            },
            IdmapEntry {
                kind: IdmapKind::Gid,
                host_base: 100_000,
                ns_base: 0,
                range: 1_000_000,
            },
        ],
    }
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let cgroup = MemCgroup::new();
    let factory = MockFactory::new(temp.path().join("runtimes"));

    let support = CgroupSupport {
        cpuset: true,
        memory: true,
        memsw: true,
        pids: false,
        freezer: true,
        devices: true,
        net_prio: true,
        blkio: true,
    };

    let host = Host::new(
        temp.path().join("var"),
        Arc::clone(&cgroup) as Arc<dyn CgroupWriter>,
        support,
        Arc::new(IdmapPlanner::new(host_map())),
        Arc::clone(&factory) as Arc<dyn RuntimeFactory>,
    );

    let pool_dir = temp.path().join("pool");
    std::fs::create_dir_all(&pool_dir).unwrap();

    Fixture {
        _temp: temp,
        host,
        cgroup,
        factory,
        pool_dir,
    }
}

fn base_devices() -> Devices {
    let mut devices = Devices::new();
    let mut root = ConfigMap::new();
    root.insert("type".into(), "disk".into());
    root.insert("path".into(), "/".into());
    root.insert("pool".into(), "p0".into());
    devices.insert("root".into(), root);
    devices
}

fn record(id: i64, name: &str, config: &[(&str, &str)], devices: Devices) -> InstanceRecord {
    InstanceRecord {
        id,
        project: "default".into(),
        name: name.into(),
        architecture: "x86_64".into(),
        description: String::new(),
        created_at: chrono::Utc::now(),
        last_used_at: None,
        expires_at: None,
        ephemeral: false,
        stateful: false,
        is_snapshot: false,
        profiles: vec![],
        config: config
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        devices,
    }
}

async fn create(fx: &Fixture, rec: InstanceRecord) -> Arc<InstanceDriver> {
    let storage = Arc::new(DirStorage::new("p0", &fx.pool_dir, &rec.scoped_name()));
    InstanceDriver::create(Arc::clone(&fx.host), rec, vec![], storage)
        .await
        .unwrap()
}

// =============================================================================
// Create Tests
// =============================================================================

#[tokio::test]
async fn test_create_allocates_idmap_for_unprivileged() {
    let fx = fixture();
    let driver = create(&fx, record(1, "c1", &[], base_devices())).await;

    let config = driver.expanded_config();
    assert!(config.contains_key("volatile.idmap.next"));
    assert!(config.contains_key("volatile.idmap.base"));
    // The record survives a reload from disk.
    assert!(fx.host.record_path("default_c1").exists());
}

#[tokio::test]
async fn test_create_reserves_nic_mac() {
    let fx = fixture();
    let mut devices = base_devices();
    let mut eth0 = ConfigMap::new();
    eth0.insert("type".into(), "nic".into());
    eth0.insert("nictype".into(), "bridged".into());
    eth0.insert("parent".into(), "silobr0".into());
    devices.insert("eth0".into(), eth0);

    let driver = create(&fx, record(1, "c1", &[], devices)).await;
    let config = driver.expanded_config();
    assert!(config["volatile.eth0.hwaddr"].starts_with("00:16:3e:"));
    assert!(config.contains_key("volatile.eth0.host_name"));
}

#[tokio::test]
async fn test_load_rejects_multiple_root_disks() {
    let fx = fixture();
    let mut devices = base_devices();
    let mut second = ConfigMap::new();
    second.insert("type".into(), "disk".into());
    second.insert("path".into(), "/".into());
    second.insert("pool".into(), "p1".into());
    devices.insert("root2".into(), second);

    let storage = Arc::new(DirStorage::new("p0", &fx.pool_dir, "default_bad"));
    let result = InstanceDriver::load(
        Arc::clone(&fx.host),
        record(9, "bad", &[], devices),
        vec![],
        storage,
    );
    assert!(result.is_err());
}

// =============================================================================
// Start / Stop Tests
// =============================================================================

#[tokio::test]
async fn test_start_stop_lifecycle() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "c1", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    assert_eq!(driver.state().await, InstanceState::Stopped);
    driver.start(false).await.unwrap();
    assert_eq!(driver.state().await, InstanceState::Running);

    // The runtime got a rendered configuration.
    let runtime = fx.factory.runtime("default_c1").unwrap();
    let items = runtime.config_items();
    assert!(items.iter().any(|(k, _)| k == "lxc.uts.name"));
    assert!(items.iter().any(|(k, v)| k == "lxc.arch" && v == "linux64"));
    assert!(items
        .iter()
        .any(|(k, v)| k == "lxc.cgroup.devices.deny" && v == "a"));

    // The backup manifest landed next to the rootfs, read-only.
    let backup = driver.storage().path().join("backup.yaml");
    assert!(backup.exists());

    driver.stop(false).await.unwrap();
    assert_eq!(driver.state().await, InstanceState::Stopped);

    // Power state was recorded.
    assert_eq!(
        driver.expanded_config().get("volatile.last_state.power").unwrap(),
        "STOPPED"
    );
}

#[tokio::test]
async fn test_start_snapshot_is_rejected() {
    let fx = fixture();
    let mut rec = record(1, "c1/snap0", &[], base_devices());
    rec.is_snapshot = true;

    let storage = Arc::new(DirStorage::new("p0", &fx.pool_dir, "default_c1-snap0"));
    let driver =
        InstanceDriver::load(Arc::clone(&fx.host), rec, vec![], storage).unwrap();
    assert!(driver.start(false).await.is_err());
}

#[tokio::test]
async fn test_concurrent_operation_is_busy() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "c1", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    let _op = fx
        .host
        .operations
        .create(driver.id(), "c1", "update", false, false)
        .unwrap();

    assert!(matches!(
        driver.start(false).await,
        Err(Error::Busy { .. })
    ));
}

#[tokio::test]
async fn test_shutdown_completes_gracefully() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "c1", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    driver.start(false).await.unwrap();
    driver.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(driver.state().await, InstanceState::Stopped);
}

#[tokio::test]
async fn test_freeze_unfreeze_round_trip() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "c1", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    driver.start(false).await.unwrap();
    driver.freeze().await.unwrap();
    assert_eq!(driver.state().await, InstanceState::Frozen);

    // Freezing twice is an invalid transition.
    assert!(driver.freeze().await.is_err());

    driver.unfreeze().await.unwrap();
    assert_eq!(driver.state().await, InstanceState::Running);
}

#[tokio::test]
async fn test_ephemeral_deletes_after_stop() {
    let fx = fixture();
    let mut rec = record(1, "eph", &[("security.privileged", "true")], base_devices());
    rec.ephemeral = true;
    let driver = create(&fx, rec).await;

    driver.start(false).await.unwrap();
    driver.stop(false).await.unwrap();

    // Deletion is asynchronous after the hook chain.
    let record_path = fx.host.record_path("default_eph");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while record_path.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "ephemeral instance was not deleted"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// Stateful Tests
// =============================================================================

#[tokio::test]
async fn test_stateful_stop_then_start() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "st", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    driver.start(false).await.unwrap();
    driver.stop(true).await.unwrap();
    assert!(driver.is_stateful());
    assert!(driver.state_path().join("dump.img").exists());

    driver.start(true).await.unwrap();
    assert_eq!(driver.state().await, InstanceState::Running);
    assert!(!driver.is_stateful());
    assert!(!driver.state_path().exists());
}

#[tokio::test]
async fn test_stateless_start_discards_leftover_state() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "st", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    driver.start(false).await.unwrap();
    driver.stop(true).await.unwrap();

    driver.start(false).await.unwrap();
    assert!(!driver.is_stateful());
    assert!(!driver.state_path().exists());
}

#[tokio::test]
async fn test_stateful_start_without_state_fails() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "st", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    assert!(driver.start(true).await.is_err());
}

// =============================================================================
// Delete Tests
// =============================================================================

#[tokio::test]
async fn test_delete_removes_storage_and_record() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "c1", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    let volume_path = driver.storage().path();
    driver.start(false).await.unwrap();
    driver.stop(false).await.unwrap();
    driver.delete().await.unwrap();

    assert!(!volume_path.exists());
    assert!(!fx.host.record_path("default_c1").exists());
}

#[tokio::test]
async fn test_protection_flag_blocks_delete() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(
            1,
            "c1",
            &[("security.protection.delete", "true")],
            base_devices(),
        ),
    )
    .await;

    let err = driver.delete().await.unwrap_err();
    assert!(matches!(err, Error::Protected { .. }));
    // Nothing on disk was touched.
    assert!(fx.host.record_path("default_c1").exists());
}

#[tokio::test]
async fn test_delete_running_instance_fails() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "c1", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    driver.start(false).await.unwrap();
    assert!(matches!(
        driver.delete().await,
        Err(Error::InvalidState { .. })
    ));
}

// =============================================================================
// Rename Tests
// =============================================================================

#[tokio::test]
async fn test_rename_stopped_instance() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "old", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    // Materialise the volume so the rename has something to move.
    driver.storage().mount().await.unwrap();
    driver.storage().unmount().await.unwrap();

    driver.rename("new").await.unwrap();
    assert_eq!(driver.name(), "new");
    assert!(fx.host.record_path("default_new").exists());
    assert!(!fx.host.record_path("default_old").exists());
    assert!(fx.pool_dir.join("default_new").exists());
}

#[tokio::test]
async fn test_rename_running_instance_fails() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "c1", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    driver.start(false).await.unwrap();
    assert!(driver.rename("c2").await.is_err());
}

// =============================================================================
// Snapshot / Restore Tests
// =============================================================================

#[tokio::test]
async fn test_restore_rolls_back_rootfs_and_config() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "c1", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    // Materialise the rootfs and drop a marker into it.
    driver.storage().mount().await.unwrap();
    let marker = driver.storage().rootfs_path().join("marker");
    std::fs::write(&marker, "v1").unwrap();
    driver.snapshot("s1").await.unwrap();

    // Mutate rootfs and config.
    std::fs::write(&marker, "v2").unwrap();
    let mut new_config = driver.record().config;
    new_config.insert("user.note".into(), "added-later".into());
    driver
        .update(
            UpdateArgs {
                config: Some(new_config),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap();

    driver.restore("s1", false).await.unwrap();

    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "v1");
    assert!(!driver.expanded_config().contains_key("user.note"));
}

#[tokio::test]
async fn test_restore_unknown_snapshot() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "c1", &[("security.privileged", "true")], base_devices()),
    )
    .await;
    assert!(matches!(
        driver.restore("nope", false).await,
        Err(Error::NotFound(_))
    ));
}

// =============================================================================
// Update Tests
// =============================================================================

fn updated_config(driver: &Arc<InstanceDriver>, pairs: &[(&str, &str)]) -> ConfigMap {
    let mut config = driver.record().config;
    for (k, v) in pairs {
        config.insert(k.to_string(), v.to_string());
    }
    config
}

#[tokio::test]
async fn test_update_rejects_volatile_changes_from_users() {
    let fx = fixture();
    let driver = create(&fx, record(1, "c1", &[], base_devices())).await;

    let config = updated_config(&driver, &[("volatile.idmap.base", "999999")]);
    let err = driver
        .update(
            UpdateArgs {
                config: Some(config),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::VolatileKey(_)));
}

#[tokio::test]
async fn test_update_allows_engine_volatile_changes() {
    let fx = fixture();
    let driver = create(&fx, record(1, "c1", &[], base_devices())).await;

    let config = updated_config(&driver, &[("volatile.idmap.base", "999999")]);
    driver
        .update(
            UpdateArgs {
                config: Some(config),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_update_refuses_root_pool_change() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "c1", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    let mut devices = driver.record().devices;
    devices.get_mut("root").unwrap().insert("pool".into(), "other".into());

    let err = driver
        .update(
            UpdateArgs {
                devices: Some(devices),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("pool"));
}

#[tokio::test]
async fn test_memory_limit_live_update_transitions_through_unlimited() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(
            1,
            "mem1",
            &[("security.privileged", "true"), ("limits.memory", "512MB")],
            base_devices(),
        ),
    )
    .await;

    driver.start(false).await.unwrap();

    // Seed the cgroup values a running container would have.
    let path = driver.cgroup_path();
    fx.cgroup.seed(&path, "memory.limit_in_bytes", "512000000");
    fx.cgroup.seed(&path, "memory.memsw.limit_in_bytes", "512000000");
    fx.cgroup.seed(&path, "memory.soft_limit_in_bytes", "460800000");

    let config = updated_config(&driver, &[("limits.memory", "1GB")]);
    driver
        .update(
            UpdateArgs {
                config: Some(config),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap();

    let memory_writes: Vec<(String, String)> = fx
        .cgroup
        .writes()
        .into_iter()
        .filter(|(k, _)| k.starts_with("memory."))
        .collect();

    let keys: Vec<&str> = memory_writes.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(
        keys,
        vec![
            "memory.memsw.limit_in_bytes",
            "memory.limit_in_bytes",
            "memory.soft_limit_in_bytes",
            "memory.limit_in_bytes",
            "memory.memsw.limit_in_bytes",
            "memory.soft_limit_in_bytes",
        ]
    );
    assert!(memory_writes[..3].iter().all(|(_, v)| v == "-1"));
    assert_eq!(memory_writes[3].1, "1000000000");
    assert_eq!(memory_writes[5].1, "900000000");
}

#[tokio::test]
async fn test_update_drops_orphan_volatile_keys() {
    let fx = fixture();
    let mut devices = base_devices();
    let mut eth0 = ConfigMap::new();
    eth0.insert("type".into(), "nic".into());
    eth0.insert("nictype".into(), "bridged".into());
    eth0.insert("parent".into(), "silobr0".into());
    devices.insert("eth0".into(), eth0);

    let driver = create(
        &fx,
        record(1, "c1", &[("security.privileged", "true")], devices),
    )
    .await;
    assert!(driver
        .expanded_config()
        .contains_key("volatile.eth0.hwaddr"));

    // Drop the NIC while stopped.
    driver
        .update(
            UpdateArgs {
                devices: Some(base_devices()),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();

    let config = driver.expanded_config();
    assert!(!config.contains_key("volatile.eth0.hwaddr"));
    assert!(!config.contains_key("volatile.eth0.host_name"));
    // Engine namespaces survive the orphan sweep.
    assert!(config.contains_key("volatile.apply_template"));
}

#[tokio::test]
async fn test_failed_update_reverts_in_memory_state() {
    let fx = fixture();
    let driver = create(
        &fx,
        record(1, "c1", &[("security.privileged", "true")], base_devices()),
    )
    .await;

    // Two root disks make re-validation fail after apply.
    let mut devices = driver.record().devices;
    let mut second = ConfigMap::new();
    second.insert("type".into(), "disk".into());
    second.insert("path".into(), "/".into());
    second.insert("pool".into(), "p0".into());
    devices.insert("root2".into(), second);

    let before = driver.expanded_devices();
    assert!(driver
        .update(
            UpdateArgs {
                devices: Some(devices),
                ..Default::default()
            },
            true,
        )
        .await
        .is_err());
    assert_eq!(driver.expanded_devices(), before);
}

// =============================================================================
// Hotplug Tests
// =============================================================================

#[tokio::test]
async fn test_optional_disk_hotplug_after_source_appears() {
    let fx = fixture();
    let late_source = fx.pool_dir.join("late-share");

    let mut devices = base_devices();
    let mut late = ConfigMap::new();
    late.insert("type".into(), "disk".into());
    late.insert("path".into(), "/data".into());
    late.insert("source".into(), late_source.display().to_string());
    late.insert("optional".into(), "true".into());
    devices.insert("late".into(), late);

    let driver = create(
        &fx,
        record(1, "v", &[("security.privileged", "true")], devices),
    )
    .await;

    // Start succeeds with the source absent and no mount configured.
    driver.start(false).await.unwrap();
    let runtime = fx.factory.runtime("default_v").unwrap();
    assert!(!runtime
        .config_items()
        .iter()
        .any(|(k, v)| k == "lxc.mount.entry" && v.contains("late-share")));

    // The source appears; the event bus path inserts the disk live.
    std::fs::create_dir(&late_source).unwrap();
    let view = BusView(Arc::clone(&driver));
    view.hotplug_device("late", true).await.unwrap();
    assert_eq!(runtime.live_mounts(), vec!["/data".to_string()]);

    // And removes it again when the source goes away.
    view.hotplug_device("late", false).await.unwrap();
    assert!(runtime.live_mounts().is_empty());
}

#[tokio::test]
async fn test_usb_hotplug_inserts_node_and_injects_uevent() {
    let fx = fixture();
    let mut devices = base_devices();
    let mut usb = ConfigMap::new();
    usb.insert("type".into(), "usb".into());
    usb.insert("vendorid".into(), "f0f0".into());
    usb.insert("productid".into(), "0f0f".into());
    usb.insert("required".into(), "false".into());
    devices.insert("stick".into(), usb);

    let driver = create(
        &fx,
        record(1, "u", &[("security.privileged", "true")], devices),
    )
    .await;
    driver.start(false).await.unwrap();

    // A matching device appears. Node creation needs mknod, which the
    // devices.allow write does not; only run the full path when root.
    if !nix::unistd::Uid::effective().is_root() {
        return;
    }

    let observed = silo::device::ObservedUsb::from_bus_address("f0f0", "0f0f", 1, 7);
    let payload = b"add@/devices/usb1\0ACTION=add\0SUBSYSTEM=usb".to_vec();

    let view = BusView(Arc::clone(&driver));
    view.hotplug_usb(true, &observed, &payload).await.unwrap();

    let runtime = fx.factory.runtime("default_u").unwrap();
    assert_eq!(runtime.live_mounts(), vec!["/dev/bus/usb/001/007".to_string()]);
    assert_eq!(runtime.injected_uevents.lock().unwrap().len(), 1);

    // The cgroup allow rule was recorded.
    assert!(fx
        .cgroup
        .writes()
        .iter()
        .any(|(k, v)| k == "devices.allow" && v == "c 189:6 rwm"));

    view.hotplug_usb(false, &observed, &payload).await.unwrap();
    assert!(runtime.live_mounts().is_empty());
}
