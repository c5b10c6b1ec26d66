//! Tests for the backup manifest writer.
//!
//! Validates content, file mode, the skip conditions, and the read-back
//! path.

use silo::backup::{read_backup_file, write_backup_file};
use silo::cgroup::{CgroupSupport, CgroupWriter};
use silo::config::{ConfigMap, Devices};
use silo::idmap::{IdmapPlanner, IdmapSet};
use silo::instance::{Host, InstanceRecord};
use silo::runtime::RuntimeHandle;
use silo::{DirStorage, InstanceDriver, Result, RuntimeFactory};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

// =============================================================================
// Fixture
// =============================================================================

struct NullCgroup;

#[async_trait::async_trait]
impl CgroupWriter for NullCgroup {
    async fn get(&self, _c: &str, _p: &str, key: &str) -> Result<String> {
        Err(silo::Error::NotFound(key.to_string()))
    }

    async fn set(&self, _c: &str, _p: &str, _k: &str, _v: &str) -> Result<()> {
        Ok(())
    }
}

struct NullFactory;

impl RuntimeFactory for NullFactory {
    fn create(&self, _scoped_name: &str, _log_dir: &Path) -> Result<Arc<dyn RuntimeHandle>> {
        Err(silo::Error::Unsupported("no runtime in this test".into()))
    }
}

fn record(name: &str) -> InstanceRecord {
    let mut devices = Devices::new();
    let mut root = ConfigMap::new();
    root.insert("type".into(), "disk".into());
    root.insert("path".into(), "/".into());
    root.insert("pool".into(), "p0".into());
    devices.insert("root".into(), root);

    InstanceRecord {
        id: 1,
        project: "default".into(),
        name: name.into(),
        architecture: "x86_64".into(),
        description: "test container".into(),
        created_at: chrono::Utc::now(),
        last_used_at: None,
        expires_at: None,
        ephemeral: false,
        stateful: false,
        is_snapshot: false,
        profiles: vec![],
        config: ConfigMap::new(),
        devices,
    }
}

fn driver(temp: &TempDir, name: &str) -> Arc<InstanceDriver> {
    let host = Host::new(
        temp.path().join("var"),
        Arc::new(NullCgroup),
        CgroupSupport::default(),
        Arc::new(IdmapPlanner::new(IdmapSet::isolated(100_000, 1_000_000))),
        Arc::new(NullFactory),
    );
    let storage = Arc::new(DirStorage::new(
        "p0",
        temp.path().join("pool"),
        &format!("default_{name}"),
    ));
    InstanceDriver::load(host, record(name), vec![], storage).unwrap()
}

// =============================================================================
// Writer Tests
// =============================================================================

#[tokio::test]
async fn test_backup_file_written_read_only() {
    let temp = TempDir::new().unwrap();
    let driver = driver(&temp, "c1");

    driver.storage().mount().await.unwrap();
    write_backup_file(&driver).await.unwrap();

    let path = driver.storage().path().join("backup.yaml");
    assert!(path.exists());
    let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o400);
}

#[tokio::test]
async fn test_backup_file_round_trips() {
    let temp = TempDir::new().unwrap();
    let driver = driver(&temp, "c1");

    driver.storage().mount().await.unwrap();
    driver.snapshot("s1").await.unwrap();
    write_backup_file(&driver).await.unwrap();

    let manifest = read_backup_file(&driver.storage().path()).unwrap();
    assert_eq!(manifest.container.name, "c1");
    assert_eq!(manifest.container.description, "test container");
    assert_eq!(manifest.snapshots.len(), 1);
    assert_eq!(manifest.snapshots[0].name, "c1/s1");
    assert!(manifest.snapshots[0].is_snapshot);
    assert_eq!(manifest.pool.name, "p0");
    assert_eq!(manifest.pool.driver, "dir");
    assert_eq!(manifest.volume.name, "default_c1");
}

#[tokio::test]
async fn test_backup_skipped_when_unmounted() {
    let temp = TempDir::new().unwrap();
    let driver = driver(&temp, "c1");

    // Never mounted: the writer declines without error.
    write_backup_file(&driver).await.unwrap();
    assert!(!driver.storage().path().join("backup.yaml").exists());
}

#[tokio::test]
async fn test_backup_overwrites_previous_manifest() {
    let temp = TempDir::new().unwrap();
    let driver = driver(&temp, "c1");

    driver.storage().mount().await.unwrap();
    write_backup_file(&driver).await.unwrap();
    // A second write must cope with the read-only previous file.
    write_backup_file(&driver).await.unwrap();
}
