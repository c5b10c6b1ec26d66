//! On-disk backup manifest.
//!
//! `backup.yaml` sits next to the rootfs and describes everything needed
//! to re-import the instance without the daemon's database: the instance
//! record, its snapshots, the pool and the volume.

use crate::constants::{BACKUP_FILE, BACKUP_FILE_MODE};
use crate::error::Result;
use crate::instance::{InstanceDriver, InstanceRecord};
use crate::storage::{PoolRecord, VolumeRecord};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// The rendered manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub container: InstanceRecord,
    #[serde(default)]
    pub snapshots: Vec<InstanceRecord>,
    pub pool: PoolRecord,
    pub volume: VolumeRecord,
}

/// Writes the manifest into the container path, mode 0400.
///
/// Skipped for snapshots and when the container path or rootfs is not
/// currently mounted: the manifest belongs next to the data it describes.
pub async fn write_backup_file(driver: &Arc<InstanceDriver>) -> Result<()> {
    if driver.is_snapshot() {
        return Ok(());
    }

    let storage = driver.storage();
    if !storage.is_mounted() || !storage.rootfs_path().exists() {
        debug!(instance = %driver.name(), "storage not mounted, skipping backup manifest");
        return Ok(());
    }

    let manifest = BackupManifest {
        container: driver.record(),
        snapshots: driver.snapshots(),
        pool: storage.pool(),
        volume: storage.volume(),
    };

    let rendered = serde_yaml::to_string(&manifest)?;
    write_manifest(&storage.path(), &rendered)?;
    debug!(instance = %driver.name(), "wrote backup manifest");
    Ok(())
}

fn write_manifest(container_path: &Path, rendered: &str) -> Result<()> {
    let path = container_path.join(BACKUP_FILE);
    let tmp = container_path.join(format!("{BACKUP_FILE}.tmp"));

    // The previous manifest is read-only; drop it before replacing.
    if path.exists() {
        std::fs::remove_file(&path)?;
    }

    std::fs::write(&tmp, rendered)?;
    std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(BACKUP_FILE_MODE))?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Reads a manifest back, for re-import tooling.
pub fn read_backup_file(container_path: &Path) -> Result<BackupManifest> {
    let raw = std::fs::read_to_string(container_path.join(BACKUP_FILE))?;
    Ok(serde_yaml::from_str(&raw)?)
}
