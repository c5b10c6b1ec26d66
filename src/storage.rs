//! Storage pool contract.
//!
//! The engine consumes pool drivers through this narrow interface. Mounts
//! are reference-counted per handle: concurrent operations on the same
//! instance can each request a mount, and only the last release unmounts.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Pool record rendered into the backup manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub config: std::collections::BTreeMap<String, String>,
}

/// Volume record rendered into the backup manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    pub pool: String,
    #[serde(rename = "type")]
    pub volume_type: String,
    #[serde(default)]
    pub config: std::collections::BTreeMap<String, String>,
}

/// Narrow contract to a pool driver for one instance volume.
#[async_trait]
pub trait StorageHandle: Send + Sync {
    /// Pool this volume lives on.
    fn pool(&self) -> PoolRecord;

    /// The instance volume record.
    fn volume(&self) -> VolumeRecord;

    /// Container path (holds rootfs/, templates/, backup.yaml, ...).
    fn path(&self) -> PathBuf;

    /// Root filesystem path inside the container path.
    fn rootfs_path(&self) -> PathBuf {
        self.path().join("rootfs")
    }

    /// Mounts the volume. Returns true when this call performed the mount
    /// (refcount 0 → 1), false when it was already mounted.
    async fn mount(&self) -> Result<bool>;

    /// Releases one mount reference. Returns true when the volume was
    /// actually unmounted.
    async fn unmount(&self) -> Result<bool>;

    /// True while at least one mount reference is held.
    fn is_mounted(&self) -> bool;

    /// Creates a named snapshot of the volume.
    async fn snapshot(&self, name: &str) -> Result<()>;

    /// Rolls the volume back to a named snapshot.
    async fn restore(&self, name: &str) -> Result<()>;

    /// Applies a size quota to the volume.
    async fn set_quota(&self, bytes: u64) -> Result<()>;

    /// True when the backend can only apply a quota change while the
    /// instance is stopped (the driver then defers via
    /// `volatile.apply_quota`).
    fn quota_requires_stopped(&self) -> bool {
        false
    }

    /// Renames the volume and its on-disk paths.
    async fn rename(&self, new_name: &str) -> Result<()>;

    /// Deletes the volume and all its snapshots.
    async fn delete(&self) -> Result<()>;

    /// True when the backend mounts through an identity-shifting
    /// filesystem, making on-disk ownership shifts unnecessary.
    fn identity_shift_supported(&self) -> bool {
        false
    }

    /// Copy-on-write backends override this to toggle read-only
    /// subvolumes around an ownership shift. Default: nothing to do.
    async fn set_subvolumes_writable(&self, _writable: bool) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Directory-Backed Implementation
// =============================================================================

/// Plain-directory storage: the volume is a directory tree, mount is a
/// no-op tracked only for refcounting, snapshots are directory copies.
///
/// This is the `dir` pool driver equivalent and the backend the tests run
/// against.
pub struct DirStorage {
    pool: PoolRecord,
    volume_name: std::sync::Mutex<String>,
    base: PathBuf,
    mounts: AtomicUsize,
}

impl DirStorage {
    pub fn new(pool_name: &str, base: impl Into<PathBuf>, volume_name: &str) -> Self {
        DirStorage {
            pool: PoolRecord {
                name: pool_name.to_string(),
                driver: "dir".to_string(),
                config: Default::default(),
            },
            volume_name: std::sync::Mutex::new(volume_name.to_string()),
            base: base.into(),
            mounts: AtomicUsize::new(0),
        }
    }

    fn volume_name(&self) -> String {
        self.volume_name.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn volume_path(&self) -> PathBuf {
        self.base.join(self.volume_name())
    }

    fn snapshots_path(&self) -> PathBuf {
        self.base
            .join(format!("{}-snapshots", self.volume_name()))
    }

    fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
        std::fs::create_dir_all(dst)?;
        for dirent in std::fs::read_dir(src)? {
            let dirent = dirent?;
            let target = dst.join(dirent.file_name());
            let meta = dirent.metadata()?;
            if meta.is_dir() {
                Self::copy_tree(&dirent.path(), &target)?;
            } else if meta.is_file() {
                std::fs::copy(dirent.path(), &target)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageHandle for DirStorage {
    fn pool(&self) -> PoolRecord {
        self.pool.clone()
    }

    fn volume(&self) -> VolumeRecord {
        VolumeRecord {
            name: self.volume_name(),
            pool: self.pool.name.clone(),
            volume_type: "container".to_string(),
            config: Default::default(),
        }
    }

    fn path(&self) -> PathBuf {
        self.volume_path()
    }

    async fn mount(&self) -> Result<bool> {
        let path = self.volume_path();
        tokio::fs::create_dir_all(path.join("rootfs")).await?;
        let previous = self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(previous == 0)
    }

    async fn unmount(&self) -> Result<bool> {
        let previous = self.mounts.fetch_sub(1, Ordering::SeqCst);
        if previous == 0 {
            self.mounts.store(0, Ordering::SeqCst);
            return Err(Error::Internal("unbalanced storage unmount".into()));
        }
        Ok(previous == 1)
    }

    fn is_mounted(&self) -> bool {
        self.mounts.load(Ordering::SeqCst) > 0
    }

    async fn snapshot(&self, name: &str) -> Result<()> {
        let src = self.volume_path();
        let dst = self.snapshots_path().join(name);
        debug!(snapshot = %name, "creating dir snapshot");
        tokio::task::spawn_blocking(move || Self::copy_tree(&src, &dst))
            .await
            .map_err(|e| Error::Internal(format!("snapshot task failed: {e}")))?
    }

    async fn restore(&self, name: &str) -> Result<()> {
        let snap = self.snapshots_path().join(name);
        if !snap.is_dir() {
            return Err(Error::NotFound(format!("snapshot '{name}'")));
        }
        let dst = self.volume_path();
        tokio::task::spawn_blocking(move || {
            std::fs::remove_dir_all(&dst)?;
            Self::copy_tree(&snap, &dst)
        })
        .await
        .map_err(|e| Error::Internal(format!("restore task failed: {e}")))?
    }

    async fn set_quota(&self, _bytes: u64) -> Result<()> {
        // The dir backend has no quota support; accepted and ignored,
        // matching its upstream behavior of not enforcing size limits.
        Ok(())
    }

    async fn rename(&self, new_name: &str) -> Result<()> {
        let old_path = self.volume_path();
        let old_snaps = self.snapshots_path();

        {
            let mut name = self.volume_name.lock().unwrap_or_else(|p| p.into_inner());
            *name = new_name.to_string();
        }

        let new_path = self.volume_path();
        let new_snaps = self.snapshots_path();

        if old_path.exists() {
            tokio::fs::rename(&old_path, &new_path).await?;
        }
        if old_snaps.exists() {
            tokio::fs::rename(&old_snaps, &new_snaps).await?;
        }
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let path = self.volume_path();
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await?;
        }
        let snaps = self.snapshots_path();
        if snaps.exists() {
            tokio::fs::remove_dir_all(&snaps).await?;
        }
        Ok(())
    }
}
