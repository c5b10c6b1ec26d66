//! Inotify watches for device sources that do not exist yet.
//!
//! Optional devices with a missing source arm a watch on the closest
//! living ancestor of the source path. When directories appear the watch
//! migrates downward until the source itself exists and the device can be
//! hot-plugged; deletions migrate it back up.
//!
//! The watch table sits behind a reader-writer lock: event dispatch only
//! resolves descriptors (read), watch add/remove takes the write side.

use crate::error::{Error, Result};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

// =============================================================================
// Path Helpers
// =============================================================================

/// First existing ancestor of a path (possibly the path itself).
pub fn closest_living_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = path.to_path_buf();
    loop {
        if current.exists() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// All ancestor paths from `/` down to the path itself.
pub fn ancestor_paths(path: &Path) -> Vec<PathBuf> {
    let mut ancestors = vec![PathBuf::from("/")];
    let mut current = PathBuf::from("/");
    for component in path.components() {
        if let Component::Normal(part) = component {
            current.push(part);
            ancestors.push(current.clone());
        }
    }
    ancestors
}

// =============================================================================
// Events
// =============================================================================

/// A filesystem transition under a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    /// A directory appeared at the path.
    DirCreated(PathBuf),
    /// A directory (watched or child of watched) went away.
    DirDeleted(PathBuf),
    /// A non-directory appeared.
    FileCreated(PathBuf),
    /// A non-directory went away.
    FileDeleted(PathBuf),
}

impl FsEvent {
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::DirCreated(p)
            | FsEvent::DirDeleted(p)
            | FsEvent::FileCreated(p)
            | FsEvent::FileDeleted(p) => p,
        }
    }
}

// =============================================================================
// Watch Table
// =============================================================================

struct Targets {
    by_path: HashMap<PathBuf, WatchDescriptor>,
    by_wd: HashMap<WatchDescriptor, PathBuf>,
}

/// Inotify instance plus the directory targets it watches.
pub struct WatchTable {
    inotify: Arc<Inotify>,
    targets: RwLock<Targets>,
}

impl WatchTable {
    /// Creates the inotify instance and spawns the blocking reader
    /// thread, which feeds parsed events into the returned channel.
    pub fn new() -> Result<(Arc<Self>, mpsc::UnboundedReceiver<FsEvent>)> {
        let inotify = Arc::new(Inotify::init(InitFlags::IN_CLOEXEC)?);
        let table = Arc::new(WatchTable {
            inotify: Arc::clone(&inotify),
            targets: RwLock::new(Targets {
                by_path: HashMap::new(),
                by_wd: HashMap::new(),
            }),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let reader_table = Arc::clone(&table);
        std::thread::Builder::new()
            .name("silo-inotify".to_string())
            .spawn(move || reader_table.read_loop(tx))
            .map_err(|e| Error::Internal(format!("failed to spawn inotify reader: {e}")))?;

        Ok((table, rx))
    }

    /// Watches the closest living ancestor of a device source path.
    pub fn watch_ancestor_of(&self, path: &Path) -> Result<()> {
        let ancestor = closest_living_ancestor(path).ok_or_else(|| {
            Error::Internal(format!(
                "no existing ancestor directory found for {}",
                path.display()
            ))
        })?;
        self.add_target(&ancestor)
    }

    /// Adds one directory target; watching the same path twice is a no-op.
    pub fn add_target(&self, path: &Path) -> Result<()> {
        let mut targets = self.write();
        if targets.by_path.contains_key(path) {
            debug!(path = %path.display(), "already watching");
            return Ok(());
        }

        let mask = AddWatchFlags::IN_ONLYDIR
            | AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_DELETE_SELF;
        let wd = self.inotify.add_watch(path, mask)?;
        targets.by_path.insert(path.to_path_buf(), wd);
        targets.by_wd.insert(wd, path.to_path_buf());
        debug!(path = %path.display(), "added inotify target");
        Ok(())
    }

    /// Drops one directory target.
    pub fn remove_target(&self, path: &Path) -> Result<()> {
        let mut targets = self.write();
        let Some(wd) = targets.by_path.remove(path) else {
            return Ok(());
        };
        targets.by_wd.remove(&wd);
        // The kernel already dropped the watch if the directory is gone.
        if let Err(e) = self.inotify.rm_watch(wd) {
            debug!(path = %path.display(), err = %e, "rm_watch");
        }
        Ok(())
    }

    /// Currently watched directories.
    pub fn targets(&self) -> Vec<PathBuf> {
        self.read().by_path.keys().cloned().collect()
    }

    fn resolve(&self, wd: WatchDescriptor) -> Option<PathBuf> {
        self.read().by_wd.get(&wd).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Targets> {
        self.targets.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Targets> {
        self.targets.write().unwrap_or_else(|p| p.into_inner())
    }

    fn read_loop(self: Arc<Self>, tx: mpsc::UnboundedSender<FsEvent>) {
        loop {
            let events = match self.inotify.read_events() {
                Ok(events) => events,
                Err(nix::errno::Errno::EBADF) => return,
                Err(e) => {
                    warn!(err = %e, "inotify read failed");
                    return;
                }
            };

            for event in events {
                let Some(dir) = self.resolve(event.wd) else {
                    continue;
                };

                let full = match &event.name {
                    Some(name) => dir.join(name),
                    None => dir.clone(),
                };

                let is_dir = event.mask.contains(AddWatchFlags::IN_ISDIR);
                let parsed = if event.mask.contains(AddWatchFlags::IN_CREATE) {
                    if is_dir {
                        FsEvent::DirCreated(full)
                    } else {
                        FsEvent::FileCreated(full)
                    }
                } else if event.mask.contains(AddWatchFlags::IN_DELETE) {
                    if is_dir {
                        FsEvent::DirDeleted(full)
                    } else {
                        FsEvent::FileDeleted(full)
                    }
                } else if event.mask.contains(AddWatchFlags::IN_DELETE_SELF) {
                    FsEvent::DirDeleted(full)
                } else {
                    continue;
                };

                if tx.send(parsed).is_err() {
                    return;
                }
            }
        }
    }
}
