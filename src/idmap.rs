//! UID/GID identity mapping.
//!
//! Unprivileged containers run under a translation between host ids and
//! in-container ids. This module owns the mapping model, the `raw.idmap`
//! parser, and the planner that allocates isolated ranges without
//! collisions across instances.
//!
//! The planner is one of the engine's three named singletons: isolated
//! allocation holds its process-wide mutex from reading peer allocations
//! through picking an offset.

use crate::constants::DEFAULT_IDMAP_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

// =============================================================================
// Model
// =============================================================================

/// Which id spaces an entry maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdmapKind {
    Uid,
    Gid,
    Both,
}

impl IdmapKind {
    pub fn maps_uid(self) -> bool {
        matches!(self, IdmapKind::Uid | IdmapKind::Both)
    }

    pub fn maps_gid(self) -> bool {
        matches!(self, IdmapKind::Gid | IdmapKind::Both)
    }

    fn overlaps_kind(self, other: IdmapKind) -> bool {
        (self.maps_uid() && other.maps_uid()) || (self.maps_gid() && other.maps_gid())
    }
}

/// One contiguous mapping between a host range and a namespace range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdmapEntry {
    pub kind: IdmapKind,
    pub host_base: u64,
    pub ns_base: u64,
    pub range: u64,
}

impl IdmapEntry {
    fn host_intersects(&self, other: &IdmapEntry) -> bool {
        self.kind.overlaps_kind(other.kind)
            && self.host_base < other.host_base + other.range
            && other.host_base < self.host_base + self.range
    }

    fn ns_intersects(&self, other: &IdmapEntry) -> bool {
        self.kind.overlaps_kind(other.kind)
            && self.ns_base < other.ns_base + other.range
            && other.ns_base < self.ns_base + self.range
    }

    /// Translates a namespace id to its host id, if covered.
    fn shift_from_ns(&self, ns_id: u64) -> Option<u64> {
        if ns_id >= self.ns_base && ns_id < self.ns_base + self.range {
            Some(self.host_base + (ns_id - self.ns_base))
        } else {
            None
        }
    }

    /// Translates a host id back to its namespace id, if covered.
    fn shift_into_ns(&self, host_id: u64) -> Option<u64> {
        if host_id >= self.host_base && host_id < self.host_base + self.range {
            Some(self.ns_base + (host_id - self.host_base))
        } else {
            None
        }
    }
}

/// An ordered list of idmap entries.
///
/// Invariant: host ranges of entries mapping the same id space never
/// overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdmapSet {
    pub entries: Vec<IdmapEntry>,
}

impl IdmapSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds the two-entry `{uid,gid}` map for an isolated allocation.
    pub fn isolated(offset: u64, size: u64) -> Self {
        IdmapSet {
            entries: vec![
                IdmapEntry {
                    kind: IdmapKind::Uid,
                    host_base: offset,
                    ns_base: 0,
                    range: size,
                },
                IdmapEntry {
                    kind: IdmapKind::Gid,
                    host_base: offset,
                    ns_base: 0,
                    range: size,
                },
            ],
        }
    }

    /// Safely merges one entry into the set.
    ///
    /// Rejects entries whose host ids fall inside an existing entry's host
    /// range (a raw map must not smuggle ids the host already delegates).
    /// Existing entries whose namespace range overlaps the new entry are
    /// split around it, so the new entry wins for that window.
    pub fn add_safe(&mut self, entry: IdmapEntry) -> Result<()> {
        if self.entries.iter().any(|e| e.host_intersects(&entry)) {
            return Err(Error::Validation(format!(
                "host id range {}-{} is already a sub-id",
                entry.host_base,
                entry.host_base + entry.range - 1
            )));
        }

        let mut rebuilt = Vec::with_capacity(self.entries.len() + 2);
        for existing in self.entries.drain(..) {
            if !existing.ns_intersects(&entry) {
                rebuilt.push(existing);
                continue;
            }

            // Keep the part of the existing entry below the new window.
            if existing.ns_base < entry.ns_base {
                let head = entry.ns_base - existing.ns_base;
                rebuilt.push(IdmapEntry {
                    range: head,
                    ..existing
                });
            }

            // Keep the part above the new window.
            let existing_end = existing.ns_base + existing.range;
            let entry_end = entry.ns_base + entry.range;
            if existing_end > entry_end {
                rebuilt.push(IdmapEntry {
                    kind: existing.kind,
                    host_base: existing.host_base + (entry_end - existing.ns_base),
                    ns_base: entry_end,
                    range: existing_end - entry_end,
                });
            }
        }

        rebuilt.push(entry);
        self.entries = rebuilt;
        Ok(())
    }

    /// Renders the runtime's `lxc.idmap` lines.
    pub fn to_runtime_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for e in &self.entries {
            if e.kind.maps_uid() {
                lines.push(format!("u {} {} {}", e.ns_base, e.host_base, e.range));
            }
            if e.kind.maps_gid() {
                lines.push(format!("g {} {} {}", e.ns_base, e.host_base, e.range));
            }
        }
        lines
    }

    /// Serializes for storage in a volatile key.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.entries)?)
    }

    /// Parses a volatile-key value back into a set.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(IdmapSet {
            entries: serde_json::from_str(raw)?,
        })
    }

    /// Host uid for a namespace uid, identity when unmapped.
    pub fn shift_uid(&self, ns_uid: u64) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind.maps_uid())
            .find_map(|e| e.shift_from_ns(ns_uid))
            .unwrap_or(ns_uid)
    }

    /// Host gid for a namespace gid, identity when unmapped.
    pub fn shift_gid(&self, ns_gid: u64) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind.maps_gid())
            .find_map(|e| e.shift_from_ns(ns_gid))
            .unwrap_or(ns_gid)
    }

    /// Namespace uid for a host uid, identity when unmapped.
    pub fn unshift_uid(&self, host_uid: u64) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind.maps_uid())
            .find_map(|e| e.shift_into_ns(host_uid))
            .unwrap_or(host_uid)
    }

    /// Namespace gid for a host gid, identity when unmapped.
    pub fn unshift_gid(&self, host_gid: u64) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind.maps_gid())
            .find_map(|e| e.shift_into_ns(host_gid))
            .unwrap_or(host_gid)
    }

    /// Walks a rootfs translating every file's owner from namespace ids to
    /// host ids. Blocking; callers run it on a blocking task.
    pub fn shift_rootfs(&self, root: &Path) -> Result<()> {
        self.walk_chown(root, true)
    }

    /// Reverse of [`IdmapSet::shift_rootfs`].
    pub fn unshift_rootfs(&self, root: &Path) -> Result<()> {
        self.walk_chown(root, false)
    }

    fn walk_chown(&self, path: &Path, shift: bool) -> Result<()> {
        let meta = std::fs::symlink_metadata(path)?;
        let (uid, gid) = (meta.uid() as u64, meta.gid() as u64);
        let (new_uid, new_gid) = if shift {
            (self.shift_uid(uid), self.shift_gid(gid))
        } else {
            (self.unshift_uid(uid), self.unshift_gid(gid))
        };

        if (new_uid, new_gid) != (uid, gid) {
            std::os::unix::fs::lchown(path, Some(new_uid as u32), Some(new_gid as u32))?;
        }

        if meta.is_dir() {
            for dirent in std::fs::read_dir(path)? {
                self.walk_chown(&dirent?.path(), shift)?;
            }
        }

        Ok(())
    }
}

// =============================================================================
// raw.idmap Parsing
// =============================================================================

/// Parses a `raw.idmap` blob: one `both|uid|gid <host-range> <ns-range>`
/// entry per line, where a range is `N` or `N-M` inclusive.
pub fn parse_raw_idmap(value: &str) -> Result<Vec<IdmapEntry>> {
    fn parse_range(raw: &str) -> Result<(u64, u64)> {
        let parts: Vec<&str> = raw.split('-').collect();
        if parts.len() > 2 {
            return Err(Error::Validation(format!("invalid raw.idmap range {raw}")));
        }

        let base: u64 = parts[0]
            .parse()
            .map_err(|_| Error::Validation(format!("invalid raw.idmap range {raw}")))?;
        let size = if parts.len() == 2 {
            let end: u64 = parts[1]
                .parse()
                .map_err(|_| Error::Validation(format!("invalid raw.idmap range {raw}")))?;
            if end < base {
                return Err(Error::Validation(format!("invalid raw.idmap range {raw}")));
            }
            end - base + 1
        } else {
            1
        };

        Ok((base, size))
    }

    let mut entries = Vec::new();
    for line in value.lines() {
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() != 3 {
            return Err(Error::Validation(format!("invalid raw.idmap line {line}")));
        }

        let kind = match fields[0] {
            "both" => IdmapKind::Both,
            "uid" => IdmapKind::Uid,
            "gid" => IdmapKind::Gid,
            other => {
                return Err(Error::Validation(format!("invalid raw.idmap type {other}")))
            }
        };

        let (host_base, host_size) = parse_range(fields[1])?;
        let (ns_base, ns_size) = parse_range(fields[2])?;
        if host_size != ns_size {
            return Err(Error::Validation(format!(
                "idmap ranges of different sizes: {line}"
            )));
        }

        entries.push(IdmapEntry {
            kind,
            host_base,
            ns_base,
            range: ns_size,
        });
    }

    Ok(entries)
}

// =============================================================================
// Planner
// =============================================================================

/// Idmap request derived from an instance's expanded config.
#[derive(Debug, Clone, Default)]
pub struct IdmapRequest {
    /// Instance name, excluded from peer collision checks.
    pub instance: String,
    /// `security.idmap.isolated`.
    pub isolated: bool,
    /// `security.idmap.base`, when explicitly set.
    pub base: Option<u64>,
    /// `security.idmap.size`, when explicitly set.
    pub size: Option<u64>,
    /// `raw.idmap` blob.
    pub raw_idmap: String,
}

/// An isolated range some other instance already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedRange {
    pub base: u64,
    pub size: u64,
}

/// Planner output: the map to use and the isolated base (0 when shared).
#[derive(Debug, Clone)]
pub struct IdmapPlan {
    pub set: IdmapSet,
    pub base: u64,
}

/// Computes per-instance idmaps and allocates isolated ranges.
///
/// The only writer of `volatile.idmap.{base,next}` is the caller acting on
/// this planner's output.
pub struct IdmapPlanner {
    host_map: IdmapSet,
    alloc_lock: Mutex<()>,
}

impl IdmapPlanner {
    /// Creates a planner over the host's backing sub-id map.
    pub fn new(host_map: IdmapSet) -> Self {
        IdmapPlanner {
            host_map,
            alloc_lock: Mutex::new(()),
        }
    }

    pub fn host_map(&self) -> &IdmapSet {
        &self.host_map
    }

    /// Effective range size for a request.
    fn request_size(&self, req: &IdmapRequest) -> Result<u64> {
        if let Some(size) = req.size {
            return Ok(size);
        }
        if req.isolated {
            return Ok(DEFAULT_IDMAP_SIZE);
        }

        self.host_map
            .entries
            .first()
            .map(|e| e.range)
            .ok_or_else(|| Error::Internal("host idmap is empty".into()))
    }

    /// Plans the next idmap for an instance.
    ///
    /// `peers` are the `(base, size)` allocations of every other isolated
    /// non-privileged instance; the allocator mutex is held while choosing
    /// an offset among them.
    pub async fn plan(&self, req: &IdmapRequest, peers: &[AllocatedRange]) -> Result<IdmapPlan> {
        let raw_entries = parse_raw_idmap(&req.raw_idmap)?;

        if !req.isolated {
            let mut set = self.host_map.clone();
            for entry in raw_entries {
                set.add_safe(entry)?;
            }
            return Ok(IdmapPlan { set, base: 0 });
        }

        let size = self.request_size(req)?;

        let build = |offset: u64| -> Result<IdmapSet> {
            let mut set = IdmapSet::isolated(offset, size);
            for entry in &raw_entries {
                set.add_safe(*entry)?;
            }
            Ok(set)
        };

        if let Some(offset) = req.base {
            return Ok(IdmapPlan {
                set: build(offset)?,
                base: offset,
            });
        }

        let _guard = self.alloc_lock.lock().await;

        let host = self
            .host_map
            .entries
            .first()
            .ok_or_else(|| Error::Internal("host idmap is empty".into()))?;

        let mut sorted: Vec<AllocatedRange> = peers.to_vec();
        sorted.sort_by_key(|r| r.base);

        // First fit after the host offset, skipping every allocated range.
        let mut offset = host.host_base + DEFAULT_IDMAP_SIZE;
        for peer in &sorted {
            if peer.base < offset + size {
                offset = offset.max(peer.base + peer.size);
                continue;
            }
            break;
        }

        if offset + size <= host.host_base + host.range {
            debug!(instance = %req.instance, offset, size, "allocated isolated idmap range");
            return Ok(IdmapPlan {
                set: build(offset)?,
                base: offset,
            });
        }

        Err(Error::Validation(
            "not enough uid/gid available for the container".into(),
        ))
    }
}
