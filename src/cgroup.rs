//! Control group access.
//!
//! Everything the engine writes into the cgroup filesystem goes through
//! the [`CgroupWriter`] trait so the decision logic (cpuset arithmetic,
//! the memory limit ordering) stays testable without a host kernel.

use crate::constants::SOFT_MEMORY_LIMIT_FACTOR;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::warn;

// =============================================================================
// Writer
// =============================================================================

/// Read/write access to one cgroup hierarchy, addressed by controller
/// name and hierarchical path.
#[async_trait]
pub trait CgroupWriter: Send + Sync {
    async fn get(&self, controller: &str, path: &str, key: &str) -> Result<String>;
    async fn set(&self, controller: &str, path: &str, key: &str, value: &str) -> Result<()>;
}

/// Writer over the mounted v1 hierarchy.
pub struct HostCgroup {
    root: PathBuf,
}

impl HostCgroup {
    pub fn new() -> Self {
        Self::with_root("/sys/fs/cgroup")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        HostCgroup { root: root.into() }
    }

    fn file(&self, controller: &str, path: &str, key: &str) -> PathBuf {
        self.root
            .join(controller)
            .join(path.trim_start_matches('/'))
            .join(key)
    }
}

impl Default for HostCgroup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CgroupWriter for HostCgroup {
    async fn get(&self, controller: &str, path: &str, key: &str) -> Result<String> {
        let file = self.file(controller, path, key);
        let raw = tokio::fs::read_to_string(&file).await?;
        Ok(raw.trim().to_string())
    }

    async fn set(&self, controller: &str, path: &str, key: &str, value: &str) -> Result<()> {
        let file = self.file(controller, path, key);
        tokio::fs::write(&file, value).await?;
        Ok(())
    }
}

// =============================================================================
// Controller Support
// =============================================================================

/// Which controllers the host kernel exposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CgroupSupport {
    pub cpuset: bool,
    pub memory: bool,
    pub memsw: bool,
    pub pids: bool,
    pub freezer: bool,
    pub devices: bool,
    pub net_prio: bool,
    pub blkio: bool,
}

impl CgroupSupport {
    /// Probes the mounted hierarchy.
    pub fn probe() -> Self {
        Self::probe_root(Path::new("/sys/fs/cgroup"))
    }

    pub fn probe_root(root: &Path) -> Self {
        let has = |name: &str| root.join(name).is_dir();
        CgroupSupport {
            cpuset: has("cpuset"),
            memory: has("memory"),
            memsw: root.join("memory/memory.memsw.limit_in_bytes").exists(),
            pids: has("pids"),
            freezer: has("freezer"),
            devices: has("devices"),
            net_prio: has("net_prio"),
            blkio: has("blkio"),
        }
    }
}

// =============================================================================
// Cpuset Parsing
// =============================================================================

/// Parses a kernel cpuset string ("0-3,6") into individual cpu ids.
pub fn parse_cpuset(cpuset: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for chunk in cpuset.split(',') {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }

        if let Some((low, high)) = chunk.split_once('-') {
            let low: u32 = low
                .parse()
                .map_err(|_| Error::Validation(format!("invalid cpuset chunk '{chunk}'")))?;
            let high: u32 = high
                .parse()
                .map_err(|_| Error::Validation(format!("invalid cpuset chunk '{chunk}'")))?;
            if high < low {
                return Err(Error::Validation(format!("invalid cpuset chunk '{chunk}'")));
            }
            cpus.extend(low..=high);
        } else {
            cpus.push(
                chunk
                    .parse()
                    .map_err(|_| Error::Validation(format!("invalid cpuset chunk '{chunk}'")))?,
            );
        }
    }
    Ok(cpus)
}

/// Renders cpu ids back into the kernel's comma-separated form.
pub fn render_cpuset(cpus: &[u32]) -> String {
    cpus.iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// CPU Allowance
// =============================================================================

/// CFS scheduler parameters derived from `limits.cpu.allowance` and
/// `limits.cpu.priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuLimits {
    pub shares: u64,
    /// Microseconds, -1 for unlimited.
    pub quota_us: i64,
    /// Microseconds.
    pub period_us: i64,
}

/// Parses `limits.cpu.allowance` ("50%", "25ms/100ms", empty) together
/// with `limits.cpu.priority` (0-10, default 10).
pub fn parse_cpu_allowance(allowance: &str, priority: &str) -> Result<CpuLimits> {
    let priority: i64 = if priority.is_empty() {
        10
    } else {
        priority
            .parse()
            .map_err(|_| Error::Validation(format!("invalid cpu priority '{priority}'")))?
    };

    let mut shares: i64 = -(10 - priority);
    let mut quota_us: i64 = -1;
    let mut period_us: i64 = 100_000;

    if allowance.is_empty() {
        shares += 1024;
    } else if let Some(percent) = allowance.strip_suffix('%') {
        let percent: i64 = percent
            .parse()
            .map_err(|_| Error::Validation(format!("invalid cpu allowance '{allowance}'")))?;
        shares += 10 * percent + 24;
    } else {
        let Some((quota, period)) = allowance.split_once('/') else {
            return Err(Error::Validation(format!(
                "invalid cpu allowance '{allowance}'"
            )));
        };
        let quota_ms: i64 = quota
            .strip_suffix("ms")
            .unwrap_or(quota)
            .parse()
            .map_err(|_| Error::Validation(format!("invalid cpu allowance '{allowance}'")))?;
        let period_ms: i64 = period
            .strip_suffix("ms")
            .unwrap_or(period)
            .parse()
            .map_err(|_| Error::Validation(format!("invalid cpu allowance '{allowance}'")))?;

        quota_us = quota_ms * 1000;
        period_us = period_ms * 1000;
        shares += 1024;
    }

    Ok(CpuLimits {
        shares: shares.max(0) as u64,
        quota_us,
        period_us,
    })
}

// =============================================================================
// Disk Limits
// =============================================================================

/// Block throttle values derived from `limits.read`/`limits.write`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskLimits {
    pub read_bps: u64,
    pub read_iops: u64,
    pub write_bps: u64,
    pub write_iops: u64,
}

/// Parses one side of a disk limit: either bytes/s ("100MB") or
/// operations/s ("50iops").
fn parse_disk_value(value: &str) -> Result<(u64, u64)> {
    if value.is_empty() {
        return Ok((0, 0));
    }
    if let Some(iops) = value.strip_suffix("iops") {
        let iops: u64 = iops
            .parse()
            .map_err(|_| Error::Validation(format!("invalid disk limit '{value}'")))?;
        return Ok((0, iops));
    }
    Ok((crate::config::parse_byte_size(value)?, 0))
}

/// Parses a read/write disk limit pair. `limits.max` applies to both
/// sides when the specific key is absent.
pub fn parse_disk_limits(read: &str, write: &str) -> Result<DiskLimits> {
    let (read_bps, read_iops) = parse_disk_value(read)?;
    let (write_bps, write_iops) = parse_disk_value(write)?;
    Ok(DiskLimits {
        read_bps,
        read_iops,
        write_bps,
        write_iops,
    })
}

impl DiskLimits {
    /// Merges another disk's limits for the same block device. Zero means
    /// unlimited, and unlimited wins over any bound.
    pub fn merge(&mut self, other: &DiskLimits) {
        fn combine(a: u64, b: u64) -> u64 {
            if a == 0 || b == 0 {
                0
            } else {
                a.max(b)
            }
        }
        self.read_bps = combine(self.read_bps, other.read_bps);
        self.read_iops = combine(self.read_iops, other.read_iops);
        self.write_bps = combine(self.write_bps, other.write_bps);
        self.write_iops = combine(self.write_iops, other.write_iops);
    }
}

/// Block device number (`major:minor`) of the filesystem holding a path.
pub fn fs_block_device(path: &Path) -> Result<String> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(path)?;
    let dev = meta.dev();
    Ok(format!(
        "{}:{}",
        nix::sys::stat::major(dev),
        nix::sys::stat::minor(dev)
    ))
}

/// Writes the blkio throttle values for one block device.
pub async fn apply_disk_throttle(
    cg: &dyn CgroupWriter,
    cgroup_path: &str,
    block: &str,
    limits: &DiskLimits,
) -> Result<()> {
    for (key, value) in [
        ("blkio.throttle.read_bps_device", limits.read_bps),
        ("blkio.throttle.read_iops_device", limits.read_iops),
        ("blkio.throttle.write_bps_device", limits.write_bps),
        ("blkio.throttle.write_iops_device", limits.write_iops),
    ] {
        cg.set("blkio", cgroup_path, key, &format!("{block} {value}"))
            .await?;
    }
    Ok(())
}

// =============================================================================
// Memory Limits
// =============================================================================

/// Applies a new hard memory limit to a running container's cgroup.
///
/// All three of `memory.limit_in_bytes`, `memory.memsw.limit_in_bytes` and
/// `memory.soft_limit_in_bytes` are first cleared to `-1`: setting them in
/// an arbitrary order can transiently violate `memsw >= mem` and be
/// rejected by the kernel. On any failure every value is restored.
pub async fn apply_memory_limit(
    cg: &dyn CgroupWriter,
    cgroup_path: &str,
    limit_bytes: u64,
    memsw_available: bool,
) -> Result<()> {
    let old_soft = cg.get("memory", cgroup_path, "memory.soft_limit_in_bytes").await?;
    let old_hard = cg.get("memory", cgroup_path, "memory.limit_in_bytes").await?;
    let old_memsw = if memsw_available {
        Some(
            cg.get("memory", cgroup_path, "memory.memsw.limit_in_bytes")
                .await?,
        )
    } else {
        None
    };

    async fn revert(
        cg: &dyn CgroupWriter,
        cgroup_path: &str,
        old_soft: &str,
        old_hard: &str,
        old_memsw: Option<&str>,
    ) {
        if let Err(e) = cg
            .set("memory", cgroup_path, "memory.soft_limit_in_bytes", old_soft)
            .await
        {
            warn!(err = %e, "failed to restore soft memory limit");
        }
        if let Err(e) = cg
            .set("memory", cgroup_path, "memory.limit_in_bytes", old_hard)
            .await
        {
            warn!(err = %e, "failed to restore memory limit");
        }
        if let Some(old_memsw) = old_memsw {
            if let Err(e) = cg
                .set("memory", cgroup_path, "memory.memsw.limit_in_bytes", old_memsw)
                .await
            {
                warn!(err = %e, "failed to restore memsw limit");
            }
        }
    }

    // Clear, widest first.
    if memsw_available {
        if let Err(e) = cg
            .set("memory", cgroup_path, "memory.memsw.limit_in_bytes", "-1")
            .await
        {
            revert(cg, cgroup_path, &old_soft, &old_hard, old_memsw.as_deref()).await;
            return Err(e);
        }
    }
    if let Err(e) = cg
        .set("memory", cgroup_path, "memory.limit_in_bytes", "-1")
        .await
    {
        revert(cg, cgroup_path, &old_soft, &old_hard, old_memsw.as_deref()).await;
        return Err(e);
    }
    if let Err(e) = cg
        .set("memory", cgroup_path, "memory.soft_limit_in_bytes", "-1")
        .await
    {
        revert(cg, cgroup_path, &old_soft, &old_hard, old_memsw.as_deref()).await;
        return Err(e);
    }

    // Set the new values, hard limit before memsw.
    let hard = limit_bytes.to_string();
    if let Err(e) = cg
        .set("memory", cgroup_path, "memory.limit_in_bytes", &hard)
        .await
    {
        revert(cg, cgroup_path, &old_soft, &old_hard, old_memsw.as_deref()).await;
        return Err(e);
    }
    if memsw_available {
        if let Err(e) = cg
            .set("memory", cgroup_path, "memory.memsw.limit_in_bytes", &hard)
            .await
        {
            revert(cg, cgroup_path, &old_soft, &old_hard, old_memsw.as_deref()).await;
            return Err(e);
        }
    }

    let soft = format!(
        "{:.0}",
        limit_bytes as f64 * SOFT_MEMORY_LIMIT_FACTOR
    );
    if let Err(e) = cg
        .set("memory", cgroup_path, "memory.soft_limit_in_bytes", &soft)
        .await
    {
        revert(cg, cgroup_path, &old_soft, &old_hard, old_memsw.as_deref()).await;
        return Err(e);
    }

    Ok(())
}
