//! CPU pinning rebalancer.
//!
//! Containers either pin an explicit cpuset (`limits.cpu = "0-3,6"`) or
//! request a count of cpus (`limits.cpu = "2"`, absent meaning all).
//! Pinned containers get their requested subset intersected with the
//! host's effective set; balanced containers are spread greedily over the
//! least-loaded cpus.

use crate::cgroup::{parse_cpuset, CgroupWriter};
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// One container's pinning request.
#[derive(Debug, Clone)]
pub struct BalanceRequest {
    /// Stable key used in the result map (project_name).
    pub key: String,
    /// `limits.cpu` from the expanded config, empty when absent.
    pub limits_cpu: String,
}

/// Computed assignment: container key → sorted cpu ids.
pub type BalancePlan = BTreeMap<String, Vec<u32>>;

/// Partitions and balances the containers over the effective cpu set.
///
/// Ties between equally-loaded cpus break toward the lowest id. The plan
/// is deterministic for a given input ordering.
pub fn plan_cpu_balance(effective: &[u32], requests: &[BalanceRequest]) -> BalancePlan {
    let mut plan = BalancePlan::new();
    if effective.is_empty() {
        return plan;
    }

    // Usage counter per effective cpu.
    let mut usage: BTreeMap<u32, usize> = effective.iter().map(|c| (*c, 0)).collect();

    // Pinned containers claim their subset first.
    let mut balanced: Vec<(String, usize)> = Vec::new();
    for request in requests {
        if request.limits_cpu.is_empty() {
            balanced.push((request.key.clone(), effective.len()));
            continue;
        }

        match request.limits_cpu.parse::<usize>() {
            Ok(count) => balanced.push((request.key.clone(), count.min(effective.len()))),
            Err(_) => {
                let Ok(wanted) = parse_cpuset(&request.limits_cpu) else {
                    warn!(container = %request.key, cpuset = %request.limits_cpu, "skipping invalid pinned cpuset");
                    continue;
                };
                let mut assigned: Vec<u32> = wanted
                    .into_iter()
                    .filter(|cpu| usage.contains_key(cpu))
                    .collect();
                assigned.sort_unstable();
                assigned.dedup();
                for cpu in &assigned {
                    if let Some(count) = usage.get_mut(cpu) {
                        *count += 1;
                    }
                }
                plan.insert(request.key.clone(), assigned);
            }
        }
    }

    // Balanced containers pick the least-loaded cpus, lowest id first.
    for (key, count) in balanced {
        let mut by_load: Vec<(usize, u32)> = usage.iter().map(|(cpu, n)| (*n, *cpu)).collect();
        by_load.sort_unstable();

        let mut assigned: Vec<u32> = by_load.into_iter().take(count).map(|(_, cpu)| cpu).collect();
        assigned.sort_unstable();
        for cpu in &assigned {
            if let Some(count) = usage.get_mut(cpu) {
                *count += 1;
            }
        }
        plan.insert(key, assigned);
    }

    plan
}

/// Reads the host's effective cpu set minus isolated cpus.
///
/// Prefers `cpuset.effective_cpus`; older kernels only expose
/// `cpuset.cpus` at the root.
pub async fn effective_cpus(cg: &dyn CgroupWriter, isolated_path: &Path) -> Result<Vec<u32>> {
    let raw = match cg.get("cpuset", "/", "cpuset.effective_cpus").await {
        Ok(raw) => raw,
        Err(_) => cg.get("cpuset", "/", "cpuset.cpus").await?,
    };
    let mut cpus = parse_cpuset(&raw)?;

    if let Ok(isolated_raw) = std::fs::read_to_string(isolated_path) {
        let isolated_raw = isolated_raw.trim();
        if !isolated_raw.is_empty() {
            let isolated = parse_cpuset(isolated_raw)?;
            cpus.retain(|cpu| !isolated.contains(cpu));
        }
    }

    debug!(?cpus, "effective cpu set");
    Ok(cpus)
}
