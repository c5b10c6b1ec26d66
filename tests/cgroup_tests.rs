//! Tests for control group helpers.
//!
//! Validates cpuset parsing, cpu allowance arithmetic, disk limit
//! parsing, and the memory limit transition ordering.

use async_trait::async_trait;
use silo::cgroup::{
    apply_memory_limit, parse_cpu_allowance, parse_cpuset, parse_disk_limits, render_cpuset,
    CgroupWriter,
};
use silo::Result;
use std::collections::HashMap;
use std::sync::Mutex;

// =============================================================================
// Cpuset Tests
// =============================================================================

#[test]
fn test_parse_cpuset() {
    assert_eq!(parse_cpuset("0-3,6").unwrap(), vec![0, 1, 2, 3, 6]);
    assert_eq!(parse_cpuset("0").unwrap(), vec![0]);
    assert_eq!(parse_cpuset("2,4,6").unwrap(), vec![2, 4, 6]);
    assert!(parse_cpuset("3-1").is_err());
    assert!(parse_cpuset("a-b").is_err());
}

#[test]
fn test_render_cpuset() {
    assert_eq!(render_cpuset(&[0, 1, 5]), "0,1,5");
    assert_eq!(render_cpuset(&[]), "");
}

// =============================================================================
// CPU Allowance Tests
// =============================================================================

#[test]
fn test_cpu_allowance_default() {
    let cpu = parse_cpu_allowance("", "").unwrap();
    assert_eq!(cpu.shares, 1024);
    assert_eq!(cpu.quota_us, -1);
    assert_eq!(cpu.period_us, 100_000);
}

#[test]
fn test_cpu_allowance_percentage() {
    let cpu = parse_cpu_allowance("50%", "").unwrap();
    assert_eq!(cpu.shares, 524);
    assert_eq!(cpu.quota_us, -1);
}

#[test]
fn test_cpu_allowance_time_based() {
    let cpu = parse_cpu_allowance("25ms/100ms", "").unwrap();
    assert_eq!(cpu.shares, 1024);
    assert_eq!(cpu.quota_us, 25_000);
    assert_eq!(cpu.period_us, 100_000);
}

#[test]
fn test_cpu_priority_lowers_shares() {
    let cpu = parse_cpu_allowance("", "0").unwrap();
    assert_eq!(cpu.shares, 1014);
}

#[test]
fn test_cpu_allowance_invalid() {
    assert!(parse_cpu_allowance("25ms", "").is_err());
    assert!(parse_cpu_allowance("x%", "").is_err());
}

// =============================================================================
// Disk Limit Tests
// =============================================================================

#[test]
fn test_parse_disk_limits() {
    let limits = parse_disk_limits("100MB", "50iops").unwrap();
    assert_eq!(limits.read_bps, 100_000_000);
    assert_eq!(limits.read_iops, 0);
    assert_eq!(limits.write_bps, 0);
    assert_eq!(limits.write_iops, 50);

    let empty = parse_disk_limits("", "").unwrap();
    assert_eq!(empty.read_bps, 0);
    assert_eq!(empty.write_iops, 0);
}

// =============================================================================
// Memory Limit Ordering Tests
// =============================================================================

/// Records every write so the transition ordering can be asserted.
struct RecordingCgroup {
    values: Mutex<HashMap<String, String>>,
    writes: Mutex<Vec<(String, String)>>,
    attempts: Mutex<HashMap<String, usize>>,
    /// Fail the nth (0-based) attempt on this key, once.
    fail_on: Option<(String, usize)>,
}

impl RecordingCgroup {
    fn new() -> Self {
        let mut values = HashMap::new();
        values.insert("memory.limit_in_bytes".to_string(), "536870912".to_string());
        values.insert(
            "memory.memsw.limit_in_bytes".to_string(),
            "536870912".to_string(),
        );
        values.insert(
            "memory.soft_limit_in_bytes".to_string(),
            "483183820".to_string(),
        );
        RecordingCgroup {
            values: Mutex::new(values),
            writes: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
            fail_on: None,
        }
    }

    fn failing_on(key: &str, nth: usize) -> Self {
        let mut cg = Self::new();
        cg.fail_on = Some((key.to_string(), nth));
        cg
    }

    fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CgroupWriter for RecordingCgroup {
    async fn get(&self, _controller: &str, _path: &str, key: &str) -> Result<String> {
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_else(|| "-1".to_string()))
    }

    async fn set(&self, _controller: &str, _path: &str, key: &str, value: &str) -> Result<()> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let counter = attempts.entry(key.to_string()).or_insert(0);
            let current = *counter;
            *counter += 1;
            current
        };

        if let Some((fail_key, nth)) = &self.fail_on {
            if key == fail_key && attempt == *nth {
                return Err(silo::Error::Internal("injected failure".into()));
            }
        }

        self.writes
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_memory_limit_transition_ordering() {
    let cg = RecordingCgroup::new();
    apply_memory_limit(&cg, "/lxc/c1", 1_000_000_000, true)
        .await
        .unwrap();

    let writes = cg.writes();
    let keys: Vec<&str> = writes.iter().map(|(k, _)| k.as_str()).collect();
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

    // First three writes clear to -1.
    assert!(writes[..3].iter().all(|(_, v)| v == "-1"));
    // Then the new values land, soft limit at 90%.
    assert_eq!(writes[3].1, "1000000000");
    assert_eq!(writes[4].1, "1000000000");
    assert_eq!(writes[5].1, "900000000");
}

#[tokio::test]
async fn test_memory_limit_without_swap_accounting() {
    let cg = RecordingCgroup::new();
    apply_memory_limit(&cg, "/lxc/c1", 1_000_000_000, false)
        .await
        .unwrap();

    let writes = cg.writes();
    assert!(writes.iter().all(|(k, _)| k != "memory.memsw.limit_in_bytes"));
}

#[tokio::test]
async fn test_memory_limit_failure_reverts_previous_values() {
    // The second write to the hard limit (the new value) fails.
    let cg = RecordingCgroup::failing_on("memory.limit_in_bytes", 1);
    let result = apply_memory_limit(&cg, "/lxc/c1", 1_000_000_000, true).await;
    assert!(result.is_err());

    // After the revert the original values are back.
    let values = cg.values.lock().unwrap().clone();
    assert_eq!(values["memory.limit_in_bytes"], "536870912");
    assert_eq!(values["memory.memsw.limit_in_bytes"], "536870912");
    assert_eq!(values["memory.soft_limit_in_bytes"], "483183820");
}
