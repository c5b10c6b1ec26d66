//! Tests for the device registry and the typed device kinds.
//!
//! Validates per-kind config validation, RunConfig production, MAC
//! reservation, USB matching, and the legacy fall-through sentinel.

use silo::config::ConfigMap;
use silo::device::{
    load_device, usb_config_matches, Device, DeviceContext, DeviceHost, ObservedUsb,
};
use silo::idmap::IdmapSet;
use silo::instance::{diff_devices, DeviceDiff};
use silo::Error;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// =============================================================================
// Test Host
// =============================================================================

/// In-memory device host capturing volatile writes.
struct TestHost {
    devices_dir: PathBuf,
    privileged: bool,
    volatile: Mutex<BTreeMap<String, String>>,
}

impl TestHost {
    fn new(devices_dir: PathBuf) -> Arc<Self> {
        Arc::new(TestHost {
            devices_dir,
            privileged: true,
            volatile: Mutex::new(BTreeMap::new()),
        })
    }
}

impl DeviceHost for TestHost {
    fn instance_name(&self) -> String {
        "c1".into()
    }

    fn project(&self) -> String {
        "default".into()
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn devices_dir(&self) -> PathBuf {
        self.devices_dir.clone()
    }

    fn idmap(&self) -> Option<IdmapSet> {
        None
    }

    fn volatile_get(&self, device: &str, key: &str) -> Option<String> {
        self.volatile
            .lock()
            .unwrap()
            .get(&format!("volatile.{device}.{key}"))
            .cloned()
    }

    fn volatile_set(&self, device: &str, changes: BTreeMap<String, String>) -> silo::Result<()> {
        let mut volatile = self.volatile.lock().unwrap();
        for (key, value) in changes {
            volatile.insert(format!("volatile.{device}.{key}"), value);
        }
        Ok(())
    }
}

fn ctx(host: &Arc<TestHost>, device: &str) -> DeviceContext {
    DeviceContext::new(Arc::clone(host) as Arc<dyn DeviceHost>, device)
}

fn entry(pairs: &[(&str, &str)]) -> ConfigMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// =============================================================================
// Registry Tests
// =============================================================================

#[test]
fn test_unknown_type_is_rejected() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    let result = load_device("bad", &entry(&[("type", "warp-drive")]), ctx(&host, "bad"));
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[test]
fn test_missing_type_is_rejected() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    let result = load_device("bad", &entry(&[]), ctx(&host, "bad"));
    assert!(result.is_err());
}

#[tokio::test]
async fn test_legacy_kind_falls_through() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    let device = load_device("g", &entry(&[("type", "gpu")]), ctx(&host, "g")).unwrap();
    let err = device.start(false).await.unwrap_err();
    assert!(err.is_unsupported_dev_type());
}

// =============================================================================
// Disk Tests
// =============================================================================

#[test]
fn test_disk_validation() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    // Missing path.
    assert!(load_device("d", &entry(&[("type", "disk"), ("source", "/x")]), ctx(&host, "d")).is_err());
    // Non-root without source.
    assert!(load_device("d", &entry(&[("type", "disk"), ("path", "/data")]), ctx(&host, "d")).is_err());
    // Root with source.
    assert!(load_device(
        "root",
        &entry(&[("type", "disk"), ("path", "/"), ("source", "/x"), ("pool", "p0")]),
        ctx(&host, "root")
    )
    .is_err());
    // Root needs a pool.
    assert!(load_device(
        "root",
        &entry(&[("type", "disk"), ("path", "/")]),
        ctx(&host, "root")
    )
    .is_err());
    // Valid root.
    assert!(load_device(
        "root",
        &entry(&[("type", "disk"), ("path", "/"), ("pool", "p0")]),
        ctx(&host, "root")
    )
    .is_ok());
    // Invalid propagation.
    assert!(load_device(
        "d",
        &entry(&[("type", "disk"), ("path", "/d"), ("source", "/x"), ("propagation", "sideways")]),
        ctx(&host, "d")
    )
    .is_err());
}

#[tokio::test]
async fn test_disk_start_produces_bind_mount() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().join("devices"));
    let source = temp.path().join("share");
    std::fs::create_dir(&source).unwrap();

    let config = entry(&[
        ("type", "disk"),
        ("path", "/data"),
        ("readonly", "true"),
    ]);
    let mut config = config;
    config.insert("source".into(), source.display().to_string());

    let device = load_device("share", &config, ctx(&host, "share")).unwrap();
    let run = device.start(false).await.unwrap();

    assert_eq!(run.mounts.len(), 1);
    let mount = &run.mounts[0];
    assert_eq!(mount.source, source);
    assert_eq!(mount.target, "/data");
    assert!(mount.opts.contains(&"bind".to_string()));
    assert!(mount.opts.contains(&"ro".to_string()));
    assert!(mount.opts.contains(&"create=dir".to_string()));
}

#[tokio::test]
async fn test_optional_disk_with_missing_source_is_empty() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    let config = entry(&[
        ("type", "disk"),
        ("path", "/data"),
        ("source", "/definitely/not/here"),
        ("optional", "true"),
    ]);
    let device = load_device("late", &config, ctx(&host, "late")).unwrap();
    let run = device.start(false).await.unwrap();
    assert!(run.is_empty());
}

#[tokio::test]
async fn test_required_disk_with_missing_source_fails() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    let config = entry(&[
        ("type", "disk"),
        ("path", "/data"),
        ("source", "/definitely/not/here"),
    ]);
    let device = load_device("gone", &config, ctx(&host, "gone")).unwrap();
    assert!(matches!(
        device.start(false).await,
        Err(Error::MissingSource(_))
    ));
}

// =============================================================================
// NIC Tests
// =============================================================================

#[test]
fn test_nic_validation() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    assert!(load_device("n", &entry(&[("type", "nic")]), ctx(&host, "n")).is_err());
    assert!(load_device(
        "n",
        &entry(&[("type", "nic"), ("nictype", "bridged")]),
        ctx(&host, "n")
    )
    .is_err());
    assert!(load_device(
        "n",
        &entry(&[("type", "nic"), ("nictype", "bridged"), ("parent", "br0")]),
        ctx(&host, "n")
    )
    .is_ok());
    assert!(load_device(
        "n",
        &entry(&[
            ("type", "nic"),
            ("nictype", "bridged"),
            ("parent", "br0"),
            ("hwaddr", "not-a-mac")
        ]),
        ctx(&host, "n")
    )
    .is_err());
}

#[tokio::test]
async fn test_nic_add_reserves_stable_mac() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    let config = entry(&[("type", "nic"), ("nictype", "bridged"), ("parent", "br0")]);
    let device = load_device("eth0", &config, ctx(&host, "eth0")).unwrap();

    device.add().await.unwrap();
    let mac = host
        .volatile_get("eth0", "hwaddr")
        .expect("hwaddr reserved in volatile");
    assert!(mac.starts_with("00:16:3e:"), "{mac}");

    // A second add keeps the reservation.
    device.add().await.unwrap();
    assert_eq!(host.volatile_get("eth0", "hwaddr").unwrap(), mac);
}

#[tokio::test]
async fn test_nic_start_produces_interface_kv() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    let config = entry(&[
        ("type", "nic"),
        ("nictype", "bridged"),
        ("parent", "silobr0"),
        ("name", "eth0"),
    ]);
    let device = load_device("eth0", &config, ctx(&host, "eth0")).unwrap();
    let run = device.start(false).await.unwrap();

    let kv: BTreeMap<_, _> = run.network_interface.iter().cloned().collect();
    assert_eq!(kv["type"], "veth");
    assert_eq!(kv["link"], "silobr0");
    assert_eq!(kv["name"], "eth0");
    assert!(kv.contains_key("hwaddr"));
}

#[tokio::test]
async fn test_nic_stop_with_netns_names_host_side() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    let config = entry(&[
        ("type", "nic"),
        ("nictype", "physical"),
        ("parent", "ib0p0"),
        ("name", "eth1"),
    ]);
    let device = load_device("port", &config, ctx(&host, "port")).unwrap();
    let run = device.stop(Some("/proc/1234/ns/net")).await.unwrap();

    let kv: BTreeMap<_, _> = run.network_interface.iter().cloned().collect();
    assert_eq!(kv["name"], "eth1");
    assert_eq!(kv["host_name"], "ib0p0");
    assert_eq!(kv["netns"], "/proc/1234/ns/net");
}

// =============================================================================
// Unix Device Tests
// =============================================================================

#[test]
fn test_unix_validation() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    assert!(load_device("u", &entry(&[("type", "unix-char")]), ctx(&host, "u")).is_err());
    assert!(load_device(
        "u",
        &entry(&[("type", "unix-char"), ("path", "/dev/x"), ("major", "ten")]),
        ctx(&host, "u")
    )
    .is_err());
    assert!(load_device(
        "u",
        &entry(&[("type", "unix-char"), ("path", "/dev/x"), ("mode", "99x9")]),
        ctx(&host, "u")
    )
    .is_err());
    assert!(load_device(
        "u",
        &entry(&[
            ("type", "unix-char"),
            ("path", "/dev/x"),
            ("major", "10"),
            ("minor", "200"),
            ("mode", "0660")
        ]),
        ctx(&host, "u")
    )
    .is_ok());
}

#[tokio::test]
async fn test_optional_unix_device_missing_source_is_empty() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    let config = entry(&[
        ("type", "unix-char"),
        ("path", "/dev/not/here"),
        ("required", "false"),
    ]);
    let device = load_device("u", &config, ctx(&host, "u")).unwrap();
    let run = device.start(false).await.unwrap();
    assert!(run.is_empty());
}

// =============================================================================
// USB Tests
// =============================================================================

#[test]
fn test_usb_validation() {
    let temp = TempDir::new().unwrap();
    let host = TestHost::new(temp.path().into());

    assert!(load_device(
        "u",
        &entry(&[("type", "usb"), ("vendorid", "1234"), ("productid", "5678")]),
        ctx(&host, "u")
    )
    .is_ok());
    assert!(load_device(
        "u",
        &entry(&[("type", "usb"), ("vendorid", "12345")]),
        ctx(&host, "u")
    )
    .is_err());
    assert!(load_device(
        "u",
        &entry(&[("type", "usb"), ("productid", "xyzw")]),
        ctx(&host, "u")
    )
    .is_err());
}

#[test]
fn test_usb_matching() {
    let exact = entry(&[("type", "usb"), ("vendorid", "1234"), ("productid", "5678")]);
    assert!(usb_config_matches(&exact, "1234", "5678"));
    assert!(!usb_config_matches(&exact, "1234", "9999"));
    assert!(!usb_config_matches(&exact, "9999", "5678"));

    // Absent fields match anything.
    let vendor_only = entry(&[("type", "usb"), ("vendorid", "1234")]);
    assert!(usb_config_matches(&vendor_only, "1234", "0001"));
    assert!(usb_config_matches(&vendor_only, "1234", "ffff"));

    let wildcard = entry(&[("type", "usb")]);
    assert!(usb_config_matches(&wildcard, "aaaa", "bbbb"));

    // Only usb entries match.
    let disk = entry(&[("type", "disk"), ("path", "/"), ("pool", "p0")]);
    assert!(!usb_config_matches(&disk, "1234", "5678"));
}

#[test]
fn test_observed_usb_from_bus_address() {
    let observed = ObservedUsb::from_bus_address("123", "45", 1, 5);
    assert_eq!(observed.vendor, "0123");
    assert_eq!(observed.product, "0045");
    assert_eq!(observed.major, 189);
    assert_eq!(observed.minor, 4);
    assert_eq!(observed.path, PathBuf::from("/dev/bus/usb/001/005"));
}

// =============================================================================
// Device Diff Tests
// =============================================================================

fn devices(entries: &[(&str, &[(&str, &str)])]) -> silo::Devices {
    entries
        .iter()
        .map(|(name, pairs)| (name.to_string(), entry(pairs)))
        .collect()
}

#[test]
fn test_diff_classifies_added_and_removed() {
    let old = devices(&[("a", &[("type", "disk"), ("path", "/a"), ("source", "/x")])]);
    let new = devices(&[("b", &[("type", "disk"), ("path", "/b"), ("source", "/y")])]);

    let diff = diff_devices(&old, &new, |_, _| vec![]);
    assert_eq!(
        diff,
        DeviceDiff {
            removed: vec!["a".into()],
            added: vec!["b".into()],
            updated: vec![],
        }
    );
}

#[test]
fn test_diff_update_requires_advertised_fields() {
    let old = devices(&[(
        "d",
        &[("type", "disk"), ("path", "/d"), ("source", "/x"), ("limits.read", "10MB")],
    )]);
    let new = devices(&[(
        "d",
        &[("type", "disk"), ("path", "/d"), ("source", "/x"), ("limits.read", "20MB")],
    )]);

    // Advertised as live-updatable: a pure update.
    let diff = diff_devices(&old, &new, |_, _| vec!["limits.read"]);
    assert_eq!(diff.updated, vec!["d".to_string()]);
    assert!(diff.removed.is_empty());

    // Not advertised: remove + add cycle.
    let diff = diff_devices(&old, &new, |_, _| vec![]);
    assert!(diff.updated.is_empty());
    assert_eq!(diff.removed, vec!["d".to_string()]);
    assert_eq!(diff.added, vec!["d".to_string()]);
}

#[test]
fn test_diff_type_change_is_never_an_update() {
    let old = devices(&[("x", &[("type", "unix-char"), ("path", "/dev/x")])]);
    let new = devices(&[("x", &[("type", "unix-block"), ("path", "/dev/x")])]);

    let diff = diff_devices(&old, &new, |_, _| vec!["path"]);
    assert_eq!(diff.removed, vec!["x".to_string()]);
    assert_eq!(diff.added, vec!["x".to_string()]);
}

#[test]
fn test_diff_identical_maps_are_empty() {
    let devs = devices(&[("a", &[("type", "disk"), ("path", "/"), ("pool", "p0")])]);
    let diff = diff_devices(&devs, &devs, |_, _| vec![]);
    assert_eq!(diff, DeviceDiff::default());
}
