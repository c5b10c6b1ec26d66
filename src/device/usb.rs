//! USB devices, matched against the host's USB enumeration by vendor and
//! product id.
//!
//! At start every present match is materialised like a unix-char device.
//! Absent optional devices are picked up later by the event bus when a
//! matching uevent arrives.

use super::{device_rule, escape_device_path, CgroupRule, Device, DeviceContext, MountEntry, RunConfig};
use crate::config::ConfigMap;
use crate::error::{Error, Result};
use async_trait::async_trait;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Char major of USB device nodes.
pub const USB_MAJOR: u32 = 189;

/// Host sysfs root of the USB enumeration.
pub const USB_SYS_PATH: &str = "/sys/bus/usb/devices";

/// One observed USB device on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedUsb {
    /// Zero-padded 4-digit hex vendor id.
    pub vendor: String,
    /// Zero-padded 4-digit hex product id.
    pub product: String,
    pub major: u32,
    pub minor: u32,
    /// Host device node path (`/dev/bus/usb/BBB/DDD`).
    pub path: PathBuf,
}

impl ObservedUsb {
    pub fn from_bus_address(vendor: &str, product: &str, busnum: u32, devnum: u32) -> Self {
        ObservedUsb {
            vendor: zero_pad(vendor, 4),
            product: zero_pad(product, 4),
            major: USB_MAJOR,
            minor: busnum.saturating_sub(1) * 128 + devnum.saturating_sub(1),
            path: PathBuf::from(format!("/dev/bus/usb/{busnum:03}/{devnum:03}")),
        }
    }
}

/// Left-pads with zeroes; udev omits the padding other tools apply.
pub fn zero_pad(value: &str, width: usize) -> String {
    format!("{value:0>width$}")
}

/// Whether a configured usb entry matches an observed device. An absent
/// vendorid/productid matches anything.
pub fn usb_config_matches(config: &ConfigMap, vendor: &str, product: &str) -> bool {
    if config.get("type").map(String::as_str) != Some("usb") {
        return false;
    }
    let want_vendor = config.get("vendorid").map(String::as_str).unwrap_or("");
    let want_product = config.get("productid").map(String::as_str).unwrap_or("");
    (want_vendor.is_empty() || want_vendor.eq_ignore_ascii_case(vendor))
        && (want_product.is_empty() || want_product.eq_ignore_ascii_case(product))
}

/// Reads the host's current USB enumeration from sysfs.
pub fn enumerate_usb(sys_path: &Path) -> Result<Vec<ObservedUsb>> {
    let mut observed = Vec::new();
    let entries = match std::fs::read_dir(sys_path) {
        Ok(entries) => entries,
        Err(_) => return Ok(observed),
    };

    for dirent in entries {
        let dir = dirent?.path();
        let read = |name: &str| -> Option<String> {
            std::fs::read_to_string(dir.join(name))
                .ok()
                .map(|s| s.trim().to_string())
        };

        let (Some(vendor), Some(product), Some(busnum), Some(devnum)) = (
            read("idVendor"),
            read("idProduct"),
            read("busnum"),
            read("devnum"),
        ) else {
            continue;
        };

        let (Ok(busnum), Ok(devnum)) = (busnum.parse::<u32>(), devnum.parse::<u32>()) else {
            continue;
        };

        observed.push(ObservedUsb::from_bus_address(
            &vendor, &product, busnum, devnum,
        ));
    }

    Ok(observed)
}

pub struct UsbDevice {
    name: String,
    config: ConfigMap,
    ctx: DeviceContext,
}

impl UsbDevice {
    pub fn new(name: &str, config: ConfigMap, ctx: DeviceContext) -> Self {
        UsbDevice {
            name: name.to_string(),
            config,
            ctx,
        }
    }

    fn get(&self, key: &str) -> &str {
        self.config.get(key).map(String::as_str).unwrap_or("")
    }

    /// Required defaults to false for usb devices: most are hotplugged.
    fn required(&self) -> bool {
        self.config
            .get("required")
            .map(|v| crate::config::is_true(v))
            .unwrap_or(false)
    }

    /// Materialises the node for one observed device.
    pub fn materialise(&self, observed: &ObservedUsb) -> Result<RunConfig> {
        let devices_dir = self.ctx.devices_dir();
        std::fs::create_dir_all(&devices_dir)?;

        let target = observed.path.to_string_lossy().to_string();
        let node_name = escape_device_path("usb", &target);
        let node_path = devices_dir.join(&node_name);
        if node_path.exists() {
            std::fs::remove_file(&node_path)?;
        }

        mknod(
            &node_path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o660),
            makedev(observed.major as u64, observed.minor as u64),
        )?;

        if let Some(map) = self.ctx.idmap() {
            std::os::unix::fs::lchown(
                &node_path,
                Some(map.shift_uid(0) as u32),
                Some(map.shift_gid(0) as u32),
            )?;
        }

        debug!(
            device = %self.name,
            node = %node_path.display(),
            vendor = %observed.vendor,
            product = %observed.product,
            "materialised usb device node"
        );

        Ok(RunConfig {
            mounts: vec![MountEntry {
                device: self.name.clone(),
                source: node_path,
                target,
                fstype: "none".to_string(),
                opts: vec!["bind".to_string(), "create=file".to_string()],
                shift: false,
            }],
            cgroup_rules: vec![CgroupRule {
                key: "devices.allow".to_string(),
                value: device_rule(false, observed.major, observed.minor),
            }],
            ..Default::default()
        })
    }

    /// Teardown counterpart of [`UsbDevice::materialise`].
    pub fn dematerialise(&self, observed: &ObservedUsb) -> Result<RunConfig> {
        let target = observed.path.to_string_lossy().to_string();
        let node_name = escape_device_path("usb", &target);
        let node_path = self.ctx.devices_dir().join(node_name);

        Ok(RunConfig {
            mounts: vec![MountEntry {
                device: self.name.clone(),
                source: node_path,
                target,
                fstype: "none".to_string(),
                opts: vec![],
                shift: false,
            }],
            cgroup_rules: vec![CgroupRule {
                key: "devices.deny".to_string(),
                value: device_rule(false, observed.major, observed.minor),
            }],
            ..Default::default()
        })
    }
}

#[async_trait]
impl Device for UsbDevice {
    fn kind(&self) -> &'static str {
        "usb"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        for key in ["vendorid", "productid"] {
            let value = self.get(key);
            if value.is_empty() {
                continue;
            }
            if value.len() != 4 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::Validation(format!(
                    "usb device '{}' has invalid {key} '{value}'",
                    self.name
                )));
            }
        }
        Ok(())
    }

    async fn start(&self, _is_running: bool) -> Result<RunConfig> {
        let observed = enumerate_usb(Path::new(USB_SYS_PATH))?;
        let matches: Vec<&ObservedUsb> = observed
            .iter()
            .filter(|o| usb_config_matches(&self.config, &o.vendor, &o.product))
            .collect();

        if matches.is_empty() {
            if self.required() {
                return Err(Error::MissingSource(PathBuf::from(format!(
                    "usb {}:{}",
                    self.get("vendorid"),
                    self.get("productid")
                ))));
            }
            // The event bus inserts it when a matching uevent arrives.
            return Ok(RunConfig::default());
        }

        let mut run = RunConfig::default();
        for observed in matches {
            let one = self.materialise(observed)?;
            run.mounts.extend(one.mounts);
            run.cgroup_rules.extend(one.cgroup_rules);
        }
        Ok(run)
    }

    fn can_hot_plug(&self) -> (bool, &'static [&'static str]) {
        (true, &[])
    }

    async fn stop(&self, _netns_path: Option<&str>) -> Result<RunConfig> {
        let observed = enumerate_usb(Path::new(USB_SYS_PATH))?;
        let mut run = RunConfig::default();
        for o in observed
            .iter()
            .filter(|o| usb_config_matches(&self.config, &o.vendor, &o.product))
        {
            let one = self.dematerialise(o)?;
            run.mounts.extend(one.mounts);
            run.cgroup_rules.extend(one.cgroup_rules);
        }
        Ok(run)
    }

    async fn remove(&self) -> Result<()> {
        // Nodes live under the devices dir; the driver clears leftovers
        // before every start and on delete.
        Ok(())
    }
}
