//! Unix character and block devices.
//!
//! The node is materialised under the instance's devices directory with
//! ownership shifted into the container's idmap, then bind-mounted into
//! place, with a matching cgroup `devices.allow` rule.

use super::{device_rule, escape_device_path, Device, DeviceContext, CgroupRule, MountEntry, RunConfig};
use crate::config::ConfigMap;
use crate::error::{Error, Result};
use async_trait::async_trait;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use tracing::debug;

pub struct UnixDevice {
    name: String,
    config: ConfigMap,
    ctx: DeviceContext,
    block: bool,
}

impl UnixDevice {
    pub fn new(name: &str, config: ConfigMap, ctx: DeviceContext, block: bool) -> Self {
        UnixDevice {
            name: name.to_string(),
            config,
            ctx,
            block,
        }
    }

    fn get(&self, key: &str) -> &str {
        self.config.get(key).map(String::as_str).unwrap_or("")
    }

    /// In-container path of the node: `path`, falling back to `source`.
    fn target_path(&self) -> &str {
        let path = self.get("path");
        if path.is_empty() {
            self.get("source")
        } else {
            path
        }
    }

    /// Host path the major/minor can be derived from.
    fn source_path(&self) -> &str {
        let source = self.get("source");
        if source.is_empty() {
            self.get("path")
        } else {
            source
        }
    }

    /// Required defaults to true for unix devices.
    fn required(&self) -> bool {
        match self.config.get("required") {
            Some(v) => crate::config::is_true(v),
            None => true,
        }
    }

    fn parse_id(&self, key: &str) -> Result<Option<u32>> {
        let raw = self.get(key);
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<u32>()
            .map(Some)
            .map_err(|_| Error::Validation(format!("invalid {key} '{raw}' on '{}'", self.name)))
    }

    fn parse_mode(&self) -> Result<u32> {
        let raw = self.get("mode");
        if raw.is_empty() {
            return Ok(0o660);
        }
        u32::from_str_radix(raw, 8)
            .map_err(|_| Error::Validation(format!("invalid mode '{raw}' on '{}'", self.name)))
    }

    /// Resolves the device numbers: explicit config wins, else the host
    /// node is stat'ed.
    fn device_numbers(&self) -> Result<(u32, u32)> {
        let major = self.parse_id("major")?;
        let minor = self.parse_id("minor")?;
        if let (Some(major), Some(minor)) = (major, minor) {
            return Ok((major, minor));
        }

        let source = self.source_path();
        let meta = std::fs::metadata(source)
            .map_err(|_| Error::MissingSource(PathBuf::from(source)))?;
        let rdev = meta.rdev();
        Ok((
            major.unwrap_or(nix::sys::stat::major(rdev) as u32),
            minor.unwrap_or(nix::sys::stat::minor(rdev) as u32),
        ))
    }

    /// Creates the node under the devices directory and returns the
    /// mount + cgroup contribution.
    fn materialise(&self, major: u32, minor: u32) -> Result<RunConfig> {
        let devices_dir = self.ctx.devices_dir();
        std::fs::create_dir_all(&devices_dir)?;

        let node_name = escape_device_path(
            if self.block { "unix-block" } else { "unix-char" },
            self.target_path(),
        );
        let node_path = devices_dir.join(&node_name);
        if node_path.exists() {
            std::fs::remove_file(&node_path)?;
        }

        let kind = if self.block {
            SFlag::S_IFBLK
        } else {
            SFlag::S_IFCHR
        };
        let mode = Mode::from_bits_truncate(self.parse_mode()?);
        mknod(&node_path, kind, mode, makedev(major as u64, minor as u64))?;

        // Shift ownership so the configured uid/gid are correct inside
        // the container.
        let uid = self.parse_id("uid")?.unwrap_or(0) as u64;
        let gid = self.parse_id("gid")?.unwrap_or(0) as u64;
        let (host_uid, host_gid) = match self.ctx.idmap() {
            Some(map) => (map.shift_uid(uid), map.shift_gid(gid)),
            None => (uid, gid),
        };
        std::os::unix::fs::lchown(&node_path, Some(host_uid as u32), Some(host_gid as u32))?;

        debug!(
            device = %self.name,
            node = %node_path.display(),
            major,
            minor,
            "materialised unix device node"
        );

        Ok(RunConfig {
            mounts: vec![MountEntry {
                device: self.name.clone(),
                source: node_path,
                target: self.target_path().to_string(),
                fstype: "none".to_string(),
                opts: vec!["bind".to_string(), "create=file".to_string()],
                shift: false,
            }],
            cgroup_rules: vec![CgroupRule {
                key: "devices.allow".to_string(),
                value: device_rule(self.block, major, minor),
            }],
            ..Default::default()
        })
    }
}

#[async_trait]
impl Device for UnixDevice {
    fn kind(&self) -> &'static str {
        if self.block {
            "unix-block"
        } else {
            "unix-char"
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        if self.get("source").is_empty() && self.get("path").is_empty() {
            return Err(Error::Validation(format!(
                "unix device '{}' requires a source or path",
                self.name
            )));
        }
        self.parse_id("major")?;
        self.parse_id("minor")?;
        self.parse_id("uid")?;
        self.parse_id("gid")?;
        self.parse_mode()?;
        Ok(())
    }

    async fn start(&self, _is_running: bool) -> Result<RunConfig> {
        match self.device_numbers() {
            Ok((major, minor)) => self.materialise(major, minor),
            Err(Error::MissingSource(path)) if !self.required() => {
                // The driver arms an inotify ancestor watch for the
                // source instead of failing.
                debug!(device = %self.name, source = %path.display(), "optional unix device absent");
                Ok(RunConfig::default())
            }
            Err(e) => Err(e),
        }
    }

    fn can_hot_plug(&self) -> (bool, &'static [&'static str]) {
        (true, &[])
    }

    async fn stop(&self, _netns_path: Option<&str>) -> Result<RunConfig> {
        let mut run = RunConfig::default();

        if let Ok((major, minor)) = self.device_numbers() {
            run.cgroup_rules.push(CgroupRule {
                key: "devices.deny".to_string(),
                value: device_rule(self.block, major, minor),
            });
        }

        let node_name = escape_device_path(
            if self.block { "unix-block" } else { "unix-char" },
            self.target_path(),
        );
        let node_path = self.ctx.devices_dir().join(node_name);
        run.mounts.push(MountEntry {
            device: self.name.clone(),
            source: node_path,
            target: self.target_path().to_string(),
            fstype: "none".to_string(),
            opts: vec![],
            shift: false,
        });

        Ok(run)
    }

    async fn remove(&self) -> Result<()> {
        let node_name = escape_device_path(
            if self.block { "unix-block" } else { "unix-char" },
            self.target_path(),
        );
        let node_path = self.ctx.devices_dir().join(node_name);
        if node_path.exists() {
            std::fs::remove_file(&node_path)?;
        }
        Ok(())
    }
}
