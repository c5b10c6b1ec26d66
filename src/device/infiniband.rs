//! Infiniband devices: the parent interface moves into the container and
//! the matching verbs char devices are bound in.

use super::{device_rule, CgroupRule, Device, DeviceContext, MountEntry, RunConfig};
use crate::config::ConfigMap;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Host directory holding verbs device nodes.
const INFINIBAND_DEV_DIR: &str = "/dev/infiniband";

pub struct InfinibandDevice {
    name: String,
    config: ConfigMap,
    #[allow(dead_code)]
    ctx: DeviceContext,
}

impl InfinibandDevice {
    pub fn new(name: &str, config: ConfigMap, ctx: DeviceContext) -> Self {
        InfinibandDevice {
            name: name.to_string(),
            config,
            ctx,
        }
    }

    fn get(&self, key: &str) -> &str {
        self.config.get(key).map(String::as_str).unwrap_or("")
    }

    /// Verbs nodes belonging to the parent interface.
    fn verbs_nodes(&self) -> Result<Vec<(std::path::PathBuf, u32, u32)>> {
        let mut nodes = Vec::new();
        let dir = Path::new(INFINIBAND_DEV_DIR);
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(nodes),
        };

        for dirent in entries {
            let path = dirent?.path();
            let meta = std::fs::metadata(&path)?;
            let rdev = meta.rdev();
            nodes.push((
                path,
                nix::sys::stat::major(rdev) as u32,
                nix::sys::stat::minor(rdev) as u32,
            ));
        }
        Ok(nodes)
    }
}

#[async_trait]
impl Device for InfinibandDevice {
    fn kind(&self) -> &'static str {
        "infiniband"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        if self.get("parent").is_empty() {
            return Err(Error::Validation(format!(
                "infiniband device '{}' requires a parent",
                self.name
            )));
        }
        if !self.get("mtu").is_empty() {
            self.get("mtu").parse::<u32>().map_err(|_| {
                Error::Validation(format!(
                    "infiniband device '{}' has invalid mtu",
                    self.name
                ))
            })?;
        }
        Ok(())
    }

    async fn start(&self, _is_running: bool) -> Result<RunConfig> {
        let mut kv = vec![
            ("type".to_string(), "phys".to_string()),
            ("flags".to_string(), "up".to_string()),
            ("link".to_string(), self.get("parent").to_string()),
        ];

        let guest_name = if self.get("name").is_empty() {
            "ib0".to_string()
        } else {
            self.get("name").to_string()
        };
        kv.push(("name".to_string(), guest_name));

        if !self.get("mtu").is_empty() {
            kv.push(("mtu".to_string(), self.get("mtu").to_string()));
        }

        let mut mounts = Vec::new();
        let mut cgroup_rules = Vec::new();
        for (path, major, minor) in self.verbs_nodes()? {
            let target = path.to_string_lossy().to_string();
            mounts.push(MountEntry {
                device: self.name.clone(),
                source: path,
                target,
                fstype: "none".to_string(),
                opts: vec!["bind".to_string(), "create=file".to_string()],
                shift: false,
            });
            cgroup_rules.push(CgroupRule {
                key: "devices.allow".to_string(),
                value: device_rule(false, major, minor),
            });
        }

        Ok(RunConfig {
            mounts,
            cgroup_rules,
            network_interface: kv,
            ..Default::default()
        })
    }

    fn can_hot_plug(&self) -> (bool, &'static [&'static str]) {
        (false, &["mtu"])
    }

    async fn stop(&self, netns_path: Option<&str>) -> Result<RunConfig> {
        let mut kv = vec![
            (
                "name".to_string(),
                if self.get("name").is_empty() {
                    "ib0".to_string()
                } else {
                    self.get("name").to_string()
                },
            ),
            ("host_name".to_string(), self.get("parent").to_string()),
        ];
        if let Some(netns) = netns_path {
            kv.push(("netns".to_string(), netns.to_string()));
        }

        Ok(RunConfig {
            network_interface: kv,
            ..Default::default()
        })
    }
}
