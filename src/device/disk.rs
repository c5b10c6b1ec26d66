//! Disk device: bind-mounts a host path (or a pool volume) into the
//! container.

use super::{Device, DeviceContext, MountEntry, RunConfig};
use crate::config::{config_is_true, parse_byte_size, ConfigMap};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;

/// Mount propagation values the kernel accepts.
const PROPAGATION_VALUES: &[&str] = &[
    "private",
    "shared",
    "slave",
    "unbindable",
    "rprivate",
    "rshared",
    "rslave",
    "runbindable",
];

pub struct DiskDevice {
    name: String,
    config: ConfigMap,
    #[allow(dead_code)]
    ctx: DeviceContext,
}

impl DiskDevice {
    pub fn new(name: &str, config: ConfigMap, ctx: DeviceContext) -> Self {
        DiskDevice {
            name: name.to_string(),
            config,
            ctx,
        }
    }

    fn get(&self, key: &str) -> &str {
        self.config.get(key).map(String::as_str).unwrap_or("")
    }

    /// True when this entry is the root disk (`path` is `/`).
    pub fn is_root(&self) -> bool {
        self.get("path") == "/"
    }

    fn source(&self) -> PathBuf {
        PathBuf::from(self.get("source"))
    }
}

#[async_trait]
impl Device for DiskDevice {
    fn kind(&self) -> &'static str {
        "disk"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        let path = self.get("path");
        if path.is_empty() {
            return Err(Error::Validation(format!(
                "disk '{}' requires a path",
                self.name
            )));
        }

        if self.is_root() {
            if !self.get("source").is_empty() {
                return Err(Error::Validation(format!(
                    "root disk '{}' may not have a source",
                    self.name
                )));
            }
            if self.get("pool").is_empty() {
                return Err(Error::Validation(format!(
                    "root disk '{}' requires a pool",
                    self.name
                )));
            }
        } else if self.get("source").is_empty() {
            return Err(Error::Validation(format!(
                "disk '{}' requires a source",
                self.name
            )));
        }

        let propagation = self.get("propagation");
        if !propagation.is_empty() && !PROPAGATION_VALUES.contains(&propagation) {
            return Err(Error::Validation(format!(
                "disk '{}' has invalid propagation '{propagation}'",
                self.name
            )));
        }

        for key in ["limits.read", "limits.write", "limits.max"] {
            let value = self.get(key);
            if !value.is_empty() && !value.ends_with("iops") {
                parse_byte_size(value)?;
            }
        }

        if !self.get("size").is_empty() {
            parse_byte_size(self.get("size"))?;
        }

        Ok(())
    }

    async fn start(&self, _is_running: bool) -> Result<RunConfig> {
        // The root disk is materialised by the storage layer; the device
        // only contributes block I/O limits, which the driver computes
        // across all disks in one pass.
        if self.is_root() {
            return Ok(RunConfig::default());
        }

        let source = self.source();
        let optional = config_is_true(&self.config, "optional");
        if !source.exists() {
            if optional {
                // The driver arms an inotify ancestor watch instead.
                return Ok(RunConfig::default());
            }
            return Err(Error::MissingSource(source));
        }

        let mut opts = Vec::new();
        if config_is_true(&self.config, "recursive") {
            opts.push("rbind".to_string());
        } else {
            opts.push("bind".to_string());
        }
        if config_is_true(&self.config, "readonly") {
            opts.push("ro".to_string());
        }
        if source.is_dir() {
            opts.push("create=dir".to_string());
        } else {
            opts.push("create=file".to_string());
        }
        let propagation = self.get("propagation");
        if !propagation.is_empty() {
            opts.push(propagation.to_string());
        }
        opts.push("optional".to_string());

        Ok(RunConfig {
            mounts: vec![MountEntry {
                device: self.name.clone(),
                source,
                target: self.get("path").to_string(),
                fstype: "none".to_string(),
                opts,
                shift: config_is_true(&self.config, "shift"),
            }],
            ..Default::default()
        })
    }

    fn can_hot_plug(&self) -> (bool, &'static [&'static str]) {
        (true, &["limits.read", "limits.write", "limits.max", "size"])
    }

    async fn stop(&self, _netns_path: Option<&str>) -> Result<RunConfig> {
        if self.is_root() {
            return Ok(RunConfig::default());
        }
        Ok(RunConfig {
            mounts: vec![MountEntry {
                device: self.name.clone(),
                source: self.source(),
                target: self.get("path").to_string(),
                fstype: "none".to_string(),
                opts: vec![],
                shift: false,
            }],
            ..Default::default()
        })
    }
}
