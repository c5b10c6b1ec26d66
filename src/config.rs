//! Instance configuration model.
//!
//! Instances carry two layers of configuration: the local layer stored for
//! the instance itself, and the expanded layer produced by applying the
//! instance's profiles in order with local values winning. Devices expand
//! the same way. Keys under `volatile.` are engine-owned and rejected in
//! user updates.

use crate::constants::{
    ENV_UNPRIVILEGED_ONLY, INSTANCE_NAME_VALID_CHARS, SNAPSHOT_SEPARATOR, VOLATILE_PREFIX,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered string→string configuration map.
pub type ConfigMap = BTreeMap<String, String>;

/// Ordered device-name → property-map collection.
pub type Devices = BTreeMap<String, ConfigMap>;

// =============================================================================
// Profiles
// =============================================================================

/// A profile contributes configuration and devices to every instance that
/// lists it. Profiles apply in list order; later profiles and finally the
/// instance's local layer override earlier values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub devices: Devices,
}

/// Layers profile config under the local config, local winning.
pub fn expand_config(local: &ConfigMap, profiles: &[Profile]) -> ConfigMap {
    let mut expanded = ConfigMap::new();
    for profile in profiles {
        for (k, v) in &profile.config {
            expanded.insert(k.clone(), v.clone());
        }
    }
    for (k, v) in local {
        expanded.insert(k.clone(), v.clone());
    }
    expanded
}

/// Layers profile devices under the local devices, local winning whole
/// entries (a local device with the same name replaces the profile's).
pub fn expand_devices(local: &Devices, profiles: &[Profile]) -> Devices {
    let mut expanded = Devices::new();
    for profile in profiles {
        for (name, entry) in &profile.devices {
            expanded.insert(name.clone(), entry.clone());
        }
    }
    for (name, entry) in local {
        expanded.insert(name.clone(), entry.clone());
    }
    expanded
}

// =============================================================================
// Volatile Keys
// =============================================================================

/// True when the key is engine-owned.
pub fn is_volatile(key: &str) -> bool {
    key.starts_with(VOLATILE_PREFIX)
}

/// Rejects user-initiated changes to engine-owned or image-sourced keys.
///
/// Compares old and new config: any `volatile.*` or `image.*` key that is
/// added, removed or modified fails validation. Unchanged keys pass, so
/// users can round-trip a full config dump.
pub fn check_user_keys(old: &ConfigMap, new: &ConfigMap) -> Result<()> {
    let protected = |k: &str| is_volatile(k) || k.starts_with("image.");

    for (key, value) in new {
        if protected(key) && old.get(key) != Some(value) {
            return Err(Error::VolatileKey(key.clone()));
        }
    }
    for key in old.keys() {
        if protected(key) && !new.contains_key(key) {
            return Err(Error::VolatileKey(key.clone()));
        }
    }
    Ok(())
}

// =============================================================================
// Names and Architectures
// =============================================================================

/// Validates an instance name (not a snapshot name).
pub fn validate_instance_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(Error::Validation(format!(
            "instance name '{name}' must be 1-63 characters"
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::Validation(format!(
            "instance name '{name}' may not start or end with a dash"
        )));
    }
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return Err(Error::Validation(format!(
            "instance name '{name}' may not start with a digit"
        )));
    }
    if !name.chars().all(|c| INSTANCE_NAME_VALID_CHARS.contains(c)) {
        return Err(Error::Validation(format!(
            "instance name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Splits `parent/snap` into its components, if the name is a snapshot name.
pub fn split_snapshot_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(SNAPSHOT_SEPARATOR)
}

/// Architectures the engine can set a runtime personality for.
pub const SUPPORTED_ARCHITECTURES: &[&str] = &[
    "x86_64", "i686", "aarch64", "armv7l", "ppc64le", "s390x", "riscv64",
];

/// Validates an architecture code.
pub fn validate_architecture(arch: &str) -> Result<()> {
    if SUPPORTED_ARCHITECTURES.contains(&arch) {
        return Ok(());
    }
    Err(Error::Validation(format!("unsupported architecture '{arch}'")))
}

/// Personality string the runtime expects for an architecture.
pub fn architecture_personality(arch: &str) -> &'static str {
    match arch {
        "i686" | "armv7l" => "linux32",
        _ => "linux64",
    }
}

// =============================================================================
// Value Parsing
// =============================================================================

/// Truthiness of a config value: "true", "1", "yes" and "on" are true.
pub fn is_true(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Truthiness of an optional config value; absent is false.
pub fn config_is_true(config: &ConfigMap, key: &str) -> bool {
    config.get(key).map(|v| is_true(v)).unwrap_or(false)
}

/// Parses a human byte size ("512MB", "1GB", "10GiB", "4096") into bytes.
pub fn parse_byte_size(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Validation("empty size value".into()));
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    let number: u64 = digits
        .parse()
        .map_err(|_| Error::Validation(format!("invalid size value '{value}'")))?;

    let multiplier: u64 = match suffix.trim() {
        "" | "B" => 1,
        "kB" | "KB" => 1000,
        "MB" => 1000 * 1000,
        "GB" => 1000 * 1000 * 1000,
        "TB" => 1000u64.pow(4),
        "KiB" => 1024,
        "MiB" => 1024 * 1024,
        "GiB" => 1024 * 1024 * 1024,
        "TiB" => 1024u64.pow(4),
        other => {
            return Err(Error::Validation(format!(
                "invalid size suffix '{other}' in '{value}'"
            )))
        }
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Validation(format!("size '{value}' overflows")))
}

/// Parses a bit rate ("10Mbit", "500kbit") into bits per second.
pub fn parse_bit_rate(value: &str) -> Result<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    let number: u64 = digits
        .parse()
        .map_err(|_| Error::Validation(format!("invalid rate value '{value}'")))?;

    let multiplier: u64 = match suffix.trim() {
        "" | "bit" => 1,
        "kbit" => 1000,
        "Mbit" => 1000 * 1000,
        "Gbit" => 1000 * 1000 * 1000,
        "Tbit" => 1000u64.pow(4),
        other => {
            return Err(Error::Validation(format!(
                "invalid rate suffix '{other}' in '{value}'"
            )))
        }
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Validation(format!("rate '{value}' overflows")))
}

// =============================================================================
// Raw Runtime Keys
// =============================================================================

/// True when the deployment refuses privileged containers.
pub fn unprivileged_only() -> bool {
    std::env::var(ENV_UNPRIVILEGED_ONLY)
        .map(|v| is_true(&v))
        .unwrap_or(false)
}

/// Parses one `raw.lxc` line into a `(key, value)` pair.
///
/// Empty lines and `#` comments yield `None`. Anything else must be a
/// `key=value` pair.
pub fn parse_raw_runtime_line(line: &str) -> Result<Option<(String, String)>> {
    let line = line.trim_start_matches(['\t', ' ']);
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let Some((key, value)) = line.split_once('=') else {
        return Err(Error::Validation(format!("invalid raw.lxc line: {line}")));
    };

    Ok(Some((
        key.trim_matches([' ', '\t']).to_lowercase(),
        value.trim_matches([' ', '\t']).to_string(),
    )))
}

/// Validates a full `raw.lxc` blob against the key blacklist.
pub fn validate_raw_runtime(raw: &str) -> Result<()> {
    validate_raw_runtime_for(raw, unprivileged_only())
}

/// Blacklist enforcement with an explicit unprivileged-only flag.
pub fn validate_raw_runtime_for(raw: &str, unpriv_only: bool) -> Result<()> {
    for line in raw.lines() {
        let Some((key, _)) = parse_raw_runtime_line(line)? else {
            continue;
        };

        if unpriv_only && matches!(key.as_str(), "lxc.idmap" | "lxc.id_map" | "lxc.include") {
            return Err(Error::Validation(format!(
                "{key} can't be set in raw.lxc on an unprivileged-only host"
            )));
        }

        match key.as_str() {
            "lxc.logfile" | "lxc.log.file" => {
                return Err(Error::Validation("setting lxc.logfile is not allowed".into()))
            }
            "lxc.syslog" | "lxc.log.syslog" => {
                return Err(Error::Validation(
                    "setting lxc.log.syslog is not allowed".into(),
                ))
            }
            "lxc.ephemeral" => {
                return Err(Error::Validation(
                    "setting lxc.ephemeral is not allowed".into(),
                ))
            }
            _ => {}
        }

        if key.starts_with("lxc.prlimit.") {
            return Err(Error::Validation(
                "process limits should be set via limits.kernel.[name], not lxc.prlimit.[name]"
                    .into(),
            ));
        }

        if key.starts_with("lxc.net.") {
            // Only per-interface ipv4/ipv6 address and gateway keys pass.
            let fields: Vec<&str> = key.split('.').collect();
            let ok = fields.len() == 5
                && matches!(fields[3], "ipv4" | "ipv6")
                && matches!(fields[4], "address" | "gateway");
            if !ok {
                return Err(Error::Validation(
                    "only interface-specific ipv4/ipv6 lxc.net. keys are allowed".into(),
                ));
            }
        }
    }

    Ok(())
}

// =============================================================================
// Instance Config Validation
// =============================================================================

/// Key namespaces a user may set on an instance.
const USER_KEY_PREFIXES: &[&str] = &[
    "boot.",
    "environment.",
    "limits.",
    "linux.",
    "nvidia.",
    "raw.",
    "security.",
    "snapshots.",
    "user.",
    "volatile.",
    "image.",
    "migration.",
];

/// Validates a full instance config map (expanded or local).
pub fn validate_config(config: &ConfigMap) -> Result<()> {
    for (key, value) in config {
        if !USER_KEY_PREFIXES.iter().any(|p| key.starts_with(p)) {
            return Err(Error::Validation(format!("unknown config key '{key}'")));
        }

        match key.as_str() {
            "limits.memory" => {
                if !value.ends_with('%') {
                    parse_byte_size(value)?;
                }
            }
            "limits.processes" => {
                value.parse::<i64>().map_err(|_| {
                    Error::Validation(format!("limits.processes '{value}' is not an integer"))
                })?;
            }
            "limits.network.priority" => {
                value.parse::<u32>().map_err(|_| {
                    Error::Validation(format!(
                        "limits.network.priority '{value}' is not an integer"
                    ))
                })?;
            }
            "raw.lxc" => validate_raw_runtime(value)?,
            "security.idmap.size" => {
                value.parse::<u64>().map_err(|_| {
                    Error::Validation(format!("security.idmap.size '{value}' is not an integer"))
                })?;
            }
            "security.idmap.base" => {
                value.parse::<u64>().map_err(|_| {
                    Error::Validation(format!("security.idmap.base '{value}' is not an integer"))
                })?;
            }
            _ => {}
        }
    }
    Ok(())
}
