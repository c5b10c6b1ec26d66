//! Image template application.
//!
//! Images ship a `metadata.yaml` describing template files to render into
//! the rootfs at specific lifecycle triggers. Create/copy triggers are
//! deferred through `volatile.apply_template` and applied at the next
//! start, followed by the start trigger itself.
//!
//! Rendering is rooted at the container rootfs: target paths are resolved
//! inside it and may not escape upward.

use crate::constants::{METADATA_FILE, TEMPLATES_DIR};
use crate::error::{Error, Result};
use crate::instance::InstanceDriver;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Triggers
// =============================================================================

/// Lifecycle points a template can fire at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Create,
    Copy,
    Start,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Create => "create",
            Trigger::Copy => "copy",
            Trigger::Start => "start",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Trigger::Create),
            "copy" => Ok(Trigger::Copy),
            "start" => Ok(Trigger::Start),
            other => Err(Error::Validation(format!("unknown template trigger '{other}'"))),
        }
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// One template declaration from the image metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateEntry {
    /// File name under the image's `templates/` directory.
    pub template: String,
    /// Triggers the template fires at.
    #[serde(default)]
    pub when: Vec<String>,
    /// Only applied the first time (at create), never re-rendered.
    #[serde(default)]
    pub create_only: bool,
    /// Free-form variables exposed to the template.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// The slice of `metadata.yaml` the templater consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateEntry>,
}

/// Parses the image metadata file; a missing file means no templates.
pub fn load_metadata(container_path: &Path) -> Result<ImageMetadata> {
    let path = container_path.join(METADATA_FILE);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ImageMetadata::default())
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_yaml::from_str(&raw)?)
}

// =============================================================================
// Rendering
// =============================================================================

/// Values exposed to template expressions.
pub struct TemplateContext<'a> {
    pub trigger: Trigger,
    /// In-container target path of the rendered file.
    pub path: &'a str,
    pub container_name: &'a str,
    pub architecture: &'a str,
    pub ephemeral: bool,
    pub privileged: bool,
    pub config: &'a crate::config::ConfigMap,
    pub devices: &'a crate::config::Devices,
    pub properties: &'a BTreeMap<String, String>,
}

impl TemplateContext<'_> {
    /// Config lookup falling back to a provided default.
    fn config_get(&self, key: &str, default: &str) -> String {
        self.config
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn resolve(&self, expr: &str) -> String {
        let expr = expr.trim();

        if let Some(args) = expr
            .strip_prefix("config_get(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let parts: Vec<&str> = args.splitn(2, ',').collect();
            let unquote = |s: &str| s.trim().trim_matches('"').to_string();
            let key = unquote(parts.first().copied().unwrap_or(""));
            let default = unquote(parts.get(1).copied().unwrap_or(""));
            return self.config_get(&key, &default);
        }

        match expr {
            "trigger" => return self.trigger.as_str().to_string(),
            "path" => return self.path.to_string(),
            "container.name" => return self.container_name.to_string(),
            "container.architecture" => return self.architecture.to_string(),
            "container.ephemeral" => return self.ephemeral.to_string(),
            "container.privileged" => return self.privileged.to_string(),
            _ => {}
        }

        if let Some(key) = expr.strip_prefix("properties.") {
            return self.properties.get(key).cloned().unwrap_or_default();
        }
        if let Some(key) = expr.strip_prefix("config.") {
            return self.config.get(key).cloned().unwrap_or_default();
        }
        if let Some(name) = expr.strip_prefix("devices.") {
            // devices.eth0.nictype style lookups.
            if let Some((dev, field)) = name.split_once('.') {
                return self
                    .devices
                    .get(dev)
                    .and_then(|entry| entry.get(field))
                    .cloned()
                    .unwrap_or_default();
            }
        }

        debug!(expr, "unknown template expression");
        String::new()
    }
}

/// Substitutes every `{{ expression }}` in the template source.
pub fn render(source: &str, ctx: &TemplateContext<'_>) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                out.push_str(&ctx.resolve(&after[..close]));
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Resolves an in-container target path inside the rootfs, refusing
/// upward escapes.
pub fn resolve_in_rootfs(rootfs: &Path, target: &str) -> Result<PathBuf> {
    let relative = Path::new(target.trim_start_matches('/'));
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => {
                return Err(Error::Validation(format!(
                    "template target '{target}' escapes the rootfs"
                )))
            }
        }
    }
    Ok(rootfs.join(relative))
}

// =============================================================================
// Application
// =============================================================================

/// Renders every template matching the trigger into the rootfs.
pub async fn apply_templates(driver: &Arc<InstanceDriver>, trigger: Trigger) -> Result<()> {
    let container_path = driver.storage().path();
    let metadata = load_metadata(&container_path)?;
    if metadata.templates.is_empty() {
        return Ok(());
    }

    let rootfs = driver.storage().rootfs_path();
    let record = driver.record();
    let config = driver.expanded_config();
    let devices = driver.expanded_devices();
    let privileged = driver.is_privileged();

    for (target, entry) in &metadata.templates {
        if !entry.when.iter().any(|w| w.as_str() == trigger.as_str()) {
            continue;
        }
        if entry.create_only && trigger != Trigger::Create {
            continue;
        }

        // A missing template file renders as empty.
        let template_path = container_path.join(TEMPLATES_DIR).join(&entry.template);
        let source = match std::fs::read_to_string(&template_path) {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(template = %entry.template, "template file missing, rendering empty");
                String::new()
            }
            Err(e) => return Err(e.into()),
        };

        let ctx = TemplateContext {
            trigger,
            path: target,
            container_name: &record.name,
            architecture: &record.architecture,
            ephemeral: record.ephemeral,
            privileged,
            config: &config,
            devices: &devices,
            properties: &entry.properties,
        };

        let rendered = render(&source, &ctx);
        let destination = resolve_in_rootfs(&rootfs, target)?;
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&destination, rendered)?;
        debug!(
            instance = %record.name,
            target = %target,
            trigger = %trigger,
            "applied template"
        );
    }

    Ok(())
}
