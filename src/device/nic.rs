//! Network interface device.
//!
//! Covers the veth-based kinds (`bridged`, `p2p`), `macvlan` and
//! `physical`. The stable MAC and the host-side veth name are reserved in
//! volatile at `add` time so they survive restarts.

use super::{Device, DeviceContext, PostHook, RunConfig};
use crate::config::{parse_bit_rate, ConfigMap};
use crate::constants::NIC_MAC_PREFIX;
use crate::error::{Error, Result};
use async_trait::async_trait;
use rand::Rng;

const NIC_TYPES: &[&str] = &["bridged", "macvlan", "ipvlan", "p2p", "physical"];

pub struct NicDevice {
    name: String,
    config: ConfigMap,
    ctx: DeviceContext,
}

impl NicDevice {
    pub fn new(name: &str, config: ConfigMap, ctx: DeviceContext) -> Self {
        NicDevice {
            name: name.to_string(),
            config,
            ctx,
        }
    }

    fn get(&self, key: &str) -> &str {
        self.config.get(key).map(String::as_str).unwrap_or("")
    }

    fn nictype(&self) -> &str {
        self.get("nictype")
    }

    fn needs_parent(&self) -> bool {
        matches!(self.nictype(), "bridged" | "macvlan" | "ipvlan" | "physical")
    }

    /// MAC for this NIC: configured value, else the volatile reservation.
    fn effective_hwaddr(&self) -> Option<String> {
        let configured = self.get("hwaddr");
        if !configured.is_empty() {
            return Some(configured.to_string());
        }
        self.ctx.volatile_get("hwaddr")
    }

    /// Generates a stable random MAC under the engine's prefix.
    fn generate_hwaddr() -> String {
        let mut rng = rand::thread_rng();
        format!(
            "{}:{:02x}:{:02x}:{:02x}",
            NIC_MAC_PREFIX,
            rng.gen::<u8>(),
            rng.gen::<u8>(),
            rng.gen::<u8>()
        )
    }

    /// Generates a host-side veth name.
    fn generate_host_name() -> String {
        let mut rng = rand::thread_rng();
        format!("veth{:08x}", rng.gen::<u32>())
    }
}

/// Validates an `aa:bb:cc:dd:ee:ff` hardware address.
fn validate_hwaddr(hwaddr: &str) -> Result<()> {
    let octets: Vec<&str> = hwaddr.split(':').collect();
    let ok = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !ok {
        return Err(Error::Validation(format!("invalid hwaddr '{hwaddr}'")));
    }
    Ok(())
}

#[async_trait]
impl Device for NicDevice {
    fn kind(&self) -> &'static str {
        "nic"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        let nictype = self.nictype();
        if !NIC_TYPES.contains(&nictype) {
            return Err(Error::Validation(format!(
                "nic '{}' has invalid nictype '{nictype}'",
                self.name
            )));
        }

        if self.needs_parent() && self.get("parent").is_empty() {
            return Err(Error::Validation(format!(
                "nic '{}' of type '{nictype}' requires a parent",
                self.name
            )));
        }

        if !self.get("hwaddr").is_empty() {
            validate_hwaddr(self.get("hwaddr"))?;
        }

        for key in ["limits.ingress", "limits.egress", "limits.max"] {
            if !self.get(key).is_empty() {
                parse_bit_rate(self.get(key))?;
            }
        }

        Ok(())
    }

    async fn add(&self) -> Result<()> {
        if self.effective_hwaddr().is_none() {
            self.ctx.volatile_set_one("hwaddr", &Self::generate_hwaddr())?;
        }
        if self.nictype() != "physical" && self.ctx.volatile_get("host_name").is_none() {
            self.ctx
                .volatile_set_one("host_name", &Self::generate_host_name())?;
        }
        Ok(())
    }

    async fn start(&self, _is_running: bool) -> Result<RunConfig> {
        // Re-run the reservation: profile-sourced NICs may never have
        // seen add().
        self.add().await?;

        let runtime_type = match self.nictype() {
            "bridged" | "p2p" => "veth",
            "macvlan" => "macvlan",
            "ipvlan" => "ipvlan",
            "physical" => "phys",
            other => return Err(Error::UnsupportedDevType(other.to_string())),
        };

        let mut kv = vec![
            ("type".to_string(), runtime_type.to_string()),
            ("flags".to_string(), "up".to_string()),
        ];

        if self.needs_parent() {
            kv.push(("link".to_string(), self.get("parent").to_string()));
        }

        let guest_name = if self.get("name").is_empty() {
            "eth0".to_string()
        } else {
            self.get("name").to_string()
        };
        kv.push(("name".to_string(), guest_name));

        if let Some(hwaddr) = self.effective_hwaddr() {
            kv.push(("hwaddr".to_string(), hwaddr));
        }

        if let Some(host_name) = self.ctx.volatile_get("host_name") {
            if self.nictype() != "physical" {
                kv.push(("veth.pair".to_string(), host_name));
            }
        }

        if !self.get("mtu").is_empty() {
            kv.push(("mtu".to_string(), self.get("mtu").to_string()));
        }

        let mut post_hooks = Vec::new();
        let ingress = self
            .config
            .get("limits.ingress")
            .map(|v| parse_bit_rate(v))
            .transpose()?;
        let egress = self
            .config
            .get("limits.egress")
            .map(|v| parse_bit_rate(v))
            .transpose()?;
        if ingress.is_some() || egress.is_some() {
            if let Some(host_name) = self.ctx.volatile_get("host_name") {
                post_hooks.push(PostHook::NetworkLimits {
                    iface: host_name,
                    ingress_bps: ingress,
                    egress_bps: egress,
                });
            }
        }

        Ok(RunConfig {
            network_interface: kv,
            post_hooks,
            ..Default::default()
        })
    }

    fn can_hot_plug(&self) -> (bool, &'static [&'static str]) {
        (true, &["limits.ingress", "limits.egress", "limits.max"])
    }

    async fn update(&self, old: &ConfigMap, _is_running: bool) -> Result<()> {
        // Only advertised fields reach here; nothing persistent changes
        // for traffic limits, the driver re-runs the post hooks.
        let _ = old;
        self.validate()
    }

    async fn stop(&self, netns_path: Option<&str>) -> Result<RunConfig> {
        let mut kv = Vec::new();

        let guest_name = if self.get("name").is_empty() {
            "eth0"
        } else {
            self.get("name")
        };
        kv.push(("name".to_string(), guest_name.to_string()));

        // Physical interfaces must return to the host under their
        // original name; veth host sides just get deleted with the
        // namespace.
        if self.nictype() == "physical" {
            kv.push(("host_name".to_string(), self.get("parent").to_string()));
        } else if let Some(host_name) = self.ctx.volatile_get("host_name") {
            kv.push(("host_name".to_string(), host_name));
        }

        if let Some(netns) = netns_path {
            kv.push(("netns".to_string(), netns.to_string()));
        }

        Ok(RunConfig {
            network_interface: kv,
            ..Default::default()
        })
    }

    async fn remove(&self) -> Result<()> {
        // Volatile cleanup happens in the driver's orphan-key pass.
        Ok(())
    }
}
