//! Host-wide device scheduler and event bus.
//!
//! One long-lived task listens to kernel uevents (CPU hotplug, network
//! interface hotplug, USB hotplug) and to inotify reports for device
//! sources that do not exist yet, then pushes decisions back into every
//! affected instance: cpuset rebalancing, network priority updates, and
//! device insert/remove.
//!
//! Handlers log and continue on per-container errors; one misconfigured
//! instance cannot stall rebalancing for the rest.

pub mod balance;
pub mod uevent;
pub mod watcher;

pub use balance::{effective_cpus, plan_cpu_balance, BalancePlan, BalanceRequest};
pub use uevent::{classify_uevent, parse_uevent, Uevent, UeventClass, UeventSocket};
pub use watcher::{ancestor_paths, closest_living_ancestor, FsEvent, WatchTable};

use crate::cgroup::{render_cpuset, CgroupSupport, CgroupWriter};
use crate::config::{ConfigMap, Devices};
use crate::constants::REBALANCE_CHANNEL_CAPACITY;
use crate::device::ObservedUsb;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

// =============================================================================
// Instance Access
// =============================================================================

/// The slice of an instance the event bus is allowed to touch.
#[async_trait]
pub trait BusInstance: Send + Sync {
    /// Stable display key (`project_name`).
    fn key(&self) -> String;

    async fn is_running(&self) -> bool;

    fn expanded_config(&self) -> ConfigMap;

    fn expanded_devices(&self) -> Devices;

    /// Writes one key in the instance's cgroup.
    async fn cgroup_set(&self, key: &str, value: &str) -> Result<()>;

    /// Inserts or removes a matched USB device, then injects the uevent
    /// payload into the container so in-guest udev observes it.
    async fn hotplug_usb(&self, added: bool, observed: &ObservedUsb, payload: &[u8])
        -> Result<()>;

    /// Inserts (`present`) or removes an optional device whose source
    /// transitioned.
    async fn hotplug_device(&self, device: &str, present: bool) -> Result<()>;
}

/// Source of the instances the bus iterates over.
pub trait InstanceStore: Send + Sync {
    fn instances(&self) -> Vec<Arc<dyn BusInstance>>;
}

// =============================================================================
// Event Bus
// =============================================================================

/// Handle to the process-wide event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    store: Arc<dyn InstanceStore>,
    cgroup: Arc<dyn CgroupWriter>,
    support: CgroupSupport,
    watch_table: Arc<WatchTable>,
    rebalance_tx: mpsc::Sender<String>,
    shutdown: Notify,
    isolated_cpus_path: PathBuf,
}

impl EventBus {
    /// Starts the bus: binds the uevent socket, creates the inotify
    /// instance, and spawns the single dispatcher task.
    pub fn init(
        store: Arc<dyn InstanceStore>,
        cgroup: Arc<dyn CgroupWriter>,
        support: CgroupSupport,
    ) -> Result<EventBus> {
        let (watch_table, fs_events) = WatchTable::new()?;
        let (rebalance_tx, rebalance_rx) = mpsc::channel(REBALANCE_CHANNEL_CAPACITY);

        let bus = EventBus {
            inner: Arc::new(BusInner {
                store,
                cgroup,
                support,
                watch_table,
                rebalance_tx,
                shutdown: Notify::new(),
                isolated_cpus_path: PathBuf::from("/sys/devices/system/cpu/isolated"),
            }),
        };

        let socket = match UeventSocket::open() {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!(err = %e, "uevent socket unavailable, kernel hotplug tracking disabled");
                None
            }
        };

        let dispatcher = bus.clone();
        tokio::spawn(dispatcher.dispatch(socket, fs_events, rebalance_rx));

        info!("event bus started");
        Ok(bus)
    }

    /// Requests a CPU rebalance. Requests coalesce: when the channel is
    /// full the event is dropped because a rebalance is already pending.
    pub fn request_rebalance(&self, reason: &str) {
        if self.inner.rebalance_tx.try_send(reason.to_string()).is_err() {
            debug!(reason, "rebalance already pending");
        }
    }

    /// Arms an inotify watch for an optional device source.
    pub fn watch_device_source(&self, path: &Path) -> Result<()> {
        self.inner.watch_table.watch_ancestor_of(path)
    }

    /// Stops the dispatcher task.
    pub fn shutdown(&self) {
        self.inner.shutdown.notify_waiters();
        self.inner.shutdown.notify_one();
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn dispatch(
        self,
        socket: Option<UeventSocket>,
        mut fs_events: mpsc::UnboundedReceiver<FsEvent>,
        mut rebalance_rx: mpsc::Receiver<String>,
    ) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.notified() => {
                    info!("event bus stopping");
                    return;
                }
                event = Self::next_uevent(&socket) => {
                    match event {
                        Ok(event) => {
                            if let Some(class) = classify_uevent(&event) {
                                self.handle_uevent(class).await;
                            }
                        }
                        Err(e) => {
                            warn!(err = %e, "uevent receive failed");
                        }
                    }
                }
                Some(event) = fs_events.recv() => {
                    debug!(?event, "device source transition");
                    self.rescan_optional_devices().await;
                }
                Some(reason) = rebalance_rx.recv() => {
                    debug!(reason = %reason, "rebalancing cpu pinning");
                    self.rebalance_cpus().await;
                }
            }
        }
    }

    async fn next_uevent(socket: &Option<UeventSocket>) -> Result<Uevent> {
        match socket {
            Some(socket) => socket.next_event().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_uevent(&self, class: UeventClass) {
        match class {
            UeventClass::Cpu { name, online } => {
                if !self.inner.support.cpuset {
                    return;
                }
                debug!(cpu = %name, online, "cpu hotplug, rebalancing");
                self.rebalance_cpus().await;
            }
            UeventClass::Net { iface, added } => {
                if !added || !self.inner.support.net_prio {
                    return;
                }
                // Interface may already be gone again.
                if !Path::new("/sys/class/net").join(&iface).exists() {
                    return;
                }
                debug!(iface = %iface, "network interface added, updating priorities");
                self.apply_network_priority(&iface).await;
            }
            UeventClass::Usb {
                added,
                observed,
                payload,
            } => {
                self.dispatch_usb(added, &observed, &payload).await;
            }
        }
    }

    // =========================================================================
    // CPU Rebalance
    // =========================================================================

    async fn rebalance_cpus(&self) {
        if !self.inner.support.cpuset {
            return;
        }

        let cgroup = self.inner.cgroup.as_ref();
        let effective = match effective_cpus(cgroup, &self.inner.isolated_cpus_path).await {
            Ok(effective) => effective,
            Err(e) => {
                warn!(err = %e, "cannot read effective cpuset");
                return;
            }
        };

        // Snapshot the running containers and their requests.
        let mut running = Vec::new();
        let mut requests = Vec::new();
        for instance in self.inner.store.instances() {
            if !instance.is_running().await {
                continue;
            }
            let limits_cpu = instance
                .expanded_config()
                .get("limits.cpu")
                .cloned()
                .unwrap_or_default();
            requests.push(BalanceRequest {
                key: instance.key(),
                limits_cpu,
            });
            running.push(instance);
        }

        let plan = plan_cpu_balance(&effective, &requests);

        for instance in running {
            let Some(cpus) = plan.get(&instance.key()) else {
                continue;
            };
            // The container may have stopped between planning and apply.
            if !instance.is_running().await {
                continue;
            }
            let value = render_cpuset(cpus);
            if let Err(e) = instance.cgroup_set("cpuset.cpus", &value).await {
                warn!(
                    container = %instance.key(),
                    cpuset = %value,
                    err = %e,
                    "unable to set cpuset"
                );
            }
        }
    }

    // =========================================================================
    // Network Priority
    // =========================================================================

    async fn apply_network_priority(&self, iface: &str) {
        for instance in self.inner.store.instances() {
            if !instance.is_running().await {
                continue;
            }
            let config = instance.expanded_config();
            let Some(priority) = config.get("limits.network.priority") else {
                continue;
            };
            let Ok(priority) = priority.parse::<u32>() else {
                continue;
            };

            let value = format!("{iface} {priority}");
            if let Err(e) = instance.cgroup_set("net_prio.ifpriomap", &value).await {
                warn!(
                    container = %instance.key(),
                    iface,
                    err = %e,
                    "unable to set network priority"
                );
            }
        }
    }

    // =========================================================================
    // USB Hotplug
    // =========================================================================

    async fn dispatch_usb(&self, added: bool, observed: &ObservedUsb, payload: &[u8]) {
        for instance in self.inner.store.instances() {
            if !instance.is_running().await {
                continue;
            }

            let devices = instance.expanded_devices();
            let matched = devices.values().any(|entry| {
                crate::device::usb_config_matches(entry, &observed.vendor, &observed.product)
            });
            if !matched {
                continue;
            }

            if let Err(e) = instance.hotplug_usb(added, observed, payload).await {
                warn!(
                    container = %instance.key(),
                    vendor = %observed.vendor,
                    product = %observed.product,
                    added,
                    err = %e,
                    "usb hotplug failed"
                );
            }
        }
    }

    // =========================================================================
    // Optional Device Rescan
    // =========================================================================

    /// Re-checks every optional device source across running instances,
    /// hot-plugging those whose paths appeared and removing those whose
    /// paths vanished, then re-arms the ancestor watches.
    async fn rescan_optional_devices(&self) {
        let mut missing_sources: HashSet<PathBuf> = HashSet::new();

        for instance in self.inner.store.instances() {
            if !instance.is_running().await {
                continue;
            }

            for (name, entry) in instance.expanded_devices() {
                let Some(source) = optional_device_source(&entry) else {
                    continue;
                };

                let present = source.exists();
                if let Err(e) = instance.hotplug_device(&name, present).await {
                    warn!(
                        container = %instance.key(),
                        device = %name,
                        present,
                        err = %e,
                        "optional device hotplug failed"
                    );
                }
                if !present {
                    missing_sources.insert(source);
                }
            }
        }

        // Re-arm: watch the closest living ancestor of every missing
        // source and drop watches nothing needs anymore.
        let desired: HashSet<PathBuf> = missing_sources
            .iter()
            .filter_map(|source| closest_living_ancestor(source))
            .collect();

        for target in self.inner.watch_table.targets() {
            if !desired.contains(&target) {
                if let Err(e) = self.inner.watch_table.remove_target(&target) {
                    warn!(path = %target.display(), err = %e, "failed to drop watch");
                }
            }
        }
        for target in &desired {
            if let Err(e) = self.inner.watch_table.add_target(target) {
                warn!(path = %target.display(), err = %e, "failed to arm watch");
            }
        }
    }
}

/// Source path of a hot-pluggable optional device entry, if it is one.
///
/// Disks must be marked `optional`; unix devices must have `required`
/// explicitly false. USB devices are handled through uevents instead.
pub fn optional_device_source(entry: &ConfigMap) -> Option<PathBuf> {
    let kind = entry.get("type").map(String::as_str)?;
    let source = entry
        .get("source")
        .or_else(|| entry.get("path"))
        .filter(|s| !s.is_empty())?;

    match kind {
        "disk" => {
            if crate::config::config_is_true(entry, "optional") {
                Some(PathBuf::from(source))
            } else {
                None
            }
        }
        "unix-char" | "unix-block" => match entry.get("required") {
            Some(required) if !crate::config::is_true(required) => Some(PathBuf::from(source)),
            _ => None,
        },
        _ => None,
    }
}
