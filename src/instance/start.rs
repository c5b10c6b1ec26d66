//! Start, stop and shutdown pipelines.
//!
//! `start` splits into a common phase that prepares everything on the
//! host (devices, idmap, storage, runtime configuration) and a fork phase
//! that launches the detached runtime process. Failures in the common
//! phase unwind the storage reference and release the runtime handle.

use super::{InstanceDriver, InstanceState};
use crate::cgroup::parse_cpu_allowance;
use crate::config::{self, ConfigMap};
use crate::constants::*;
use crate::device::{PostHook, RunConfig};
use crate::error::{Error, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Output of the common start phase, consumed by the fork phase.
pub(super) struct StartContext {
    pub config_path: PathBuf,
    pub post_hooks: Vec<PostHook>,
}

impl InstanceDriver {
    // =========================================================================
    // Start
    // =========================================================================

    pub async fn start(self: &Arc<Self>, stateful: bool) -> Result<()> {
        if self.is_snapshot() {
            return Err(Error::Validation("cannot start a snapshot".into()));
        }

        let op = self
            .host
            .operations
            .create(self.id(), &self.name(), "start", false, false)?;

        let result = self.start_inner(stateful).await;
        self.host.operations.complete(&op, match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(Error::Internal(e.to_string())),
        });

        // A failed post-start hook leaves the container running; take it
        // back down now that the start operation has been released.
        if let Err(Error::Hook { .. }) = &result {
            if self.is_running().await {
                if let Err(e) = Box::pin(self.stop(false)).await {
                    warn!(instance = %self.name(), err = %e, "stop after hook failure failed");
                }
            }
        }

        result
    }

    async fn start_inner(self: &Arc<Self>, stateful: bool) -> Result<()> {
        info!(
            instance = %self.name(),
            project = %self.project(),
            stateful,
            "starting container"
        );

        if stateful && !self.is_stateful() {
            return Err(Error::Validation(
                "container has no existing state to restore".into(),
            ));
        }

        let ctx = match self.common_start().await {
            Ok(ctx) => ctx,
            Err(e) => {
                // Common start acquired at most one storage reference.
                let _ = self.storage.unmount().await;
                self.release_runtime();
                return Err(e);
            }
        };

        // Stateful handling before the fork.
        let state_path = self.state_path();
        if stateful {
            let runtime = self.init_runtime()?;
            let restore = runtime
                .restore_checkpoint(&state_path, &ctx.config_path)
                .await;
            if let Err(e) = restore {
                if !self.is_running().await {
                    return Err(e);
                }
            }

            let _ = tokio::fs::remove_dir_all(&state_path).await;
            {
                let mut state = self.lock();
                state.record.stateful = false;
            }
            self.persist()?;

            return self.finish_start(ctx).await;
        } else if self.is_stateful() {
            // Stateless start with leftover state: discard it.
            let _ = tokio::fs::remove_dir_all(&state_path).await;
            {
                let mut state = self.lock();
                state.record.stateful = false;
            }
            self.persist()?;
        }

        // Fork phase: detached runtime process.
        let runtime = self.init_runtime()?;
        if let Err(e) = runtime.start(&ctx.config_path).await {
            if !self.is_running().await {
                let _ = self.storage.unmount().await;
                self.release_runtime();
                return Err(e);
            }
        }

        self.finish_start(ctx).await
    }

    async fn finish_start(self: &Arc<Self>, ctx: StartContext) -> Result<()> {
        if let Err(e) = self.run_post_hooks(&ctx.post_hooks).await {
            warn!(instance = %self.name(), err = %e, "post-start hook failed, stopping");
            return Err(e);
        }

        info!(instance = %self.name(), project = %self.project(), "started container");
        Ok(())
    }

    // =========================================================================
    // Common Start
    // =========================================================================

    pub(super) async fn common_start(self: &Arc<Self>) -> Result<StartContext> {
        // 1. Resolve the runtime handle (idempotent).
        let runtime = self.init_runtime()?;
        runtime.clear_config().await?;

        // 2. Device source sanity check; optional devices with missing
        //    sources arm an inotify watch instead of failing.
        for (name, entry) in self.expanded_devices() {
            let Some(source) = crate::events::optional_device_source(&entry) else {
                continue;
            };
            if !source.exists() {
                if let Some(bus) = self.host.bus() {
                    bus.watch_device_source(&source)?;
                    debug!(device = %name, source = %source.display(), "armed source watch");
                }
            }
        }

        // 3. Declared kernel modules.
        self.load_kernel_modules().await?;

        // 4. Deferred quota change from a live update on a
        //    stopped-only backend.
        let config = self.expanded_config();
        if let Some(quota) = config.get(VOLATILE_APPLY_QUOTA).filter(|q| !q.is_empty()) {
            let bytes = config::parse_byte_size(quota)?;
            self.storage.mount().await?;
            let applied = self.storage.set_quota(bytes).await;
            let _ = self.storage.unmount().await;
            applied?;

            let mut changes = ConfigMap::new();
            changes.insert(VOLATILE_APPLY_QUOTA.into(), String::new());
            self.volatile_set(changes)?;
        }

        // 5-6. Idmap reconciliation and persistence.
        self.reconcile_idmap().await?;

        // 7. Seccomp profile on disk; leftover device nodes removed.
        self.write_seccomp_profile()?;
        let devices_dir = self.devices_dir_path();
        if devices_dir.exists() {
            std::fs::remove_dir_all(&devices_dir)?;
        }
        std::fs::create_dir_all(&devices_dir)?;

        // 9. Engine directories with their fixed modes. (Before device
        //    materialisation, which writes nodes into them.)
        self.ensure_dirs()?;

        // 10. Runtime log rotation.
        crate::runtime::rotate_runtime_log(&self.log_dir()).await?;

        // 8. Materialise devices.
        let (run, post_hooks) = self.materialise_devices().await?;

        // 11. Storage up, config rendered, ownership fixed, manifest
        //     written.
        self.storage.mount().await?;

        self.render_runtime_config(&run).await?;
        let config_path = runtime.render_config().await?;

        let mode = if self.is_privileged() {
            CONTAINER_PATH_MODE_PRIVILEGED
        } else {
            CONTAINER_PATH_MODE_UNPRIVILEGED
        };
        let container_path = self.storage.path();
        std::fs::set_permissions(&container_path, std::fs::Permissions::from_mode(mode))?;

        if let Err(e) = crate::backup::write_backup_file(self).await {
            warn!(instance = %self.name(), err = %e, "backup manifest not written");
        }

        // 12. Hand the fork phase what it needs.
        Ok(StartContext {
            config_path,
            post_hooks,
        })
    }

    /// Computes the next idmap and re-shifts the rootfs when it differs
    /// from what is on disk.
    async fn reconcile_idmap(self: &Arc<Self>) -> Result<()> {
        let config = self.expanded_config();

        let next = if self.is_privileged() {
            None
        } else {
            Some(self.plan_idmap().await?)
        };

        let last_raw = config
            .get(VOLATILE_LAST_STATE_IDMAP)
            .cloned()
            .unwrap_or_default();
        let last = if last_raw.is_empty() {
            None
        } else {
            Some(crate::idmap::IdmapSet::from_json(&last_raw)?)
        };

        let next_set = next.as_ref().map(|p| p.set.clone());
        let changed = next_set != last;

        if changed {
            if config::config_is_true(&config, "security.protection.shift") {
                return Err(Error::Protected {
                    instance: self.name(),
                    action: "shift".into(),
                });
            }

            // An identity-shifting filesystem applies the map at mount
            // time; the on-disk tree stays unshifted.
            if !self.storage.identity_shift_supported() {
                self.storage.mount().await?;
                let rootfs = self.storage.rootfs_path();

                // Copy-on-write backends unlock read-only subvolumes
                // around the walk.
                self.storage.set_subvolumes_writable(true).await?;

                let shift_result = {
                    let rootfs = rootfs.clone();
                    let last = last.clone();
                    let next_set = next_set.clone();
                    tokio::task::spawn_blocking(move || -> Result<()> {
                        if let Some(old) = &last {
                            old.unshift_rootfs(&rootfs)?;
                        }
                        if let Some(new) = &next_set {
                            new.shift_rootfs(&rootfs)?;
                        }
                        Ok(())
                    })
                    .await
                    .map_err(|e| Error::Internal(format!("shift task failed: {e}")))?
                };

                let restore = self.storage.set_subvolumes_writable(false).await;
                let _ = self.storage.unmount().await;
                shift_result?;
                restore?;
            }
        }

        // Persist the reconciled state.
        let mut changes = ConfigMap::new();
        match &next {
            Some(plan) => {
                let json = plan.set.to_json()?;
                changes.insert(VOLATILE_LAST_STATE_IDMAP.into(), json.clone());
                changes.insert(VOLATILE_IDMAP_CURRENT.into(), json.clone());
                changes.insert(VOLATILE_IDMAP_NEXT.into(), json);
                changes.insert(VOLATILE_IDMAP_BASE.into(), plan.base.to_string());
            }
            None => {
                changes.insert(VOLATILE_LAST_STATE_IDMAP.into(), String::new());
                changes.insert(VOLATILE_IDMAP_CURRENT.into(), String::new());
            }
        }
        self.volatile_set(changes)?;

        {
            let mut state = self.lock();
            state.idmap = next.map(|p| p.set);
        }
        Ok(())
    }

    /// Runs every expanded device's `start`, translating the collected
    /// RunConfigs into one aggregate. `UnsupportedDevType` falls through
    /// to the legacy path for that kind.
    async fn materialise_devices(self: &Arc<Self>) -> Result<(RunConfig, Vec<PostHook>)> {
        let mut aggregate = RunConfig::default();
        let mut post_hooks = Vec::new();

        for (name, entry) in self.expanded_devices() {
            let device = self.load_device_entry(&name, &entry)?;
            match device.start(false).await {
                Ok(run) => {
                    // Shift mount sources the container must own.
                    for mount in &run.mounts {
                        if mount.shift {
                            if let Some(idmap) = self.current_idmap() {
                                let source = mount.source.clone();
                                tokio::task::spawn_blocking(move || idmap.shift_rootfs(&source))
                                    .await
                                    .map_err(|e| {
                                        Error::Internal(format!("shift task failed: {e}"))
                                    })??;
                            }
                        }
                    }
                    aggregate.mounts.extend(run.mounts);
                    aggregate.cgroup_rules.extend(run.cgroup_rules);
                    if !run.network_interface.is_empty() {
                        aggregate
                            .network_interface
                            .extend(run.network_interface.into_iter().map(|(k, v)| (k, v)));
                        // Mark the end of one interface block.
                        aggregate
                            .network_interface
                            .push(("__iface_end".into(), String::new()));
                    }
                    post_hooks.extend(run.post_hooks);
                }
                Err(e) if e.is_unsupported_dev_type() => {
                    debug!(device = %name, "no typed implementation, using legacy path");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        // Network priority is applied as a reported post-start hook
        // rather than fire-and-forget.
        let config = self.expanded_config();
        if let Some(priority) = config.get("limits.network.priority") {
            if let Ok(priority) = priority.parse::<u32>() {
                for (name, _) in self.expanded_devices() {
                    if let Some(host_name) = self
                        .expanded_config()
                        .get(&format!("volatile.{name}.host_name"))
                    {
                        post_hooks.push(PostHook::NetworkPriority {
                            iface: host_name.clone(),
                            priority,
                        });
                    }
                }
            }
        }

        Ok((aggregate, post_hooks))
    }

    /// Renders the full runtime configuration into the handle: the
    /// `initLXC` equivalent.
    async fn render_runtime_config(self: &Arc<Self>, run: &RunConfig) -> Result<()> {
        let runtime = self.init_runtime()?;
        let config = self.expanded_config();
        let scoped = self.scoped_name();

        let mut set = Vec::<(String, String)>::new();
        let push = |set: &mut Vec<(String, String)>, k: &str, v: String| {
            set.push((k.to_string(), v));
        };

        // Logging.
        push(&mut set, "lxc.log.file", self.log_dir().join(RUNTIME_LOG_FILE).display().to_string());
        let log_level = if config::config_is_true(&config, "boot.debug") {
            "trace"
        } else {
            "warn"
        };
        push(&mut set, "lxc.log.level", log_level.to_string());

        // Console and tty limits.
        push(&mut set, "lxc.console.logfile", self.log_dir().join(CONSOLE_LOG_FILE).display().to_string());
        push(&mut set, "lxc.tty.max", "0".into());
        push(&mut set, "lxc.pty.max", "1024".into());

        // Identity.
        push(&mut set, "lxc.uts.name", self.name());
        push(
            &mut set,
            "lxc.arch",
            config::architecture_personality(&self.record().architecture).to_string(),
        );
        push(&mut set, "lxc.rootfs.path", self.storage.rootfs_path().display().to_string());
        push(&mut set, "lxc.hook.version", "1".into());

        // Hooks: the helper binary calls back into the daemon.
        let hook = std::env::var(ENV_LXC_HOOK).unwrap_or_else(|_| "silo-hook".into());
        push(&mut set, "lxc.hook.pre-start", format!("{hook} {scoped} start"));
        push(&mut set, "lxc.hook.stop", format!("{hook} {scoped} stopns"));
        push(&mut set, "lxc.hook.post-stop", format!("{hook} {scoped} stop"));

        // Standard optional mounts.
        for mnt in [
            "/dev/fuse",
            "/dev/net/tun",
            "/proc/sys/fs/binfmt_misc",
            "/sys/firmware/efi/efivars",
            "/sys/fs/fuse/connections",
            "/sys/fs/pstore",
            "/sys/kernel/debug",
            "/sys/kernel/security",
        ] {
            if std::path::Path::new(mnt).exists() {
                let kind = if std::path::Path::new(mnt).is_dir() {
                    "rbind,create=dir"
                } else {
                    "bind,create=file"
                };
                push(
                    &mut set,
                    "lxc.mount.entry",
                    format!("{mnt} {} none {kind},optional 0 0", mnt.trim_start_matches('/')),
                );
            }
        }

        // Shared-mounts injection surface.
        push(
            &mut set,
            "lxc.mount.entry",
            format!(
                "{} dev/.silo-mounts none bind,create=dir 0 0",
                self.shmounts_dir_path().display()
            ),
        );

        // Security profiles: loading and labelling only.
        push(
            &mut set,
            "lxc.apparmor.profile",
            config
                .get("security.apparmor.profile")
                .cloned()
                .unwrap_or_else(|| "unconfined".into()),
        );
        push(
            &mut set,
            "lxc.seccomp.profile",
            self.host.seccomp_profile_path(&scoped).display().to_string(),
        );

        // Idmap lines.
        if let Some(idmap) = self.current_idmap() {
            for line in idmap.to_runtime_lines() {
                push(&mut set, "lxc.idmap", line);
            }
        }

        // Environment.
        for (key, value) in &config {
            if let Some(name) = key.strip_prefix("environment.") {
                push(&mut set, "lxc.environment", format!("{name}={value}"));
            }
        }

        // NVIDIA passthrough environment: gate on non-empty values.
        if let Some(cuda) = config.get("nvidia.require.cuda").filter(|v| !v.is_empty()) {
            push(&mut set, "lxc.environment", format!("NVIDIA_REQUIRE_CUDA={cuda}"));
        }
        if let Some(driver) = config.get("nvidia.require.driver").filter(|v| !v.is_empty()) {
            push(&mut set, "lxc.environment", format!("NVIDIA_REQUIRE_DRIVER={driver}"));
        }

        // Base cgroup limits.
        push(&mut set, "lxc.cgroup.devices.deny", "a".into());
        for rule in &run.cgroup_rules {
            push(&mut set, &format!("lxc.cgroup.{}", rule.key), rule.value.clone());
        }

        if self.host.support.memory {
            if let Some(memory) = config.get("limits.memory") {
                let bytes = config::parse_byte_size(memory)?;
                push(&mut set, "lxc.cgroup.memory.limit_in_bytes", bytes.to_string());
                if self.host.support.memsw {
                    push(
                        &mut set,
                        "lxc.cgroup.memory.memsw.limit_in_bytes",
                        bytes.to_string(),
                    );
                }
                push(
                    &mut set,
                    "lxc.cgroup.memory.soft_limit_in_bytes",
                    format!("{:.0}", bytes as f64 * SOFT_MEMORY_LIMIT_FACTOR),
                );
            }
        }

        let cpu = parse_cpu_allowance(
            config.get("limits.cpu.allowance").map(String::as_str).unwrap_or(""),
            config.get("limits.cpu.priority").map(String::as_str).unwrap_or(""),
        )?;
        push(&mut set, "lxc.cgroup.cpu.shares", cpu.shares.to_string());
        if cpu.quota_us > 0 {
            push(&mut set, "lxc.cgroup.cpu.cfs_quota_us", cpu.quota_us.to_string());
            push(&mut set, "lxc.cgroup.cpu.cfs_period_us", cpu.period_us.to_string());
        }

        if self.host.support.pids {
            if let Some(processes) = config.get("limits.processes") {
                push(&mut set, "lxc.cgroup.pids.max", processes.clone());
            }
        }

        if let Some(priority) = config.get("limits.disk.priority") {
            let priority: u64 = priority
                .parse()
                .map_err(|_| Error::Validation("invalid limits.disk.priority".into()))?;
            push(&mut set, "lxc.cgroup.blkio.weight", (priority * 100).to_string());
        }

        // Device mounts and interfaces.
        for mount in &run.mounts {
            push(&mut set, "lxc.mount.entry", mount.to_runtime_entry());
        }
        let mut iface_index = 0usize;
        for (key, value) in &run.network_interface {
            if key == "__iface_end" {
                iface_index += 1;
                continue;
            }
            push(
                &mut set,
                &format!("lxc.net.{iface_index}.{key}"),
                value.clone(),
            );
        }

        // User-supplied raw keys last, with blacklist enforcement.
        if let Some(raw) = config.get("raw.lxc") {
            config::validate_raw_runtime(raw)?;
            for line in raw.lines() {
                if let Some((key, value)) = config::parse_raw_runtime_line(line)? {
                    push(&mut set, &key, value);
                }
            }
        }

        for (key, value) in set {
            runtime.set_config_item(&key, &value).await?;
        }
        Ok(())
    }

    fn write_seccomp_profile(&self) -> Result<()> {
        let path = self.host.seccomp_profile_path(&self.scoped_name());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Policy generation is owned by the security layer; the engine
        // labels the container with the standard default-allow profile.
        let profile = "2\nblacklist\nreject_force_umount\n[all]\nkexec_load errno 38\nopen_by_handle_at errno 38\ninit_module errno 38\nfinit_module errno 38\ndelete_module errno 38\n";
        std::fs::write(&path, profile)?;
        Ok(())
    }

    fn ensure_dirs(&self) -> Result<()> {
        use std::fs;

        for (dir, mode) in [
            (self.log_dir(), LOG_DIR_MODE),
            (self.devices_dir_path(), DEVICES_DIR_MODE),
            (self.shmounts_dir_path(), SHMOUNTS_DIR_MODE),
        ] {
            fs::create_dir_all(&dir)?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    pub(super) async fn load_kernel_modules(&self) -> Result<()> {
        let config = self.expanded_config();
        let Some(modules) = config.get("linux.kernel_modules") else {
            return Ok(());
        };

        for module in modules.split(',').map(str::trim).filter(|m| !m.is_empty()) {
            let status = Command::new("modprobe")
                .arg("-b")
                .arg(module)
                .status()
                .await?;
            if !status.success() {
                return Err(Error::runtime(format!(
                    "failed to load kernel module '{module}'"
                )));
            }
        }
        Ok(())
    }

    /// Interprets the declarative post-start hooks. Failures surface to
    /// the caller, which stops the container.
    pub(super) async fn run_post_hooks(self: &Arc<Self>, hooks: &[PostHook]) -> Result<()> {
        for hook in hooks {
            match hook {
                PostHook::NetworkPriority { iface, priority } => {
                    if !self.host.support.net_prio {
                        continue;
                    }
                    self.cgroup_set_key("net_prio.ifpriomap", &format!("{iface} {priority}"))
                        .await
                        .map_err(|e| Error::Hook {
                            hook: "network-priority".into(),
                            reason: e.to_string(),
                        })?;
                }
                PostHook::NetworkLimits {
                    iface,
                    ingress_bps,
                    egress_bps,
                } => {
                    self.apply_interface_limits(iface, *ingress_bps, *egress_bps)
                        .await
                        .map_err(|e| Error::Hook {
                            hook: "network-limits".into(),
                            reason: e.to_string(),
                        })?;
                }
                PostHook::Command { program, args } => {
                    let status = Command::new(program).args(args).status().await?;
                    if !status.success() {
                        return Err(Error::Hook {
                            hook: program.clone(),
                            reason: format!("exited with {status}"),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Traffic shaping on the host side of a veth pair.
    async fn apply_interface_limits(
        &self,
        iface: &str,
        ingress_bps: Option<u64>,
        egress_bps: Option<u64>,
    ) -> Result<()> {
        // Egress from the container is ingress on the host veth.
        if let Some(bps) = ingress_bps {
            let rate = format!("{bps}bit");
            let status = Command::new("tc")
                .args([
                    "qdisc", "replace", "dev", iface, "root", "tbf", "rate", &rate, "burst",
                    "1024k", "latency", "50ms",
                ])
                .status()
                .await?;
            if !status.success() {
                return Err(Error::runtime(format!("tc qdisc failed on {iface}")));
            }
        }
        if let Some(bps) = egress_bps {
            let rate = format!("{bps}bit");
            let status = Command::new("tc")
                .args([
                    "qdisc", "replace", "dev", iface, "ingress", "handle", "ffff:",
                ])
                .status()
                .await?;
            if !status.success() {
                return Err(Error::runtime(format!("tc ingress failed on {iface}")));
            }
            let status = Command::new("tc")
                .args([
                    "filter", "replace", "dev", iface, "parent", "ffff:", "protocol", "all",
                    "u32", "match", "u32", "0", "0", "police", "rate", &rate, "burst", "1024k",
                    "drop",
                ])
                .status()
                .await?;
            if !status.success() {
                return Err(Error::runtime(format!("tc police failed on {iface}")));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Stop / Shutdown
    // =========================================================================

    pub async fn stop(self: &Arc<Self>, stateful: bool) -> Result<()> {
        if self.is_snapshot() {
            return Err(Error::Validation("cannot stop a snapshot".into()));
        }

        let op = self
            .host
            .operations
            .create(self.id(), &self.name(), "stop", false, false)?;

        let result = self.stop_inner(stateful, &op).await;
        match &result {
            Ok(()) => { /* completed by the stop hook or the poll below */ }
            Err(e) => self
                .host
                .operations
                .complete(&op, Err(Error::Internal(e.to_string()))),
        }
        result
    }

    async fn stop_inner(
        self: &Arc<Self>,
        stateful: bool,
        op: &crate::operations::Operation,
    ) -> Result<()> {
        info!(instance = %self.name(), project = %self.project(), stateful, "stopping container");

        let state = self.state().await;
        if state == InstanceState::Stopped {
            self.host.operations.complete(op, Ok(()));
            return Ok(());
        }

        let runtime = self
            .runtime()
            .ok_or_else(|| Error::Internal("no runtime handle".into()))?;

        // Stateful stop checkpoints through the migration facility and
        // keeps the dump for the next start.
        if stateful {
            let state_path = self.state_path();
            let _ = tokio::fs::remove_dir_all(&state_path).await;
            tokio::fs::create_dir_all(&state_path).await?;

            runtime.checkpoint(&state_path, true).await?;
            {
                let mut state = self.lock();
                state.record.stateful = true;
            }
            self.persist()?;

            self.on_stop("stop").await?;
            return Ok(());
        }

        // Fork bomb mitigation: cap the pid count, or freeze briefly when
        // the pids controller is missing.
        if self.host.support.pids {
            if let Err(e) = self.cgroup_set_key("pids.max", "0").await {
                debug!(err = %e, "pids cap failed");
            }
        } else if self.host.support.freezer {
            let _ = runtime.freeze().await;
        }

        runtime.stop().await?;

        // Wait for the hook chain to complete the operation, or observe
        // the container gone ourselves.
        loop {
            if op.is_done() {
                return op.wait().await;
            }
            if !self.is_running().await {
                // The runtime did not call back (detached helper); run
                // the teardown inline.
                if !op.is_done() {
                    self.on_stop("stop").await?;
                }
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// Graceful shutdown: SIGPWR semantics through the runtime, waiting
    /// up to `timeout`. The backing operation is reusable so concurrent
    /// callers share it, and resettable so long shutdowns survive the
    /// idle deadline.
    pub async fn shutdown(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        if self.is_snapshot() {
            return Err(Error::Validation("cannot shut down a snapshot".into()));
        }

        let op = self
            .host
            .operations
            .create(self.id(), &self.name(), "shutdown", true, true)?;

        info!(instance = %self.name(), ?timeout, "requesting graceful shutdown");

        let runtime = self
            .runtime()
            .ok_or_else(|| Error::Internal("no runtime handle".into()))?;

        let deadline = tokio::time::Instant::now() + timeout;
        let request = runtime.shutdown(timeout).await;

        if let Err(e) = request {
            if self.is_running().await {
                self.host
                    .operations
                    .complete(&op, Err(Error::Internal(e.to_string())));
                return Err(e);
            }
        }

        loop {
            if op.is_done() {
                return op.wait().await;
            }
            if !self.is_running().await {
                if !op.is_done() {
                    self.on_stop("stop").await?;
                }
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let err = Error::Timeout(format!(
                    "container did not shut down within {timeout:?}"
                ));
                self.host
                    .operations
                    .complete(&op, Err(Error::Internal(err.to_string())));
                return Err(err);
            }
            // Graceful shutdowns may take arbitrarily long; keep the
            // operation alive past its idle deadline.
            op.reset()?;
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }
}
