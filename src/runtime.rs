//! Low-level container runtime handle.
//!
//! The engine never links the runtime directly: it renders a key/value
//! configuration file, then drives a detached helper subprocess
//! (`forkstart`, `forkstop`, `forkuevent`, ...) and queries state through
//! the [`RuntimeHandle`] trait. The handle is released and recreated on
//! every full config reload so no stale cached state survives.

use crate::constants::{RUNTIME_LOG_FILE, STATE_QUERY_TIMEOUT};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

// =============================================================================
// State
// =============================================================================

/// State reported by the low-level runtime monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Aborting,
    Freezing,
    Frozen,
    Thawed,
    Error,
}

impl RuntimeState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "STOPPED" => RuntimeState::Stopped,
            "STARTING" => RuntimeState::Starting,
            "RUNNING" => RuntimeState::Running,
            "STOPPING" => RuntimeState::Stopping,
            "ABORTING" => RuntimeState::Aborting,
            "FREEZING" => RuntimeState::Freezing,
            "FROZEN" => RuntimeState::Frozen,
            "THAWED" => RuntimeState::Thawed,
            _ => RuntimeState::Error,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            RuntimeState::Running
                | RuntimeState::Freezing
                | RuntimeState::Frozen
                | RuntimeState::Thawed
        )
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeState::Stopped => "stopped",
            RuntimeState::Starting => "starting",
            RuntimeState::Running => "running",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Aborting => "aborting",
            RuntimeState::Freezing => "freezing",
            RuntimeState::Frozen => "frozen",
            RuntimeState::Thawed => "thawed",
            RuntimeState::Error => "error",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Opaque handle to the low-level container runtime.
#[async_trait]
pub trait RuntimeHandle: Send + Sync {
    /// Appends one configuration item.
    async fn set_config_item(&self, key: &str, value: &str) -> Result<()>;

    /// Drops all configuration items.
    async fn clear_config(&self) -> Result<()>;

    /// Renders the accumulated configuration into the runtime's config
    /// file and returns its path.
    async fn render_config(&self) -> Result<PathBuf>;

    /// Starts the container from a rendered config file.
    async fn start(&self, config_path: &Path) -> Result<()>;

    /// Forcibly stops the container.
    async fn stop(&self) -> Result<()>;

    /// Requests a graceful shutdown and waits up to `timeout`.
    async fn shutdown(&self, timeout: Duration) -> Result<()>;

    /// Freezes all tasks in the container.
    async fn freeze(&self) -> Result<()>;

    /// Thaws a frozen container.
    async fn unfreeze(&self) -> Result<()>;

    /// Moves a host interface into the container as `guest_name`.
    async fn attach_interface(&self, host_name: &str, guest_name: &str) -> Result<()>;

    /// Moves an interface back out of the container.
    async fn detach_interface(&self, guest_name: &str, host_name: &str) -> Result<()>;

    /// Queries the monitor for the current state. Implementations block
    /// until the monitor answers; callers bound this via
    /// [`query_state_bounded`].
    async fn state(&self) -> Result<RuntimeState>;

    /// Pid of the container's init process, when running.
    async fn init_pid(&self) -> Result<Option<i32>>;

    /// Injects a serialized uevent into the container's namespaces so
    /// in-guest udev observes a hotplug.
    async fn inject_uevent(&self, payload: &[u8]) -> Result<()>;

    /// Checkpoints the running container into a state directory through
    /// the migration facility, optionally stopping it afterwards.
    async fn checkpoint(&self, state_dir: &Path, stop: bool) -> Result<()>;

    /// Restores a container from a checkpoint directory.
    async fn restore_checkpoint(&self, state_dir: &Path, config_path: &Path) -> Result<()>;

    /// Bind-mounts a host path into the running container's mount
    /// namespace.
    async fn mount_into(
        &self,
        source: &Path,
        target: &str,
        fstype: &str,
        opts: &[String],
    ) -> Result<()>;

    /// Unmounts a path inside the running container.
    async fn umount_from(&self, target: &str) -> Result<()>;
}

/// Bounds a state query to the monitor timeout.
///
/// A hung monitor is reported as a distinct timeout error so callers can
/// carry on without blocking their own operation.
pub async fn query_state_bounded(handle: &dyn RuntimeHandle) -> Result<RuntimeState> {
    match tokio::time::timeout(STATE_QUERY_TIMEOUT, handle.state()).await {
        Ok(state) => state,
        Err(_) => Err(Error::Timeout("monitor hung".into())),
    }
}

// =============================================================================
// Fork Helper Implementation
// =============================================================================

/// Drives the runtime through detached helper subprocesses.
pub struct ForkRuntime {
    /// `<project>_<name>` as the runtime knows the container.
    scoped_name: String,
    /// Directory the runtime keeps per-container state under.
    runtime_path: PathBuf,
    /// Per-instance log directory, holds the runtime log.
    log_dir: PathBuf,
    /// Helper binary implementing the fork subcommands.
    helper: PathBuf,
    config: tokio::sync::Mutex<Vec<(String, String)>>,
}

impl ForkRuntime {
    pub fn new(
        scoped_name: &str,
        runtime_path: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let helper = std::env::current_exe()?;
        Ok(Self::with_helper(scoped_name, runtime_path, log_dir, helper))
    }

    pub fn with_helper(
        scoped_name: &str,
        runtime_path: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
        helper: impl Into<PathBuf>,
    ) -> Self {
        ForkRuntime {
            scoped_name: scoped_name.to_string(),
            runtime_path: runtime_path.into(),
            log_dir: log_dir.into(),
            helper: helper.into(),
            config: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(RUNTIME_LOG_FILE)
    }

    async fn run_helper(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(helper = %self.helper.display(), ?args, "invoking fork helper");
        let output = Command::new(&self.helper)
            .args(args)
            .kill_on_drop(false)
            .output()
            .await?;
        Ok(output)
    }

    async fn run_helper_checked(&self, args: &[&str]) -> Result<()> {
        let output = self.run_helper(args).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(Error::Runtime {
            reason: format!(
                "{} exited with {}: {}",
                args.first().copied().unwrap_or("helper"),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            log_tail: runtime_log_errors(&self.log_file()).await,
        })
    }
}

#[async_trait]
impl RuntimeHandle for ForkRuntime {
    async fn set_config_item(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Validation("empty runtime config key".into()));
        }
        let mut config = self.config.lock().await;
        config.push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn clear_config(&self) -> Result<()> {
        self.config.lock().await.clear();
        Ok(())
    }

    async fn render_config(&self) -> Result<PathBuf> {
        let config = self.config.lock().await;
        let mut rendered = String::new();
        for (key, value) in config.iter() {
            rendered.push_str(key);
            rendered.push_str(" = ");
            rendered.push_str(value);
            rendered.push('\n');
        }

        let path = self
            .runtime_path
            .join(&self.scoped_name)
            .join("lxc.conf");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, rendered).await?;
        Ok(path)
    }

    async fn start(&self, config_path: &Path) -> Result<()> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        let config = config_path.to_string_lossy().to_string();
        self.run_helper_checked(&["forkstart", &self.scoped_name, &runtime_path, &config])
            .await
    }

    async fn stop(&self) -> Result<()> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        self.run_helper_checked(&["forkstop", &self.scoped_name, &runtime_path])
            .await
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        let secs = timeout.as_secs().to_string();
        self.run_helper_checked(&[
            "forkstop",
            &self.scoped_name,
            &runtime_path,
            "--graceful",
            "--timeout",
            &secs,
        ])
        .await
    }

    async fn freeze(&self) -> Result<()> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        self.run_helper_checked(&["forkfreeze", &self.scoped_name, &runtime_path])
            .await
    }

    async fn unfreeze(&self) -> Result<()> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        self.run_helper_checked(&["forkfreeze", &self.scoped_name, &runtime_path, "--thaw"])
            .await
    }

    async fn attach_interface(&self, host_name: &str, guest_name: &str) -> Result<()> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        self.run_helper_checked(&[
            "forknet",
            "attach",
            &self.scoped_name,
            &runtime_path,
            host_name,
            guest_name,
        ])
        .await
    }

    async fn detach_interface(&self, guest_name: &str, host_name: &str) -> Result<()> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        self.run_helper_checked(&[
            "forknet",
            "detach",
            &self.scoped_name,
            &runtime_path,
            guest_name,
            host_name,
        ])
        .await
    }

    async fn state(&self) -> Result<RuntimeState> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        let output = self
            .run_helper(&["forkstate", &self.scoped_name, &runtime_path])
            .await?;
        if !output.status.success() {
            return Err(Error::runtime(format!(
                "forkstate exited with {}",
                output.status
            )));
        }
        Ok(RuntimeState::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn init_pid(&self) -> Result<Option<i32>> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        let output = self
            .run_helper(&["forkstate", &self.scoped_name, &runtime_path, "--pid"])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let raw = String::from_utf8_lossy(&output.stdout);
        Ok(raw.trim().parse::<i32>().ok().filter(|pid| *pid > 0))
    }

    async fn checkpoint(&self, state_dir: &Path, stop: bool) -> Result<()> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        let state_dir = state_dir.to_string_lossy().to_string();
        let mut args: Vec<&str> = vec![
            "forkmigrate",
            "dump",
            &self.scoped_name,
            &runtime_path,
            &state_dir,
        ];
        if stop {
            args.push("--stop");
        }
        self.run_helper_checked(&args).await
    }

    async fn restore_checkpoint(&self, state_dir: &Path, config_path: &Path) -> Result<()> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        let state_dir = state_dir.to_string_lossy().to_string();
        let config = config_path.to_string_lossy().to_string();
        self.run_helper_checked(&[
            "forkmigrate",
            "restore",
            &self.scoped_name,
            &runtime_path,
            &state_dir,
            &config,
        ])
        .await
    }

    async fn mount_into(
        &self,
        source: &Path,
        target: &str,
        fstype: &str,
        opts: &[String],
    ) -> Result<()> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        let source = source.to_string_lossy().to_string();
        let opts = opts.join(",");
        self.run_helper_checked(&[
            "forkmount",
            &self.scoped_name,
            &runtime_path,
            &source,
            target,
            fstype,
            &opts,
        ])
        .await
    }

    async fn umount_from(&self, target: &str) -> Result<()> {
        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        self.run_helper_checked(&["forkumount", &self.scoped_name, &runtime_path, target])
            .await
    }

    async fn inject_uevent(&self, payload: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let runtime_path = self.runtime_path.to_string_lossy().to_string();
        let len = payload.len().to_string();
        let mut child = Command::new(&self.helper)
            .args(["forkuevent", &self.scoped_name, &runtime_path, &len])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload).await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            warn!(status = %status, "uevent injection helper failed");
            return Err(Error::runtime("forkuevent failed"));
        }
        Ok(())
    }
}

/// Exit code convention of the exec helper: 0 for a normal exit,
/// `128 + N` when the child died on signal N, the child's real status
/// otherwise.
pub fn exec_exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    if let Some(signal) = status.signal() {
        return 128 + signal;
    }
    status.code().unwrap_or(0)
}

// =============================================================================
// Runtime Log
// =============================================================================

/// Extracts `ERROR` lines from the runtime log for failure context.
///
/// The runtime log format is `<date> <time> <LEVEL> <origin> - <msg>`;
/// only lines whose third field is `ERROR` matter.
pub async fn runtime_log_errors(log_path: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(log_path).await.ok()?;
    let mut collected = String::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[2] != "ERROR" {
            continue;
        }
        collected.push_str("  ");
        collected.push_str(line.trim());
        collected.push('\n');
    }
    if collected.is_empty() {
        None
    } else {
        Some(collected)
    }
}

/// Rotates the runtime log, keeping a single `.old` copy.
pub async fn rotate_runtime_log(log_dir: &Path) -> Result<()> {
    let current = log_dir.join(RUNTIME_LOG_FILE);
    if current.exists() {
        let old = log_dir.join(format!("{RUNTIME_LOG_FILE}.old"));
        tokio::fs::rename(&current, &old).await?;
    }
    Ok(())
}
