//! Subprocess execution for training runs.

use std::{collections::BTreeMap, fs::File, path::Path, process::Stdio};

use tokio::process::Command;

use crate::config::HarnessSettings;

/// Outcome of a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The kill signal was delivered.
    Killed,
    /// No such process; it had already exited.
    AlreadyGone,
}

/// Spawns entry scripts and signals their processes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    /// Program that executes the entry script.
    interpreter: String,
    /// Variables that receive the visible device list.
    visible_device_vars: Vec<String>,
    /// Extra environment for every child.
    env: BTreeMap<String, String>,
}

impl Supervisor {
    /// Create a new supervisor.
    #[must_use]
    pub fn new(
        interpreter: impl Into<String>,
        visible_device_vars: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            visible_device_vars,
            env,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &HarnessSettings) -> Self {
        Self::new(
            settings.interpreter.clone(),
            settings.visible_device_vars.clone(),
            settings.env.clone(),
        )
    }

    /// Spawn `<interpreter> <entry_script>` inside `workspace`.
    ///
    /// Only `devices` are visible to the child. Stdout and stderr both go to
    /// `log`. The child is reaped by a background task that logs its exit
    /// status; it never touches run records. Must be called within a Tokio
    /// runtime.
    pub fn launch(
        &self,
        workspace: &Path,
        entry_script: &str,
        devices: &[u32],
        log: File,
    ) -> Result<u32, SupervisorError> {
        let device_list = devices
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let stderr = log.try_clone().map_err(SupervisorError::Launch)?;

        tracing::debug!(
            "Spawning: {} {} in {} (devices: {device_list})",
            self.interpreter,
            entry_script,
            workspace.display()
        );

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(entry_script)
            .current_dir(workspace)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));
        for var in &self.visible_device_vars {
            cmd.env(var, &device_list);
        }

        let mut child = cmd.spawn().map_err(SupervisorError::Launch)?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Launch(std::io::Error::other("no PID")))?;

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!("Process {pid} exited: {status}"),
                Err(e) => tracing::warn!("Failed to wait for process {pid}: {e}"),
            }
        });

        Ok(pid)
    }

    /// Send `SIGKILL` to `pid`.
    ///
    /// A process that no longer exists is reported as [`Termination::AlreadyGone`].
    pub fn terminate(&self, pid: u32) -> Result<Termination, SupervisorError> {
        let raw = signal_target(pid)?;

        // SAFETY: kill has no memory-safety preconditions; `raw` is a positive pid
        let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
        if rc == 0 {
            tracing::info!("Sent SIGKILL to process {pid}");
            return Ok(Termination::Killed);
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(Termination::AlreadyGone)
        } else {
            Err(SupervisorError::Terminate(pid, err))
        }
    }
}

/// Reject pids that `kill` would interpret as process groups.
fn signal_target(pid: u32) -> Result<libc::pid_t, SupervisorError> {
    match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(raw),
        _ => Err(SupervisorError::Terminate(
            pid,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a valid process id"),
        )),
    }
}

/// Check if a process is alive by PID.
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = signal_target(pid) else {
        return false;
    };
    // SAFETY: kill with signal 0 is safe and just checks process existence
    if unsafe { libc::kill(raw, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Errors that can occur when launching or signalling a process.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn process: {0}")]
    Launch(std::io::Error),
    #[error("failed to terminate process {0}: {1}")]
    Terminate(u32, std::io::Error),
}
