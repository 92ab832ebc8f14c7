//! OS process supervision: spawn, signal-probe, and terminate.
//!
//! The supervisor knows nothing about instances or git. It spawns a command
//! with a layered environment, probes liveness with a zero-effect signal, and
//! requests termination with SIGTERM. Children are detached: no handle is kept,
//! identity is the PID alone, and the tokio runtime reaps the child when it
//! exits.
//!
//! Liveness by PID is best-effort. The OS may recycle a PID after the process
//! exits, so a positive probe can in rare cases refer to an unrelated process.
//! Callers treat a positive probe as advisory, never as proof.

use crate::error::{validate_pid, validate_pid_for_check, Error, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Name of the QR side-channel file a spawned instance may write.
pub const QR_FILE_NAME: &str = "qr.txt";

/// A spawned child, identified by its OS process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

/// Everything needed to spawn one instance process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Argv vector; never interpreted by a shell.
    pub command: Vec<String>,
    pub work_dir: PathBuf,
    /// Env file the child reads its identity from, injected as `ENV_PATH`.
    pub env_path: PathBuf,
    /// Caller-supplied overrides, applied last (later wins).
    pub overrides: HashMap<String, String>,
}

impl SpawnRequest {
    pub fn new(command: Vec<String>, work_dir: impl Into<PathBuf>, env_path: impl Into<PathBuf>) -> Self {
        Self {
            command,
            work_dir: work_dir.into(),
            env_path: env_path.into(),
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }
}

/// Seam between lifecycle management and the OS.
///
/// The lifecycle managers are written against this trait so tests can drive
/// them with a scripted implementation instead of real processes.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Spawn the command. No retry: a spawn failure surfaces immediately.
    async fn start(&self, request: SpawnRequest) -> Result<ProcessHandle>;

    /// Request graceful termination. A process that no longer exists is
    /// success, not an error: the desired end state already holds.
    async fn stop(&self, pid: u32) -> Result<()>;

    /// Probe liveness without affecting the process. EPERM means the process
    /// exists but belongs to someone else, which still counts as alive.
    async fn is_running(&self, pid: u32) -> bool;
}

/// Real supervisor backed by tokio::process and Unix signals.
#[derive(Debug, Default, Clone)]
pub struct ProcessSupervisor {
    /// Supervisor-level env overrides, applied over the controller's own
    /// environment and under the per-spawn keys.
    base_env: HashMap<String, String>,
}

impl ProcessSupervisor {
    pub fn new(base_env: HashMap<String, String>) -> Self {
        Self { base_env }
    }

    /// Build the child environment. Precedence, later wins: controller env,
    /// supervisor base overrides, instance keys, caller overrides.
    fn build_env(&self, request: &SpawnRequest) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(self.base_env.clone());
        env.insert(
            "ENV_PATH".to_string(),
            request.env_path.to_string_lossy().into_owned(),
        );
        env.insert(
            "INSTANCE_PATH".to_string(),
            request.work_dir.to_string_lossy().into_owned(),
        );
        env.insert(
            "QR_PATH".to_string(),
            request
                .work_dir
                .join(QR_FILE_NAME)
                .to_string_lossy()
                .into_owned(),
        );
        env.extend(request.overrides.clone());
        env
    }
}

#[async_trait]
impl ProcessControl for ProcessSupervisor {
    async fn start(&self, request: SpawnRequest) -> Result<ProcessHandle> {
        let Some((program, args)) = request.command.split_first() else {
            return Err(Error::SpawnFailed("empty command".to_string()));
        };

        let env = self.build_env(&request);

        tracing::debug!(
            command = ?request.command,
            work_dir = %request.work_dir.display(),
            "spawning instance process"
        );

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.work_dir)
            .env_clear()
            .envs(&env)
            // The child outlives this call and any surrounding request; a new
            // process group keeps controller-directed signals away from it.
            .kill_on_drop(false)
            .process_group(0);

        let child = cmd.spawn().map_err(|e| {
            Error::SpawnFailed(format!(
                "{} (in {}): {}",
                program,
                request.work_dir.display(),
                e
            ))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::SpawnFailed(format!("{program}: exited before pid was read")))?;

        // Detach. Tokio moves the dropped child to its orphan queue and reaps
        // it on exit; from here on the PID is the only identity we hold.
        drop(child);

        tracing::info!(pid, command = %program, "process started");
        Ok(ProcessHandle { pid })
    }

    async fn stop(&self, pid: u32) -> Result<()> {
        let target = validate_pid(pid)?;
        match signal::kill(target, Signal::SIGTERM) {
            Ok(()) => {
                tracing::debug!(pid, "sent SIGTERM");
                Ok(())
            }
            // Already gone: the desired end state holds.
            Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(Error::Signal { pid, errno }),
        }
    }

    async fn is_running(&self, pid: u32) -> bool {
        let Some(target) = validate_pid_for_check(pid) else {
            return false;
        };
        match signal::kill(target, None) {
            Ok(()) => true,
            // Exists but not ours; existence is what is being tested.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Path of the QR side-channel file inside an instance checkout.
pub fn qr_path(instance_path: &Path) -> PathBuf {
    instance_path.join(QR_FILE_NAME)
}
