//! The singleton "main" process.
//!
//! A degenerate single-slot variant of the instance lifecycle: no repository,
//! no name, no record store. Identity is one pid persisted in a well-known
//! file inside the controller data directory. The pid file can outlive a
//! controller restart while the process itself has died, so every status read
//! validates the pid with a liveness probe and self-heals a stale file.

use crate::config::Config;
use crate::error::Result;
use crate::supervisor::{ProcessControl, SpawnRequest};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Status record for the main process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MainStatus {
    pub running: bool,
    pub pid: Option<u32>,
}

impl MainStatus {
    fn stopped() -> Self {
        Self {
            running: false,
            pid: None,
        }
    }
}

pub struct MainProcessManager {
    supervisor: Arc<dyn ProcessControl>,
    command: Vec<String>,
    work_dir: PathBuf,
    env_path: PathBuf,
    pid_path: PathBuf,
    /// Single-slot lock: start/stop/status never interleave, the same
    /// discipline instance records get per name.
    lock: AsyncMutex<()>,
}

impl MainProcessManager {
    pub fn new(config: &Config, supervisor: Arc<dyn ProcessControl>) -> Self {
        Self {
            supervisor,
            command: config.main_command.clone(),
            work_dir: config.main_work_dir().to_path_buf(),
            env_path: config.main_env_path.clone(),
            pid_path: config.main_pid_path.clone(),
            lock: AsyncMutex::new(()),
        }
    }

    /// Current status. A persisted pid that fails the liveness probe is
    /// cleared from disk and reported as not running.
    pub async fn status(&self) -> Result<MainStatus> {
        let _guard = self.lock.lock().await;
        self.status_inner().await
    }

    /// Idempotent start: a live persisted pid is returned as-is, otherwise
    /// the fixed command is spawned and its pid persisted.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<MainStatus> {
        let _guard = self.lock.lock().await;

        let status = self.status_inner().await?;
        if status.running {
            return Ok(status);
        }

        let request = SpawnRequest::new(
            self.command.clone(),
            self.work_dir.clone(),
            self.env_path.clone(),
        )
        // The main process must not spawn its own controller.
        .with_override("BACKEND_DISABLED", "1");

        let handle = self.supervisor.start(request).await?;
        self.write_pid(handle.pid)?;
        tracing::info!(pid = handle.pid, "main process started");
        Ok(MainStatus {
            running: true,
            pid: Some(handle.pid),
        })
    }

    /// Idempotent stop: terminates the persisted pid if any, then clears the
    /// pid file either way.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> Result<MainStatus> {
        let _guard = self.lock.lock().await;

        if let Some(pid) = self.read_pid() {
            self.supervisor.stop(pid).await?;
            tracing::info!(pid, "main process stopped");
        }
        self.clear_pid()?;
        Ok(MainStatus::stopped())
    }

    async fn status_inner(&self) -> Result<MainStatus> {
        let Some(pid) = self.read_pid() else {
            return Ok(MainStatus::stopped());
        };
        if !self.supervisor.is_running(pid).await {
            tracing::debug!(pid, "stale main pid file; clearing");
            self.clear_pid()?;
            return Ok(MainStatus::stopped());
        }
        Ok(MainStatus {
            running: true,
            pid: Some(pid),
        })
    }

    /// Read the persisted pid. A corrupt file counts as absent and is
    /// removed.
    fn read_pid(&self) -> Option<u32> {
        let contents = std::fs::read_to_string(&self.pid_path).ok()?;
        match contents.trim().parse::<u32>() {
            Ok(pid) => Some(pid),
            Err(_) => {
                tracing::warn!(path = %self.pid_path.display(), "corrupt main pid file; removing");
                let _ = std::fs::remove_file(&self.pid_path);
                None
            }
        }
    }

    fn write_pid(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.pid_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.pid_path, format!("{pid}\n"))?;
        Ok(())
    }

    fn clear_pid(&self) -> Result<()> {
        match std::fs::remove_file(&self.pid_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
