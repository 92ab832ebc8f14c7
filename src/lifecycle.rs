//! Instance lifecycle orchestration.
//!
//! Composes the provisioner, env writer, supervisor, and record store into the
//! per-instance state machine: stopped ⇄ running. "Crashed" is not a tracked
//! state; a dead pid collapses to stopped on the next liveness check.
//!
//! # Serialization
//!
//! Every operation on a given instance name runs under that name's async
//! mutex, so start/stop/update/delete on one instance never interleave.
//! Operations on distinct names proceed concurrently. Blocking git work runs
//! on the blocking pool.

use crate::config::Config;
use crate::envfile::write_env_file;
use crate::error::{Error, Result};
use crate::provision::Provisioner;
use crate::state::{InstanceRecord, InstanceSpec, InstanceStore, InstanceUpdate, Status};
use crate::supervisor::{ProcessControl, SpawnRequest};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Synchronous guard for the lock map itself; never held across await points.
type SyncMutex<T> = parking_lot::Mutex<T>;

pub struct InstanceManager {
    config: Config,
    store: Arc<dyn InstanceStore>,
    supervisor: Arc<dyn ProcessControl>,
    provisioner: Arc<dyn Provisioner>,
    /// Per-name operation locks. Entries are created on first use and kept
    /// for the life of the manager.
    locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InstanceManager {
    pub fn new(
        config: Config,
        store: Arc<dyn InstanceStore>,
        supervisor: Arc<dyn ProcessControl>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            config,
            store,
            supervisor,
            provisioner,
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    pub async fn list(&self) -> Result<Vec<InstanceRecord>> {
        self.store.list().await
    }

    pub async fn get(&self, name: &str) -> Result<InstanceRecord> {
        self.get_record(name).await
    }

    /// Provision a new instance: clone the source into the per-install
    /// instances directory, write the env file, persist a stopped record.
    ///
    /// `AlreadyExists`, `CloneFailed`, and `VersionNotFound` surface from
    /// provisioning unchanged.
    #[tracing::instrument(skip(self, spec), fields(instance.name = %spec.name))]
    pub async fn create(&self, spec: InstanceSpec) -> Result<InstanceRecord> {
        let lock = self.lock_for(&spec.name);
        let _guard = lock.lock().await;

        let path = self.config.instance_path(&spec.name);
        let env_path = self.config.instance_env_path(&spec.name);

        self.run_provision(spec.source.clone(), path.clone(), spec.version.clone())
            .await?;
        write_env_file(&env_path, &spec.name, spec.version.as_deref(), spec.port)?;

        let record = InstanceRecord::new(
            spec.name,
            path,
            env_path,
            spec.version,
            spec.port,
            spec.owner,
        );
        self.store.insert(&record).await?;
        tracing::info!(path = %record.path.display(), "instance created");
        Ok(record)
    }

    /// Idempotent start. A live recorded pid short-circuits the spawn; a dead
    /// one is cleared and replaced.
    #[tracing::instrument(skip(self), fields(instance.name = %name))]
    pub async fn start(&self, name: &str) -> Result<InstanceRecord> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let mut record = self.get_record(name).await?;
        self.start_inner(&mut record).await?;
        Ok(record)
    }

    /// Idempotent stop. Unconditionally terminal: the record ends stopped
    /// with no pid whether or not a live process was found.
    #[tracing::instrument(skip(self), fields(instance.name = %name))]
    pub async fn stop(&self, name: &str) -> Result<InstanceRecord> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let mut record = self.get_record(name).await?;
        self.stop_inner(&mut record).await?;
        Ok(record)
    }

    /// Apply a desired-state delta: status transition, version migration,
    /// and/or port change.
    ///
    /// On a version or port change the instance is stopped before the
    /// checkout or env file is touched, so a live process never observes a
    /// mid-mutation state; it is restarted afterwards when the desired status
    /// is running.
    #[tracing::instrument(skip(self, delta), fields(instance.name = %name))]
    pub async fn update(&self, name: &str, delta: InstanceUpdate) -> Result<InstanceRecord> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let mut record = self.get_record(name).await?;

        // Validate before mutating anything.
        let requested = delta.status.as_deref().map(Status::parse).transpose()?;

        let version_changed =
            matches!(&delta.version, Some(v) if record.version.as_ref() != Some(v));
        let port_changed = matches!(delta.port, Some(p) if record.port != Some(p));

        if !version_changed && !port_changed {
            if let Some(desired) = requested {
                if desired != record.status {
                    match desired {
                        Status::Running => self.start_inner(&mut record).await?,
                        Status::Stopped => self.stop_inner(&mut record).await?,
                    }
                }
            }
            return Ok(record);
        }

        // Absent a requested status, the instance keeps the status it had
        // before the migration.
        let desired = requested.unwrap_or(record.status);

        // A running process must never have its checkout mutated under it.
        if record.status == Status::Running {
            self.stop_inner(&mut record).await?;
        }

        if version_changed {
            let version = delta.version.clone();
            self.run_update(record.path.clone(), version.clone()).await?;
            record.version = version;
        }
        if port_changed {
            record.port = delta.port;
        }

        write_env_file(
            &record.env_path,
            &record.name,
            record.version.as_deref(),
            record.port,
        )?;
        record.updated_at = Utc::now();
        self.store.commit(&record).await?;

        if desired == Status::Running {
            self.start_inner(&mut record).await?;
        }
        Ok(record)
    }

    /// Stop the instance and discard its record. The checkout is left on disk:
    /// filesystem removal is a caller policy choice, not this operation's.
    #[tracing::instrument(skip(self), fields(instance.name = %name))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let mut record = self.get_record(name).await?;
        self.stop_inner(&mut record).await?;
        self.store.remove(name).await?;
        tracing::info!("instance deleted (checkout left on disk)");
        Ok(())
    }

    /// Reconcile after a controller restart: every record persisted as
    /// running gets a start call, which either adopts the still-live process
    /// or respawns a dead one.
    pub async fn resume(&self) -> Result<Vec<InstanceRecord>> {
        let mut resumed = Vec::new();
        for record in self.store.list().await? {
            if record.status == Status::Running {
                match self.start(&record.name).await {
                    Ok(record) => resumed.push(record),
                    Err(e) => {
                        tracing::warn!(instance.name = %record.name, error = %e, "resume failed")
                    }
                }
            }
        }
        Ok(resumed)
    }

    /// Caller must hold the instance lock.
    async fn start_inner(&self, record: &mut InstanceRecord) -> Result<()> {
        if let Some(pid) = record.pid {
            if self.supervisor.is_running(pid).await {
                if record.status == Status::Running {
                    // Already running; nothing to do, no duplicate process.
                    return Ok(());
                }
                // Process is alive but the status went stale; correct it
                // without spawning.
                tracing::debug!(pid, "correcting stale stopped status for live process");
                record.status = Status::Running;
                record.updated_at = Utc::now();
                self.store.commit(record).await?;
                return Ok(());
            }
            tracing::debug!(pid, "recorded pid is dead; clearing before respawn");
            record.pid = None;
        }

        let request = SpawnRequest::new(
            self.config.instance_command.clone(),
            record.path.clone(),
            record.env_path.clone(),
        );
        let handle = self.supervisor.start(request).await?;

        let now = Utc::now();
        record.pid = Some(handle.pid);
        record.status = Status::Running;
        record.last_started_at = Some(now);
        record.updated_at = now;
        self.store.commit(record).await?;
        tracing::info!(pid = handle.pid, "instance started");
        Ok(())
    }

    /// Caller must hold the instance lock.
    async fn stop_inner(&self, record: &mut InstanceRecord) -> Result<()> {
        if let Some(pid) = record.pid {
            // Stop is unconditionally terminal: a failed termination request
            // still ends with the record stopped. A missing process is
            // already success at the supervisor level.
            if let Err(e) = self.supervisor.stop(pid).await {
                tracing::warn!(pid, error = %e, "termination request failed; marking stopped");
            }
        }
        record.pid = None;
        record.status = Status::Stopped;
        record.updated_at = Utc::now();
        self.store.commit(record).await?;
        tracing::info!("instance stopped");
        Ok(())
    }

    async fn get_record(&self, name: &str) -> Result<InstanceRecord> {
        self.store
            .get(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance '{name}' is not registered")))
    }

    fn lock_for(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    async fn run_provision(
        &self,
        source: String,
        dest: PathBuf,
        version: Option<String>,
    ) -> Result<()> {
        let provisioner = Arc::clone(&self.provisioner);
        tokio::task::spawn_blocking(move || {
            provisioner.provision(&source, &dest, version.as_deref())
        })
        .await
        .map_err(|e| Error::Filesystem(format!("provisioning task panicked: {e}")))?
    }

    async fn run_update(&self, dest: PathBuf, version: Option<String>) -> Result<()> {
        let provisioner = Arc::clone(&self.provisioner);
        tokio::task::spawn_blocking(move || provisioner.update(&dest, version.as_deref()))
            .await
            .map_err(|e| Error::Filesystem(format!("update task panicked: {e}")))?
    }
}
