//! # Roost
//!
//! A controller that provisions bot instance checkouts from a git source and
//! supervises them as local OS processes.
//!
//! ## Features
//!
//! - **Provisioning**: clone a source repository per instance, optionally
//!   pinned to a version, with local-worktree mirroring for unpublished
//!   development sources
//! - **Supervision**: spawn, signal-probe, and gracefully terminate instance
//!   processes; stale pids self-heal on observation
//! - **Reconciliation**: idempotent start/stop, in-place version and port
//!   migration with stop-before-mutate ordering, resume after controller
//!   restart
//! - **Main process**: a singleton process sharing the same primitives with
//!   pid-file identity
//!
//! ## Quick Start
//!
//! ```no_run
//! use roost::{Config, GitProvisioner, InstanceManager, InstanceSpec,
//!             ProcessSupervisor, SqliteInstanceStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), roost::Error> {
//! let config = Config::load(".")?;
//! let store = Arc::new(SqliteInstanceStore::open(&config.data_dir).await?);
//! let supervisor = Arc::new(ProcessSupervisor::new(config.base_env.clone()));
//! let manager = InstanceManager::new(config, store, supervisor, Arc::new(GitProvisioner::new()));
//!
//! let instance = manager
//!     .create(InstanceSpec {
//!         name: "bot1".into(),
//!         source: "https://example.com/bot.git".into(),
//!         version: None,
//!         port: Some(3000),
//!         owner: None,
//!     })
//!     .await?;
//! manager.start(&instance.name).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! One controller process. Lifecycle operations on the same instance name are
//! serialized behind a per-name mutex; distinct names proceed concurrently.
//! Git work runs on the blocking pool; no operation carries an implicit
//! timeout or is cancellable mid-flight.

pub mod config;
pub mod envfile;
pub mod error;
pub mod lifecycle;
pub mod main_process;
pub mod provision;
pub mod state;
pub mod supervisor;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use lifecycle::InstanceManager;
pub use main_process::{MainProcessManager, MainStatus};
pub use provision::{GitProvisioner, Provisioner};
pub use state::{InstanceRecord, InstanceSpec, InstanceStore, InstanceUpdate, SqliteInstanceStore, Status};
pub use supervisor::{ProcessControl, ProcessHandle, ProcessSupervisor, SpawnRequest};
