//! Persisted instance records.
//!
//! The lifecycle manager reads and writes records through the [`InstanceStore`]
//! trait; the shipped implementation is SQLite-backed (`.roost/instances.db`)
//! with WAL mode for crash recovery and an advisory lock file guarding against
//! a second controller on the same root. Name uniqueness is enforced at the
//! store level.

mod sqlite;
mod types;

pub use sqlite::SqliteInstanceStore;
pub use types::{InstanceRecord, InstanceSpec, InstanceUpdate, Status};

use crate::error::Result;
use async_trait::async_trait;

/// Abstract record store. The persisted record is the serialization point for
/// lifecycle operations: implementations must make `insert` fail on a
/// duplicate name rather than overwrite.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// All instances, ordered by name.
    async fn list(&self) -> Result<Vec<InstanceRecord>>;

    /// Record by name, if present.
    async fn get(&self, name: &str) -> Result<Option<InstanceRecord>>;

    /// Persist a new record. Fails with `AlreadyExists` on a duplicate name.
    async fn insert(&self, record: &InstanceRecord) -> Result<()>;

    /// Commit mutations to an existing record. `path` and `env_path` are fixed
    /// at creation and are never rewritten. Fails with `NotFound` if the
    /// record is missing.
    async fn commit(&self, record: &InstanceRecord) -> Result<()>;

    /// Discard a record. Removing an absent record is not an error.
    async fn remove(&self, name: &str) -> Result<()>;
}
