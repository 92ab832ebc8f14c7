use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Observed instance state. Two states only: a crashed process is not tracked,
/// it collapses to `Stopped` on the next liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Stopped,
    Running,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Stopped => "stopped",
            Status::Running => "running",
        }
    }

    /// Parse a caller-supplied desired status. Anything outside the two known
    /// states is `InvalidStatus`.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "stopped" => Ok(Status::Stopped),
            "running" => Ok(Status::Running),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record for one managed checkout+process pairing.
///
/// `path` and `env_path` are fixed at creation time and never change for the
/// life of the instance; only their contents change on version updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Unique name; also the checkout directory name.
    pub name: String,
    pub status: Status,
    pub path: PathBuf,
    pub env_path: PathBuf,
    /// Declared source version reference (branch, tag, or commit).
    pub version: Option<String>,
    pub port: Option<u16>,
    /// Present only while the instance is believed running. Never trusted
    /// blindly: a pid that fails a liveness probe is cleared on observation.
    pub pid: Option<u32>,
    /// Owning principal, lookup only; no lifecycle coupling.
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_started_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    pub fn new(
        name: String,
        path: PathBuf,
        env_path: PathBuf,
        version: Option<String>,
        port: Option<u16>,
        owner: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name,
            status: Status::Stopped,
            path,
            env_path,
            version,
            port,
            pid: None,
            owner,
            created_at: now,
            updated_at: now,
            last_started_at: None,
        }
    }
}

/// Desired configuration for a new instance.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    /// Source repository: a URL or a local working-tree path.
    pub source: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub owner: Option<String>,
}

/// Desired-state delta for an existing instance. Absent fields are unchanged.
///
/// `status` is carried as raw text so the core, not the boundary, decides what
/// a valid status is.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceUpdate {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}
