use super::types::{InstanceRecord, Status};
use super::InstanceStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::params;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

const DB_FILE_NAME: &str = "instances.db";
const LOCK_FILE_NAME: &str = ".lock";

/// SQLite-backed instance record store.
///
/// WAL journal mode gives crash recovery; an advisory lock file
/// (`.roost/.lock`) warns when a second controller opens the same root. The
/// lock is held for the lifetime of the store and released on drop.
pub struct SqliteInstanceStore {
    conn: Connection,
    /// Advisory lock handle. `Option` allows graceful degradation when
    /// another controller already holds the lock.
    #[allow(dead_code)]
    lock_file: Option<std::fs::File>,
}

impl SqliteInstanceStore {
    /// Open (or create) the store inside the controller data directory.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let lock_file = Self::try_acquire_lock(&data_dir.join(LOCK_FILE_NAME))?;

        let conn = Connection::open(data_dir.join(DB_FILE_NAME)).await?;
        conn.call(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        })
        .await?;

        let store = Self { conn, lock_file };
        store.init_schema().await?;
        Ok(store)
    }

    /// Ephemeral in-memory store for tests: no file, no lock.
    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open(":memory:").await?;
        let store = Self {
            conn,
            lock_file: None,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS instances (
                        name            TEXT PRIMARY KEY,
                        status          TEXT NOT NULL,
                        path            TEXT NOT NULL,
                        env_path        TEXT NOT NULL,
                        version         TEXT,
                        port            INTEGER,
                        pid             INTEGER,
                        owner           TEXT,
                        created_at      TEXT NOT NULL,
                        updated_at      TEXT NOT NULL,
                        last_started_at TEXT
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Try to take the advisory lock. Returns `None` (with a warning) when
    /// another live controller holds it; a lock left behind by a dead process
    /// is treated as stale.
    fn try_acquire_lock(lock_path: &Path) -> Result<Option<std::fs::File>> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| Error::Filesystem(format!("opening lock file: {e}")))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                debug!(path = %lock_path.display(), "acquired advisory lock");
                Ok(Some(file))
            }
            Err(_) => {
                if let Ok(contents) = std::fs::read_to_string(lock_path) {
                    if let Ok(pid) = contents.trim().parse::<i32>() {
                        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok() {
                            warn!(
                                owner_pid = pid,
                                "another controller holds the store lock; state conflicts are possible"
                            );
                        } else {
                            debug!(owner_pid = pid, "stale store lock (owner is dead)");
                        }
                    }
                }
                // Proceed without the lock so read-only use keeps working.
                Ok(None)
            }
        }
    }
}

fn to_sql_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRecord> {
    let status: String = row.get(1)?;
    let path: String = row.get(2)?;
    let env_path: String = row.get(3)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    let last_started_at: Option<String> = row.get(10)?;

    Ok(InstanceRecord {
        name: row.get(0)?,
        status: Status::parse(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        path: PathBuf::from(path),
        env_path: PathBuf::from(env_path),
        version: row.get(4)?,
        port: row.get(5)?,
        pid: row.get(6)?,
        owner: row.get(7)?,
        created_at: parse_ts(8, &created_at)?,
        updated_at: parse_ts(9, &updated_at)?,
        last_started_at: last_started_at
            .as_deref()
            .map(|ts| parse_ts(10, ts))
            .transpose()?,
    })
}

const SELECT_COLUMNS: &str = "name, status, path, env_path, version, port, pid, owner, \
                              created_at, updated_at, last_started_at";

#[async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn list(&self) -> Result<Vec<InstanceRecord>> {
        let records = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM instances ORDER BY name"
                ))?;
                let rows = stmt.query_map([], row_to_record)?;
                let mut records = Vec::new();
                for row in rows {
                    records.push(row?);
                }
                Ok(records)
            })
            .await?;
        Ok(records)
    }

    async fn get(&self, name: &str) -> Result<Option<InstanceRecord>> {
        let name = name.to_string();
        let record = self
            .conn
            .call(move |conn| {
                use rusqlite::OptionalExtension;
                let record = conn
                    .query_row(
                        &format!("SELECT {SELECT_COLUMNS} FROM instances WHERE name = ?1"),
                        params![name],
                        row_to_record,
                    )
                    .optional()?;
                Ok(record)
            })
            .await?;
        Ok(record)
    }

    async fn insert(&self, record: &InstanceRecord) -> Result<()> {
        let r = record.clone();
        let result = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO instances (name, status, path, env_path, version, port, pid, \
                     owner, created_at, updated_at, last_started_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        r.name,
                        r.status.as_str(),
                        r.path.to_string_lossy(),
                        r.env_path.to_string_lossy(),
                        r.version,
                        r.port,
                        r.pid,
                        r.owner,
                        to_sql_ts(r.created_at),
                        to_sql_ts(r.updated_at),
                        r.last_started_at.map(to_sql_ts),
                    ],
                )?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::AlreadyExists(format!(
                    "instance '{}' is already registered",
                    record.name
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn commit(&self, record: &InstanceRecord) -> Result<()> {
        let r = record.clone();
        let updated = self
            .conn
            .call(move |conn| {
                // path and env_path are deliberately absent: fixed at creation.
                let updated = conn.execute(
                    "UPDATE instances SET status = ?2, version = ?3, port = ?4, pid = ?5, \
                     owner = ?6, updated_at = ?7, last_started_at = ?8 WHERE name = ?1",
                    params![
                        r.name,
                        r.status.as_str(),
                        r.version,
                        r.port,
                        r.pid,
                        r.owner,
                        to_sql_ts(r.updated_at),
                        r.last_started_at.map(to_sql_ts),
                    ],
                )?;
                Ok(updated)
            })
            .await?;

        if updated == 0 {
            return Err(Error::NotFound(format!(
                "instance '{}' is not registered",
                record.name
            )));
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM instances WHERE name = ?1", params![name])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
