//! Lifecycle manager behavior against scripted supervisor and provisioner
//! implementations: idempotence, self-healing, and mutation ordering.

use async_trait::async_trait;
use parking_lot::Mutex;
use roost::{
    Config, Error, InstanceManager, InstanceSpec, InstanceStore, InstanceUpdate, ProcessControl,
    ProcessHandle, Provisioner, SqliteInstanceStore, Status,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Shared event log for cross-component ordering assertions.
type EventLog = Arc<Mutex<Vec<String>>>;

struct MockSupervisor {
    next_pid: AtomicU32,
    spawn_count: AtomicUsize,
    alive: Mutex<HashSet<u32>>,
    events: EventLog,
}

impl MockSupervisor {
    fn new(events: EventLog) -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            spawn_count: AtomicUsize::new(0),
            alive: Mutex::new(HashSet::new()),
            events,
        }
    }

    fn spawns(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// Simulate the process exiting behind the controller's back.
    fn kill(&self, pid: u32) {
        self.alive.lock().remove(&pid);
    }
}

#[async_trait]
impl ProcessControl for MockSupervisor {
    async fn start(&self, _request: roost::SpawnRequest) -> roost::Result<ProcessHandle> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().insert(pid);
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(format!("spawn:{pid}"));
        Ok(ProcessHandle { pid })
    }

    async fn stop(&self, pid: u32) -> roost::Result<()> {
        self.alive.lock().remove(&pid);
        self.events.lock().push(format!("stop:{pid}"));
        Ok(())
    }

    async fn is_running(&self, pid: u32) -> bool {
        self.alive.lock().contains(&pid)
    }
}

struct MockProvisioner {
    provision_count: AtomicUsize,
    update_count: AtomicUsize,
    events: EventLog,
}

impl MockProvisioner {
    fn new(events: EventLog) -> Self {
        Self {
            provision_count: AtomicUsize::new(0),
            update_count: AtomicUsize::new(0),
            events,
        }
    }

    fn provisions(&self) -> usize {
        self.provision_count.load(Ordering::SeqCst)
    }

    fn updates(&self) -> usize {
        self.update_count.load(Ordering::SeqCst)
    }
}

impl Provisioner for MockProvisioner {
    fn provision(&self, _source: &str, dest: &Path, _version: Option<&str>) -> roost::Result<()> {
        if dest.exists() {
            return Err(Error::AlreadyExists(dest.display().to_string()));
        }
        std::fs::create_dir_all(dest)?;
        self.provision_count.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push("provision".to_string());
        Ok(())
    }

    fn update(&self, _dest: &Path, _version: Option<&str>) -> roost::Result<()> {
        self.update_count.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push("update".to_string());
        Ok(())
    }

    fn list_remote_branches(&self, _source: &str) -> roost::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

struct Harness {
    _root: TempDir,
    manager: InstanceManager,
    supervisor: Arc<MockSupervisor>,
    provisioner: Arc<MockProvisioner>,
    store: Arc<SqliteInstanceStore>,
    events: EventLog,
}

async fn harness() -> Harness {
    let root = tempfile::tempdir().expect("Failed to create temp dir");
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let supervisor = Arc::new(MockSupervisor::new(Arc::clone(&events)));
    let provisioner = Arc::new(MockProvisioner::new(Arc::clone(&events)));
    let store = Arc::new(SqliteInstanceStore::in_memory().await.unwrap());
    let manager = InstanceManager::new(
        Config::with_defaults(root.path()),
        Arc::clone(&store) as Arc<dyn InstanceStore>,
        Arc::clone(&supervisor) as Arc<dyn ProcessControl>,
        Arc::clone(&provisioner) as Arc<dyn Provisioner>,
    );
    Harness {
        _root: root,
        manager,
        supervisor,
        provisioner,
        store,
        events,
    }
}

fn spec(name: &str) -> InstanceSpec {
    InstanceSpec {
        name: name.to_string(),
        source: "https://example.com/bot.git".to_string(),
        version: None,
        port: None,
        owner: None,
    }
}

#[tokio::test]
async fn duplicate_create_fails_and_leaves_first_instance_untouched() {
    let h = harness().await;

    let first = h.manager.create(spec("bot1")).await.unwrap();
    // Marker inside the first checkout; must survive the failed second create.
    let marker = first.path.join("marker.txt");
    std::fs::write(&marker, "keep me").unwrap();

    let err = h.manager.create(spec("bot1")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));

    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "keep me");
    let record = h.manager.get("bot1").await.unwrap();
    assert_eq!(record.status, Status::Stopped);
}

#[tokio::test]
async fn create_persists_a_stopped_record_with_env_file() {
    let h = harness().await;

    let record = h
        .manager
        .create(InstanceSpec {
            port: Some(3000),
            version: Some("v1".to_string()),
            ..spec("bot1")
        })
        .await
        .unwrap();

    assert_eq!(record.status, Status::Stopped);
    assert!(record.pid.is_none());
    let env = std::fs::read_to_string(&record.env_path).unwrap();
    assert!(env.contains("INSTANCE=bot1\n"));
    assert!(env.contains("INSTANCE_VERSION=v1\n"));
    assert!(env.contains("PORT=3000\n"));
}

#[tokio::test]
async fn start_is_idempotent_and_spawns_exactly_once() {
    let h = harness().await;
    h.manager.create(spec("bot1")).await.unwrap();

    let first = h.manager.start("bot1").await.unwrap();
    let second = h.manager.start("bot1").await.unwrap();

    assert_eq!(first.pid, second.pid, "pid must be stable across starts");
    assert_eq!(second.status, Status::Running);
    assert_eq!(h.supervisor.spawns(), 1, "child spawned exactly once");
}

#[tokio::test]
async fn start_respawns_when_recorded_pid_is_dead() {
    let h = harness().await;
    h.manager.create(spec("bot1")).await.unwrap();

    let first = h.manager.start("bot1").await.unwrap();
    h.supervisor.kill(first.pid.unwrap());

    let second = h.manager.start("bot1").await.unwrap();
    assert_ne!(first.pid, second.pid, "a fresh pid must be recorded");
    assert_eq!(second.status, Status::Running);
    assert_eq!(h.supervisor.spawns(), 2);
}

#[tokio::test]
async fn start_corrects_stale_stopped_status_without_spawning() {
    let h = harness().await;
    h.manager.create(spec("bot1")).await.unwrap();
    let started = h.manager.start("bot1").await.unwrap();

    // Make the persisted status lie while the process stays alive.
    let mut record = h.store.get("bot1").await.unwrap().unwrap();
    record.status = Status::Stopped;
    h.store.commit(&record).await.unwrap();

    let corrected = h.manager.start("bot1").await.unwrap();
    assert_eq!(corrected.status, Status::Running);
    assert_eq!(corrected.pid, started.pid);
    assert_eq!(h.supervisor.spawns(), 1, "no duplicate process");
}

#[tokio::test]
async fn stop_is_idempotent() {
    let h = harness().await;
    h.manager.create(spec("bot1")).await.unwrap();

    // Stop with no recorded pid.
    let stopped = h.manager.stop("bot1").await.unwrap();
    assert_eq!(stopped.status, Status::Stopped);
    assert!(stopped.pid.is_none());

    // Stop with a pid whose process already exited.
    let started = h.manager.start("bot1").await.unwrap();
    h.supervisor.kill(started.pid.unwrap());
    let stopped = h.manager.stop("bot1").await.unwrap();
    assert_eq!(stopped.status, Status::Stopped);
    assert!(stopped.pid.is_none());

    // And again on the already-stopped instance.
    let stopped = h.manager.stop("bot1").await.unwrap();
    assert_eq!(stopped.status, Status::Stopped);
}

#[tokio::test]
async fn status_only_update_never_invokes_the_repository_path() {
    let h = harness().await;
    h.manager.create(spec("bot1")).await.unwrap();
    h.manager.start("bot1").await.unwrap();

    let record = h
        .manager
        .update(
            "bot1",
            InstanceUpdate {
                status: Some("stopped".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(record.status, Status::Stopped);
    assert_eq!(h.provisioner.updates(), 0, "no provisioning call occurred");
    assert_eq!(h.provisioner.provisions(), 1, "only the initial create");
}

#[tokio::test]
async fn update_to_current_status_is_a_no_op() {
    let h = harness().await;
    h.manager.create(spec("bot1")).await.unwrap();

    let record = h
        .manager
        .update(
            "bot1",
            InstanceUpdate {
                status: Some("stopped".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(record.status, Status::Stopped);
    assert_eq!(h.supervisor.spawns(), 0);
    assert_eq!(h.provisioner.updates(), 0);
}

#[tokio::test]
async fn update_rejects_unknown_status() {
    let h = harness().await;
    h.manager.create(spec("bot1")).await.unwrap();

    let err = h
        .manager
        .update(
            "bot1",
            InstanceUpdate {
                status: Some("crashed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidStatus(_)));
    assert_eq!(h.provisioner.updates(), 0);
    assert_eq!(h.supervisor.spawns(), 0);
}

#[tokio::test]
async fn version_update_while_running_stops_updates_then_restarts_fresh() {
    let h = harness().await;
    h.manager.create(spec("bot1")).await.unwrap();
    let started = h.manager.start("bot1").await.unwrap();
    let old_pid = started.pid.unwrap();

    let record = h
        .manager
        .update(
            "bot1",
            InstanceUpdate {
                version: Some("v2".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Desired status was running before the migration, so it remains running
    // on a fresh process.
    assert_eq!(record.status, Status::Running);
    assert_ne!(record.pid.unwrap(), old_pid, "restart must use a fresh pid");
    assert_eq!(record.version.as_deref(), Some("v2"));

    // Observable ordering: stop happens-before update happens-before respawn.
    let events = h.events.lock().clone();
    let stop_at = events
        .iter()
        .position(|e| e == &format!("stop:{old_pid}"))
        .expect("old process was stopped");
    let update_at = events.iter().position(|e| e == "update").unwrap();
    let respawn_at = events
        .iter()
        .rposition(|e| e.starts_with("spawn:"))
        .unwrap();
    assert!(stop_at < update_at, "stop must precede the checkout update");
    assert!(update_at < respawn_at, "checkout update must precede restart");

    // The env file reflects the new configuration.
    let env = std::fs::read_to_string(&record.env_path).unwrap();
    assert!(env.contains("INSTANCE_VERSION=v2\n"));
}

#[tokio::test]
async fn port_update_on_stopped_instance_rewrites_env_without_git_or_spawn() {
    let h = harness().await;
    h.manager
        .create(InstanceSpec {
            port: Some(3000),
            ..spec("bot1")
        })
        .await
        .unwrap();

    let record = h
        .manager
        .update(
            "bot1",
            InstanceUpdate {
                port: Some(4000),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(record.port, Some(4000));
    assert_eq!(record.status, Status::Stopped, "stopped instance stays stopped");
    assert_eq!(h.provisioner.updates(), 0, "port changes never touch git");
    assert_eq!(h.supervisor.spawns(), 0);

    let env = std::fs::read_to_string(&record.env_path).unwrap();
    assert!(env.contains("PORT=4000\n"));
    assert!(!env.contains("PORT=3000\n"));
}

#[tokio::test]
async fn unchanged_version_value_does_not_trigger_migration() {
    let h = harness().await;
    h.manager
        .create(InstanceSpec {
            version: Some("v1".to_string()),
            ..spec("bot1")
        })
        .await
        .unwrap();
    h.manager.start("bot1").await.unwrap();

    let record = h
        .manager
        .update(
            "bot1",
            InstanceUpdate {
                version: Some("v1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(h.provisioner.updates(), 0);
    assert_eq!(record.status, Status::Running, "no needless restart");
    assert_eq!(h.supervisor.spawns(), 1);
}

#[tokio::test]
async fn delete_stops_the_process_and_discards_the_record_only() {
    let h = harness().await;
    let created = h.manager.create(spec("bot1")).await.unwrap();
    let started = h.manager.start("bot1").await.unwrap();
    let pid = started.pid.unwrap();

    h.manager.delete("bot1").await.unwrap();

    assert!(
        !h.supervisor.is_running(pid).await,
        "process was terminated on delete"
    );
    assert!(matches!(
        h.manager.get("bot1").await.unwrap_err(),
        Error::NotFound(_)
    ));
    // The checkout is a caller policy choice; delete leaves it on disk.
    assert!(created.path.exists());
}

#[tokio::test]
async fn resume_restarts_instances_recorded_as_running() {
    let h = harness().await;
    h.manager.create(spec("bot1")).await.unwrap();
    h.manager.create(spec("bot2")).await.unwrap();

    let a = h.manager.start("bot1").await.unwrap();
    h.manager.start("bot2").await.unwrap();

    // bot1's process dies behind the controller's back.
    h.supervisor.kill(a.pid.unwrap());

    let resumed = h.manager.resume().await.unwrap();
    assert_eq!(resumed.len(), 2);
    for record in &resumed {
        assert_eq!(record.status, Status::Running);
        assert!(h.supervisor.is_running(record.pid.unwrap()).await);
    }
}

#[tokio::test]
async fn operations_on_distinct_instances_are_independent() {
    let h = harness().await;
    h.manager.create(spec("bot1")).await.unwrap();
    h.manager.create(spec("bot2")).await.unwrap();

    let (a, b) = tokio::join!(h.manager.start("bot1"), h.manager.start("bot2"));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.pid, b.pid);
    assert_eq!(h.supervisor.spawns(), 2);
}
