//! Controller configuration.
//!
//! All paths derive from a single controller root: the instances directory holds
//! provisioned checkouts, the data directory holds controller-internal state
//! (the record store and the main-process pid file). An optional `roost.yaml` at
//! the root overlays the defaults.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Controller-internal data directory name, relative to the root.
///
/// This segment is also excluded from worktree mirroring so controller state
/// never leaks into a provisioned instance.
pub const DATA_DIR_NAME: &str = ".roost";

/// Directory under the root where instance checkouts are provisioned.
pub const INSTANCES_DIR_NAME: &str = "instances";

/// Pid file for the singleton main process, inside the data directory.
pub const MAIN_PID_FILE: &str = "main.pid";

const CONFIG_FILE_NAME: &str = "roost.yaml";

fn default_instance_command() -> Vec<String> {
    vec!["node".to_string(), "index.js".to_string()]
}

fn default_main_command() -> Vec<String> {
    vec![
        "node".to_string(),
        "index.js".to_string(),
        "--main".to_string(),
    ]
}

/// Optional YAML overlay for [`Config`]. Absent fields keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    instance_command: Option<Vec<String>>,
    main_command: Option<Vec<String>>,
    main_env_path: Option<PathBuf>,
    #[serde(default)]
    base_env: HashMap<String, String>,
}

/// Resolved controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Controller root. Instance checkouts and controller data live under it.
    pub root: PathBuf,
    /// Where instance checkouts are provisioned (`<root>/instances`).
    pub instances_dir: PathBuf,
    /// Controller-internal state (`<root>/.roost`).
    pub data_dir: PathBuf,
    /// Command an instance process is started with, relative to its checkout.
    pub instance_command: Vec<String>,
    /// Command the singleton main process is started with, run from the root.
    pub main_command: Vec<String>,
    /// Env file handed to the main process (`<root>/.env` by default).
    pub main_env_path: PathBuf,
    /// Pid file for the main process (`<data_dir>/main.pid`).
    pub main_pid_path: PathBuf,
    /// Supervisor-level environment overrides applied to every spawned process.
    pub base_env: HashMap<String, String>,
}

impl Config {
    /// Build a configuration with defaults rooted at `root`, overlaying
    /// `roost.yaml` if one exists there.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let mut config = Self::with_defaults(root);

        let config_path = config.root.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            let overlay: ConfigFile = serde_yaml::from_str(&contents).map_err(|e| {
                Error::Filesystem(format!("Invalid {}: {}", config_path.display(), e))
            })?;
            config.apply_overlay(overlay);
        }

        Ok(config)
    }

    /// Defaults only, no overlay. Used by tests and embedders.
    pub fn with_defaults(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let data_dir = root.join(DATA_DIR_NAME);
        Self {
            instances_dir: root.join(INSTANCES_DIR_NAME),
            main_env_path: root.join(".env"),
            main_pid_path: data_dir.join(MAIN_PID_FILE),
            data_dir,
            instance_command: default_instance_command(),
            main_command: default_main_command(),
            base_env: HashMap::new(),
            root,
        }
    }

    fn apply_overlay(&mut self, overlay: ConfigFile) {
        if let Some(cmd) = overlay.instance_command {
            self.instance_command = cmd;
        }
        if let Some(cmd) = overlay.main_command {
            self.main_command = cmd;
        }
        if let Some(path) = overlay.main_env_path {
            self.main_env_path = self.resolve(path);
        }
        self.base_env.extend(overlay.base_env);
    }

    fn resolve(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }

    /// Checkout path for an instance, fixed at creation time.
    pub fn instance_path(&self, name: &str) -> PathBuf {
        self.instances_dir.join(name)
    }

    /// Env file path for an instance, fixed at creation time.
    pub fn instance_env_path(&self, name: &str) -> PathBuf {
        self.instance_path(name).join(".env")
    }

    /// Working directory for the main process.
    pub fn main_work_dir(&self) -> &Path {
        &self.root
    }
}
