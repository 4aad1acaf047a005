//! Sync configuration stored at `<root>/.pushwork/config`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::io::{self, PUSHWORK_DIR, TEMP_DIR};

/// Current config format version.
pub const CONFIG_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config not found at {0} (is this a pushwork root?)")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Unsupported config version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("Unknown config key: {0}")]
    UnknownKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Move-detection thresholds, both in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoveThresholds {
    /// Scores at or above this apply as moves without asking.
    pub auto: f64,
    /// Scores at or above this prompt; below are delete + create.
    pub prompt: f64,
}

impl Default for MoveThresholds {
    fn default() -> Self {
        Self { auto: 0.8, prompt: 0.5 }
    }
}

/// Per-root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub version: u32,

    /// Shared document-store location (the sync server). When unset the
    /// store is private to this root under `.pushwork/automerge/`.
    pub sync_server: Option<String>,

    /// Identity advertised by the sync server, recorded at clone time.
    pub sync_server_id: Option<String>,

    /// Gitignore-syntax exclude patterns, applied relative to the root.
    pub exclude: Vec<String>,

    pub move_thresholds: MoveThresholds,

    /// Bound on parallel I/O batches.
    pub parallelism: usize,

    /// Subtrees whose files get a content hash recorded in the snapshot
    /// so pulls can skip the remote read.
    pub artifact_directories: Vec<String>,

    /// Per-document upload barrier timeout.
    pub upload_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            sync_server: None,
            sync_server_id: None,
            exclude: Vec::new(),
            move_thresholds: MoveThresholds::default(),
            parallelism: 4,
            artifact_directories: Vec::new(),
            upload_timeout_secs: 60,
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = config_path(root);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path));
            },
            Err(e) => return Err(e.into()),
        };

        let config: Config = serde_json::from_slice(&data)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if config.version != CONFIG_VERSION {
            return Err(ConfigError::Version {
                found: config.version,
                expected: CONFIG_VERSION,
            });
        }
        if config.move_thresholds.prompt > config.move_thresholds.auto {
            return Err(ConfigError::Invalid(
                "move_thresholds.prompt must not exceed move_thresholds.auto".into(),
            ));
        }

        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<(), ConfigError> {
        let dir = pushwork_dir(root);
        io::ensure_directory(&dir)?;
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        io::atomic_write(&config_path(root), &dir.join(TEMP_DIR), &data)?;
        Ok(())
    }

    /// Resolve the document store directory for this root.
    pub fn store_dir(&self, root: &Path) -> PathBuf {
        match &self.sync_server {
            Some(server) => PathBuf::from(server),
            None => pushwork_dir(root).join("automerge"),
        }
    }

    /// Read a single key for `pushwork config get`.
    pub fn get_key(&self, key: &str) -> Result<String, ConfigError> {
        Ok(match key {
            "sync_server" => self.sync_server.clone().unwrap_or_default(),
            "sync_server_id" => self.sync_server_id.clone().unwrap_or_default(),
            "exclude" => self.exclude.join(","),
            "move_thresholds.auto" => self.move_thresholds.auto.to_string(),
            "move_thresholds.prompt" => self.move_thresholds.prompt.to_string(),
            "parallelism" => self.parallelism.to_string(),
            "artifact_directories" => self.artifact_directories.join(","),
            "upload_timeout_secs" => self.upload_timeout_secs.to_string(),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        })
    }

    /// Write a single key for `pushwork config set`.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let bad = |what: &str| ConfigError::Invalid(format!("invalid {what}: {value}"));
        match key {
            "sync_server" => {
                self.sync_server = (!value.is_empty()).then(|| value.to_string());
            },
            "sync_server_id" => {
                self.sync_server_id = (!value.is_empty()).then(|| value.to_string());
            },
            "exclude" => {
                self.exclude = split_list(value);
            },
            "move_thresholds.auto" => {
                self.move_thresholds.auto =
                    value.parse().map_err(|_| bad("threshold"))?;
            },
            "move_thresholds.prompt" => {
                self.move_thresholds.prompt =
                    value.parse().map_err(|_| bad("threshold"))?;
            },
            "parallelism" => {
                self.parallelism = value.parse().map_err(|_| bad("parallelism"))?;
            },
            "artifact_directories" => {
                self.artifact_directories = split_list(value);
            },
            "upload_timeout_secs" => {
                self.upload_timeout_secs = value.parse().map_err(|_| bad("timeout"))?;
            },
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// All keys with their current values, for `pushwork config list`.
    pub fn list_keys(&self) -> Vec<(&'static str, String)> {
        const KEYS: &[&str] = &[
            "sync_server",
            "sync_server_id",
            "exclude",
            "move_thresholds.auto",
            "move_thresholds.prompt",
            "parallelism",
            "artifact_directories",
            "upload_timeout_secs",
        ];
        KEYS.iter()
            .map(|k| (*k, self.get_key(k).expect("known key")))
            .collect()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// `<root>/.pushwork`
pub fn pushwork_dir(root: &Path) -> PathBuf {
    root.join(PUSHWORK_DIR)
}

/// `<root>/.pushwork/config`
pub fn config_path(root: &Path) -> PathBuf {
    pushwork_dir(root).join("config")
}

/// `<root>/.pushwork/snapshot.json`
pub fn snapshot_path(root: &Path) -> PathBuf {
    pushwork_dir(root).join("snapshot.json")
}
