//! The sync snapshot: what we knew after the last successful sync.
//!
//! Per path it records the document id and the heads at the moment of
//! the last successful push or pull. Heads are the sole anchor for both
//! causality and change detection; there are no mtimes and no content
//! hashes, except the optional artifact-file hash.
//!
//! Persistence is temp-file-plus-rename with a backup of the previous
//! snapshot taken on load. Recovery does not need a journal: a crash
//! between operations leaves the snapshot describing the committed
//! prefix, and the next sync re-derives the remainder from the
//! filesystem and document comparison.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use automerge::ChangeHash;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config;
use crate::hash::ContentHash;
use crate::io::{self, TEMP_DIR};
use crate::store::{heads_from_hex, heads_to_hex, DocId, StoreError};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot not found at {0}")]
    NotFound(PathBuf),

    #[error("Invalid snapshot: {0}")]
    Invalid(String),

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("Snapshot invariant violated: {0}")]
    Invariant(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot state for one file path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileState {
    pub id: DocId,
    pub heads: Vec<String>,
    pub extension: String,
    pub mime_type: String,
    /// Recorded only for files under an artifact directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
}

impl FileState {
    pub fn heads(&self) -> Result<Vec<ChangeHash>, StoreError> {
        heads_from_hex(&self.heads)
    }

    pub fn set_heads(&mut self, heads: &[ChangeHash]) {
        self.heads = heads_to_hex(heads);
    }
}

/// Snapshot state for one directory path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirState {
    pub id: DocId,
    pub heads: Vec<String>,
    pub child_names: Vec<String>,
}

impl DirState {
    pub fn heads(&self) -> Result<Vec<ChangeHash>, StoreError> {
        heads_from_hex(&self.heads)
    }

    pub fn set_heads(&mut self, heads: &[ChangeHash]) {
        self.heads = heads_to_hex(heads);
    }
}

/// Serialize maps as arrays of `[key, value]` pairs.
mod pair_map {
    use std::collections::BTreeMap;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<V, S>(map: &BTreeMap<String, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        V: Serialize,
        S: Serializer,
    {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, V, D>(deserializer: D) -> Result<BTreeMap<String, V>, D::Error>
    where
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let pairs: Vec<(String, V)> = Vec::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        for (key, value) in pairs {
            if map.insert(key.clone(), value).is_some() {
                return Err(D::Error::custom(format!("duplicate snapshot key: {key}")));
            }
        }
        Ok(map)
    }
}

/// The post-sync record of both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Seconds since the Unix epoch of the last save.
    pub timestamp: u64,
    pub root_path: PathBuf,
    pub root_id: DocId,
    /// Heads of the root directory document.
    pub root_heads: Vec<String>,
    #[serde(with = "pair_map")]
    pub files: BTreeMap<String, FileState>,
    #[serde(with = "pair_map")]
    pub directories: BTreeMap<String, DirState>,
}

/// Canonical snapshot key for a relative path (`/`-separated).
pub fn path_key(path: &Path) -> String {
    let mut out = String::new();
    for comp in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&comp.as_os_str().to_string_lossy());
    }
    out
}

impl Snapshot {
    /// Fresh snapshot for a root that has never synced.
    pub fn empty(root_path: &Path, root_id: DocId, root_heads: &[ChangeHash]) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            timestamp: unix_now(),
            root_path: root_path.to_path_buf(),
            root_id,
            root_heads: heads_to_hex(root_heads),
            files: BTreeMap::new(),
            directories: BTreeMap::new(),
        }
    }

    pub fn root_heads(&self) -> Result<Vec<ChangeHash>, StoreError> {
        heads_from_hex(&self.root_heads)
    }

    pub fn set_root_heads(&mut self, heads: &[ChangeHash]) {
        self.root_heads = heads_to_hex(heads);
    }

    pub fn file(&self, key: &str) -> Option<&FileState> {
        self.files.get(key)
    }

    pub fn dir(&self, key: &str) -> Option<&DirState> {
        self.directories.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.files.contains_key(key) || self.directories.contains_key(key)
    }

    pub fn insert_file(&mut self, key: String, state: FileState) {
        self.directories.remove(&key);
        self.files.insert(key, state);
    }

    pub fn insert_dir(&mut self, key: String, state: DirState) {
        self.files.remove(&key);
        self.directories.insert(key, state);
    }

    /// Drop a path of either kind.
    pub fn remove(&mut self, key: &str) {
        self.files.remove(key);
        self.directories.remove(key);
    }

    /// Every path the snapshot knows, files and directories.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files
            .keys()
            .chain(self.directories.keys())
            .map(String::as_str)
    }

    pub fn touch(&mut self) {
        self.timestamp = unix_now();
    }

    /// Structural invariants: no path is both file and directory, and
    /// every path's parent directory is itself snapshotted.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        for key in self.files.keys() {
            if self.directories.contains_key(key) {
                return Err(SnapshotError::Invariant(format!(
                    "{key} is recorded as both file and directory"
                )));
            }
        }
        for key in self.files.keys().chain(self.directories.keys()) {
            if let Some((parent, _)) = key.rsplit_once('/') {
                if !self.directories.contains_key(parent) {
                    return Err(SnapshotError::Invariant(format!(
                        "{key} has no snapshotted parent {parent}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Load/save/backup of the serialized snapshot. The store does not
/// interpret contents beyond version and invariant checks.
pub struct SnapshotStore {
    path: PathBuf,
    backup_path: PathBuf,
    temp_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: &Path) -> Self {
        let path = config::snapshot_path(root);
        let backup_path = path.with_extension("json.bak");
        let temp_dir = config::pushwork_dir(root).join(TEMP_DIR);
        Self { path, backup_path, temp_dir }
    }

    /// Load the snapshot, backing up the on-disk copy first.
    pub fn load(&self) -> Result<Snapshot, SnapshotError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(self.path.clone()));
            },
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = fs::copy(&self.path, &self.backup_path) {
            debug!(error = %e, "Snapshot backup failed");
        }

        let snapshot: Snapshot =
            serde_json::from_slice(&data).map_err(|e| SnapshotError::Invalid(e.to_string()))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        snapshot.validate()?;

        Ok(snapshot)
    }

    /// Persist atomically: temp file, fsync, rename, directory fsync.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| SnapshotError::Invalid(e.to_string()))?;
        io::atomic_write(&self.path, &self.temp_dir, &data)?;
        if let Some(parent) = self.path.parent() {
            let _ = io::fsync_directory(parent);
        }
        Ok(())
    }
}
