//! Change classification.
//!
//! For every path known to the filesystem, the snapshot, or the document
//! tree, decides who changed relative to the snapshotted base. The rule
//! is content-based: heads equality short-circuits the remote side, and
//! the artifact content hash short-circuits the local side, but whenever
//! the cheap anchors disagree the actual contents are compared.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use ahash::{HashMap, HashMapExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::hash;
use crate::scan::{EntryType, FileSystemEntry, ScanResult};
use crate::snapshot::{path_key, Snapshot};
use crate::store::{DocId, DocStore, StoreError};
use crate::tree::{self, EntryKind, FileContent, TreeEntry};

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Who changed a path since the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    NoChange,
    LocalOnly,
    RemoteOnly,
    BothChanged,
    /// Snapshotted, but gone from both sides.
    Missing,
}

/// Classifier output for one path.
#[derive(Debug, Clone)]
pub struct ClassifiedPath {
    /// Canonical `/`-separated path.
    pub key: String,
    pub class: ChangeClass,
    /// Filesystem-side type, when the path exists locally.
    pub local_type: Option<EntryType>,
    /// Document-side type, when the path exists in the tree.
    pub remote_type: Option<EntryType>,
    /// Document at this path in the current tree.
    pub remote_id: Option<DocId>,
    /// Independent creations with incompatible types on the two sides;
    /// nothing can be merged, so the reconciler must not touch either.
    pub conflict: bool,
}

/// Full classification of a root.
#[derive(Debug)]
pub struct Classification {
    pub paths: Vec<ClassifiedPath>,
    /// Paths skipped because a side could not be read.
    pub warnings: Vec<String>,
}

impl Classification {
    pub fn count(&self, class: ChangeClass) -> usize {
        self.paths.iter().filter(|p| p.class == class).count()
    }
}

/// Read local file content according to its scanned type.
pub fn load_local_content(root: &Path, key: &str, entry_type: EntryType) -> std::io::Result<FileContent> {
    let path = root.join(key);
    match entry_type {
        EntryType::Text => Ok(FileContent::Text(fs::read_to_string(path)?)),
        EntryType::Binary => Ok(FileContent::Binary(fs::read(path)?)),
        EntryType::Directory => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "directories have no content",
        )),
    }
}

/// Is `key` under one of the configured artifact directories?
pub fn is_artifact_path(key: &str, artifact_dirs: &[String]) -> bool {
    artifact_dirs.iter().any(|dir| {
        let dir = dir.trim_end_matches('/');
        !dir.is_empty() && (key == dir || key.starts_with(&format!("{dir}/")))
    })
}

fn heads_equal(a: &[automerge::ChangeHash], b: &[automerge::ChangeHash]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

/// Immediate children of each scanned directory, as (name, kind) pairs.
fn fs_child_sets(scan: &ScanResult) -> HashMap<String, BTreeSet<(String, EntryKind)>> {
    let mut map: HashMap<String, BTreeSet<(String, EntryKind)>> = HashMap::new();
    map.insert(String::new(), BTreeSet::new());
    for entry in &scan.entries {
        if entry.entry_type.is_dir() {
            map.entry(path_key(&entry.rel_path)).or_default();
        }
        let parent = entry
            .rel_path
            .parent()
            .map(path_key)
            .unwrap_or_default();
        let name = entry
            .rel_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = if entry.entry_type.is_dir() {
            EntryKind::Folder
        } else {
            EntryKind::File
        };
        map.entry(parent).or_default().insert((name, kind));
    }
    map
}

fn doc_child_set(children: &[tree::ChildEntry]) -> BTreeSet<(String, EntryKind)> {
    children
        .iter()
        .map(|c| (c.name.clone(), c.kind))
        .collect()
}

/// Document-side type of an entry: folder, or the file's content kind.
fn remote_entry_type(store: &DocStore, entry: &TreeEntry) -> Result<EntryType, StoreError> {
    match entry.kind {
        EntryKind::Folder => Ok(EntryType::Directory),
        EntryKind::File => store.read(&entry.id, |doc| {
            Ok(match tree::file_content(doc)? {
                FileContent::Text(_) => EntryType::Text,
                FileContent::Binary(_) => EntryType::Binary,
            })
        }),
    }
}

/// Classify every path across filesystem, snapshot, and document tree.
pub fn classify(
    store: &DocStore,
    snapshot: &Snapshot,
    scan: &ScanResult,
    artifact_dirs: &[String],
) -> Result<Classification, ClassifyError> {
    let root = scan.root.clone();

    let doc_entries = tree::walk(store, &snapshot.root_id)?;
    let mut docs: BTreeMap<String, &TreeEntry> = BTreeMap::new();
    for entry in &doc_entries {
        docs.insert(path_key(&entry.rel_path), entry);
    }

    let mut fs_map: BTreeMap<String, &FileSystemEntry> = BTreeMap::new();
    for entry in &scan.entries {
        fs_map.insert(path_key(&entry.rel_path), entry);
    }
    let fs_children = fs_child_sets(scan);

    let mut keys: BTreeSet<String> = BTreeSet::new();
    keys.extend(fs_map.keys().cloned());
    keys.extend(docs.keys().cloned());
    keys.extend(snapshot.paths().map(String::from));
    keys.remove("");

    let mut paths = Vec::with_capacity(keys.len());
    let mut warnings = Vec::new();

    for key in keys {
        match classify_one(store, snapshot, &root, &key, &fs_map, &fs_children, &docs, artifact_dirs)
        {
            Ok(classified) => paths.push(classified),
            Err(e) => {
                warn!(path = %key, error = %e, "Classification skipped path");
                warnings.push(format!("{key}: {e}"));
            },
        }
    }

    Ok(Classification { paths, warnings })
}

#[allow(clippy::too_many_arguments)]
fn classify_one(
    store: &DocStore,
    snapshot: &Snapshot,
    root: &Path,
    key: &str,
    fs_map: &BTreeMap<String, &FileSystemEntry>,
    fs_children: &HashMap<String, BTreeSet<(String, EntryKind)>>,
    docs: &BTreeMap<String, &TreeEntry>,
    artifact_dirs: &[String],
) -> Result<ClassifiedPath, ClassifyError> {
    let fs_entry = fs_map.get(key).copied();
    let doc_entry = docs.get(key).copied();

    let local_type = fs_entry.map(|e| e.entry_type);
    let remote_type = match doc_entry {
        Some(entry) => Some(remote_entry_type(store, entry)?),
        None => None,
    };
    let remote_id = doc_entry.map(|e| e.id.clone());

    let snap_file = snapshot.file(key);
    let snap_dir = snapshot.dir(key);

    let mut conflict = false;

    let class = if snap_file.is_none() && snap_dir.is_none() {
        // No base: presence alone decides
        match (local_type, remote_type) {
            (Some(_), None) => ChangeClass::LocalOnly,
            (None, Some(_)) => ChangeClass::RemoteOnly,
            (Some(local), Some(remote)) => {
                conflict = local != remote;
                ChangeClass::BothChanged
            },
            (None, None) => ChangeClass::Missing,
        }
    } else if local_type.is_none() && remote_type.is_none() {
        ChangeClass::Missing
    } else {
        let (local_changed, remote_changed) = if let Some(state) = snap_file {
            let local_changed =
                local_file_changed(store, root, key, state, fs_entry, artifact_dirs)?;
            let remote_changed = remote_file_changed(store, state, doc_entry)?;
            (local_changed, remote_changed)
        } else {
            let state = snap_dir.expect("dir state present");
            let local_changed = local_dir_changed(store, key, state, fs_entry, fs_children)?;
            let remote_changed = remote_dir_changed(store, state, doc_entry)?;
            (local_changed, remote_changed)
        };

        match (local_changed, remote_changed) {
            (false, false) => ChangeClass::NoChange,
            (true, false) => ChangeClass::LocalOnly,
            (false, true) => ChangeClass::RemoteOnly,
            (true, true) => ChangeClass::BothChanged,
        }
    };

    Ok(ClassifiedPath {
        key: key.to_string(),
        class,
        local_type,
        remote_type,
        remote_id,
        conflict,
    })
}

fn local_file_changed(
    store: &DocStore,
    root: &Path,
    key: &str,
    state: &crate::snapshot::FileState,
    fs_entry: Option<&FileSystemEntry>,
    artifact_dirs: &[String],
) -> Result<bool, ClassifyError> {
    let entry = match fs_entry {
        Some(entry) => entry,
        None => return Ok(true),
    };
    if entry.entry_type.is_dir() {
        // file -> directory retype
        return Ok(true);
    }

    // Artifact fast path: hash recorded at last sync still matches disk
    if is_artifact_path(key, artifact_dirs) {
        if let Some(recorded) = state.content_hash {
            if hash::hash_file(&root.join(key))? == recorded {
                debug!(path = %key, "Artifact hash match, local unchanged");
                return Ok(false);
            }
            return Ok(true);
        }
    }

    let base_heads = state.heads()?;
    let base = store.read(&state.id, |doc| tree::file_content_at(doc, &base_heads))?;
    let local = load_local_content(root, key, entry.entry_type)?;
    Ok(local != base)
}

fn remote_file_changed(
    store: &DocStore,
    state: &crate::snapshot::FileState,
    doc_entry: Option<&TreeEntry>,
) -> Result<bool, ClassifyError> {
    let entry = match doc_entry {
        Some(entry) => entry,
        None => return Ok(true),
    };
    if entry.kind != EntryKind::File || entry.id != state.id {
        return Ok(true);
    }

    let base_heads = state.heads()?;
    store
        .read(&state.id, |doc| {
            let current = doc.get_heads();
            if heads_equal(&current, &base_heads) {
                return Ok(false);
            }
            // Heads moved; equality is still decided on content
            let base = tree::file_content_at(doc, &base_heads)?;
            let now = tree::file_content(doc)?;
            Ok(now != base)
        })
        .map_err(ClassifyError::from)
}

fn local_dir_changed(
    store: &DocStore,
    key: &str,
    state: &crate::snapshot::DirState,
    fs_entry: Option<&FileSystemEntry>,
    fs_children: &HashMap<String, BTreeSet<(String, EntryKind)>>,
) -> Result<bool, ClassifyError> {
    let entry = match fs_entry {
        Some(entry) => entry,
        None => return Ok(true),
    };
    if !entry.entry_type.is_dir() {
        return Ok(true);
    }

    let empty = BTreeSet::new();
    let local = fs_children.get(key).unwrap_or(&empty);

    // Cheap name prefilter before reading the document
    let mut local_names: Vec<&str> = local.iter().map(|(n, _)| n.as_str()).collect();
    local_names.sort_unstable();
    let mut snap_names: Vec<&str> = state.child_names.iter().map(String::as_str).collect();
    snap_names.sort_unstable();
    if local_names != snap_names {
        return Ok(true);
    }

    let base_heads = state.heads()?;
    let base = store.read(&state.id, |doc| tree::dir_children_at(doc, &base_heads))?;
    Ok(*local != doc_child_set(&base))
}

fn remote_dir_changed(
    store: &DocStore,
    state: &crate::snapshot::DirState,
    doc_entry: Option<&TreeEntry>,
) -> Result<bool, ClassifyError> {
    let entry = match doc_entry {
        Some(entry) => entry,
        None => return Ok(true),
    };
    if entry.kind != EntryKind::Folder || entry.id != state.id {
        return Ok(true);
    }

    let base_heads = state.heads()?;
    store
        .read(&state.id, |doc| {
            let current = doc.get_heads();
            if heads_equal(&current, &base_heads) {
                return Ok(false);
            }
            let base = doc_child_set(&tree::dir_children_at(doc, &base_heads)?);
            let now = doc_child_set(&tree::dir_children(doc)?);
            Ok(base != now)
        })
        .map_err(ClassifyError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_path_matching() {
        let dirs = vec!["build".to_string(), "out/gen/".to_string()];
        assert!(is_artifact_path("build/a.o", &dirs));
        assert!(is_artifact_path("build", &dirs));
        assert!(is_artifact_path("out/gen/deep/x", &dirs));
        assert!(!is_artifact_path("buildx/a.o", &dirs));
        assert!(!is_artifact_path("src/build.rs", &dirs));
    }

    #[test]
    fn test_heads_equal_ignores_order() {
        use std::str::FromStr;
        let a = automerge::ChangeHash::from_str(&"aa".repeat(32)).unwrap();
        let b = automerge::ChangeHash::from_str(&"bb".repeat(32)).unwrap();
        assert!(heads_equal(&[a, b], &[b, a]));
        assert!(!heads_equal(&[a], &[b]));
        assert!(heads_equal(&[], &[]));
    }
}
