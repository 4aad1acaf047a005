//! Document store.
//!
//! Automerge documents persisted one file per document under a store
//! directory, with an in-memory cache. Two roots configured with the same
//! store directory converge through it; the durable copy plays the role
//! of the remote peer, so `flush` is an upload and `remote_heads` reads
//! the peer-acknowledged state.
//!
//! Mutations are causally anchored: `change_at` forks the document at the
//! caller's recorded heads, applies the mutation to the fork, and merges
//! the fork back, so edits concurrent with the anchor survive the merge.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;

use automerge::{Automerge, ChangeHash, ReadDoc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::io;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(DocId),

    #[error("Document {id} is corrupt: {reason}")]
    Corrupt { id: DocId, reason: String },

    #[error("Invalid document id: {0}")]
    InvalidId(String),

    #[error("Invalid head hash: {0}")]
    InvalidHead(String),

    #[error("Document cycle detected at {0}")]
    CycleDetected(DocId),

    #[error("Malformed document: {0}")]
    Schema(String),

    #[error("Name collision in directory: {0}")]
    NameCollision(String),

    #[error("Automerge error: {0}")]
    Automerge(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<automerge::AutomergeError> for StoreError {
    fn from(e: automerge::AutomergeError) -> Self {
        StoreError::Automerge(e.to_string())
    }
}

/// Stable document identifier; the root document's id is the share URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    /// Mint a fresh id.
    pub fn generate() -> Self {
        DocId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DocId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed =
            uuid::Uuid::parse_str(s).map_err(|_| StoreError::InvalidId(s.to_string()))?;
        Ok(DocId(parsed.simple().to_string()))
    }
}

/// Encode heads for the snapshot.
pub fn heads_to_hex(heads: &[ChangeHash]) -> Vec<String> {
    heads.iter().map(|h| h.to_string()).collect()
}

/// Decode heads from the snapshot.
pub fn heads_from_hex(heads: &[String]) -> Result<Vec<ChangeHash>, StoreError> {
    heads
        .iter()
        .map(|s| {
            ChangeHash::from_str(s).map_err(|_| StoreError::InvalidHead(s.clone()))
        })
        .collect()
}

/// File-backed automerge document store with an in-memory cache.
///
/// Closures passed to `read`/`change_at` must not call back into the
/// store; the cache lock is held for their duration.
pub struct DocStore {
    dir: PathBuf,
    cache: RwLock<HashMap<DocId, Automerge>>,
}

impl DocStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        io::ensure_directory(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn doc_path(&self, id: &DocId) -> PathBuf {
        self.dir.join(format!("{id}.automerge"))
    }

    /// Create a new document, initialize it, and persist it.
    pub fn create_with<T, F>(&self, init: F) -> Result<(DocId, T, Vec<ChangeHash>), StoreError>
    where
        F: FnOnce(&mut Automerge) -> Result<T, StoreError>,
    {
        let id = DocId::generate();
        let mut doc = Automerge::new();
        let value = init(&mut doc)?;

        let bytes = doc.save();
        io::atomic_write(&self.doc_path(&id), &self.dir.join("tmp"), &bytes)?;

        let heads = doc.get_heads();
        self.cache.write().unwrap().insert(id.clone(), doc);
        Ok((id, value, heads))
    }

    pub fn contains(&self, id: &DocId) -> bool {
        self.cache.read().unwrap().contains_key(id) || self.doc_path(id).exists()
    }

    /// Merge the durable copy into the cache, bringing in anything other
    /// peers have written since we last looked.
    fn refresh(&self, id: &DocId) -> Result<(), StoreError> {
        let path = self.doc_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return if self.cache.read().unwrap().contains_key(id) {
                    Ok(())
                } else {
                    Err(StoreError::NotFound(id.clone()))
                };
            },
            Err(e) => return Err(e.into()),
        };

        let mut loaded = Automerge::load(&bytes).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: e.to_string(),
        })?;

        let mut cache = self.cache.write().unwrap();
        match cache.get_mut(id) {
            Some(doc) => {
                doc.merge(&mut loaded)?;
            },
            None => {
                cache.insert(id.clone(), loaded);
            },
        }
        Ok(())
    }

    /// Read access to a document at its current state.
    pub fn read<T, F>(&self, id: &DocId, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Automerge) -> Result<T, StoreError>,
    {
        self.refresh(id)?;
        let cache = self.cache.read().unwrap();
        let doc = cache.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        f(doc)
    }

    /// Current heads of a document.
    pub fn heads(&self, id: &DocId) -> Result<Vec<ChangeHash>, StoreError> {
        self.read(id, |doc| Ok(doc.get_heads()))
    }

    /// Apply a mutation anchored at `anchor`: fork the document as of
    /// those heads, mutate the fork, merge it back, persist. Concurrent
    /// edits recorded after `anchor` are merged, not overwritten.
    ///
    /// Unknown anchor heads fall back to the current state, which turns
    /// the mutation into a plain (non-anchored) change.
    pub fn change_at<T, F>(
        &self,
        id: &DocId,
        anchor: &[ChangeHash],
        f: F,
    ) -> Result<(T, Vec<ChangeHash>), StoreError>
    where
        F: FnOnce(&mut Automerge) -> Result<T, StoreError>,
    {
        self.refresh(id)?;
        let mut cache = self.cache.write().unwrap();
        let doc = cache.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let anchor_known = !anchor.is_empty()
            && anchor.iter().all(|h| doc.get_change_by_hash(h).is_some());

        let mut fork = if anchor_known {
            doc.fork_at(anchor)?
        } else {
            if !anchor.is_empty() {
                warn!(doc = %id, "Anchor heads unknown, mutating at current state");
            }
            doc.fork()
        };

        let value = f(&mut fork)?;
        doc.merge(&mut fork)?;

        let bytes = doc.save();
        io::atomic_write(&self.doc_path(id), &self.dir.join("tmp"), &bytes)?;

        Ok((value, doc.get_heads()))
    }

    /// Persist the cached state of a document (the upload).
    pub fn flush(&self, id: &DocId) -> Result<(), StoreError> {
        let mut cache = self.cache.write().unwrap();
        let doc = cache.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let bytes = doc.save();
        io::atomic_write(&self.doc_path(id), &self.dir.join("tmp"), &bytes)?;
        Ok(())
    }

    /// Does the durable copy contain every one of `heads`? This is the
    /// upload-barrier condition: the peer has acknowledged our changes
    /// even if it has already moved past them.
    pub fn remote_contains(&self, id: &DocId, heads: &[ChangeHash]) -> Result<bool, StoreError> {
        let bytes = match fs::read(self.doc_path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let doc = Automerge::load(&bytes).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        Ok(heads.iter().all(|h| doc.get_change_by_hash(h).is_some()))
    }

    /// Heads of the durable copy: what the peer has acknowledged. The
    /// upload barrier compares these against the cached heads.
    pub fn remote_heads(&self, id: &DocId) -> Result<Vec<ChangeHash>, StoreError> {
        let bytes = match fs::read(self.doc_path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let doc = Automerge::load(&bytes).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        Ok(doc.get_heads())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::transaction::Transactable;
    use automerge::{ObjType, ReadDoc, ROOT};
    use tempfile::tempdir;

    fn text_store(dir: &Path) -> (DocStore, DocId, Vec<ChangeHash>) {
        let store = DocStore::open(dir).unwrap();
        let (id, _, heads) = store
            .create_with(|doc| {
                doc.transact::<_, _, automerge::AutomergeError>(|tx| {
                    let text = tx.put_object(ROOT, "content", ObjType::Text)?;
                    tx.splice_text(&text, 0, 0, "base")?;
                    Ok(())
                })
                .map_err(|e| StoreError::Automerge(format!("{e:?}")))?;
                Ok(())
            })
            .unwrap();
        (store, id, heads)
    }

    fn read_text(store: &DocStore, id: &DocId) -> String {
        store
            .read(id, |doc| {
                let (_, text) = doc.get(ROOT, "content")?.expect("content field");
                Ok(doc.text(&text)?)
            })
            .unwrap()
    }

    fn splice(store: &DocStore, id: &DocId, anchor: &[ChangeHash], pos: usize, s: &str) {
        store
            .change_at(id, anchor, |doc| {
                doc.transact::<_, _, automerge::AutomergeError>(|tx| {
                    let (_, text) = tx.get(ROOT, "content")?.expect("content field");
                    tx.splice_text(&text, pos, 0, s)?;
                    Ok(())
                })
                .map_err(|e| StoreError::Automerge(format!("{e:?}")))?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_create_and_read_back() {
        let dir = tempdir().unwrap();
        let (store, id, heads) = text_store(dir.path());

        assert!(store.contains(&id));
        assert!(!heads.is_empty());
        assert_eq!(read_text(&store, &id), "base");
    }

    #[test]
    fn test_anchored_edits_merge_instead_of_overwrite() {
        let dir = tempdir().unwrap();
        let (store, id, anchor) = text_store(dir.path());

        // Two writers mutate from the same anchor
        splice(&store, &id, &anchor, 0, "A-");
        splice(&store, &id, &anchor, 4, "-B");

        let merged = read_text(&store, &id);
        assert!(merged.contains("A-"), "first edit lost: {merged}");
        assert!(merged.contains("-B"), "second edit lost: {merged}");
        assert!(merged.contains("base"), "base lost: {merged}");
    }

    #[test]
    fn test_change_at_advances_heads() {
        let dir = tempdir().unwrap();
        let (store, id, anchor) = text_store(dir.path());

        splice(&store, &id, &anchor, 4, "!");
        let new_heads = store.heads(&id).unwrap();
        assert_ne!(new_heads, anchor);
    }

    #[test]
    fn test_remote_heads_track_durable_copy() {
        let dir = tempdir().unwrap();
        let (store, id, anchor) = text_store(dir.path());

        splice(&store, &id, &anchor, 0, "x");
        // change_at persists, so the durable copy is already caught up
        assert_eq!(store.remote_heads(&id).unwrap(), store.heads(&id).unwrap());
    }

    #[test]
    fn test_second_store_instance_sees_writes() {
        let dir = tempdir().unwrap();
        let (store_a, id, anchor) = text_store(dir.path());
        let store_b = DocStore::open(dir.path()).unwrap();

        assert_eq!(read_text(&store_b, &id), "base");

        splice(&store_a, &id, &anchor, 4, "+A");
        // B refreshes from the durable copy on its next read
        assert_eq!(read_text(&store_b, &id), "base+A");
    }

    #[test]
    fn test_missing_doc_is_not_found() {
        let dir = tempdir().unwrap();
        let store = DocStore::open(dir.path()).unwrap();
        let id = DocId::generate();
        assert!(matches!(store.heads(&id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_corrupt_doc_reported() {
        let dir = tempdir().unwrap();
        let store = DocStore::open(dir.path()).unwrap();
        let id = DocId::generate();
        fs::write(dir.path().join(format!("{id}.automerge")), b"not automerge").unwrap();

        assert!(matches!(store.heads(&id), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_doc_id_round_trip() {
        let id = DocId::generate();
        let parsed: DocId = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<DocId>().is_err());
    }

    #[test]
    fn test_heads_hex_round_trip() {
        let dir = tempdir().unwrap();
        let (_, _, heads) = text_store(dir.path());
        let hex = heads_to_hex(&heads);
        assert_eq!(heads_from_hex(&hex).unwrap(), heads);
        assert!(heads_from_hex(&["zz".to_string()]).is_err());
    }
}
