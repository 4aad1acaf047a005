//! Two-phase reconciliation.
//!
//! Phase one pushes local changes into the document tree with causally
//! anchored mutations: every edit is applied against the document as of
//! the snapshot's recorded heads, so edits concurrent with ours merge
//! instead of being overwritten. Phase two waits for the tree to
//! stabilize, then makes the filesystem equal the (already merged)
//! document tree.
//!
//! The snapshot entry for a path is updated and persisted after each
//! committed operation, never before, so a crash leaves the snapshot
//! describing exactly the committed prefix.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classify::{self, ChangeClass, Classification, ClassifiedPath, ClassifyError};
use crate::config::Config;
use crate::hash;
use crate::io;
use crate::moves::{self, DetectedMove, MoveDecision, MoveSide};
use crate::scan::{self, EntryType, FileSystemEntry, ScanError};
use crate::snapshot::{path_key, DirState, FileState, Snapshot, SnapshotError, SnapshotStore};
use crate::store::{DocId, DocStore, StoreError};
use crate::tree::{self, EntryKind, FileContent, TreeEntry};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive identical polls required by the stabilization barrier.
const STABLE_POLLS: usize = 3;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A per-path failure surfaced in the sync result.
#[derive(Debug, Clone)]
pub struct SyncError {
    pub path: String,
    pub op: String,
    pub recoverable: bool,
    pub message: String,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.path, self.op, self.message)
    }
}

/// Outcome of one sync run. Partial success is the norm: recoverable
/// per-path errors are listed without flipping `success`.
#[derive(Debug, Default)]
pub struct SyncResult {
    pub success: bool,
    pub files_changed: usize,
    pub directories_changed: usize,
    pub errors: Vec<SyncError>,
    pub warnings: Vec<String>,
    /// Dry-run only: human-readable plan, nothing executed.
    pub planned: Vec<String>,
}

impl SyncResult {
    pub fn has_fatal(&self) -> bool {
        self.errors.iter().any(|e| !e.recoverable)
    }
}

/// Decides whether a prompt-level move candidate is applied.
pub type MoveConfirm = fn(&DetectedMove) -> bool;

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncOptions {
    pub dry_run: bool,
    /// Asked for prompt-level move candidates; `None` means
    /// non-interactive and prompt-level candidates stay delete + create.
    pub confirm_move: Option<MoveConfirm>,
}

/// Per-path operation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    Planned,
    InFlight,
    Committed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PushAction {
    CreateDir,
    CreateFile,
    /// Content update, adopting the remote document when the path was
    /// created independently on both sides.
    UpdateFile,
    MoveFile { to: String },
    /// Same path, new type: allocate a new document, orphan the old.
    Retype,
    DeleteFile,
    DeleteDir,
}

impl PushAction {
    fn name(&self) -> &'static str {
        match self {
            PushAction::CreateDir => "create-dir",
            PushAction::CreateFile => "create-file",
            PushAction::UpdateFile => "update-file",
            PushAction::MoveFile { .. } => "move",
            PushAction::Retype => "retype",
            PushAction::DeleteFile => "delete-file",
            PushAction::DeleteDir => "delete-dir",
        }
    }
}

#[derive(Debug)]
struct PushOp {
    key: String,
    action: PushAction,
    state: OpState,
}

struct OpFailure {
    recoverable: bool,
    message: String,
}

impl OpFailure {
    fn recoverable(message: impl Into<String>) -> Self {
        Self { recoverable: true, message: message.into() }
    }

    fn fatal(message: impl Into<String>) -> Self {
        Self { recoverable: false, message: message.into() }
    }
}

impl From<StoreError> for OpFailure {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NameCollision(_) => OpFailure::fatal(e.to_string()),
            _ => OpFailure::recoverable(e.to_string()),
        }
    }
}

impl From<std::io::Error> for OpFailure {
    fn from(e: std::io::Error) -> Self {
        OpFailure::recoverable(e.to_string())
    }
}

fn parent_key_of(key: &str) -> &str {
    key.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

fn name_of(key: &str) -> &str {
    key.rsplit_once('/').map(|(_, n)| n).unwrap_or(key)
}

/// Owner of the snapshot for the duration of a sync run.
pub struct Reconciler<'a> {
    store: &'a DocStore,
    config: &'a Config,
    root: PathBuf,
    snap_store: SnapshotStore,
    snapshot: Snapshot,
    /// Documents mutated in phase one, with the heads we recorded, for
    /// the upload barrier.
    touched: BTreeMap<DocId, Vec<automerge::ChangeHash>>,
    changed_files: HashSet<String>,
    changed_dirs: HashSet<String>,
    /// Paths whose push failed or conflicted this run. The pull phase
    /// leaves them alone so the failed local state survives for the
    /// next attempt instead of being overwritten from the tree.
    skip_pull: HashSet<String>,
}

impl<'a> Reconciler<'a> {
    pub fn new(root: &Path, config: &'a Config, store: &'a DocStore, snapshot: Snapshot) -> Self {
        Self {
            store,
            config,
            root: root.to_path_buf(),
            snap_store: SnapshotStore::new(root),
            snapshot,
            touched: BTreeMap::new(),
            changed_files: HashSet::new(),
            changed_dirs: HashSet::new(),
            skip_pull: HashSet::new(),
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Run one push + pull cycle.
    pub fn sync(&mut self, options: &SyncOptions) -> Result<SyncResult, EngineError> {
        let mut result = SyncResult { success: true, ..Default::default() };
        self.touched.clear();
        self.changed_files.clear();
        self.changed_dirs.clear();
        self.skip_pull.clear();

        let scan = scan::scan_tree(&self.root, &self.config.exclude)?;
        result.warnings.extend(scan.warnings.iter().cloned());

        let classification = classify::classify(
            self.store,
            &self.snapshot,
            &scan,
            &self.config.artifact_directories,
        )?;
        result.warnings.extend(classification.warnings.iter().cloned());

        if !options.dry_run {
            self.drop_missing(&classification)?;
        }

        let fs_by_key: BTreeMap<String, FileSystemEntry> = scan
            .entries
            .iter()
            .map(|e| (path_key(&e.rel_path), e.clone()))
            .collect();

        let ops = self.plan_push(&classification, &fs_by_key, options, &mut result)?;

        if options.dry_run {
            result.planned = self.describe_plan(&ops, &classification);
            return Ok(result);
        }

        // Phase one: push
        for mut op in ops {
            op.state = OpState::InFlight;
            debug!(path = %op.key, op = op.action.name(), "Push op in flight");
            match self.execute_push(&op, &fs_by_key) {
                Ok(()) => {
                    op.state = OpState::Committed;
                    self.snap_store.save(&self.snapshot)?;
                },
                Err(failure) => {
                    op.state = OpState::Failed;
                    warn!(path = %op.key, op = op.action.name(), error = %failure.message, "Push op failed");
                    self.skip_pull.insert(op.key.clone());
                    if let PushAction::MoveFile { to } = &op.action {
                        self.skip_pull.insert(to.clone());
                    }
                    result.errors.push(SyncError {
                        path: op.key.clone(),
                        op: op.action.name().to_string(),
                        recoverable: failure.recoverable,
                        message: failure.message,
                    });
                },
            }
            debug!(path = %op.key, state = ?op.state, "Push op finished");
        }

        self.upload_barrier(&mut result);

        // Phase two: pull
        self.stabilization_barrier(&mut result)?;
        self.pull(&mut result)?;

        self.snapshot.touch();
        self.snap_store.save(&self.snapshot)?;

        result.files_changed = self.changed_files.len();
        result.directories_changed = self.changed_dirs.len();
        result.success = !result.has_fatal();

        info!(
            files = result.files_changed,
            directories = result.directories_changed,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "Sync complete"
        );

        Ok(result)
    }

    /// Forget paths that vanished on both sides since the last sync.
    fn drop_missing(&mut self, classification: &Classification) -> Result<(), EngineError> {
        let missing: Vec<&ClassifiedPath> = classification
            .paths
            .iter()
            .filter(|p| p.class == ChangeClass::Missing)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        for path in &missing {
            debug!(path = %path.key, "Dropping entry missing on both sides");
            self.snapshot.remove(&path.key);
        }
        self.snap_store.save(&self.snapshot)?;
        Ok(())
    }

    // ---- phase one: planning ----

    fn plan_push(
        &mut self,
        classification: &Classification,
        fs_by_key: &BTreeMap<String, FileSystemEntry>,
        options: &SyncOptions,
        result: &mut SyncResult,
    ) -> Result<Vec<PushOp>, EngineError> {
        let mut dir_creates = Vec::new();
        let mut file_creates = Vec::new();
        let mut updates = Vec::new();
        let mut retypes = Vec::new();
        let mut file_deletes = Vec::new();
        let mut dir_deletes = Vec::new();

        for p in &classification.paths {
            if p.class != ChangeClass::LocalOnly && p.class != ChangeClass::BothChanged {
                continue;
            }
            if p.conflict {
                self.skip_pull.insert(p.key.clone());
                result.errors.push(SyncError {
                    path: p.key.clone(),
                    op: "classify".into(),
                    recoverable: true,
                    message: "created as different types on both sides; resolve manually".into(),
                });
                continue;
            }

            let snap_file = self.snapshot.file(&p.key).cloned();
            let snap_dir = self.snapshot.dir(&p.key).cloned();

            match p.local_type {
                None => {
                    // Deleted locally
                    if snap_file.is_some() {
                        file_deletes.push(p.key.clone());
                    } else if snap_dir.is_some() {
                        dir_deletes.push(p.key.clone());
                    }
                },
                Some(EntryType::Directory) => {
                    if snap_file.is_some() {
                        retypes.push(p.key.clone());
                    } else if snap_dir.is_none() {
                        if p.remote_type == Some(EntryType::Directory) {
                            // Created independently on both sides: adopt
                            if !options.dry_run {
                                self.adopt_remote_dir(&p.key, p.remote_id.as_ref())?;
                            }
                        } else {
                            dir_creates.push(p.key.clone());
                        }
                    }
                    // An existing directory's child-set changes are
                    // carried entirely by its children's operations.
                },
                Some(_) => {
                    if snap_dir.is_some() {
                        retypes.push(p.key.clone());
                    } else if let Some(state) = snap_file {
                        match self.base_type(&state) {
                            Ok(base_type) => {
                                let local = p.local_type.expect("file present");
                                if base_type == local {
                                    updates.push(p.key.clone());
                                } else {
                                    retypes.push(p.key.clone());
                                }
                            },
                            Err(e) => {
                                result.errors.push(SyncError {
                                    path: p.key.clone(),
                                    op: "plan".into(),
                                    recoverable: true,
                                    message: e.to_string(),
                                });
                            },
                        }
                    } else if p.remote_type.is_some() {
                        // Same-type independent create: adopt the remote
                        // document and push our content into it.
                        updates.push(p.key.clone());
                    } else {
                        file_creates.push(p.key.clone());
                    }
                },
            }
        }

        // Move detection pairs deletions with creations
        let detected = self.detect_moves(&file_deletes, &file_creates, fs_by_key, result);
        let mut accepted: Vec<DetectedMove> = Vec::new();
        for mv in detected {
            let take = match mv.decision {
                MoveDecision::Auto => true,
                MoveDecision::Prompt => match options.confirm_move {
                    Some(confirm) if !options.dry_run => confirm(&mv),
                    _ => false,
                },
            };
            if take {
                info!(from = %mv.from, to = %mv.to, score = mv.score, "Move detected");
                accepted.push(mv);
            } else {
                debug!(from = %mv.from, to = %mv.to, score = mv.score, "Move candidate declined");
            }
        }

        let moved_from: HashSet<&str> = accepted.iter().map(|m| m.from.as_str()).collect();
        let moved_to: HashSet<&str> = accepted.iter().map(|m| m.to.as_str()).collect();
        file_deletes.retain(|k| !moved_from.contains(k.as_str()));
        file_creates.retain(|k| !moved_to.contains(k.as_str()));

        // Creates parents-first, deletes children-first
        dir_creates.sort();
        file_creates.sort();
        updates.sort();
        retypes.sort();
        file_deletes.sort_by(|a, b| b.cmp(a));
        dir_deletes.sort_by(|a, b| b.cmp(a));
        let mut moves_sorted = accepted;
        moves_sorted.sort_by(|a, b| a.to.cmp(&b.to));

        let mut ops = Vec::new();
        let mut push = |key: String, action: PushAction| {
            debug!(path = %key, op = action.name(), "Planned");
            ops.push(PushOp { key, action, state: OpState::Planned });
        };

        for key in dir_creates {
            push(key, PushAction::CreateDir);
        }
        for key in file_creates {
            push(key, PushAction::CreateFile);
        }
        for key in updates {
            push(key, PushAction::UpdateFile);
        }
        for mv in moves_sorted {
            push(mv.from, PushAction::MoveFile { to: mv.to });
        }
        for key in retypes {
            push(key, PushAction::Retype);
        }
        for key in file_deletes {
            push(key, PushAction::DeleteFile);
        }
        for key in dir_deletes {
            push(key, PushAction::DeleteDir);
        }

        Ok(ops)
    }

    /// Content type of the snapshotted document at its recorded heads.
    fn base_type(&self, state: &FileState) -> Result<EntryType, StoreError> {
        let heads = state.heads()?;
        self.store.read(&state.id, |doc| {
            Ok(match tree::file_content_at(doc, &heads)? {
                FileContent::Text(_) => EntryType::Text,
                FileContent::Binary(_) => EntryType::Binary,
            })
        })
    }

    fn detect_moves(
        &self,
        file_deletes: &[String],
        file_creates: &[String],
        fs_by_key: &BTreeMap<String, FileSystemEntry>,
        result: &mut SyncResult,
    ) -> Vec<DetectedMove> {
        if file_deletes.is_empty() || file_creates.is_empty() {
            return Vec::new();
        }

        // Deleted content comes from the snapshotted document, created
        // content from disk; both loaded only when a pairing is possible.
        let mut deleted = Vec::new();
        for key in file_deletes {
            let state = match self.snapshot.file(key) {
                Some(state) => state,
                None => continue,
            };
            let heads = match state.heads() {
                Ok(heads) => heads,
                Err(_) => continue,
            };
            match self
                .store
                .read(&state.id, |doc| tree::file_content_at(doc, &heads))
            {
                Ok(content) => deleted.push(MoveSide { key: key.clone(), content }),
                Err(e) => result.warnings.push(format!("{key}: {e}")),
            }
        }

        let mut created = Vec::new();
        for key in file_creates {
            let entry = match fs_by_key.get(key) {
                Some(entry) => entry,
                None => continue,
            };
            match classify::load_local_content(&self.root, key, entry.entry_type) {
                Ok(content) => created.push(MoveSide { key: key.clone(), content }),
                Err(e) => result.warnings.push(format!("{key}: {e}")),
            }
        }

        moves::detect_moves(&deleted, &created, &self.config.move_thresholds)
    }

    fn describe_plan(&self, ops: &[PushOp], classification: &Classification) -> Vec<String> {
        let mut lines: Vec<String> = ops
            .iter()
            .map(|op| match &op.action {
                PushAction::MoveFile { to } => format!("move {} -> {}", op.key, to),
                action => format!("{} {}", action.name(), op.key),
            })
            .collect();
        for p in &classification.paths {
            if p.class == ChangeClass::RemoteOnly {
                lines.push(format!("pull {}", p.key));
            } else if p.class == ChangeClass::BothChanged && !p.conflict {
                lines.push(format!("pull-merged {}", p.key));
            }
        }
        lines
    }

    /// Adopt a directory created identically on both sides: record the
    /// remote document as ours, no mutation needed.
    fn adopt_remote_dir(&mut self, key: &str, id: Option<&DocId>) -> Result<(), EngineError> {
        let id = match id {
            Some(id) => id.clone(),
            None => return Ok(()),
        };
        let (heads, names) = self.store.read(&id, |doc| {
            let names = tree::dir_children(doc)?
                .into_iter()
                .map(|c| c.name)
                .collect();
            Ok((doc.get_heads(), names))
        })?;
        let mut state = DirState { id, heads: Vec::new(), child_names: names };
        state.set_heads(&heads);
        self.snapshot.insert_dir(key.to_string(), state);
        self.snap_store.save(&self.snapshot)?;
        Ok(())
    }

    // ---- phase one: execution ----

    fn execute_push(
        &mut self,
        op: &PushOp,
        fs_by_key: &BTreeMap<String, FileSystemEntry>,
    ) -> Result<(), OpFailure> {
        match &op.action {
            PushAction::CreateDir => self.push_create_dir(&op.key),
            PushAction::CreateFile => self.push_create_file(&op.key, fs_by_key),
            PushAction::UpdateFile => self.push_update_file(&op.key, fs_by_key),
            PushAction::MoveFile { to } => self.push_move_file(&op.key, to, fs_by_key),
            PushAction::Retype => self.push_retype(&op.key, fs_by_key),
            PushAction::DeleteFile => self.push_delete(&op.key, false),
            PushAction::DeleteDir => self.push_delete(&op.key, true),
        }
    }

    /// Parent directory document and the anchor heads to mutate it at.
    fn parent_info(
        &self,
        key: &str,
    ) -> Result<(String, DocId, Vec<automerge::ChangeHash>), OpFailure> {
        let parent_key = parent_key_of(key);
        if parent_key.is_empty() {
            let heads = self
                .snapshot
                .root_heads()
                .map_err(|e| OpFailure::recoverable(e.to_string()))?;
            return Ok((String::new(), self.snapshot.root_id.clone(), heads));
        }
        match self.snapshot.dir(parent_key) {
            Some(state) => {
                let heads = state.heads().map_err(|e| OpFailure::recoverable(e.to_string()))?;
                Ok((parent_key.to_string(), state.id.clone(), heads))
            },
            None => Err(OpFailure::recoverable(format!(
                "parent directory {parent_key} is not synced"
            ))),
        }
    }

    /// Record a parent mutation: new heads plus refreshed child names.
    fn commit_parent(
        &mut self,
        parent_key: &str,
        parent_id: &DocId,
        new_heads: Vec<automerge::ChangeHash>,
    ) -> Result<(), OpFailure> {
        self.touched.insert(parent_id.clone(), new_heads.clone());
        if parent_key.is_empty() {
            self.snapshot.set_root_heads(&new_heads);
            return Ok(());
        }
        let names: Vec<String> = self
            .store
            .read(parent_id, |doc| {
                Ok(tree::dir_children(doc)?.into_iter().map(|c| c.name).collect())
            })?;
        let state = self
            .snapshot
            .dir(parent_key)
            .cloned()
            .map(|mut s| {
                s.set_heads(&new_heads);
                s.child_names = names.clone();
                s
            })
            .unwrap_or_else(|| {
                let mut s = DirState {
                    id: parent_id.clone(),
                    heads: Vec::new(),
                    child_names: names,
                };
                s.set_heads(&new_heads);
                s
            });
        self.snapshot.insert_dir(parent_key.to_string(), state);
        Ok(())
    }

    fn local_file_state(
        &self,
        key: &str,
        fs_by_key: &BTreeMap<String, FileSystemEntry>,
    ) -> Result<(FileContent, tree::FileAttrs), OpFailure> {
        let entry = fs_by_key
            .get(key)
            .ok_or_else(|| OpFailure::recoverable("path disappeared mid-sync"))?;
        let content = classify::load_local_content(&self.root, key, entry.entry_type)
            .map_err(|e| OpFailure::recoverable(e.to_string()))?;
        let rel = Path::new(key);
        let attrs = tree::FileAttrs {
            name: name_of(key).to_string(),
            extension: scan::extension_for(rel),
            mime_type: scan::mime_type_for(rel, entry.entry_type),
            permissions: entry.permissions,
        };
        Ok((content, attrs))
    }

    fn artifact_hash(&self, key: &str, content: &FileContent) -> Option<crate::hash::ContentHash> {
        classify::is_artifact_path(key, &self.config.artifact_directories)
            .then(|| content.hash())
    }

    fn push_create_dir(&mut self, key: &str) -> Result<(), OpFailure> {
        let (parent_key, parent_id, parent_anchor) = self.parent_info(key)?;
        let (id, _, heads) = self.store.create_with(tree::init_directory)?;

        let name = name_of(key).to_string();
        let ((), parent_heads) = self.store.change_at(&parent_id, &parent_anchor, |doc| {
            tree::add_child(doc, &name, EntryKind::Folder, &id)
        })?;
        self.commit_parent(&parent_key, &parent_id, parent_heads)?;

        let mut state = DirState { id: id.clone(), heads: Vec::new(), child_names: Vec::new() };
        state.set_heads(&heads);
        self.touched.insert(id, heads);
        self.snapshot.insert_dir(key.to_string(), state);
        self.changed_dirs.insert(key.to_string());
        Ok(())
    }

    fn push_create_file(
        &mut self,
        key: &str,
        fs_by_key: &BTreeMap<String, FileSystemEntry>,
    ) -> Result<(), OpFailure> {
        let (parent_key, parent_id, parent_anchor) = self.parent_info(key)?;
        let (content, attrs) = self.local_file_state(key, fs_by_key)?;

        let (id, _, heads) = self
            .store
            .create_with(|doc| tree::init_file(doc, &attrs, &content))?;

        let name = attrs.name.clone();
        let ((), parent_heads) = self.store.change_at(&parent_id, &parent_anchor, |doc| {
            tree::add_child(doc, &name, EntryKind::File, &id)
        })?;
        self.commit_parent(&parent_key, &parent_id, parent_heads)?;

        let mut state = FileState {
            id: id.clone(),
            heads: Vec::new(),
            extension: attrs.extension,
            mime_type: attrs.mime_type,
            content_hash: self.artifact_hash(key, &content),
        };
        state.set_heads(&heads);
        self.touched.insert(id, heads);
        self.snapshot.insert_file(key.to_string(), state);
        self.changed_files.insert(key.to_string());
        Ok(())
    }

    fn push_update_file(
        &mut self,
        key: &str,
        fs_by_key: &BTreeMap<String, FileSystemEntry>,
    ) -> Result<(), OpFailure> {
        let (content, attrs) = self.local_file_state(key, fs_by_key)?;

        // Adopt the remote document when both sides created this path
        let state = match self.snapshot.file(key) {
            Some(state) => state.clone(),
            None => self.adopt_remote_file(key, &attrs)?,
        };

        let anchor = state.heads().map_err(|e| OpFailure::recoverable(e.to_string()))?;
        let ((), new_heads) = self.store.change_at(&state.id, &anchor, |doc| {
            match &content {
                FileContent::Text(text) => tree::update_text_content(doc, text),
                FileContent::Binary(bytes) => tree::update_binary_content(doc, bytes),
            }
        })?;

        self.ensure_parent_link(key, &state.id, EntryKind::File)?;

        let mut state = state;
        state.set_heads(&new_heads);
        state.content_hash = self.artifact_hash(key, &content);
        self.touched.insert(state.id.clone(), new_heads);
        self.snapshot.insert_file(key.to_string(), state);
        self.changed_files.insert(key.to_string());
        Ok(())
    }

    /// Both sides created the same file path: take the remote document
    /// as the base so our content lands as an anchored edit on it.
    fn adopt_remote_file(
        &mut self,
        key: &str,
        attrs: &tree::FileAttrs,
    ) -> Result<FileState, OpFailure> {
        let entries = tree::walk(self.store, &self.snapshot.root_id)?;
        let id = entries
            .iter()
            .find(|e| path_key(&e.rel_path) == key && e.kind == EntryKind::File)
            .map(|e| e.id.clone())
            .ok_or_else(|| OpFailure::recoverable("remote document vanished"))?;
        let heads = self.store.heads(&id)?;
        let mut state = FileState {
            id,
            heads: Vec::new(),
            extension: attrs.extension.clone(),
            mime_type: attrs.mime_type.clone(),
            content_hash: None,
        };
        state.set_heads(&heads);
        Ok(state)
    }

    /// Re-link a document whose parent entry was removed remotely while
    /// we edited it locally (edit wins over delete).
    fn ensure_parent_link(
        &mut self,
        key: &str,
        id: &DocId,
        kind: EntryKind,
    ) -> Result<(), OpFailure> {
        let (parent_key, parent_id, parent_anchor) = self.parent_info(key)?;
        let linked = self.store.read(&parent_id, |doc| {
            Ok(tree::dir_children(doc)?.iter().any(|c| c.id == *id))
        })?;
        if linked {
            return Ok(());
        }
        info!(path = %key, "Restoring entry removed remotely");
        let name = name_of(key).to_string();
        let id = id.clone();
        let ((), parent_heads) = self.store.change_at(&parent_id, &parent_anchor, |doc| {
            tree::add_child(doc, &name, kind, &id)
        })?;
        self.commit_parent(&parent_key, &parent_id, parent_heads)
    }

    fn push_move_file(
        &mut self,
        from: &str,
        to: &str,
        fs_by_key: &BTreeMap<String, FileSystemEntry>,
    ) -> Result<(), OpFailure> {
        let state = self
            .snapshot
            .file(from)
            .cloned()
            .ok_or_else(|| OpFailure::recoverable("source not in snapshot"))?;

        let (from_parent_key, from_pid, from_anchor) = self.parent_info(from)?;
        let (to_parent_key, to_pid, to_anchor) = self.parent_info(to)?;
        let from_name = name_of(from).to_string();
        let to_name = name_of(to).to_string();

        if from_parent_key == to_parent_key {
            let ((), heads) = self.store.change_at(&from_pid, &from_anchor, |doc| {
                tree::rename_child(doc, &from_name, &to_name)
            })?;
            self.commit_parent(&from_parent_key, &from_pid, heads)?;
        } else {
            // Collision check up front: abort before touching either parent
            let collides = self.store.read(&to_pid, |doc| {
                Ok(tree::dir_children(doc)?.iter().any(|c| c.name == to_name))
            })?;
            if collides {
                return Err(OpFailure::fatal(format!(
                    "name collision at {to} while moving {from}"
                )));
            }

            let ((), old_heads) = self.store.change_at(&from_pid, &from_anchor, |doc| {
                tree::remove_child(doc, &from_name)?;
                Ok(())
            })?;
            self.commit_parent(&from_parent_key, &from_pid, old_heads)?;

            let id = state.id.clone();
            let ((), new_heads) = self.store.change_at(&to_pid, &to_anchor, |doc| {
                tree::add_child(doc, &to_name, EntryKind::File, &id)
            })?;
            self.commit_parent(&to_parent_key, &to_pid, new_heads)?;
        }

        // The file document carries its own name and may also have been
        // edited before the rename.
        let rel = Path::new(to);
        let entry_type = fs_by_key.get(to).map(|e| e.entry_type);
        let extension = scan::extension_for(rel);
        let mime_type = scan::mime_type_for(rel, entry_type.unwrap_or(EntryType::Text));

        let anchor = state.heads().map_err(|e| OpFailure::recoverable(e.to_string()))?;
        let ((), mut file_heads) = self.store.change_at(&state.id, &anchor, |doc| {
            tree::set_file_name(doc, &to_name, &extension, &mime_type)
        })?;

        if let Some(entry_type) = entry_type {
            let local = classify::load_local_content(&self.root, to, entry_type)
                .map_err(|e| OpFailure::recoverable(e.to_string()))?;
            let remote = self.store.read(&state.id, tree::file_content)?;
            if local != remote {
                let ((), heads) = self.store.change_at(&state.id, &anchor, |doc| match &local {
                    FileContent::Text(text) => tree::update_text_content(doc, text),
                    FileContent::Binary(bytes) => tree::update_binary_content(doc, bytes),
                })?;
                file_heads = heads;
            }
        }

        let mut state = state;
        state.set_heads(&file_heads);
        state.extension = extension;
        state.mime_type = mime_type;
        self.touched.insert(state.id.clone(), file_heads);
        self.snapshot.remove(from);
        self.snapshot.insert_file(to.to_string(), state);
        self.changed_files.insert(from.to_string());
        self.changed_files.insert(to.to_string());
        Ok(())
    }

    fn push_retype(
        &mut self,
        key: &str,
        fs_by_key: &BTreeMap<String, FileSystemEntry>,
    ) -> Result<(), OpFailure> {
        let entry = fs_by_key
            .get(key)
            .ok_or_else(|| OpFailure::recoverable("path disappeared mid-sync"))?;
        let (parent_key, parent_id, parent_anchor) = self.parent_info(key)?;
        let name = name_of(key).to_string();

        if entry.entry_type.is_dir() {
            // file -> directory
            let (id, _, heads) = self.store.create_with(tree::init_directory)?;
            let ((), parent_heads) = self.store.change_at(&parent_id, &parent_anchor, |doc| {
                tree::replace_child(doc, &name, EntryKind::Folder, &id)
            })?;
            self.commit_parent(&parent_key, &parent_id, parent_heads)?;

            let mut state = DirState { id: id.clone(), heads: Vec::new(), child_names: Vec::new() };
            state.set_heads(&heads);
            self.touched.insert(id, heads);
            self.snapshot.insert_dir(key.to_string(), state);
            self.changed_dirs.insert(key.to_string());
        } else {
            // directory -> file, or text <-> binary
            let (content, attrs) = self.local_file_state(key, fs_by_key)?;
            let (id, _, heads) = self
                .store
                .create_with(|doc| tree::init_file(doc, &attrs, &content))?;
            let ((), parent_heads) = self.store.change_at(&parent_id, &parent_anchor, |doc| {
                tree::replace_child(doc, &name, EntryKind::File, &id)
            })?;
            self.commit_parent(&parent_key, &parent_id, parent_heads)?;

            let mut state = FileState {
                id: id.clone(),
                heads: Vec::new(),
                extension: attrs.extension,
                mime_type: attrs.mime_type,
                content_hash: self.artifact_hash(key, &content),
            };
            state.set_heads(&heads);
            self.touched.insert(id, heads);
            self.snapshot.insert_file(key.to_string(), state);
            self.changed_files.insert(key.to_string());
        }
        Ok(())
    }

    fn push_delete(&mut self, key: &str, is_dir: bool) -> Result<(), OpFailure> {
        let (parent_key, parent_id, parent_anchor) = self.parent_info(key)?;
        let name = name_of(key).to_string();

        let ((), parent_heads) = self.store.change_at(&parent_id, &parent_anchor, |doc| {
            tree::remove_child(doc, &name)?;
            Ok(())
        })?;
        self.commit_parent(&parent_key, &parent_id, parent_heads)?;

        // The child document is orphaned, not destroyed; unreachable
        // documents are the store's garbage to collect.
        self.snapshot.remove(key);
        if is_dir {
            self.changed_dirs.insert(key.to_string());
        } else {
            self.changed_files.insert(key.to_string());
        }
        Ok(())
    }

    // ---- barriers ----

    /// Wait until the peer acknowledges every document we touched.
    fn upload_barrier(&self, result: &mut SyncResult) {
        let timeout = Duration::from_secs(self.config.upload_timeout_secs);
        for (id, heads) in &self.touched {
            if let Err(e) = self.store.flush(id) {
                result.warnings.push(format!("upload flush: {e}"));
            }
            let deadline = Instant::now() + timeout;
            loop {
                match self.store.remote_contains(id, heads) {
                    Ok(true) => break,
                    Ok(false) => {},
                    Err(e) => {
                        result.warnings.push(format!("upload barrier: {e}"));
                        break;
                    },
                }
                if Instant::now() >= deadline {
                    warn!(doc = %id, "Upload barrier timed out");
                    result
                        .warnings
                        .push(format!("upload not acknowledged for document {id}"));
                    break;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    /// Every document id reachable from the root, with its heads.
    fn tree_heads(&self) -> Result<BTreeMap<DocId, Vec<String>>, StoreError> {
        let mut map = BTreeMap::new();
        let root = &self.snapshot.root_id;
        map.insert(
            root.clone(),
            crate::store::heads_to_hex(&self.store.heads(root)?),
        );
        for entry in tree::walk(self.store, root)? {
            let heads = self.store.heads(&entry.id)?;
            map.insert(entry.id, crate::store::heads_to_hex(&heads));
        }
        Ok(map)
    }

    /// Wait for the reachable-head union to stay unchanged across
    /// consecutive polls before reading the tree back.
    fn stabilization_barrier(&self, result: &mut SyncResult) -> Result<(), EngineError> {
        let started = Instant::now();
        let mut last: Option<BTreeMap<DocId, Vec<String>>> = None;
        let mut stable = 0usize;

        loop {
            let current = self.tree_heads()?;
            let doc_count = current.len();

            if last.as_ref() == Some(&current) {
                stable += 1;
            } else {
                stable = 1;
                last = Some(current);
            }
            if stable >= STABLE_POLLS {
                return Ok(());
            }

            let timeout = Duration::from_secs(10)
                .max(Duration::from_secs(5) + Duration::from_millis(50) * doc_count as u32);
            if started.elapsed() >= timeout {
                warn!("Stabilization barrier timed out");
                result
                    .warnings
                    .push("document tree did not stabilize before pull".into());
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    // ---- phase two: pull ----

    fn pull(&mut self, result: &mut SyncResult) -> Result<(), EngineError> {
        let entries = tree::walk(self.store, &self.snapshot.root_id)?;
        let tree_keys: HashSet<String> =
            entries.iter().map(|e| path_key(&e.rel_path)).collect();

        // Removals first, children before parents
        let mut to_remove: Vec<String> = self
            .snapshot
            .paths()
            .filter(|key| !tree_keys.contains(*key) && !self.skip_pull.contains(*key))
            .map(String::from)
            .collect();
        to_remove.sort_by(|a, b| b.cmp(a));

        for key in to_remove {
            match self.pull_remove(&key) {
                Ok(()) => self.snap_store.save(&self.snapshot)?,
                Err(failure) => {
                    warn!(path = %key, error = %failure.message, "Pull removal failed");
                    result.errors.push(SyncError {
                        path: key,
                        op: "remove".into(),
                        recoverable: failure.recoverable,
                        message: failure.message,
                    });
                },
            }
        }

        // Materializations parents-first (walk order is already sorted)
        for entry in &entries {
            let key = path_key(&entry.rel_path);
            if self.skip_pull.contains(&key) {
                debug!(path = %key, "Pull skipped after failed push");
                continue;
            }
            let outcome = match entry.kind {
                EntryKind::Folder => self.pull_dir(&key, entry),
                EntryKind::File => self.pull_file(&key, entry),
            };
            match outcome {
                Ok(()) => self.snap_store.save(&self.snapshot)?,
                Err(failure) => {
                    warn!(path = %key, error = %failure.message, "Pull failed");
                    result.errors.push(SyncError {
                        path: key,
                        op: "materialize".into(),
                        recoverable: failure.recoverable,
                        message: failure.message,
                    });
                },
            }
        }

        // Track the root's heads for the next run's anchors
        let root_heads = self.store.heads(&self.snapshot.root_id)?;
        self.snapshot.set_root_heads(&root_heads);
        Ok(())
    }

    /// Remove a path that vanished from the document tree.
    fn pull_remove(&mut self, key: &str) -> Result<(), OpFailure> {
        let abs = self.root.join(key);

        match fs::symlink_metadata(&abs) {
            Ok(meta) if meta.is_dir() => {
                io::remove_dir_safe(&abs)?;
                self.changed_dirs.insert(key.to_string());
            },
            Ok(_) => {
                io::remove_file_safe(&abs)?;
                self.changed_files.insert(key.to_string());
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }

        debug!(path = %key, "Removed (deleted remotely)");
        self.snapshot.remove(key);
        Ok(())
    }

    fn pull_dir(&mut self, key: &str, entry: &TreeEntry) -> Result<(), OpFailure> {
        let abs = self.root.join(key);

        match fs::symlink_metadata(&abs) {
            Ok(meta) if meta.is_dir() => {},
            Ok(_) => {
                // File on disk where the tree has a folder
                io::remove_file_safe(&abs)?;
                fs::create_dir_all(&abs)?;
                self.changed_dirs.insert(key.to_string());
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(&abs)?;
                self.changed_dirs.insert(key.to_string());
            },
            Err(e) => return Err(e.into()),
        }

        let (heads, names) = self.store.read(&entry.id, |doc| {
            let names: Vec<String> = tree::dir_children(doc)?
                .into_iter()
                .map(|c| c.name)
                .collect();
            Ok((doc.get_heads(), names))
        })?;
        let mut state = DirState {
            id: entry.id.clone(),
            heads: Vec::new(),
            child_names: names,
        };
        state.set_heads(&heads);
        self.snapshot.insert_dir(key.to_string(), state);
        Ok(())
    }

    fn pull_file(&mut self, key: &str, entry: &TreeEntry) -> Result<(), OpFailure> {
        let abs = self.root.join(key);

        // Artifact fast path: same document state and same bytes on
        // disk, skip the content read entirely.
        if let Some(state) = self.snapshot.file(key) {
            if state.id == entry.id {
                if let (Some(recorded), Ok(anchor)) = (state.content_hash, state.heads()) {
                    let current = self.store.heads(&entry.id)?;
                    if anchor == current && abs.is_file() {
                        if let Ok(on_disk) = hash::hash_file(&abs) {
                            if on_disk == recorded {
                                debug!(path = %key, "Artifact unchanged, pull skipped");
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }

        let (heads, content, permissions) = self.store.read(&entry.id, |doc| {
            Ok((
                doc.get_heads(),
                tree::file_content(doc)?,
                tree::file_permissions(doc)?,
            ))
        })?;

        let needs_write = match fs::symlink_metadata(&abs) {
            Ok(meta) if meta.is_dir() => {
                // Folder on disk where the tree has a file
                warn!(path = %key, "Replacing local directory with synced file");
                fs::remove_dir_all(&abs)?;
                true
            },
            Ok(_) => {
                let entry_type = if content.is_text() {
                    EntryType::Text
                } else {
                    EntryType::Binary
                };
                match classify::load_local_content(&self.root, key, entry_type) {
                    Ok(local) => local != content,
                    Err(_) => true,
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };

        if needs_write {
            if let Some(parent) = abs.parent() {
                io::ensure_directory(parent)?;
            }
            let temp_dir = crate::config::pushwork_dir(&self.root).join(io::TEMP_DIR);
            io::atomic_write(&abs, &temp_dir, content.as_bytes())?;
            if let Some(mode) = permissions {
                io::set_permissions_mode(&abs, mode)?;
            }
            self.changed_files.insert(key.to_string());
            debug!(path = %key, bytes = content.len(), "Materialized");
        }

        let rel = Path::new(key);
        let entry_type = if content.is_text() { EntryType::Text } else { EntryType::Binary };
        let mut state = FileState {
            id: entry.id.clone(),
            heads: Vec::new(),
            extension: scan::extension_for(rel),
            mime_type: scan::mime_type_for(rel, entry_type),
            content_hash: self.artifact_hash(key, &content),
        };
        state.set_heads(&heads);
        self.snapshot.insert_file(key.to_string(), state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_helpers() {
        assert_eq!(parent_key_of("a/b/c.txt"), "a/b");
        assert_eq!(parent_key_of("top.txt"), "");
        assert_eq!(name_of("a/b/c.txt"), "c.txt");
        assert_eq!(name_of("top.txt"), "top.txt");
    }

    #[test]
    fn test_sync_error_display() {
        let e = SyncError {
            path: "a/b.txt".into(),
            op: "update-file".into(),
            recoverable: true,
            message: "permission denied".into(),
        };
        assert_eq!(e.to_string(), "a/b.txt (update-file): permission denied");
    }

    #[test]
    fn test_op_failure_maps_collision_to_fatal() {
        let failure: OpFailure = StoreError::NameCollision("x".into()).into();
        assert!(!failure.recoverable);
        let failure: OpFailure = StoreError::Schema("y".into()).into();
        assert!(failure.recoverable);
    }
}
