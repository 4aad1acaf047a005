//! Bidirectional directory sync over automerge documents.
//!
//! A local tree is mirrored into a tree of CRDT documents: one document
//! per file and per directory, linked from a shareable root. Peers that
//! edit in parallel converge with no manual merge step; the two-phase
//! reconciler pushes local changes as causally anchored edits, then
//! pulls the merged tree back onto the filesystem.

pub mod classify;
pub mod config;
pub mod hash;
pub mod io;
pub mod moves;
pub mod reconcile;
pub mod scan;
pub mod snapshot;
pub mod store;
pub mod tree;

pub use classify::{classify, ChangeClass, Classification};
pub use config::Config;
pub use reconcile::{Reconciler, SyncOptions, SyncResult};
pub use scan::{scan_tree, EntryType, FileSystemEntry, ScanResult};
pub use snapshot::{Snapshot, SnapshotStore};
pub use store::{DocId, DocStore};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
