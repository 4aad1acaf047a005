//! Filesystem scanner.
//!
//! Walks the local tree, classifies entries as text, binary, or directory,
//! and honors gitignore-style exclude patterns. The scanner never reads
//! full file content; the only read is an 8 KiB sniff for text/binary
//! detection. Content reads are the reconciler's job.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use crate::io::PUSHWORK_DIR;

/// Sniff window for binary detection.
const SNIFF_BYTES: usize = 8 * 1024;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a filesystem entry is represented on the document side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Text,
    Binary,
    Directory,
}

impl EntryType {
    pub fn is_dir(self) -> bool {
        matches!(self, EntryType::Directory)
    }
}

/// A single scanned entry, path relative to the scan root.
#[derive(Debug, Clone)]
pub struct FileSystemEntry {
    pub rel_path: PathBuf,
    pub entry_type: EntryType,
    pub size: u64,
    pub mtime: SystemTime,
    pub permissions: Option<u32>,
}

/// Result of scanning a directory tree.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub root: PathBuf,
    pub entries: Vec<FileSystemEntry>,
    pub scan_time: SystemTime,
    /// Paths that could not be processed, with the reason. The sync run
    /// reports these as warnings; they are skipped, not fatal.
    pub warnings: Vec<String>,
}

/// Scan the tree rooted at `root`, excluding `.pushwork/` and any
/// configured patterns (gitignore syntax, applied root-relative).
pub fn scan_tree(root: &Path, exclude_patterns: &[String]) -> Result<ScanResult, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::InvalidPath(format!(
            "Not a directory: {}",
            root.display()
        )));
    }

    let mut builder = ignore::WalkBuilder::new(root);
    builder
        .hidden(false)
        .standard_filters(false)
        .follow_links(false)
        .threads(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

    let mut override_builder = ignore::overrides::OverrideBuilder::new(root);
    for pattern in exclude_patterns {
        override_builder
            .add(&format!("!{pattern}"))
            .map_err(|e| ScanError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
    }
    // Internal state is never synced
    override_builder
        .add(&format!("!{PUSHWORK_DIR}/"))
        .map_err(|e| ScanError::InvalidPattern {
            pattern: PUSHWORK_DIR.to_string(),
            reason: e.to_string(),
        })?;
    let overrides = override_builder
        .build()
        .map_err(|e| ScanError::InvalidPattern {
            pattern: String::new(),
            reason: e.to_string(),
        })?;
    builder.overrides(overrides);

    let walker = builder.build_parallel();
    let found: Mutex<Vec<(PathBuf, bool)>> = Mutex::new(Vec::with_capacity(1024));

    walker.run(|| {
        Box::new(|entry_result| {
            if let Ok(entry) = entry_result {
                if let Some(file_type) = entry.file_type() {
                    if file_type.is_symlink() {
                        debug!(path = %entry.path().display(), "Skipping symlink");
                    } else if entry.depth() > 0 {
                        found
                            .lock()
                            .unwrap()
                            .push((entry.path().to_path_buf(), file_type.is_dir()));
                    }
                }
            }
            ignore::WalkState::Continue
        })
    });

    let paths = found.into_inner().unwrap();

    // Metadata + sniff in parallel, as a bounded batch
    let results: Vec<Result<FileSystemEntry, String>> = paths
        .par_iter()
        .map(|(path, is_dir)| {
            stat_entry(root, path, *is_dir).map_err(|e| format!("{}: {e}", path.display()))
        })
        .collect();

    let mut entries = Vec::with_capacity(results.len());
    let mut warnings = Vec::new();
    for result in results {
        match result {
            Ok(entry) => entries.push(entry),
            Err(msg) => {
                warn!(warning = %msg, "Scan skipped entry");
                warnings.push(msg);
            },
        }
    }

    // Deterministic order: parents sort before children
    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    Ok(ScanResult {
        root: root.to_path_buf(),
        entries,
        scan_time: SystemTime::now(),
        warnings,
    })
}

fn stat_entry(root: &Path, path: &Path, is_dir: bool) -> Result<FileSystemEntry, ScanError> {
    let metadata = fs::metadata(path)?;

    #[cfg(unix)]
    let permissions = {
        use std::os::unix::fs::PermissionsExt;
        Some(metadata.permissions().mode() & 0o777)
    };
    #[cfg(not(unix))]
    let permissions = None;

    let rel_path = path
        .strip_prefix(root)
        .map_err(|_| ScanError::InvalidPath(format!("Path not under root: {}", path.display())))?
        .to_path_buf();

    let entry_type = if is_dir {
        EntryType::Directory
    } else {
        detect_file_type(path)?
    };

    Ok(FileSystemEntry {
        rel_path,
        entry_type,
        size: if is_dir { 0 } else { metadata.len() },
        mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        permissions,
    })
}

/// Classify a file as text or binary: binary iff the first 8 KiB contain
/// a NUL byte. The extension's MIME type is recorded separately and does
/// not override the sniff.
pub fn detect_file_type(path: &Path) -> Result<EntryType, ScanError> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; SNIFF_BYTES];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if buf[..filled].contains(&0) {
        Ok(EntryType::Binary)
    } else {
        Ok(EntryType::Text)
    }
}

/// MIME type for a path, from its extension.
pub fn mime_type_for(path: &Path, entry_type: EntryType) -> String {
    match mime_guess::from_path(path).first_raw() {
        Some(mime) => mime.to_string(),
        None => match entry_type {
            EntryType::Binary => "application/octet-stream".to_string(),
            _ => "text/plain".to_string(),
        },
    }
}

/// File extension (without the dot), empty when absent.
pub fn extension_for(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn rel_paths(result: &ScanResult) -> Vec<String> {
        result
            .entries
            .iter()
            .map(|e| e.rel_path.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_scan_includes_dirs_and_files() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/file.txt"), "hello").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();

        let result = scan_tree(dir.path(), &[]).unwrap();
        let paths = rel_paths(&result);

        assert_eq!(paths, vec!["empty", "sub", "sub/file.txt"]);
        assert_eq!(result.entries[0].entry_type, EntryType::Directory);
        assert_eq!(result.entries[2].entry_type, EntryType::Text);
    }

    #[test]
    fn test_pushwork_dir_always_excluded() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".pushwork/automerge")).unwrap();
        fs::write(dir.path().join(".pushwork/config"), "{}").unwrap();
        fs::write(dir.path().join("kept.txt"), "x").unwrap();

        let result = scan_tree(dir.path(), &[]).unwrap();
        assert_eq!(rel_paths(&result), vec!["kept.txt"]);
    }

    #[test]
    fn test_exclude_patterns_are_root_relative() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("build")).unwrap();
        fs::write(dir.path().join("build/out.bin"), [0u8, 1]).unwrap();
        fs::create_dir_all(dir.path().join("src/build")).unwrap();
        fs::write(dir.path().join("src/build/keep.txt"), "x").unwrap();
        fs::write(dir.path().join("a.log"), "log").unwrap();
        fs::write(dir.path().join("a.txt"), "txt").unwrap();

        let result = scan_tree(dir.path(), &["/build/".into(), "*.log".into()]).unwrap();
        let paths = rel_paths(&result);

        assert!(paths.contains(&"a.txt".to_string()));
        assert!(paths.contains(&"src/build/keep.txt".to_string()));
        assert!(!paths.iter().any(|p| p == "build" || p.starts_with("build/")));
        assert!(!paths.contains(&"a.log".to_string()));
    }

    #[test]
    fn test_binary_detection_by_nul_sniff() {
        let dir = tempdir().unwrap();
        let text = dir.path().join("notes.md");
        let binary = dir.path().join("blob.dat");
        fs::write(&text, "no nul here, just prose").unwrap();
        fs::write(&binary, b"abc\x00def").unwrap();

        assert_eq!(detect_file_type(&text).unwrap(), EntryType::Text);
        assert_eq!(detect_file_type(&binary).unwrap(), EntryType::Binary);
    }

    #[test]
    fn test_empty_file_is_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();
        assert_eq!(detect_file_type(&path).unwrap(), EntryType::Text);
    }

    #[test]
    fn test_mime_and_extension() {
        assert_eq!(
            mime_type_for(Path::new("a.json"), EntryType::Text),
            "application/json"
        );
        assert_eq!(
            mime_type_for(Path::new("noext"), EntryType::Binary),
            "application/octet-stream"
        );
        assert_eq!(extension_for(Path::new("a/b/c.tar.gz")), "gz");
        assert_eq!(extension_for(Path::new("Makefile")), "");
    }

    #[test]
    fn test_scan_missing_root_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            scan_tree(&missing, &[]),
            Err(ScanError::InvalidPath(_))
        ));
    }
}
