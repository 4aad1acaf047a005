//! Atomic filesystem writes.
//!
//! Every file the sync engine produces (materialized documents, the
//! snapshot itself) goes through write-to-temp, fsync, rename so the
//! destination is never observable in a partial state.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Pushwork metadata directory name (inside the sync root).
pub const PUSHWORK_DIR: &str = ".pushwork";

/// Temp directory for in-flight writes (inside `.pushwork/`).
pub const TEMP_DIR: &str = "tmp";

/// Monotonic counter for unique temp file names within a process
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique temp file path within the given directory.
///
/// Format: `{PID}-{counter}.tmp`, unique per process.
pub fn generate_temp_path(temp_dir: &Path) -> PathBuf {
    let pid = std::process::id();
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    temp_dir.join(format!("{pid}-{counter}.tmp"))
}

/// Crash-safe atomic file writer.
///
/// Writes data to a temporary file, then atomically renames to the final
/// destination on commit. If dropped without commit, the temp file is
/// cleaned up automatically.
///
/// On crash: either the old file or the complete new file exists. The
/// temp file must be on the same filesystem as the destination.
pub struct AtomicWriter {
    temp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
    committed: bool,
}

impl AtomicWriter {
    pub fn new(temp_path: PathBuf, final_path: PathBuf) -> io::Result<Self> {
        let file = File::create(&temp_path)?;
        let writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        Ok(Self { temp_path, final_path, writer, committed: false })
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.writer.write_all(buf)
    }

    /// Flush, fsync, rename.
    pub fn commit(mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        fs::rename(&self.temp_path, &self.final_path)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for AtomicWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

/// Write `data` to `final_path` atomically via a temp file in `temp_dir`.
pub fn atomic_write(final_path: &Path, temp_dir: &Path, data: &[u8]) -> io::Result<()> {
    fs::create_dir_all(temp_dir)?;
    let temp_path = generate_temp_path(temp_dir);
    let mut writer = AtomicWriter::new(temp_path, final_path.to_path_buf())?;
    writer.write(data)?;
    writer.commit()
}

/// Remove a file, ignoring "not found" errors.
pub fn remove_file_safe(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove a directory if it exists. Contents must already be gone.
pub fn remove_dir_safe(path: &Path) -> io::Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Ensure a directory exists, creating it and all parents if necessary.
pub fn ensure_directory(path: &Path) -> io::Result<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Path exists but is not a directory: {}", path.display()),
            ));
        }
        return Ok(());
    }

    fs::create_dir_all(path)
}

/// Apply a Unix permission mode to a path. No-op elsewhere.
pub fn set_permissions_mode(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

/// Flush directory metadata to disk (ensures renames are persisted).
///
/// No-op on Windows where directory fsync is not supported.
pub fn fsync_directory(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    File::open(path)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_writer_commit() -> io::Result<()> {
        let dir = tempdir()?;
        let temp_path = dir.path().join("temp.tmp");
        let final_path = dir.path().join("final.txt");

        let mut writer = AtomicWriter::new(temp_path.clone(), final_path.clone())?;
        writer.write(b"hello atomic")?;
        writer.commit()?;

        assert!(final_path.exists());
        assert!(!temp_path.exists());
        assert_eq!(fs::read_to_string(&final_path)?, "hello atomic");

        Ok(())
    }

    #[test]
    fn test_atomic_writer_drop_cleanup() -> io::Result<()> {
        let dir = tempdir()?;
        let temp_path = dir.path().join("temp.tmp");
        let final_path = dir.path().join("final.txt");

        {
            let mut writer = AtomicWriter::new(temp_path.clone(), final_path.clone())?;
            writer.write(b"uncommitted data")?;
        }

        assert!(!temp_path.exists(), "Temp file should be cleaned up on drop");
        assert!(!final_path.exists(), "Final path should not exist");

        Ok(())
    }

    #[test]
    fn test_atomic_write_replaces_existing() -> io::Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("file.txt");
        let temp_dir = dir.path().join(TEMP_DIR);

        fs::write(&target, b"old")?;
        atomic_write(&target, &temp_dir, b"new contents")?;

        assert_eq!(fs::read(&target)?, b"new contents");
        Ok(())
    }

    #[test]
    fn test_remove_file_safe() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("gone.txt");
        fs::write(&path, b"x")?;

        remove_file_safe(&path)?;
        // Second removal succeeds even though the file is gone
        remove_file_safe(&path)?;

        Ok(())
    }

    #[test]
    fn test_ensure_directory() -> io::Result<()> {
        let temp_dir = tempdir()?;
        let nested_path = temp_dir.path().join("a").join("b").join("c");

        ensure_directory(&nested_path)?;
        assert!(nested_path.is_dir());

        // Calling again should succeed
        ensure_directory(&nested_path)?;

        Ok(())
    }

    #[test]
    fn test_generate_temp_path_uniqueness() {
        let dir = Path::new("/tmp/test");
        assert_ne!(generate_temp_path(dir), generate_temp_path(dir));
    }

    #[test]
    fn test_fsync_directory() -> io::Result<()> {
        let dir = tempdir()?;
        fsync_directory(dir.path())?;
        Ok(())
    }
}
