//! Removes an in-progress file unless it was committed.

use std::path::{Path, PathBuf};

/// Deletes `path` on drop unless [`TempFileGuard::defuse`] was called.
#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Call after the temp file has been renamed into place.
    pub fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed temp file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove temp file {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_guard_removes_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt.qsync");
        fs::write(&path, "partial").unwrap();
        {
            let _guard = TempFileGuard::new(&path);
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_defused_guard_keeps_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt.qsync");
        fs::write(&path, "done").unwrap();
        TempFileGuard::new(&path).defuse();
        assert!(path.exists());
    }

    #[test]
    fn test_missing_file_is_fine() {
        let tmp = TempDir::new().unwrap();
        let _guard = TempFileGuard::new(&tmp.path().join("never-created"));
    }
}
