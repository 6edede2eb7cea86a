//! Receiver-side update policy.
//!
//! "Newer wins" by modification time: an entry is left alone when the local
//! copy has the same kind, is at least as new as the advertised one and (for
//! regular files) has the same size. Anything the policy cannot inspect is
//! reported as [`Decision::Unreachable`] and never written.

use crate::error::{Result, SyncError};
use crate::streaming::protocol::{Record, RecordKind, Timestamp};
use std::fs::{self, Metadata};
use std::io;
use std::path::{Component, Path, PathBuf};

/// Destination state captured when a transfer is decided, compared again
/// right before commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub size: u64,
    pub mtime: Timestamp,
}

impl Snapshot {
    pub fn of(meta: &Metadata) -> Self {
        Self {
            size: meta.len(),
            mtime: Timestamp::from_metadata(meta),
        }
    }
}

#[derive(Debug)]
pub enum Decision {
    /// The destination could not be inspected; nothing is written.
    Unreachable(SyncError),
    Current,
    CreateDir,
    CreateSymlink,
    /// `snapshot` is `Some` when something already exists at the destination.
    NeedsTransfer { snapshot: Option<Snapshot> },
}

impl Decision {
    /// Everything except a content pull is resolved with an acknowledgment.
    pub fn needs_ack(&self) -> bool {
        !matches!(self, Decision::NeedsTransfer { .. })
    }
}

/// Join a '/'-separated relative path onto `root`, refusing anything that
/// could land outside it.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(SyncError::InvalidPath("empty path".to_string()));
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        return Err(SyncError::InvalidPath(format!(
            "absolute path not allowed: {}",
            relative
        )));
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                return Err(SyncError::InvalidPath(format!(
                    "path traversal not allowed: {}",
                    relative
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(SyncError::InvalidPath(format!(
                    "prefixed path not allowed: {}",
                    relative
                )));
            }
            _ => {}
        }
    }

    Ok(root.join(rel_path))
}

fn same_kind(record: &Record, dest: &Path, meta: &Metadata) -> bool {
    let ft = meta.file_type();
    match record.kind {
        RecordKind::File => ft.is_file(),
        RecordKind::Dir => ft.is_dir(),
        // A link pointing somewhere else is a different entry.
        RecordKind::FileSymlink | RecordKind::DirSymlink => {
            ft.is_symlink()
                && fs::read_link(dest)
                    .map(|t| Some(t.as_path()) == record.link_target.as_deref().map(Path::new))
                    .unwrap_or(false)
        }
    }
}

/// Classify `record` against the tree under `root`.
///
/// Checks run in order: existence, kind, modification time, then size for
/// regular files only.
pub fn decide(root: &Path, record: &Record) -> Decision {
    let dest = match resolve(root, &record.path) {
        Ok(dest) => dest,
        Err(e) => return Decision::Unreachable(e),
    };

    let meta = match fs::symlink_metadata(&dest) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return stale(record, None),
        Err(e) => return Decision::Unreachable(SyncError::io_path(&dest, e)),
    };

    if same_kind(record, &dest, &meta) {
        let local_mtime = Timestamp::from_metadata(&meta);
        let size_ok = record.kind != RecordKind::File || meta.len() == record.size;
        if local_mtime >= record.mtime && size_ok {
            return Decision::Current;
        }
    }

    stale(record, Some(Snapshot::of(&meta)))
}

fn stale(record: &Record, existing: Option<Snapshot>) -> Decision {
    match record.kind {
        RecordKind::File => Decision::NeedsTransfer { snapshot: existing },
        RecordKind::Dir => Decision::CreateDir,
        RecordKind::FileSymlink | RecordKind::DirSymlink => Decision::CreateSymlink,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    const T: Timestamp = Timestamp::new(1_600_000_000, 0);

    fn set_mtime(path: &Path, ts: Timestamp) {
        filetime::set_file_mtime(path, FileTime::from(ts)).unwrap();
    }

    #[test]
    fn test_missing_file_needs_transfer() {
        let tmp = TempDir::new().unwrap();
        let record = Record::file(1, "a.txt", 5, T);
        assert!(matches!(
            decide(tmp.path(), &record),
            Decision::NeedsTransfer { snapshot: None }
        ));
    }

    #[test]
    fn test_same_size_newer_local_is_current() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        fs::write(&path, "hello").unwrap();
        set_mtime(&path, Timestamp::new(T.secs + 10, 0));

        let record = Record::file(1, "a.txt", 5, T);
        let decision = decide(tmp.path(), &record);
        assert!(matches!(decision, Decision::Current));
        assert!(decision.needs_ack());
    }

    #[test]
    fn test_equal_mtime_is_current() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        fs::write(&path, "hello").unwrap();
        set_mtime(&path, T);
        assert!(matches!(
            decide(tmp.path(), &Record::file(1, "a.txt", 5, T)),
            Decision::Current
        ));
    }

    #[test]
    fn test_newer_advertised_needs_transfer_with_snapshot() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        fs::write(&path, "hello").unwrap();
        set_mtime(&path, T);

        let record = Record::file(1, "a.txt", 5, Timestamp::new(T.secs, 1));
        match decide(tmp.path(), &record) {
            Decision::NeedsTransfer {
                snapshot: Some(snapshot),
            } => {
                assert_eq!(snapshot.size, 5);
                assert_eq!(snapshot.mtime, T);
            }
            other => panic!("Expected transfer, got {:?}", other),
        }
    }

    #[test]
    fn test_size_difference_needs_transfer() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        fs::write(&path, "hello!").unwrap();
        set_mtime(&path, Timestamp::new(T.secs + 10, 0));
        assert!(matches!(
            decide(tmp.path(), &Record::file(1, "a.txt", 5, T)),
            Decision::NeedsTransfer { snapshot: Some(_) }
        ));
    }

    #[test]
    fn test_existing_dir_not_checked_by_size() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("d");
        fs::create_dir(&dir).unwrap();
        set_mtime(&dir, Timestamp::new(T.secs + 10, 0));
        let mut record = Record::dir(1, "d", T);
        record.size = 12345;
        assert!(matches!(decide(tmp.path(), &record), Decision::Current));
    }

    #[test]
    fn test_missing_dir_and_symlink() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            decide(tmp.path(), &Record::dir(1, "d", T)),
            Decision::CreateDir
        ));
        let link = Record::symlink(2, "l", "a.txt", false, T);
        let decision = decide(tmp.path(), &link);
        assert!(matches!(decision, Decision::CreateSymlink));
        assert!(decision.needs_ack());
    }

    #[test]
    fn test_wrong_kind_is_stale() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("x")).unwrap();
        assert!(matches!(
            decide(tmp.path(), &Record::file(1, "x", 0, T)),
            Decision::NeedsTransfer { snapshot: Some(_) }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_with_other_target_is_stale() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("l");
        std::os::unix::fs::symlink("old.txt", &link).unwrap();
        filetime::set_symlink_file_times(&link, FileTime::from(T), FileTime::from(T)).unwrap();

        let same = Record::symlink(1, "l", "old.txt", false, T);
        assert!(matches!(decide(tmp.path(), &same), Decision::Current));
        let moved = Record::symlink(2, "l", "new.txt", false, T);
        assert!(matches!(decide(tmp.path(), &moved), Decision::CreateSymlink));
    }

    #[test]
    fn test_link_targets_are_not_interpreted() {
        let tmp = TempDir::new().unwrap();
        for target in ["/etc/hostname", "../../outside", "../sibling"] {
            let link = Record::symlink(1, "sub/l", target, false, T);
            assert!(
                matches!(decide(tmp.path(), &link), Decision::CreateSymlink),
                "{}",
                target
            );
        }
    }

    #[test]
    fn test_escaping_paths_are_unreachable() {
        let tmp = TempDir::new().unwrap();
        for bad in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            let decision = decide(tmp.path(), &Record::file(1, bad, 1, T));
            assert!(
                matches!(decision, Decision::Unreachable(SyncError::InvalidPath(_))),
                "{} should be rejected",
                bad
            );
        }
    }
}
