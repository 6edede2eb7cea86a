//! Source tree scanner.
//!
//! Walks the sync root and turns every entry below it into a [`Record`].
//! Ignore files are not honored and hidden entries are included: the
//! receiver should end up with exactly what the sender has.

use crate::error::{Result, SyncError};
use crate::streaming::inventory::IdAllocator;
use crate::streaming::protocol::{Record, Timestamp};
use ignore::WalkBuilder;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Totals for one scan
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    /// Entries that could not be read or named
    pub skipped: u64,
    /// Sum of file sizes
    pub bytes: u64,
}

impl ScanSummary {
    pub fn records(&self) -> u64 {
        self.files + self.dirs + self.symlinks
    }
}

pub struct Scanner {
    root: PathBuf,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the tree, handing each record to `emit` in walk order (parents
    /// before children). Returns early with the first error from `emit`.
    pub fn scan<F>(&self, ids: &IdAllocator, mut emit: F) -> Result<ScanSummary>
    where
        F: FnMut(Record) -> Result<()>,
    {
        let root_meta =
            fs::metadata(&self.root).map_err(|e| SyncError::io_path(&self.root, e))?;
        if !root_meta.is_dir() {
            return Err(SyncError::InvalidPath(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .build();

        let mut summary = ScanSummary::default();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Scan error: {}", e);
                    summary.skipped += 1;
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            let path = entry.path();
            let Some(relative) = relative_name(&self.root, path) else {
                tracing::warn!("Skipping {}: not representable as UTF-8", path.display());
                summary.skipped += 1;
                continue;
            };
            let meta = match fs::symlink_metadata(path) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", path.display(), e);
                    summary.skipped += 1;
                    continue;
                }
            };
            let mtime = Timestamp::from_metadata(&meta);
            let file_type = meta.file_type();

            let record = if file_type.is_symlink() {
                let target = match fs::read_link(path) {
                    Ok(target) => target,
                    Err(e) => {
                        tracing::warn!("Skipping symlink {}: {}", path.display(), e);
                        summary.skipped += 1;
                        continue;
                    }
                };
                let Some(target) = target.to_str().map(str::to_string) else {
                    tracing::warn!("Skipping symlink {}: target is not UTF-8", path.display());
                    summary.skipped += 1;
                    continue;
                };
                // Dangling links are treated as file links.
                let to_dir = fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false);
                summary.symlinks += 1;
                Record::symlink(ids.next_id(), relative, target, to_dir, mtime)
            } else if file_type.is_dir() {
                summary.dirs += 1;
                Record::dir(ids.next_id(), relative, mtime)
            } else if file_type.is_file() {
                summary.files += 1;
                summary.bytes += meta.len();
                Record::file(ids.next_id(), relative, meta.len(), mtime)
            } else {
                tracing::debug!("Skipping special file {}", path.display());
                summary.skipped += 1;
                continue;
            };
            emit(record)?;
        }

        tracing::info!(
            "Scanned {}: {} files ({} bytes), {} dirs, {} symlinks",
            self.root.display(),
            summary.files,
            summary.bytes,
            summary.dirs,
            summary.symlinks
        );
        Ok(summary)
    }
}

/// `root/a/b.txt` -> `"a/b.txt"` regardless of platform separator.
fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
