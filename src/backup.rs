//! Mirror of the installation taken before an update, replayed on failure.

use filetime::FileTime;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{CtlError, Result};
use crate::package;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

impl EntryKind {
    fn of(meta: &Metadata) -> Self {
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_dir() {
            Self::Dir
        } else {
            Self::File
        }
    }
}

/// Metadata of one entry as it was before the update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub relative: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: FileTime,
}

impl BackupRecord {
    fn matches(&self, meta: &Metadata) -> bool {
        self.size == meta.len()
            && self.mode == mode_bits(meta)
            && self.mtime == FileTime::from_last_modification_time(meta)
    }
}

#[cfg(unix)]
fn mode_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_bits(meta: &Metadata) -> u32 {
    u32::from(meta.permissions().readonly())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub restored: Vec<PathBuf>,
    pub skipped: usize,
    /// Entries that could not be reconciled; the rest were still attempted.
    pub failures: Vec<String>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug)]
pub struct Backup {
    root: PathBuf,
    backup_root: PathBuf,
    records: Vec<BackupRecord>,
}

impl Backup {
    /// Copies every entry under `root` into `backup_root`, replacing any
    /// previous mirror. `backup_root` and the `skip` subtrees are left out.
    pub fn create(root: &Path, backup_root: &Path, skip: &[PathBuf]) -> Result<Self> {
        if backup_root.exists() {
            fs::remove_dir_all(backup_root)?;
        }
        fs::create_dir_all(backup_root)?;

        let mut records = Vec::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                e.path() != backup_root && !skip.iter().any(|s| e.path() == s.as_path())
            });
        for entry in walker {
            let entry = entry.map_err(|e| CtlError::Io(e.into()))?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| CtlError::Other(e.to_string()))?
                .to_path_buf();
            let meta = fs::symlink_metadata(entry.path())?;
            let kind = EntryKind::of(&meta);
            let mirror = backup_root.join(&relative);

            match kind {
                EntryKind::Dir => fs::create_dir_all(&mirror)?,
                EntryKind::File | EntryKind::Symlink => {
                    package::copy_tree_entry(entry.path(), &mirror, kind == EntryKind::Symlink)?
                }
            }
            records.push(BackupRecord {
                relative,
                kind,
                size: meta.len(),
                mode: mode_bits(&meta),
                mtime: FileTime::from_last_modification_time(&meta),
            });
        }

        tracing::info!(entries = records.len(), backup = %backup_root.display(), "Backed up installation");
        Ok(Self {
            root: root.to_path_buf(),
            backup_root: backup_root.to_path_buf(),
            records,
        })
    }

    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Best-effort restore of every entry that changed since the backup.
    /// Unchanged entries are left alone, which also avoids touching files a
    /// running process holds open.
    pub fn rollback(&self) -> RollbackReport {
        let mut report = RollbackReport::default();
        for record in &self.records {
            let from = self.backup_root.join(&record.relative);
            let to = self.root.join(&record.relative);
            let live = fs::symlink_metadata(&to).ok();

            if live.as_ref().is_some_and(|meta| {
                EntryKind::of(meta) == record.kind && record.matches(meta)
            }) {
                report.skipped += 1;
                continue;
            }

            let live_kind = live.as_ref().map(EntryKind::of);
            let outcome = match (record.kind, live_kind) {
                (EntryKind::File, None | Some(EntryKind::File)) => {
                    package::copy_file(&from, &to)
                }
                (EntryKind::Symlink, None | Some(EntryKind::Symlink)) => {
                    package::copy_tree_entry(&from, &to, true)
                }
                // Directory contents are reconciled entry by entry; entries
                // the failed update added are not removed.
                (EntryKind::Dir, Some(EntryKind::Dir)) => {
                    report.skipped += 1;
                    continue;
                }
                (EntryKind::Dir, None) => fs::create_dir_all(&to).map_err(CtlError::from),
                _ => Err(CtlError::UpdateFailed(format!(
                    "Rollback failed. We cannot rollback {} to {}",
                    from.display(),
                    to.display()
                ))),
            };

            match outcome {
                Ok(()) => {
                    tracing::debug!(path = %record.relative.display(), "Restored");
                    report.restored.push(record.relative.clone());
                }
                Err(e) => {
                    tracing::error!(path = %record.relative.display(), error = %e, "Rollback failure");
                    report.failures.push(e.to_string());
                }
            }
        }
        report
    }

    /// Drops the on-disk mirror once the update went through.
    pub fn discard(self) -> Result<()> {
        if self.backup_root.exists() {
            fs::remove_dir_all(&self.backup_root)?;
        }
        Ok(())
    }
}
