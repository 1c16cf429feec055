//! Transaction journal used to finish or undo an update interrupted by a
//! crash.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use refit_platform::{RootPaths, UpdateLock, write_atomic};
use serde::{Deserialize, Serialize};

use crate::backup::{BACKUP_METADATA_FILE, BackupHandle, BackupManager};
use crate::error::UpdateError;
use crate::lock::acquire_lock;
use crate::version::VersionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalPhase {
    /// Backup in progress; the root has not been touched.
    BackingUp,
    /// Files are being copied or verified.
    Applying,
    /// The new descriptor is being written.
    Committing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    pub target_version: String,
    pub phase: JournalPhase,
    #[serde(default)]
    pub backup: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

impl Journal {
    #[must_use]
    pub fn begin(target_version: &str) -> Self {
        Self {
            target_version: target_version.to_string(),
            phase: JournalPhase::BackingUp,
            backup: None,
            started_at: Utc::now(),
        }
    }

    /// # Errors
    /// Returns an error when the journal exists but cannot be read or parsed.
    pub fn read(root: &Path) -> Result<Option<Self>, UpdateError> {
        let path = RootPaths::new(root).journal_file();
        match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|error| UpdateError::Descriptor {
                    path,
                    details: error.to_string(),
                }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(UpdateError::io_with_path(
                "failed to read update journal",
                &path,
                &error,
            )),
        }
    }

    #[must_use]
    pub fn exists(root: &Path) -> bool {
        RootPaths::new(root).journal_file().is_file()
    }

    /// # Errors
    /// Returns an error when the atomic write fails.
    pub fn write(&self, root: &Path) -> Result<(), UpdateError> {
        let path = RootPaths::new(root).journal_file();
        let data = serde_json::to_vec_pretty(self).map_err(|error| UpdateError::Descriptor {
            path: path.clone(),
            details: error.to_string(),
        })?;
        write_atomic(&path, &data)
            .map_err(|error| UpdateError::io_with_path("failed to write update journal", &path, &error))
    }

    /// # Errors
    /// Returns an error when an existing journal cannot be removed.
    pub fn clear(root: &Path) -> Result<(), UpdateError> {
        let path = RootPaths::new(root).journal_file();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(UpdateError::io_with_path(
                "failed to remove update journal",
                &path,
                &error,
            )),
        }
    }

    /// Advance to `phase` and persist.
    ///
    /// # Errors
    /// Returns an error when the journal cannot be written.
    pub fn advance(&mut self, root: &Path, phase: JournalPhase) -> Result<(), UpdateError> {
        self.phase = phase;
        self.write(root)
    }
}

/// How a leftover journal was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// The interrupted run never touched the root.
    Discarded,
    /// The new version had been fully written; only the journal was left.
    Committed { version: String },
    /// The root was restored from the recorded backup.
    RolledBack { backup: PathBuf },
}

/// Resolve a journal left behind by an interrupted update. The caller must
/// hold the root's update lock.
///
/// # Errors
/// Returns [`UpdateError::RestoreFailure`] when a needed restore fails; the
/// journal is kept so the next run tries again.
pub fn recover(_lock: &UpdateLock, root: &Path) -> Result<Option<Recovery>, UpdateError> {
    let Some(journal) = Journal::read(root)? else {
        return Ok(None);
    };
    warn!(
        "Found interrupted update to {} in phase {:?} for {}",
        journal.target_version,
        journal.phase,
        root.display()
    );

    let recovery = match journal.phase {
        JournalPhase::BackingUp => {
            if let Some(backup) = &journal.backup
                && !backup.join(BACKUP_METADATA_FILE).is_file()
            {
                let _ = std::fs::remove_dir_all(backup);
            }
            Recovery::Discarded
        }
        JournalPhase::Committing
            if VersionStore::read(root)
                .ok()
                .flatten()
                .is_some_and(|descriptor| descriptor.version == journal.target_version) =>
        {
            Recovery::Committed {
                version: journal.target_version.clone(),
            }
        }
        JournalPhase::Applying | JournalPhase::Committing => {
            let backup_path = journal.backup.clone().ok_or_else(|| {
                UpdateError::restore(Path::new("<unknown>"), "journal does not name a backup")
            })?;
            let handle = BackupHandle::open(&backup_path)
                .map_err(|error| UpdateError::restore(&backup_path, error))?;
            if let Err(restore_error) = BackupManager::restore(&handle, root) {
                error!(
                    "FATAL: could not restore {} from {}: {restore_error}; manual intervention required",
                    root.display(),
                    backup_path.display()
                );
                return Err(restore_error);
            }
            Recovery::RolledBack {
                backup: backup_path,
            }
        }
    };

    Journal::clear(root)?;
    info!("Recovered interrupted update for {}: {recovery:?}", root.display());
    Ok(Some(recovery))
}

/// Restore `root` from its newest backup, under the update lock.
///
/// # Errors
/// Returns [`UpdateError::LockContention`] when an update is running,
/// [`UpdateError::BackupFailure`] when there is no backup to restore, and
/// [`UpdateError::RestoreFailure`] when the restore fails.
pub fn rollback_to_latest(root: &Path, lock_timeout: Duration) -> Result<BackupHandle, UpdateError> {
    let lock = acquire_lock(root, lock_timeout)?;
    let backups = BackupManager::list(root)?;
    let Some(latest) = backups.into_iter().next() else {
        return Err(UpdateError::backup(root, "no backups found"));
    };

    BackupManager::restore(&latest, root)?;
    Journal::clear(root)?;
    drop(lock);
    info!(
        "Rolled back {} to backup {}",
        root.display(),
        latest.path.display()
    );
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::{Journal, JournalPhase, Recovery, recover, rollback_to_latest};
    use crate::backup::BackupManager;
    use crate::lock::acquire_lock;
    use crate::version::{VersionDescriptor, VersionStore};

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().expect("file has a parent"))
            .expect("parent directories should be created");
        std::fs::write(path, contents).expect("file should be written");
    }

    fn installed_root(parent: &Path) -> std::path::PathBuf {
        let root = parent.join("app");
        write(&root, "bot.py", "v1");
        VersionStore::write(&root, &VersionDescriptor::new("1.0.0", ""))
            .expect("descriptor written");
        root
    }

    #[test]
    fn journal_round_trips_through_disk() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let mut journal = Journal::begin("1.1.0");
        journal.write(temp.path()).expect("journal written");
        journal
            .advance(temp.path(), JournalPhase::Applying)
            .expect("journal advanced");

        let loaded = Journal::read(temp.path())
            .expect("journal readable")
            .expect("journal present");
        assert_eq!(loaded.phase, JournalPhase::Applying);
        assert_eq!(loaded.target_version, "1.1.0");

        Journal::clear(temp.path()).expect("journal cleared");
        assert!(!Journal::exists(temp.path()));
        Journal::clear(temp.path()).expect("clearing twice is fine");
    }

    #[test]
    fn recover_without_journal_is_noop() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = installed_root(temp.path());
        let lock = acquire_lock(&root, Duration::from_millis(50)).expect("lock acquired");

        assert_eq!(recover(&lock, &root).expect("recovery runs"), None);
    }

    #[test]
    fn interrupted_apply_is_rolled_back() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = installed_root(temp.path());
        let backup = BackupManager::snapshot(&root).expect("snapshot succeeds");
        let mut journal = Journal::begin("1.1.0");
        journal.backup = Some(backup.path.clone());
        journal
            .advance(&root, JournalPhase::Applying)
            .expect("journal written");
        write(&root, "bot.py", "half-copied");
        write(&root, "added.py", "new");

        let lock = acquire_lock(&root, Duration::from_millis(50)).expect("lock acquired");
        let recovery = recover(&lock, &root).expect("recovery succeeds");

        assert_eq!(
            recovery,
            Some(Recovery::RolledBack {
                backup: backup.path.clone()
            })
        );
        assert_eq!(std::fs::read_to_string(root.join("bot.py")).expect("readable"), "v1");
        assert!(!root.join("added.py").exists());
        assert!(!Journal::exists(&root));
    }

    #[test]
    fn interrupted_commit_with_new_descriptor_is_kept() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = installed_root(temp.path());
        let backup = BackupManager::snapshot(&root).expect("snapshot succeeds");
        let mut journal = Journal::begin("1.1.0");
        journal.backup = Some(backup.path);
        journal
            .advance(&root, JournalPhase::Committing)
            .expect("journal written");
        write(&root, "bot.py", "v2");
        VersionStore::write(&root, &VersionDescriptor::new("1.1.0", ""))
            .expect("descriptor written");

        let lock = acquire_lock(&root, Duration::from_millis(50)).expect("lock acquired");
        let recovery = recover(&lock, &root).expect("recovery succeeds");

        assert_eq!(
            recovery,
            Some(Recovery::Committed {
                version: "1.1.0".to_string()
            })
        );
        assert_eq!(std::fs::read_to_string(root.join("bot.py")).expect("readable"), "v2");
    }

    #[test]
    fn interrupted_backup_is_discarded() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = installed_root(temp.path());
        let partial = temp.path().join("backup_20240101_000000");
        std::fs::create_dir(&partial).expect("partial backup dir created");
        let mut journal = Journal::begin("1.1.0");
        journal.backup = Some(partial.clone());
        journal.write(&root).expect("journal written");

        let lock = acquire_lock(&root, Duration::from_millis(50)).expect("lock acquired");
        let recovery = recover(&lock, &root).expect("recovery succeeds");

        assert_eq!(recovery, Some(Recovery::Discarded));
        assert!(!partial.exists());
        assert_eq!(std::fs::read_to_string(root.join("bot.py")).expect("readable"), "v1");
    }

    #[test]
    fn backup_cut_short_after_reservation_is_cleaned_up() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = installed_root(temp.path());
        let reserved = BackupManager::reserve(&root).expect("backup directory reserved");
        let mut journal = Journal::begin("1.1.0");
        journal.backup = Some(reserved.clone());
        journal.write(&root).expect("journal written");
        // the process dies halfway through the copy
        write(&reserved, "bot.py", "v1");

        let recorded = Journal::read(&root)
            .expect("journal readable")
            .expect("journal present");
        assert_eq!(recorded.phase, JournalPhase::BackingUp);
        assert_eq!(recorded.backup.as_deref(), Some(reserved.as_path()));

        let lock = acquire_lock(&root, Duration::from_millis(50)).expect("lock acquired");
        let recovery = recover(&lock, &root).expect("recovery succeeds");

        assert_eq!(recovery, Some(Recovery::Discarded));
        assert!(!reserved.exists(), "partial backup must not be left behind");
        assert!(BackupManager::list(&root).expect("backups listed").is_empty());
    }

    #[test]
    fn rollback_to_latest_restores_newest_backup() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = installed_root(temp.path());
        BackupManager::snapshot(&root).expect("first snapshot");
        write(&root, "bot.py", "v1.5");
        let newest = BackupManager::snapshot(&root).expect("second snapshot");
        write(&root, "bot.py", "broken");

        let restored =
            rollback_to_latest(&root, Duration::from_millis(50)).expect("rollback succeeds");

        assert_eq!(restored.path, newest.path);
        assert_eq!(std::fs::read_to_string(root.join("bot.py")).expect("readable"), "v1.5");
    }

    #[test]
    fn rollback_without_backups_fails() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = installed_root(temp.path());

        let result = rollback_to_latest(&root, Duration::from_millis(50));
        assert!(matches!(result, Err(crate::UpdateError::BackupFailure { .. })));
    }
}
