use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use refit_platform::{RootPaths, write_atomic};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::UpdateError;
use crate::manifest::{relative_path, sha256_file};

/// Metadata written at the top of every backup directory.
pub const BACKUP_METADATA_FILE: &str = ".refit-backup.json";

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const SPOT_CHECKS: usize = 8;

/// A verified, immutable pre-update copy of a root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHandle {
    pub path: PathBuf,
    pub timestamp: DateTime<Local>,
    pub source_root: PathBuf,
    pub file_count: u64,
    pub total_bytes: u64,
}

impl BackupHandle {
    /// Re-open a backup directory from its metadata file.
    ///
    /// # Errors
    /// Returns an error when the metadata is missing or unreadable.
    pub fn open(path: &Path) -> Result<Self, UpdateError> {
        let metadata_path = path.join(BACKUP_METADATA_FILE);
        let data = std::fs::read_to_string(&metadata_path).map_err(|error| {
            UpdateError::io_with_path("failed to read backup metadata", &metadata_path, &error)
        })?;
        let mut handle: Self = serde_json::from_str(&data)
            .map_err(|error| UpdateError::restore(path, format!("invalid backup metadata: {error}")))?;
        handle.path = path.to_path_buf();
        Ok(handle)
    }
}

#[derive(Default)]
struct CopyTotals {
    files: Vec<String>,
    bytes: u64,
}

pub struct BackupManager;

impl BackupManager {
    /// Copy the whole of `root` into a `backup_<YYYYMMDD_HHMMSS>` sibling and
    /// verify the copy. User-owned files are included; only the lock,
    /// journal and temp files are left out. The live tree is only read.
    ///
    /// # Errors
    /// Returns [`UpdateError::BackupFailure`] if copying or verification
    /// fails; a partial backup directory is removed.
    pub fn snapshot(root: &Path) -> Result<BackupHandle, UpdateError> {
        let backup_dir = Self::reserve(root)?;
        Self::snapshot_into(root, &backup_dir)
    }

    /// Create an empty, uniquely named backup directory for `root`, so it
    /// can be recorded before anything is copied into it.
    ///
    /// # Errors
    /// Returns [`UpdateError::BackupFailure`] when the directory cannot be
    /// created.
    pub fn reserve(root: &Path) -> Result<PathBuf, UpdateError> {
        let stamp = Local::now().format(STAMP_FORMAT).to_string();
        reserve_backup_dir(&RootPaths::new(root), &stamp)
            .map_err(|error| UpdateError::backup(root, format!("failed to create backup directory: {error}")))
    }

    /// Fill a directory returned by [`BackupManager::reserve`] and verify it.
    /// The metadata file is written last, so a directory without it is an
    /// incomplete backup.
    ///
    /// # Errors
    /// Returns [`UpdateError::BackupFailure`] if copying or verification
    /// fails; the directory is then removed.
    pub fn snapshot_into(root: &Path, backup_dir: &Path) -> Result<BackupHandle, UpdateError> {
        let timestamp = Local::now();
        info!(
            "Backing up {} to {}",
            root.display(),
            backup_dir.display()
        );

        let result = copy_tree(root, backup_dir)
            .map_err(|error| UpdateError::backup(root, error))
            .and_then(|totals| {
                verify_copy(root, backup_dir, &totals)?;
                Ok(totals)
            });

        let totals = match result {
            Ok(totals) => totals,
            Err(error) => {
                warn!("Discarding incomplete backup {}", backup_dir.display());
                let _ = std::fs::remove_dir_all(backup_dir);
                return Err(error);
            }
        };

        let handle = BackupHandle {
            path: backup_dir.to_path_buf(),
            timestamp,
            source_root: root.to_path_buf(),
            file_count: totals.files.len() as u64,
            total_bytes: totals.bytes,
        };
        let metadata = serde_json::to_vec_pretty(&handle).map_err(|error| UpdateError::backup(root, error))?;
        if let Err(error) = write_atomic(&backup_dir.join(BACKUP_METADATA_FILE), &metadata) {
            let _ = std::fs::remove_dir_all(backup_dir);
            return Err(UpdateError::backup(root, format!("failed to write backup metadata: {error}")));
        }

        info!(
            "Backup verified: {} files, {} bytes",
            handle.file_count, handle.total_bytes
        );
        Ok(handle)
    }

    /// Replace the contents of `root` with the backup. Backup directories,
    /// the lock and the journal inside `root` are left in place. Running it
    /// twice gives the same result.
    ///
    /// # Errors
    /// Returns [`UpdateError::RestoreFailure`] on any failure; the root may
    /// then be partially restored and needs manual repair.
    pub fn restore(handle: &BackupHandle, root: &Path) -> Result<(), UpdateError> {
        if !handle.path.join(BACKUP_METADATA_FILE).is_file() {
            return Err(UpdateError::restore(&handle.path, "backup directory is missing or incomplete"));
        }

        info!(
            "Restoring {} from {}",
            root.display(),
            handle.path.display()
        );
        clear_root(root).map_err(|error| UpdateError::restore(&handle.path, error))?;
        let totals = copy_tree(&handle.path, root).map_err(|error| UpdateError::restore(&handle.path, error))?;

        if totals.files.len() as u64 != handle.file_count || totals.bytes != handle.total_bytes {
            return Err(UpdateError::restore(
                &handle.path,
                format!(
                    "restored {} files / {} bytes, backup recorded {} / {}",
                    totals.files.len(),
                    totals.bytes,
                    handle.file_count,
                    handle.total_bytes
                ),
            ));
        }
        Ok(())
    }

    /// Backups taken of `root`, newest first.
    ///
    /// # Errors
    /// Returns an error when the parent directory cannot be listed.
    pub fn list(root: &Path) -> Result<Vec<BackupHandle>, UpdateError> {
        let parent = RootPaths::new(root).backup_parent();
        let wanted = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let entries = std::fs::read_dir(&parent)
            .map_err(|error| UpdateError::io_with_path("failed to list backups", &parent, &error))?;

        let mut handles: Vec<BackupHandle> = entries
            .filter_map(Result::ok)
            .filter(|entry| RootPaths::is_backup_dir_name(&entry.file_name().to_string_lossy()))
            .filter_map(|entry| BackupHandle::open(&entry.path()).ok())
            .filter(|handle| {
                std::fs::canonicalize(&handle.source_root)
                    .unwrap_or_else(|_| handle.source_root.clone())
                    == wanted
            })
            .collect();
        handles.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.path.cmp(&a.path)));
        Ok(handles)
    }
}

fn reserve_backup_dir(paths: &RootPaths, stamp: &str) -> std::io::Result<PathBuf> {
    let base = paths.backup_dir(stamp);
    for attempt in 1..100_u32 {
        let candidate = if attempt == 1 {
            base.clone()
        } else {
            PathBuf::from(format!("{}_{attempt}", base.display()))
        };
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "too many backups with the same timestamp",
    ))
}

/// Join a path produced by [`relative_path`] onto `base`.
fn below(base: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .fold(base.to_path_buf(), |path, part| path.join(part))
}

fn skip_in_copy(relative: &str) -> bool {
    relative == BACKUP_METADATA_FILE
        || RootPaths::is_transient_file(relative)
        || (!relative.contains('/') && RootPaths::is_backup_dir_name(relative))
}

fn copy_tree(from: &Path, to: &Path) -> Result<CopyTotals, String> {
    let mut totals = CopyTotals::default();
    let mut walker = WalkDir::new(from)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|error| error.to_string())?;
        let relative = relative_path(from, entry.path())
            .ok_or_else(|| format!("unsupported path {}", entry.path().display()))?;
        if skip_in_copy(&relative) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        let target = below(to, &relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|error| format!("{}: {error}", target.display()))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            let bytes = std::fs::copy(entry.path(), &target)
                .map_err(|error| format!("{} -> {}: {error}", entry.path().display(), target.display()))?;
            totals.bytes += bytes;
            totals.files.push(relative);
        }
    }
    Ok(totals)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<(), String> {
    let destination =
        std::fs::read_link(link).map_err(|error| format!("{}: {error}", link.display()))?;
    std::os::unix::fs::symlink(&destination, target)
        .map_err(|error| format!("{}: {error}", target.display()))
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, _target: &Path) -> Result<(), String> {
    warn!("Skipping symlink {} in backup", link.display());
    Ok(())
}

fn verify_copy(root: &Path, backup_dir: &Path, totals: &CopyTotals) -> Result<(), UpdateError> {
    let mut copied_bytes = 0_u64;
    for relative in &totals.files {
        let path = below(backup_dir, relative);
        let metadata = std::fs::metadata(&path)
            .map_err(|error| UpdateError::backup(root, format!("{}: {error}", path.display())))?;
        copied_bytes += metadata.len();
    }
    if copied_bytes != totals.bytes {
        return Err(UpdateError::backup(
            root,
            format!("byte count mismatch: copied {} of {} bytes", copied_bytes, totals.bytes),
        ));
    }

    for relative in spot_check_sample(&totals.files) {
        let original = sha256_file(&below(root, relative))
            .map_err(|error| UpdateError::backup(root, format!("{relative}: {error}")))?;
        let copy = sha256_file(&below(backup_dir, relative))
            .map_err(|error| UpdateError::backup(root, format!("{relative}: {error}")))?;
        if original != copy {
            return Err(UpdateError::backup(
                root,
                format!("spot check failed for {relative}"),
            ));
        }
        debug!("Spot check ok: {relative}");
    }
    Ok(())
}

/// Evenly spaced sample of at most `SPOT_CHECKS` paths, always including the
/// first and last file.
fn spot_check_sample(files: &[String]) -> Vec<&str> {
    if files.len() <= SPOT_CHECKS {
        return files.iter().map(String::as_str).collect();
    }
    let last = files.len() - 1;
    (0..SPOT_CHECKS)
        .map(|i| files[i * last / (SPOT_CHECKS - 1)].as_str())
        .collect()
}

fn clear_root(root: &Path) -> Result<(), String> {
    let entries = std::fs::read_dir(root).map_err(|error| format!("{}: {error}", root.display()))?;
    for entry in entries {
        let entry = entry.map_err(|error| error.to_string())?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if RootPaths::is_transient_file(&name) || RootPaths::is_backup_dir_name(&name) {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type().map_err(|error| format!("{}: {error}", path.display()))?;
        let removed = if file_type.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.map_err(|error| format!("failed to remove {}: {error}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{BackupHandle, BackupManager, spot_check_sample};
    use crate::exclusion::ExclusionRules;
    use crate::manifest::ManifestBuilder;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().expect("file has a parent"))
            .expect("parent directories should be created");
        std::fs::write(path, contents).expect("file should be written");
    }

    fn app_root(parent: &Path) -> std::path::PathBuf {
        let root = parent.join("app");
        write(&root, "bot.py", "v1");
        write(&root, "users.json", "{\"user\":\"local\"}");
        write(&root, "trained/button.png", "png-bytes");
        write(&root, "version.json", "{}");
        write(&root, ".update.lock", "123");
        root
    }

    #[test]
    fn snapshot_copies_everything_but_transient_files() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = app_root(temp.path());

        let handle = BackupManager::snapshot(&root).expect("snapshot succeeds");

        assert_eq!(handle.path.parent(), Some(temp.path()));
        let name = handle.path.file_name().expect("named").to_string_lossy().into_owned();
        assert!(name.starts_with("backup_") && name.len() >= "backup_YYYYMMDD_HHMMSS".len());
        assert_eq!(handle.file_count, 4);
        assert!(handle.path.join("users.json").is_file());
        assert!(handle.path.join("trained/button.png").is_file());
        assert!(handle.path.join("version.json").is_file());
        assert!(!handle.path.join(".update.lock").exists());
        assert_eq!(
            std::fs::read_to_string(root.join("bot.py")).expect("live tree untouched"),
            "v1"
        );
    }

    #[test]
    fn restore_round_trips_the_tree() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = app_root(temp.path());
        let rules = ExclusionRules::empty();
        let before = ManifestBuilder::build(&root, &rules).expect("manifest builds");

        let handle = BackupManager::snapshot(&root).expect("snapshot succeeds");
        write(&root, "bot.py", "v2-partially-applied");
        write(&root, "new_module.py", "added");
        std::fs::remove_file(root.join("users.json")).expect("file removed");

        BackupManager::restore(&handle, &root).expect("restore succeeds");
        let after = ManifestBuilder::build(&root, &rules).expect("manifest builds");

        assert!(after.same_contents(&before));
        assert!(root.join(".update.lock").exists());
    }

    #[test]
    fn restore_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = app_root(temp.path());
        let handle = BackupManager::snapshot(&root).expect("snapshot succeeds");
        write(&root, "bot.py", "broken");

        BackupManager::restore(&handle, &root).expect("first restore succeeds");
        BackupManager::restore(&handle, &root).expect("second restore succeeds");

        assert_eq!(
            std::fs::read_to_string(root.join("bot.py")).expect("restored"),
            "v1"
        );
    }

    #[test]
    fn restore_refuses_missing_backup() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = app_root(temp.path());
        let handle = BackupManager::snapshot(&root).expect("snapshot succeeds");
        std::fs::remove_dir_all(&handle.path).expect("backup removed");

        let result = BackupManager::restore(&handle, &root);

        assert!(matches!(result, Err(crate::UpdateError::RestoreFailure { .. })));
        assert!(root.join("bot.py").exists(), "root must not be cleared");
    }

    #[test]
    fn snapshots_in_the_same_second_get_distinct_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = app_root(temp.path());

        let first = BackupManager::snapshot(&root).expect("first snapshot");
        let second = BackupManager::snapshot(&root).expect("second snapshot");

        assert_ne!(first.path, second.path);
    }

    #[test]
    fn reserved_directory_is_empty_until_filled() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = app_root(temp.path());

        let reserved = BackupManager::reserve(&root).expect("directory reserved");
        assert!(reserved.is_dir());
        assert_eq!(std::fs::read_dir(&reserved).expect("readable").count(), 0);
        assert!(
            BackupManager::list(&root).expect("backups listed").is_empty(),
            "an unfilled directory is not a backup"
        );

        let handle = BackupManager::snapshot_into(&root, &reserved).expect("snapshot succeeds");

        assert_eq!(handle.path, reserved);
        assert_eq!(BackupManager::list(&root).expect("backups listed").len(), 1);
    }

    #[test]
    fn list_returns_backups_of_this_root_newest_first() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let root = app_root(temp.path());
        let other = temp.path().join("other");
        write(&other, "x.txt", "x");

        let first = BackupManager::snapshot(&root).expect("first snapshot");
        let second = BackupManager::snapshot(&root).expect("second snapshot");
        BackupManager::snapshot(&other).expect("other snapshot");

        let listed = BackupManager::list(&root).expect("backups listed");

        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, second.path);
        assert_eq!(listed[1].path, first.path);
        assert_eq!(
            BackupHandle::open(&first.path).expect("metadata readable"),
            first
        );
    }

    #[test]
    fn spot_check_sample_is_bounded_and_includes_ends() {
        let files: Vec<String> = (0..100).map(|i| format!("f{i:03}")).collect();
        let sample = spot_check_sample(&files);
        assert_eq!(sample.len(), 8);
        assert_eq!(sample.first(), Some(&"f000"));
        assert_eq!(sample.last(), Some(&"f099"));

        let few: Vec<String> = vec!["a".to_string(), "b".to_string()];
        assert_eq!(spot_check_sample(&few), vec!["a", "b"]);
    }
}
