//! The update transaction as an explicit state machine:
//! `Idle -> Checking -> Diffing -> BackingUp -> Applying -> Verifying ->
//! Committed`, with `Error` reachable from every working state and
//! `RolledBack` only from `Error` after a successful restore.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use refit_platform::{RootPaths, UpdateLock};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::backup::{BackupHandle, BackupManager};
use crate::diff::{DiffResult, ManifestDiffer};
use crate::error::UpdateError;
use crate::exclusion::ExclusionRules;
use crate::fs_ops::{FileOps, StdFileOps};
use crate::journal::{Journal, JournalPhase};
use crate::manifest::{Manifest, ManifestBuilder, join_relative, sha256_file};
use crate::version::{VersionDescriptor, VersionOrdering, VersionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Checking,
    Diffing,
    BackingUp,
    Applying,
    Verifying,
    Committed,
    Error,
    RolledBack,
}

impl UpdateState {
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use UpdateState::{
            Applying, BackingUp, Checking, Committed, Diffing, Error, Idle, RolledBack, Verifying,
        };
        matches!(
            (self, next),
            (Idle, Checking)
                | (Checking | Diffing, Idle)
                | (Checking, Diffing)
                | (Diffing, BackingUp)
                | (BackingUp, Applying)
                | (Applying, Verifying)
                | (Verifying, Committed)
                | (Checking | Diffing | BackingUp | Applying | Verifying, Error)
                | (Error, RolledBack)
        )
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Diffing => "diffing",
            Self::BackingUp => "backing up",
            Self::Applying => "applying",
            Self::Verifying => "verifying",
            Self::Committed => "committed",
            Self::Error => "error",
            Self::RolledBack => "rolled back",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateProgress {
    State(UpdateState),
    FileCopied {
        path: String,
        done: usize,
        total: usize,
    },
    OrphanKept {
        path: String,
    },
    OrphanRemoved {
        path: String,
    },
}

#[derive(Debug)]
pub enum ApplyOutcome {
    /// The source is not newer; nothing happened.
    NotNewer,
    /// Cancelled before the backup started; nothing was written.
    Cancelled,
    /// Failed before the backup existed; the root is untouched.
    Aborted(UpdateError),
    Committed {
        version: String,
        diff: DiffResult,
        backup: BackupHandle,
    },
    RolledBack {
        error: UpdateError,
        backup: PathBuf,
    },
    /// The automatic restore failed. The root needs manual repair.
    Fatal {
        error: UpdateError,
        restore_error: UpdateError,
        backup: PathBuf,
    },
}

pub struct UpdateApplier {
    root: PathBuf,
    source: PathBuf,
    rules: ExclusionRules,
    remove_orphans: bool,
    use_manifest_cache: bool,
    file_ops: Arc<dyn FileOps>,
    progress: Option<Sender<UpdateProgress>>,
    cancel: CancellationToken,
    state: UpdateState,
    history: Vec<UpdateState>,
}

impl UpdateApplier {
    pub fn new(root: impl Into<PathBuf>, source: impl Into<PathBuf>, rules: ExclusionRules) -> Self {
        Self {
            root: root.into(),
            source: source.into(),
            rules,
            remove_orphans: false,
            use_manifest_cache: true,
            file_ops: Arc::new(StdFileOps),
            progress: None,
            cancel: CancellationToken::new(),
            state: UpdateState::Idle,
            history: vec![UpdateState::Idle],
        }
    }

    #[must_use]
    pub fn remove_orphans(mut self, enabled: bool) -> Self {
        self.remove_orphans = enabled;
        self
    }

    #[must_use]
    pub fn use_manifest_cache(mut self, enabled: bool) -> Self {
        self.use_manifest_cache = enabled;
        self
    }

    #[must_use]
    pub fn with_file_ops(mut self, file_ops: Arc<dyn FileOps>) -> Self {
        self.file_ops = file_ops;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Sender<UpdateProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Every state visited by the last run, starting with `Idle`.
    #[must_use]
    pub fn history(&self) -> &[UpdateState] {
        &self.history
    }

    /// Run one transaction from `installed` to `remote`. Holding `lock`
    /// is required; every mutating phase runs while it is held.
    pub fn run(
        &mut self,
        _lock: &UpdateLock,
        installed: Option<&VersionDescriptor>,
        remote: &VersionDescriptor,
    ) -> ApplyOutcome {
        self.state = UpdateState::Idle;
        self.history = vec![UpdateState::Idle];

        let installed_version = installed.map_or("0.0.0", |descriptor| descriptor.version.as_str());
        match VersionStore::compare(&remote.version, installed_version) {
            Ok(VersionOrdering::Newer) => {}
            Ok(ordering) => {
                debug!(
                    "Source version {} is {ordering:?} relative to installed {installed_version}",
                    remote.version
                );
                return ApplyOutcome::NotNewer;
            }
            Err(error) => {
                warn!("Not updating {}: {error}", self.root.display());
                return ApplyOutcome::NotNewer;
            }
        }

        self.transition(UpdateState::Checking);
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }
        let source_manifest = match self.source_manifest() {
            Ok(manifest) => manifest,
            Err(error) => return self.abort(error),
        };

        self.transition(UpdateState::Diffing);
        let dest_manifest = match ManifestBuilder::build(&self.root, &self.rules) {
            Ok(manifest) => manifest,
            Err(error) => return self.abort(error),
        };
        let diff = ManifestDiffer::diff(&source_manifest, &dest_manifest, &self.rules);
        info!(
            "Update {} -> {}: {} to add, {} to update, {} orphaned, {} user-owned skipped",
            installed_version,
            remote.version,
            diff.to_add.len(),
            diff.to_update.len(),
            diff.to_remove.len(),
            diff.skipped.len()
        );
        for path in &diff.skipped {
            debug!("Leaving user-owned file alone: {path}");
        }
        let blockers = ManifestDiffer::blockers(&diff, &dest_manifest);
        if let Err(error) = self.check_blockers(&diff, &blockers) {
            return self.abort(error);
        }
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }

        // Past this point cancellation is refused.
        self.transition(UpdateState::BackingUp);
        let backup_dir = match BackupManager::reserve(&self.root) {
            Ok(dir) => dir,
            Err(error) => return self.abort_without_backup(error),
        };
        let mut journal = Journal::begin(&remote.version);
        journal.backup = Some(backup_dir.clone());
        if let Err(error) = journal.write(&self.root) {
            let _ = std::fs::remove_dir_all(&backup_dir);
            return self.abort_without_backup(error);
        }
        let backup = match BackupManager::snapshot_into(&self.root, &backup_dir) {
            Ok(backup) => backup,
            Err(error) => return self.abort_without_backup(error),
        };
        if let Err(error) = journal.advance(&self.root, JournalPhase::Applying) {
            return self.fail_after_backup(error, &backup);
        }

        self.transition(UpdateState::Applying);
        if self.cancel.is_cancelled() {
            warn!("{}", UpdateError::CancellationRefused);
        }
        if let Err(error) = self.apply(&diff, &blockers) {
            return self.fail_after_backup(error, &backup);
        }

        self.transition(UpdateState::Verifying);
        if let Err(error) = self.verify(&diff, &source_manifest) {
            return self.fail_after_backup(error, &backup);
        }

        if let Err(error) = journal.advance(&self.root, JournalPhase::Committing) {
            return self.fail_after_backup(error, &backup);
        }
        if let Err(error) = VersionStore::write(&self.root, remote) {
            return self.fail_after_backup(error, &backup);
        }
        if let Err(error) = Journal::clear(&self.root) {
            // recovery sees a Committing journal with a matching descriptor
            warn!("Update committed but journal cleanup failed: {error}");
        }

        self.transition(UpdateState::Committed);
        info!(
            "Updated {} to {}",
            self.root.display(),
            remote.version
        );
        ApplyOutcome::Committed {
            version: remote.version.clone(),
            diff,
            backup,
        }
    }

    fn source_manifest(&self) -> Result<Manifest, UpdateError> {
        if !self.source.is_dir() {
            return Err(UpdateError::SourceUnreachable {
                path: self.source.clone(),
                details: "source directory is missing".to_string(),
            });
        }

        let cache_path = RootPaths::new(&self.source).manifest_cache_file();
        if self.use_manifest_cache && cache_path.is_file() {
            // a published cache that cannot be trusted fails the run
            let manifest = Manifest::load_cache(&cache_path)?;
            debug!("Using cached source manifest {}", cache_path.display());
            return Ok(manifest);
        }
        ManifestBuilder::build(&self.source, &self.rules)
    }

    /// Blockers can only be cleared by removing orphans; anything else in
    /// the way fails the run before a backup is taken.
    fn check_blockers(&self, diff: &DiffResult, blockers: &[String]) -> Result<(), UpdateError> {
        for blocker in blockers {
            let details = if diff.to_remove.binary_search(blocker).is_err() {
                "a user-owned path is in the way"
            } else if !self.remove_orphans {
                "an orphaned path is in the way and orphan removal is off"
            } else {
                continue;
            };
            warn!("Cannot apply update: {blocker}: {details}");
            return Err(UpdateError::PathConflict {
                path: blocker.clone(),
                details: details.to_string(),
            });
        }
        Ok(())
    }

    fn apply(&self, diff: &DiffResult, blockers: &[String]) -> Result<(), UpdateError> {
        for path in blockers {
            self.remove_orphan(path)?;
        }
        for path in diff.to_copy() {
            let dst = self.resolve(&self.root, path)?;
            if dst.is_dir() {
                remove_empty_dirs(&dst).map_err(|source| UpdateError::RemoveFailure {
                    path: path.to_string(),
                    source,
                })?;
            }
        }

        let total = diff.to_add.len() + diff.to_update.len();
        for (index, path) in diff.to_copy().enumerate() {
            let src = self.resolve(&self.source, path)?;
            let dst = self.resolve(&self.root, path)?;
            self.file_ops
                .copy_file(&src, &dst)
                .map_err(|source| UpdateError::CopyFailure {
                    path: path.to_string(),
                    source,
                })?;
            self.emit(UpdateProgress::FileCopied {
                path: path.to_string(),
                done: index + 1,
                total,
            });
        }

        for path in &diff.to_remove {
            if blockers.binary_search(path).is_ok() {
                continue;
            }
            if self.remove_orphans {
                self.remove_orphan(path)?;
            } else {
                info!("Leaving orphan {path} in place");
                self.emit(UpdateProgress::OrphanKept { path: path.clone() });
            }
        }
        Ok(())
    }

    fn remove_orphan(&self, path: &str) -> Result<(), UpdateError> {
        self.file_ops
            .remove_file(&self.resolve(&self.root, path)?)
            .map_err(|source| UpdateError::RemoveFailure {
                path: path.to_string(),
                source,
            })?;
        info!("Removed orphan {path}");
        self.emit(UpdateProgress::OrphanRemoved {
            path: path.to_string(),
        });
        Ok(())
    }

    fn resolve(&self, base: &Path, path: &str) -> Result<PathBuf, UpdateError> {
        join_relative(base, path)
            .ok_or_else(|| UpdateError::manifest(base, format!("unsafe path {path:?}")))
    }

    fn verify(&self, diff: &DiffResult, source_manifest: &Manifest) -> Result<(), UpdateError> {
        for path in diff.to_copy() {
            let expected = source_manifest
                .get(path)
                .map(|entry| entry.hash.as_str())
                .unwrap_or_default();
            let actual = sha256_file(&self.resolve(&self.root, path)?).map_err(|error| {
                UpdateError::io_with_path("failed to re-hash copied file", Path::new(path), &error)
            })?;
            if actual != expected {
                return Err(UpdateError::HashMismatchAfterCopy {
                    path: path.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        debug!("Verified {} copied files", diff.to_add.len() + diff.to_update.len());
        Ok(())
    }

    fn fail_after_backup(&mut self, error: UpdateError, backup: &BackupHandle) -> ApplyOutcome {
        warn!(
            "Update of {} failed while {}: {error}; rolling back",
            self.root.display(),
            self.state
        );
        self.transition(UpdateState::Error);

        match BackupManager::restore(backup, &self.root) {
            Ok(()) => {
                if let Err(clear_error) = Journal::clear(&self.root) {
                    warn!("Rolled back but journal cleanup failed: {clear_error}");
                }
                self.transition(UpdateState::RolledBack);
                warn!(
                    "Rolled back {} from {}",
                    self.root.display(),
                    backup.path.display()
                );
                ApplyOutcome::RolledBack {
                    error,
                    backup: backup.path.clone(),
                }
            }
            Err(restore_error) => {
                error!(
                    "FATAL: restore of {} from {} failed: {restore_error}; manual intervention required",
                    self.root.display(),
                    backup.path.display()
                );
                ApplyOutcome::Fatal {
                    error,
                    restore_error,
                    backup: backup.path.clone(),
                }
            }
        }
    }

    fn abort_without_backup(&mut self, error: UpdateError) -> ApplyOutcome {
        error!("Refusing to apply update without a verified backup: {error}");
        let _ = Journal::clear(&self.root);
        self.transition(UpdateState::Error);
        ApplyOutcome::Aborted(error)
    }

    fn abort(&mut self, error: UpdateError) -> ApplyOutcome {
        debug!("Update aborted before any change: {error}");
        self.transition(UpdateState::Error);
        ApplyOutcome::Aborted(error)
    }

    fn cancelled(&mut self) -> ApplyOutcome {
        info!("{}: {}", self.root.display(), UpdateError::Cancelled);
        self.transition(UpdateState::Idle);
        ApplyOutcome::Cancelled
    }

    fn transition(&mut self, next: UpdateState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid update transition {} -> {next}",
            self.state
        );
        debug!("Update state: {} -> {next}", self.state);
        self.state = next;
        self.history.push(next);
        self.emit(UpdateProgress::State(next));
    }

    fn emit(&self, event: UpdateProgress) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event);
        }
    }
}

/// Remove the directory tree at `dir` bottom-up. Fails if anything other
/// than directories is left in it.
fn remove_empty_dirs(dir: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(dir).contents_first(true) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            std::fs::remove_dir(entry.path())?;
        }
    }
    Ok(())
}
