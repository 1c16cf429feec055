//! Entry point called by a host application at startup or on a timer.
//!
//! Reading the source descriptor is bounded by the policy's check timeout so
//! an unmounted share never stalls the host. Mutating phases run on a
//! blocking thread while the root's update lock is held. No error escapes:
//! every result is an [`UpdateOutcome`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::applier::{ApplyOutcome, UpdateApplier, UpdateProgress};
use crate::error::UpdateError;
use crate::exclusion::ExclusionRules;
use crate::fs_ops::{FileOps, StdFileOps};
use crate::journal::{Journal, Recovery, recover};
use crate::lock::acquire_lock;
use crate::policy::{InstallMode, UpdatePolicy};
use crate::version::{VersionDescriptor, VersionStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableUpdate {
    pub installed: Option<VersionDescriptor>,
    pub available: VersionDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    NoUpdate,
    /// Another run holds the root's update lock.
    Busy,
    /// A newer version exists but the policy only reports it.
    Available(AvailableUpdate),
    Declined,
    Cancelled,
    /// The new version is in place; the host must restart itself to load it.
    Applied { version: String },
    RolledBack { reason: String, backup: PathBuf },
    Failed { reason: String },
    /// The root could not be restored and needs manual repair.
    Fatal { reason: String, backup: PathBuf },
}

impl UpdateOutcome {
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl std::fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoUpdate => write!(f, "no update available"),
            Self::Busy => write!(f, "another update is in progress"),
            Self::Available(update) => write!(
                f,
                "version {} is available (installed: {})",
                update.available.version,
                update
                    .installed
                    .as_ref()
                    .map_or("none", |descriptor| descriptor.version.as_str())
            ),
            Self::Declined => write!(f, "update declined"),
            Self::Cancelled => write!(f, "update cancelled"),
            Self::Applied { version } => write!(f, "updated to {version}; restart required"),
            Self::RolledBack { reason, backup } => {
                write!(f, "update failed and was rolled back from {}: {reason}", backup.display())
            }
            Self::Failed { reason } => write!(f, "update failed: {reason}"),
            Self::Fatal { reason, backup } => write!(
                f,
                "FATAL: update failed and could not be rolled back ({reason}); restore manually from {}",
                backup.display()
            ),
        }
    }
}

type PromptFn = dyn Fn(&AvailableUpdate) -> bool + Send + Sync;

pub struct UpdateChecker {
    policy: UpdatePolicy,
    prompt: Option<Arc<PromptFn>>,
    file_ops: Arc<dyn FileOps>,
    progress: Option<Sender<UpdateProgress>>,
    cancel: CancellationToken,
}

impl UpdateChecker {
    #[must_use]
    pub fn new(policy: UpdatePolicy) -> Self {
        Self {
            policy,
            prompt: None,
            file_ops: Arc::new(StdFileOps),
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Callback consulted under [`InstallMode::Prompt`]. Without one, prompted
    /// updates are declined.
    #[must_use]
    pub fn with_prompt<F>(mut self, prompt: F) -> Self
    where
        F: Fn(&AvailableUpdate) -> bool + Send + Sync + 'static,
    {
        self.prompt = Some(Arc::new(prompt));
        self
    }

    /// The prompt may block on a terminal, so it runs off the async workers.
    async fn ask(&self, update: &AvailableUpdate) -> bool {
        let Some(prompt) = self.prompt.clone() else {
            return false;
        };
        let update = update.clone();
        match tokio::task::spawn_blocking(move || prompt(&update)).await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!("Update prompt failed: {error}");
                false
            }
        }
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
    pub fn policy(&self) -> &UpdatePolicy {
        &self.policy
    }

    /// Look for a newer version without touching the root.
    ///
    /// # Errors
    /// Returns [`UpdateError::SourceUnreachable`] when the source cannot be
    /// read within the check timeout, or an error reading either descriptor.
    pub async fn check(&self, root: &Path, source: &Path) -> Result<Option<AvailableUpdate>, UpdateError> {
        let remote = read_remote(source, &self.policy).await?;
        let installed = read_blocking(root.to_path_buf(), VersionStore::read).await?;

        let installed_version = installed
            .as_ref()
            .map_or("0.0.0", |descriptor| descriptor.version.as_str());
        if VersionStore::is_newer(&remote.version, installed_version) {
            info!(
                "Update available for {}: {} -> {}",
                root.display(),
                installed_version,
                remote.version
            );
            Ok(Some(AvailableUpdate {
                installed,
                available: remote,
            }))
        } else {
            debug!("{} is up to date at {installed_version}", root.display());
            Ok(None)
        }
    }

    /// Check `source` for a newer version and, per policy, apply it to
    /// `root`.
    pub async fn check_and_apply(&self, root: &Path, source: &Path) -> UpdateOutcome {
        if Journal::exists(root)
            && let Some(outcome) = self.recover_interrupted(root).await
        {
            return outcome;
        }

        let update = match self.check(root, source).await {
            Ok(Some(update)) => update,
            Ok(None) => return UpdateOutcome::NoUpdate,
            Err(error @ UpdateError::SourceUnreachable { .. }) => {
                debug!("Skipping update check: {error}");
                return UpdateOutcome::NoUpdate;
            }
            Err(error) => {
                warn!("Skipping update check: {error}");
                return UpdateOutcome::NoUpdate;
            }
        };

        match self.policy.install {
            InstallMode::NotifyOnly => return UpdateOutcome::Available(update),
            InstallMode::Prompt => {
                if !self.ask(&update).await {
                    info!("Update to {} declined", update.available.version);
                    return UpdateOutcome::Declined;
                }
            }
            InstallMode::Automatic => {}
        }
        if self.cancel.is_cancelled() {
            return UpdateOutcome::Cancelled;
        }

        let root = root.to_path_buf();
        let source = source.to_path_buf();
        let policy = self.policy.clone();
        let file_ops = Arc::clone(&self.file_ops);
        let progress = self.progress.clone();
        let cancel = self.cancel.clone();
        let remote = update.available;

        let joined = tokio::task::spawn_blocking(move || {
            apply_locked(&root, &source, &policy, file_ops, progress, cancel, &remote)
        })
        .await;
        joined.unwrap_or_else(|error| UpdateOutcome::Failed {
            reason: format!("update task failed: {error}"),
        })
    }

    async fn recover_interrupted(&self, root: &Path) -> Option<UpdateOutcome> {
        let root = root.to_path_buf();
        let lock_timeout = self.policy.lock_timeout();
        let joined = tokio::task::spawn_blocking(move || {
            let lock = acquire_lock(&root, lock_timeout)?;
            recover(&lock, &root)
        })
        .await;

        match joined {
            Ok(Ok(Some(Recovery::RolledBack { backup }))) => {
                warn!("Rolled back an interrupted update from {}", backup.display());
                None
            }
            Ok(Ok(_)) => None,
            Ok(Err(error)) => Some(recovery_failure(error)),
            Err(error) => Some(UpdateOutcome::Failed {
                reason: format!("recovery task failed: {error}"),
            }),
        }
    }
}

/// Check and apply with the given policy and no prompt handler.
pub async fn check_and_apply(root: &Path, source: &Path, policy: UpdatePolicy) -> UpdateOutcome {
    UpdateChecker::new(policy).check_and_apply(root, source).await
}

fn recovery_failure(error: UpdateError) -> UpdateOutcome {
    match error {
        UpdateError::LockContention { .. } => UpdateOutcome::Busy,
        UpdateError::RestoreFailure { backup, details } => UpdateOutcome::Fatal {
            reason: format!("could not roll back interrupted update: {details}"),
            backup,
        },
        error => UpdateOutcome::Failed {
            reason: format!("could not resolve interrupted update: {error}"),
        },
    }
}

async fn read_remote(source: &Path, policy: &UpdatePolicy) -> Result<VersionDescriptor, UpdateError> {
    let unreachable = |details: String| UpdateError::SourceUnreachable {
        path: source.to_path_buf(),
        details,
    };

    let owned = source.to_path_buf();
    let read = tokio::task::spawn_blocking(move || {
        if !owned.is_dir() {
            return Err(UpdateError::SourceUnreachable {
                path: owned,
                details: "not a directory".to_string(),
            });
        }
        VersionStore::read(&owned)
    });

    match tokio::time::timeout(policy.check_timeout(), read).await {
        Ok(Ok(Ok(Some(descriptor)))) => Ok(descriptor),
        Ok(Ok(Ok(None))) => Err(unreachable("no version descriptor".to_string())),
        Ok(Ok(Err(error))) => Err(error),
        Ok(Err(error)) => Err(unreachable(format!("read task failed: {error}"))),
        Err(_) => Err(unreachable(format!(
            "no response within {} ms",
            policy.check_timeout_ms
        ))),
    }
}

async fn read_blocking<T, F>(path: PathBuf, read: F) -> Result<T, UpdateError>
where
    T: Send + 'static,
    F: FnOnce(&Path) -> Result<T, UpdateError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || read(&path))
        .await
        .map_err(|error| UpdateError::io("blocking read task failed", std::io::Error::other(error)))?
}

fn apply_locked(
    root: &Path,
    source: &Path,
    policy: &UpdatePolicy,
    file_ops: Arc<dyn FileOps>,
    progress: Option<Sender<UpdateProgress>>,
    cancel: CancellationToken,
    remote: &VersionDescriptor,
) -> UpdateOutcome {
    let lock = match acquire_lock(root, policy.lock_timeout()) {
        Ok(lock) => lock,
        Err(UpdateError::LockContention { .. }) => {
            info!("Update of {} already in progress elsewhere", root.display());
            return UpdateOutcome::Busy;
        }
        Err(error) => {
            return UpdateOutcome::Failed {
                reason: error.to_string(),
            };
        }
    };

    if let Err(error) = recover(&lock, root) {
        return recovery_failure(error);
    }

    // another process may have finished this update while we waited
    let installed = match VersionStore::read(root) {
        Ok(installed) => installed,
        Err(error) => {
            warn!("Cannot read installed version of {}: {error}", root.display());
            return UpdateOutcome::NoUpdate;
        }
    };

    let rules = match ExclusionRules::load(root, &policy.default_exclusions) {
        Ok(rules) => rules,
        Err(error) => {
            return UpdateOutcome::Failed {
                reason: error.to_string(),
            };
        }
    };

    let mut applier = UpdateApplier::new(root, source, rules)
        .remove_orphans(policy.remove_orphans)
        .use_manifest_cache(policy.use_manifest_cache)
        .with_file_ops(file_ops)
        .with_cancellation(cancel);
    if let Some(progress) = progress {
        applier = applier.with_progress(progress);
    }

    let outcome = applier.run(&lock, installed.as_ref(), remote);
    drop(lock);

    match outcome {
        ApplyOutcome::NotNewer => UpdateOutcome::NoUpdate,
        ApplyOutcome::Cancelled => UpdateOutcome::Cancelled,
        ApplyOutcome::Aborted(UpdateError::SourceUnreachable { .. }) => UpdateOutcome::NoUpdate,
        ApplyOutcome::Aborted(error) => UpdateOutcome::Failed {
            reason: error.to_string(),
        },
        ApplyOutcome::Committed { version, .. } => UpdateOutcome::Applied { version },
        ApplyOutcome::RolledBack { error, backup } => UpdateOutcome::RolledBack {
            reason: error.to_string(),
            backup,
        },
        ApplyOutcome::Fatal {
            error,
            restore_error,
            backup,
        } => {
            error!("Update failure needs manual repair: {error}; restore failed: {restore_error}");
            UpdateOutcome::Fatal {
                reason: format!("{error}; restore failed: {restore_error}"),
                backup,
            }
        }
    }
}
