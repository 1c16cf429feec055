use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update source {} is unreachable: {details}", path.display())]
    SourceUnreachable { path: PathBuf, details: String },

    #[error("invalid version '{input}': {details}")]
    InvalidVersion { input: String, details: String },

    #[error("failed to read version descriptor {}: {details}", path.display())]
    Descriptor { path: PathBuf, details: String },

    #[error("invalid exclusion rule '{pattern}': {details}")]
    InvalidExclusionRule { pattern: String, details: String },

    #[error("failed to build manifest for {}: {details}", root.display())]
    ManifestBuildFailure { root: PathBuf, details: String },

    #[error("backup of {} failed: {details}", root.display())]
    BackupFailure { root: PathBuf, details: String },

    #[error("cannot place {path}: {details}")]
    PathConflict { path: String, details: String },

    #[error("failed to copy {path}: {source}")]
    CopyFailure {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove orphan {path}: {source}")]
    RemoveFailure {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("hash mismatch after copying {path}: expected {expected}, found {actual}")]
    HashMismatchAfterCopy {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("update lock for {} is held by another process", root.display())]
    LockContention { root: PathBuf },

    #[error("restore from {} failed: {details}", backup.display())]
    RestoreFailure { backup: PathBuf, details: String },

    #[error("update was cancelled before any change was made")]
    Cancelled,

    #[error("cancellation ignored: the backup has started and the update will finish")]
    CancellationRefused,

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl UpdateError {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn io_with_path(context: &'static str, path: &Path, source: &std::io::Error) -> Self {
        Self::io(
            context,
            std::io::Error::new(source.kind(), format!("{}: {source}", path.display())),
        )
    }

    pub(crate) fn invalid_version(input: &str, details: impl Into<String>) -> Self {
        Self::InvalidVersion {
            input: input.to_string(),
            details: details.into(),
        }
    }

    pub(crate) fn manifest(root: &Path, details: impl std::fmt::Display) -> Self {
        Self::ManifestBuildFailure {
            root: root.to_path_buf(),
            details: details.to_string(),
        }
    }

    pub(crate) fn backup(root: &Path, details: impl std::fmt::Display) -> Self {
        Self::BackupFailure {
            root: root.to_path_buf(),
            details: details.to_string(),
        }
    }

    pub(crate) fn restore(backup: &Path, details: impl std::fmt::Display) -> Self {
        Self::RestoreFailure {
            backup: backup.to_path_buf(),
            details: details.to_string(),
        }
    }

    /// Soft failures leave the host usable and need no rollback.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnreachable { .. }
                | Self::InvalidVersion { .. }
                | Self::Descriptor { .. }
                | Self::InvalidExclusionRule { .. }
                | Self::ManifestBuildFailure { .. }
                | Self::PathConflict { .. }
                | Self::LockContention { .. }
                | Self::Cancelled
        )
    }

    /// Failures that require an operator to repair the root by hand.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RestoreFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::UpdateError;

    #[test]
    fn soft_failures_are_recoverable() {
        let unreachable = UpdateError::SourceUnreachable {
            path: PathBuf::from("/mnt/share"),
            details: "not mounted".to_string(),
        };
        assert!(unreachable.is_recoverable());
        assert!(!unreachable.is_fatal());
        assert!(UpdateError::invalid_version("1.x", "bad minor").is_recoverable());
        assert!(
            UpdateError::LockContention {
                root: PathBuf::from("/srv/app")
            }
            .is_recoverable()
        );
    }

    #[test]
    fn restore_failure_is_fatal() {
        let error = UpdateError::restore(std::path::Path::new("/srv/backup_1"), "disk gone");
        assert!(error.is_fatal());
        assert!(!error.is_recoverable());
        assert_eq!(
            error.to_string(),
            "restore from /srv/backup_1 failed: disk gone"
        );
    }

    #[test]
    fn backup_failure_aborts_without_being_fatal() {
        let error = UpdateError::backup(std::path::Path::new("/srv/app"), "disk full");
        assert!(!error.is_recoverable());
        assert!(!error.is_fatal());
    }

    #[test]
    fn cancellation_refused_is_reported_as_is() {
        let error = UpdateError::CancellationRefused;
        assert!(!error.is_recoverable());
        assert!(error.to_string().starts_with("cancellation ignored"));
    }

    #[test]
    fn path_conflict_names_the_blocking_path() {
        let error = UpdateError::PathConflict {
            path: "plugins".to_string(),
            details: "a kept file is where a directory must go".to_string(),
        };
        assert!(error.is_recoverable());
        assert_eq!(
            error.to_string(),
            "cannot place plugins: a kept file is where a directory must go"
        );
    }

    #[test]
    fn copy_failure_is_neither_soft_nor_fatal() {
        let error = UpdateError::CopyFailure {
            path: "bot.py".to_string(),
            source: std::io::Error::other("no space left"),
        };
        assert!(!error.is_recoverable());
        assert!(!error.is_fatal());
    }
}
