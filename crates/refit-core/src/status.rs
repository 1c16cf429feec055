use std::path::Path;

use crate::backup::{BackupHandle, BackupManager};
use crate::error::UpdateError;
use crate::journal::Journal;
use crate::version::{VersionDescriptor, VersionStore};

/// What is known about one installed root without taking its lock.
#[derive(Debug, Clone)]
pub struct RootStatus {
    pub installed: Option<VersionDescriptor>,
    /// Set when an update was interrupted and will be resolved on the next
    /// run.
    pub pending: Option<Journal>,
    pub backups: Vec<BackupHandle>,
}

impl RootStatus {
    /// # Errors
    /// Returns an error when the descriptor or journal is unreadable or the
    /// backups cannot be listed.
    pub fn collect(root: &Path) -> Result<Self, UpdateError> {
        Ok(Self {
            installed: VersionStore::read(root)?,
            pending: Journal::read(root)?,
            backups: BackupManager::list(root)?,
        })
    }

    /// Consistent means no transaction is half done.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.pending.is_none()
    }
}
