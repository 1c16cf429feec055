use std::path::Path;
use std::time::Duration;

use refit_platform::{LockError, UpdateLock};

use crate::error::UpdateError;

/// Take the root's update lock, mapping contention onto the update error
/// taxonomy.
///
/// # Errors
/// Returns [`UpdateError::LockContention`] when another run holds the lock.
pub fn acquire_lock(root: &Path, timeout: Duration) -> Result<UpdateLock, UpdateError> {
    UpdateLock::acquire(root, timeout).map_err(|error| match error {
        LockError::Contended { .. } => UpdateError::LockContention {
            root: root.to_path_buf(),
        },
        LockError::Io { context, source } => UpdateError::Io { context, source },
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::acquire_lock;
    use crate::error::UpdateError;

    #[test]
    fn contention_maps_to_lock_contention() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let _held = acquire_lock(temp.path(), Duration::from_millis(10)).expect("first lock");

        let second = acquire_lock(temp.path(), Duration::from_millis(10));
        assert!(matches!(second, Err(UpdateError::LockContention { .. })));
    }
}
