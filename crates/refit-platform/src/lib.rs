mod atomic;
mod lock;
mod paths;

pub use atomic::{replace_file, write_atomic};
pub use lock::{LockError, UpdateLock};
pub use paths::{
    AppPaths, AppPathsError, BACKUP_DIR_PREFIX, EXCLUDE_FILE, JOURNAL_FILE, LOCK_FILE,
    MANIFEST_CACHE_FILE, RootPaths, VERSION_FILE,
};
