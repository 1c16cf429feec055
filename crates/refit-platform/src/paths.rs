use std::path::{Path, PathBuf};
use thiserror::Error;

/// Version descriptor, present in both installed roots and update sources.
pub const VERSION_FILE: &str = "version.json";
/// Newline-delimited exclusion globs, one per installed root.
pub const EXCLUDE_FILE: &str = ".updateignore";
pub const LOCK_FILE: &str = ".update.lock";
pub const JOURNAL_FILE: &str = ".update-journal.json";
/// Optional manifest cache written beside an update source.
pub const MANIFEST_CACHE_FILE: &str = "manifest.json";
pub const BACKUP_DIR_PREFIX: &str = "backup_";

const CONTROL_FILES: [&str; 5] = [
    VERSION_FILE,
    EXCLUDE_FILE,
    LOCK_FILE,
    JOURNAL_FILE,
    MANIFEST_CACHE_FILE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AppPathsError {
    #[error("Could not determine home directory")]
    HomeDirUnavailable,
    #[error("Could not determine config directory")]
    ConfigDirUnavailable,
    #[error("Could not determine data directory")]
    DataDirUnavailable,
}

/// Directories used by the `refit` host itself (settings and logs), not by
/// the application roots it updates.
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    /// Build host paths for the current platform.
    ///
    /// # Errors
    /// Returns an error when a required base directory cannot be determined.
    pub fn new() -> Result<Self, AppPathsError> {
        #[cfg(target_os = "macos")]
        {
            let home = dirs::home_dir().ok_or(AppPathsError::HomeDirUnavailable)?;
            Ok(Self {
                config_dir: home.join("Library/Application Support/refit"),
                data_dir: home.join("Library/Application Support/refit"),
            })
        }

        #[cfg(not(target_os = "macos"))]
        {
            Ok(Self {
                config_dir: dirs::config_dir()
                    .ok_or(AppPathsError::ConfigDirUnavailable)?
                    .join("refit"),
                data_dir: dirs::data_dir()
                    .ok_or(AppPathsError::DataDirUnavailable)?
                    .join("refit"),
            })
        }
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("refit.log")
    }

    /// Ensure the host directories exist on disk.
    ///
    /// # Errors
    /// Returns an error if any directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

/// Locations of the control files inside one application root (or update
/// source). Every call site gets its root explicitly; there is no notion of
/// a current installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPaths {
    root: PathBuf,
}

impl RootPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn version_file(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    #[must_use]
    pub fn exclude_file(&self) -> PathBuf {
        self.root.join(EXCLUDE_FILE)
    }

    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    #[must_use]
    pub fn journal_file(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    #[must_use]
    pub fn manifest_cache_file(&self) -> PathBuf {
        self.root.join(MANIFEST_CACHE_FILE)
    }

    /// Directory that holds the root's backup siblings.
    #[must_use]
    pub fn backup_parent(&self) -> PathBuf {
        match self.root.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Path of a backup sibling for the given `YYYYMMDD_HHMMSS` stamp.
    #[must_use]
    pub fn backup_dir(&self, stamp: &str) -> PathBuf {
        self.backup_parent()
            .join(format!("{BACKUP_DIR_PREFIX}{stamp}"))
    }

    /// Whether a root-relative, `/`-separated path names one of the control
    /// files the updater owns. Control files are never listed in manifests,
    /// copied from a source, or deleted as orphans.
    #[must_use]
    pub fn is_control_file(relative: &str) -> bool {
        CONTROL_FILES.contains(&relative) || Self::is_transient_file(relative)
    }

    /// Control files that only matter while an update runs: the lock, the
    /// journal and temp files. Backups and restores skip them; the version
    /// descriptor and rule file are part of a backup.
    #[must_use]
    pub fn is_transient_file(relative: &str) -> bool {
        if relative == LOCK_FILE || relative == JOURNAL_FILE {
            return true;
        }
        let name = relative.rsplit('/').next().unwrap_or(relative);
        if name.ends_with(".refit-tmp") {
            return true;
        }
        // leftovers of an interrupted `write_atomic` on a control file
        !relative.contains('/')
            && name.ends_with(".tmp")
            && CONTROL_FILES
                .iter()
                .any(|control| name.starts_with(&format!(".{control}.")))
    }

    #[must_use]
    pub fn is_backup_dir_name(name: &str) -> bool {
        name.strip_prefix(BACKUP_DIR_PREFIX)
            .is_some_and(|stamp| stamp.starts_with(|c: char| c.is_ascii_digit()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{AppPaths, RootPaths};

    #[test]
    fn host_file_paths_use_expected_filenames() {
        let paths = AppPaths {
            config_dir: Path::new("/tmp/refit-test/config").to_path_buf(),
            data_dir: Path::new("/tmp/refit-test/data").to_path_buf(),
        };

        assert!(
            paths
                .settings_file()
                .ends_with(Path::new("config").join("settings.json"))
        );
        assert!(
            paths
                .log_file()
                .ends_with(Path::new("data").join("refit.log"))
        );
    }

    #[test]
    fn ensure_dirs_creates_all_directories() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = AppPaths {
            config_dir: temp.path().join("config"),
            data_dir: temp.path().join("data"),
        };

        paths
            .ensure_dirs()
            .expect("ensure_dirs should create host directories");

        assert!(paths.config_dir.is_dir());
        assert!(paths.data_dir.is_dir());
    }

    #[test]
    fn backups_are_siblings_of_the_root() {
        let paths = RootPaths::new("/srv/apps/bot");
        assert_eq!(
            paths.backup_dir("20240102_030405"),
            Path::new("/srv/apps/backup_20240102_030405")
        );
    }

    #[test]
    fn control_files_are_recognised() {
        assert!(RootPaths::is_control_file("version.json"));
        assert!(RootPaths::is_control_file(".update.lock"));
        assert!(RootPaths::is_control_file("scripts/.bot.py.refit-tmp"));
        assert!(RootPaths::is_control_file(".version.json.42.17.0.tmp"));
        assert!(!RootPaths::is_control_file("cache/.version.json.42.17.0.tmp"));
        assert!(!RootPaths::is_control_file("config/version.json.bak"));
        assert!(!RootPaths::is_control_file("bot.py"));
    }

    #[test]
    fn transient_files_exclude_descriptor_and_rules() {
        assert!(RootPaths::is_transient_file(".update.lock"));
        assert!(RootPaths::is_transient_file(".update-journal.json"));
        assert!(RootPaths::is_transient_file("a/.b.txt.refit-tmp"));
        assert!(!RootPaths::is_transient_file("version.json"));
        assert!(!RootPaths::is_transient_file(".updateignore"));
    }

    #[test]
    fn backup_dir_names_need_a_stamp() {
        assert!(RootPaths::is_backup_dir_name("backup_20240102_030405"));
        assert!(!RootPaths::is_backup_dir_name("backup_notes"));
        assert!(!RootPaths::is_backup_dir_name("scripts"));
    }
}
