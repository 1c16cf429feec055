use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::exclusion::DEFAULT_EXCLUSIONS;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// Apply as soon as a newer version is found.
    Automatic,
    /// Ask the host before applying.
    #[default]
    Prompt,
    /// Report the update, never apply it.
    NotifyOnly,
}

/// How one update cycle behaves. Every field has a default so partial
/// settings files deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    #[serde(default)]
    pub install: InstallMode,

    /// Delete destination files the new version no longer ships.
    #[serde(default)]
    pub remove_orphans: bool,

    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub use_manifest_cache: bool,

    #[serde(default = "default_exclusions")]
    pub default_exclusions: Vec<String>,
}

fn default_check_timeout_ms() -> u64 {
    2_000
}

fn default_lock_timeout_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_exclusions() -> Vec<String> {
    DEFAULT_EXCLUSIONS.iter().map(ToString::to_string).collect()
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            install: InstallMode::default(),
            remove_orphans: false,
            check_timeout_ms: default_check_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            use_manifest_cache: true,
            default_exclusions: default_exclusions(),
        }
    }
}

impl UpdatePolicy {
    #[must_use]
    pub fn automatic() -> Self {
        Self {
            install: InstallMode::Automatic,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::{InstallMode, UpdatePolicy};

    #[test]
    fn defaults_leave_orphans_and_prompt() {
        let policy = UpdatePolicy::default();
        assert_eq!(policy.install, InstallMode::Prompt);
        assert!(!policy.remove_orphans);
        assert_eq!(policy.check_timeout().as_secs(), 2);
        assert!(policy.default_exclusions.iter().any(|rule| rule == "*.log"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let policy: UpdatePolicy =
            serde_json::from_str(r#"{"install":"automatic","remove_orphans":true}"#)
                .expect("policy parses");
        assert_eq!(policy.install, InstallMode::Automatic);
        assert!(policy.remove_orphans);
        assert_eq!(policy.lock_timeout_ms, 500);
        assert!(policy.use_manifest_cache);
    }
}
