use std::cmp::Ordering;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, warn};
use refit_platform::{RootPaths, write_atomic};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub version: String,
    #[serde(deserialize_with = "deserialize_release_date")]
    pub release_date: DateTime<Utc>,
    #[serde(default)]
    pub release_notes: String,
}

impl VersionDescriptor {
    #[must_use]
    pub fn new(version: impl Into<String>, release_notes: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            release_date: Utc::now(),
            release_notes: release_notes.into(),
        }
    }
}

/// Accepts full RFC 3339 timestamps and bare `YYYY-MM-DD` dates.
fn deserialize_release_date<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| serde::de::Error::custom(format!("invalid release_date '{raw}'")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    Older,
    Same,
    Newer,
}

impl From<Ordering> for VersionOrdering {
    fn from(ordering: Ordering) -> Self {
        match ordering {
            Ordering::Less => Self::Older,
            Ordering::Equal => Self::Same,
            Ordering::Greater => Self::Newer,
        }
    }
}

/// Parse a strict `MAJOR.MINOR.PATCH` version. A leading `v` is tolerated;
/// pre-release and build suffixes are not.
///
/// # Errors
/// Returns [`UpdateError::InvalidVersion`] for anything else.
pub fn parse_version(input: &str) -> Result<Version, UpdateError> {
    let trimmed = input.trim();
    let core = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let parsed =
        Version::parse(core).map_err(|error| UpdateError::invalid_version(input, error.to_string()))?;
    if !parsed.pre.is_empty() || !parsed.build.is_empty() {
        return Err(UpdateError::invalid_version(
            input,
            "pre-release and build suffixes are not supported",
        ));
    }
    Ok(parsed)
}

/// Reads and writes the version descriptor of one root.
pub struct VersionStore;

impl VersionStore {
    /// Read the descriptor of `root`. A missing descriptor is `Ok(None)`.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn read(root: &Path) -> Result<Option<VersionDescriptor>, UpdateError> {
        let path = RootPaths::new(root).version_file();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("No version descriptor at {}", path.display());
                return Ok(None);
            }
            Err(error) => {
                return Err(UpdateError::io_with_path(
                    "failed to read version descriptor",
                    &path,
                    &error,
                ));
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|error| UpdateError::Descriptor {
                path,
                details: error.to_string(),
            })
    }

    /// Atomically replace the descriptor of `root`.
    ///
    /// # Errors
    /// Returns an error when serialization or the atomic write fails.
    pub fn write(root: &Path, descriptor: &VersionDescriptor) -> Result<(), UpdateError> {
        let path = RootPaths::new(root).version_file();
        let data = serde_json::to_vec_pretty(descriptor).map_err(|error| UpdateError::Descriptor {
            path: path.clone(),
            details: error.to_string(),
        })?;
        write_atomic(&path, &data).map_err(|error| {
            UpdateError::io_with_path("failed to write version descriptor", &path, &error)
        })
    }

    /// Compare `a` against `b` numerically.
    ///
    /// # Errors
    /// Returns [`UpdateError::InvalidVersion`] when either side is malformed.
    pub fn compare(a: &str, b: &str) -> Result<VersionOrdering, UpdateError> {
        let a = parse_version(a)?;
        let b = parse_version(b)?;
        Ok(a.cmp(&b).into())
    }

    /// Whether `candidate` is strictly newer than `installed`. Malformed
    /// versions are never newer.
    #[must_use]
    pub fn is_newer(candidate: &str, installed: &str) -> bool {
        match Self::compare(candidate, installed) {
            Ok(ordering) => ordering == VersionOrdering::Newer,
            Err(error) => {
                warn!("Treating update as not newer: {error}");
                false
            }
        }
    }
}
