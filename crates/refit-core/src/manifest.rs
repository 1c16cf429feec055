use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use refit_platform::{RootPaths, write_atomic};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::UpdateError;
use crate::exclusion::ExclusionRules;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub hash: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
}

/// Inventory of the files under a root, keyed by `/`-separated relative
/// path. Paths skipped by exclusion rules are kept aside for auditing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
    excluded: BTreeSet<String>,
}

impl Manifest {
    pub fn from_entries(entries: impl IntoIterator<Item = ManifestEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.path.clone(), entry))
                .collect(),
            excluded: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    /// Paths seen while building but left out because a rule matched.
    pub fn excluded(&self) -> impl Iterator<Item = &str> {
        self.excluded.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|entry| entry.size).sum()
    }

    /// Whether both manifests list the same paths with the same contents,
    /// ignoring modification times.
    #[must_use]
    pub fn same_contents(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().zip(other.entries.iter()).all(|((a_path, a), (b_path, b))| {
                a_path == b_path && a.hash == b.hash && a.size == b.size
            })
    }

    /// Serialize entries in path order.
    ///
    /// # Errors
    /// Returns an error if JSON serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let entries: Vec<&ManifestEntry> = self.entries.values().collect();
        serde_json::to_string_pretty(&entries)
    }

    /// Load a cached manifest (`[{path, hash, size}]`). Every listed path
    /// must stay below the root it describes.
    ///
    /// # Errors
    /// Returns [`UpdateError::ManifestBuildFailure`] when the cache cannot be
    /// read or parsed, or lists a path that is empty, absolute, contains
    /// `.`, `..` or empty segments, or uses `\` separators.
    pub fn load_cache(path: &Path) -> Result<Self, UpdateError> {
        let data = std::fs::read_to_string(path).map_err(|error| {
            UpdateError::manifest(path, format!("failed to read manifest cache: {error}"))
        })?;
        let entries: Vec<ManifestEntry> = serde_json::from_str(&data)
            .map_err(|error| UpdateError::manifest(path, format!("invalid manifest cache: {error}")))?;
        if let Some(entry) = entries.iter().find(|entry| !is_safe_relative(&entry.path)) {
            return Err(UpdateError::manifest(
                path,
                format!("manifest cache lists unsafe path {:?}", entry.path),
            ));
        }
        Ok(Self::from_entries(entries.into_iter().map(|entry| ManifestEntry {
            mtime: None,
            ..entry
        })))
    }

    /// Write the manifest cache without modification times, so the file only
    /// changes when contents do.
    ///
    /// # Errors
    /// Returns an error when serialization or the atomic write fails.
    pub fn save_cache(&self, path: &Path) -> Result<(), UpdateError> {
        let entries: Vec<ManifestEntry> = self
            .entries
            .values()
            .map(|entry| ManifestEntry {
                mtime: None,
                ..entry.clone()
            })
            .collect();
        let data = serde_json::to_vec_pretty(&entries)
            .map_err(|error| UpdateError::manifest(path, error))?;
        write_atomic(path, &data)
            .map_err(|error| UpdateError::io_with_path("failed to write manifest cache", path, &error))
    }
}

pub struct ManifestBuilder;

impl ManifestBuilder {
    /// Walk `root` and hash every regular file not matched by `rules`.
    /// Symlinks are not followed and the updater's own control files are
    /// never listed. The walk is read-only.
    ///
    /// # Errors
    /// Returns [`UpdateError::ManifestBuildFailure`] when the root cannot be
    /// walked, a path is not valid UTF-8, or a file cannot be hashed.
    pub fn build(root: &Path, rules: &ExclusionRules) -> Result<Manifest, UpdateError> {
        if !root.is_dir() {
            return Err(UpdateError::manifest(root, "not a directory"));
        }

        let mut manifest = Manifest::default();
        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
        {
            let entry = entry.map_err(|error| UpdateError::manifest(root, error))?;
            if !entry.file_type().is_file() {
                if entry.path_is_symlink() {
                    debug!("Not following symlink {}", entry.path().display());
                }
                continue;
            }

            let relative = relative_path(root, entry.path())
                .ok_or_else(|| UpdateError::manifest(root, format!("unsupported path {}", entry.path().display())))?;
            if RootPaths::is_control_file(&relative) {
                continue;
            }
            if !is_safe_relative(&relative) {
                warn!("Leaving {relative} out of the manifest: name is not portable");
                continue;
            }
            if rules.is_excluded(&relative) {
                manifest.excluded.insert(relative);
                continue;
            }

            let metadata = entry
                .metadata()
                .map_err(|error| UpdateError::manifest(root, error))?;
            let hash = sha256_file(entry.path()).map_err(|error| UpdateError::manifest(root, error))?;
            let mtime = metadata.modified().ok().map(DateTime::<Utc>::from);

            manifest.entries.insert(
                relative.clone(),
                ManifestEntry {
                    path: relative,
                    hash,
                    size: metadata.len(),
                    mtime,
                },
            );
        }

        info!(
            "Built manifest for {}: {} files, {} excluded",
            root.display(),
            manifest.len(),
            manifest.excluded.len()
        );
        Ok(manifest)
    }
}

/// `/`-separated path of `path` relative to `root`, or `None` when it is not
/// below `root` or not valid UTF-8.
pub(crate) fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let stripped = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in stripped.components() {
        match component {
            std::path::Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Whether `relative` names a path strictly below a root: non-empty,
/// `/`-separated, no `\\`, and only plain segments (no `.`, `..`, empty or
/// prefix segments).
pub(crate) fn is_safe_relative(relative: &str) -> bool {
    !relative.is_empty()
        && !relative.contains('\\')
        && relative.split('/').all(|part| {
            let mut components = Path::new(part).components();
            matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(normal)), None) if normal == part
            )
        })
}

/// Map a `/`-separated relative path below `root`, or `None` when the path
/// would leave `root`.
pub(crate) fn join_relative(root: &Path, relative: &str) -> Option<PathBuf> {
    is_safe_relative(relative).then(|| {
        relative
            .split('/')
            .fold(root.to_path_buf(), |path, part| path.join(part))
    })
}

pub(crate) fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{Manifest, ManifestBuilder, is_safe_relative, join_relative, relative_path, sha256_file};
    use crate::exclusion::ExclusionRules;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().expect("file has a parent"))
            .expect("parent directories should be created");
        std::fs::write(path, contents).expect("file should be written");
    }

    #[test]
    fn build_lists_nested_files_with_hashes() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        write(temp.path(), "bot.py", "print('hi')\n");
        write(temp.path(), "scripts/run.bat", "@echo off\n");

        let manifest =
            ManifestBuilder::build(temp.path(), &ExclusionRules::empty()).expect("manifest builds");

        assert_eq!(manifest.len(), 2);
        let entry = manifest.get("scripts/run.bat").expect("nested file listed");
        assert_eq!(entry.size, 10);
        assert_eq!(entry.hash.len(), 64);
        assert!(entry.mtime.is_some());
    }

    #[test]
    fn build_skips_excluded_and_control_files() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        write(temp.path(), "bot.py", "code");
        write(temp.path(), "users.json", "{}");
        write(temp.path(), "version.json", "{}");
        write(temp.path(), ".update.lock", "42");
        write(temp.path(), "trained/new.png", "png");

        let rules = ExclusionRules::from_patterns(["*.json", "trained/"]).expect("valid rules");
        let manifest = ManifestBuilder::build(temp.path(), &rules).expect("manifest builds");

        assert_eq!(
            manifest.entries().map(|e| e.path.as_str()).collect::<Vec<_>>(),
            vec!["bot.py"]
        );
        assert_eq!(
            manifest.excluded().collect::<Vec<_>>(),
            vec!["trained/new.png", "users.json"]
        );
    }

    #[test]
    fn build_is_deterministic() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        write(temp.path(), "b.txt", "b");
        write(temp.path(), "a/z.txt", "z");
        write(temp.path(), "a/y.txt", "y");

        let first = ManifestBuilder::build(temp.path(), &ExclusionRules::empty())
            .expect("manifest builds");
        let second = ManifestBuilder::build(temp.path(), &ExclusionRules::empty())
            .expect("manifest builds");

        assert_eq!(
            first.to_json().expect("serializes"),
            second.to_json().expect("serializes")
        );
    }

    #[cfg(unix)]
    #[test]
    fn build_does_not_follow_symlinks() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let outside = tempfile::tempdir().expect("tempdir should be created");
        write(outside.path(), "secret.txt", "secret");
        write(temp.path(), "bot.py", "code");
        std::os::unix::fs::symlink(outside.path(), temp.path().join("linked"))
            .expect("symlink should be created");

        let manifest =
            ManifestBuilder::build(temp.path(), &ExclusionRules::empty()).expect("manifest builds");

        assert_eq!(manifest.len(), 1);
        assert!(manifest.get("linked/secret.txt").is_none());
    }

    #[test]
    fn build_fails_for_missing_root() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let result = ManifestBuilder::build(&temp.path().join("missing"), &ExclusionRules::empty());
        assert!(matches!(
            result,
            Err(crate::UpdateError::ManifestBuildFailure { .. })
        ));
    }

    #[test]
    fn cache_keeps_contents_but_drops_mtime() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        write(temp.path(), "bot.py", "code");
        let built =
            ManifestBuilder::build(temp.path(), &ExclusionRules::empty()).expect("manifest builds");
        let cache_path = temp.path().join("manifest.json");

        built.save_cache(&cache_path).expect("cache written");
        let loaded = Manifest::load_cache(&cache_path).expect("cache loads");

        assert!(loaded.same_contents(&built));
        assert!(loaded.get("bot.py").expect("listed").mtime.is_none());
        let raw = std::fs::read_to_string(&cache_path).expect("cache readable");
        assert!(!raw.contains("mtime"));
    }

    #[test]
    fn cache_listing_a_path_outside_the_root_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        for listed in ["../payload.txt", "/etc/cron.d/job", "lib/../../x", "./bot.py", "lib//x", "..\\x", ""] {
            let cache_path = temp.path().join("manifest.json");
            let cache = serde_json::json!([{ "path": listed, "hash": "00", "size": 1 }]);
            std::fs::write(&cache_path, cache.to_string()).expect("cache written");

            let result = Manifest::load_cache(&cache_path);

            assert!(
                matches!(result, Err(crate::UpdateError::ManifestBuildFailure { .. })),
                "{listed:?} should be refused"
            );
        }
    }

    #[test]
    fn join_relative_stays_below_root() {
        let root = Path::new("/srv/app");
        assert_eq!(
            join_relative(root, "lib/helpers.py"),
            Some(root.join("lib").join("helpers.py"))
        );
        assert_eq!(join_relative(root, "../payload.txt"), None);
        assert_eq!(join_relative(root, "/abs"), None);
        assert!(is_safe_relative("trained/button.png"));
        assert!(is_safe_relative(".updateignore"));
        assert!(!is_safe_relative("a/./b"));
    }

    #[test]
    fn relative_path_uses_forward_slashes() {
        let root = Path::new("/srv/app");
        assert_eq!(
            relative_path(root, &root.join("a").join("b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(relative_path(root, Path::new("/elsewhere/b.txt")), None);
    }

    #[test]
    fn sha256_file_returns_known_digest() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let file_path = temp.path().join("payload.bin");
        std::fs::write(&file_path, b"bot payload").expect("payload file should be written");

        let digest = sha256_file(&file_path).expect("checksum should be computed");
        assert_eq!(
            digest,
            "ae8022811385920d3c6aa4587b69c4822b948651b483ab1bb2cc676f1bafd2ac"
        );
    }
}
