use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ops::Bound;

use refit_platform::RootPaths;
use serde::Serialize;

use crate::exclusion::ExclusionRules;
use crate::manifest::{Manifest, ManifestEntry};

/// Disjoint path sets describing how to bring a destination in line with a
/// source. Every list is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    pub to_add: Vec<String>,
    pub to_update: Vec<String>,
    pub to_remove: Vec<String>,
    /// User-owned paths left alone, for the audit log.
    pub skipped: Vec<String>,
}

impl DiffResult {
    /// No file needs to change. Skipped paths do not count.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }

    /// Paths whose source contents must be copied into the destination.
    pub fn to_copy(&self) -> impl Iterator<Item = &str> {
        self.to_add
            .iter()
            .chain(self.to_update.iter())
            .map(String::as_str)
    }
}

pub struct ManifestDiffer;

impl ManifestDiffer {
    /// Compare `source` against `dest` with a sorted merge over both path
    /// lists. Rules are re-checked for every key regardless of how either
    /// manifest was built, so an excluded path only ever lands in
    /// `skipped`.
    #[must_use]
    pub fn diff(source: &Manifest, dest: &Manifest, rules: &ExclusionRules) -> DiffResult {
        let mut result = DiffResult::default();
        let mut skipped: BTreeSet<String> = source
            .excluded()
            .chain(dest.excluded())
            .map(str::to_string)
            .collect();

        let mut classify = |path: &str, target: fn(&mut DiffResult) -> &mut Vec<String>| {
            if RootPaths::is_control_file(path) {
                return;
            }
            if rules.is_excluded(path) {
                skipped.insert(path.to_string());
            } else {
                target(&mut result).push(path.to_string());
            }
        };

        let mut source_entries = source.entries().peekable();
        let mut dest_entries = dest.entries().peekable();
        loop {
            let ordering = match (source_entries.peek(), dest_entries.peek()) {
                (Some(src), Some(dst)) => src.path.cmp(&dst.path),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => break,
            };

            match ordering {
                Ordering::Less => {
                    if let Some(src) = source_entries.next() {
                        classify(&src.path, |r| &mut r.to_add);
                    }
                }
                Ordering::Greater => {
                    if let Some(dst) = dest_entries.next() {
                        classify(&dst.path, |r| &mut r.to_remove);
                    }
                }
                Ordering::Equal => {
                    let (Some(src), Some(dst)) = (source_entries.next(), dest_entries.next())
                    else {
                        break;
                    };
                    // unchanged user-owned files are still reported as skipped
                    if contents_differ(src, dst) || rules.is_excluded(&src.path) {
                        classify(&src.path, |r| &mut r.to_update);
                    }
                }
            }
        }

        result.skipped = skipped.into_iter().collect();
        result
    }
}

impl ManifestDiffer {
    /// Destination paths whose type clashes with a path that must be copied:
    /// a file standing where the copy needs a directory, or files inside a
    /// directory standing where the copy needs a file. Sorted.
    #[must_use]
    pub fn blockers(diff: &DiffResult, dest: &Manifest) -> Vec<String> {
        let occupied: BTreeSet<&str> = dest
            .entries()
            .map(|entry| entry.path.as_str())
            .chain(dest.excluded())
            .collect();

        let mut found = BTreeSet::new();
        for path in diff.to_copy() {
            for (index, _) in path.match_indices('/') {
                let ancestor = &path[..index];
                if occupied.contains(ancestor) {
                    found.insert(ancestor.to_string());
                }
            }

            let prefix = format!("{path}/");
            found.extend(
                occupied
                    .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
                    .take_while(|occupant| occupant.starts_with(&prefix))
                    .map(|occupant| (*occupant).to_string()),
            );
        }
        found.into_iter().collect()
    }
}

fn contents_differ(source: &ManifestEntry, dest: &ManifestEntry) -> bool {
    source.hash != dest.hash || source.size != dest.size
}
