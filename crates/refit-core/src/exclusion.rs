//! Declarative rules for user-owned files.
//!
//! A rule is a glob. Rules without a `/` match the file name at any depth;
//! rules with a `/` match the whole root-relative path, where `*` stays
//! inside one path component and `**` crosses components. A trailing `/`
//! turns the rule into a directory rule that excludes everything below any
//! matching directory. Matching is always done per file, so newly created
//! files under an excluded directory are caught too.

use std::path::Path;

use glob::{MatchOptions, Pattern};
use log::debug;
use refit_platform::RootPaths;

use crate::error::UpdateError;

/// Patterns every root gets before its own `.updateignore` entries.
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    "*.log",
    "logs/",
    "credentials*",
    "*.token",
    ".env",
    "trained/",
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct Rule {
    source: String,
    pattern: Pattern,
    whole_path: bool,
    directory: bool,
}

impl Rule {
    fn matches(&self, relative: &str) -> bool {
        if self.directory {
            return relative
                .match_indices('/')
                .any(|(index, _)| self.matches_subject(&relative[..index]));
        }
        self.matches_subject(relative)
    }

    fn matches_subject(&self, path: &str) -> bool {
        let subject = if self.whole_path {
            path
        } else {
            path.rsplit('/').next().unwrap_or(path)
        };
        self.pattern.matches_with(subject, MATCH_OPTIONS)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExclusionRules {
    rules: Vec<Rule>,
}

impl ExclusionRules {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a rule set from individual patterns, in order.
    ///
    /// # Errors
    /// Returns an error naming the first pattern that is not a valid glob.
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, UpdateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Self::empty();
        for pattern in patterns {
            rules.push(pattern.as_ref())?;
        }
        Ok(rules)
    }

    /// Parse newline-delimited rules. Blank lines and `#` comments are
    /// ignored.
    ///
    /// # Errors
    /// Returns an error naming the first invalid pattern.
    pub fn parse(text: &str) -> Result<Self, UpdateError> {
        Self::from_patterns(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }

    /// Load the rule set for `root`: `defaults` first, then the root's
    /// `.updateignore` if it exists.
    ///
    /// # Errors
    /// Returns an error when the rule file cannot be read or holds an
    /// invalid pattern. Callers treat this as a manifest build failure, so
    /// nothing is mutated with a partial rule set.
    pub fn load<S: AsRef<str>>(root: &Path, defaults: &[S]) -> Result<Self, UpdateError> {
        let mut rules = Self::from_patterns(defaults)?;
        let path = RootPaths::new(root).exclude_file();
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let from_file = Self::parse(&text)?;
                debug!(
                    "Loaded {} exclusion rules from {}",
                    from_file.len(),
                    path.display()
                );
                rules.rules.extend(from_file.rules);
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(UpdateError::manifest(
                    root,
                    format!("failed to read {}: {error}", path.display()),
                ));
            }
        }
        Ok(rules)
    }

    fn push(&mut self, raw: &str) -> Result<(), UpdateError> {
        let normalized = raw.trim().replace('\\', "/");
        let anchored = normalized.starts_with('/');
        let directory = normalized.ends_with('/');
        let body = normalized.trim_start_matches('/').trim_end_matches('/');
        let whole_path = anchored || body.contains('/');

        let pattern = Pattern::new(body).map_err(|error| UpdateError::InvalidExclusionRule {
            pattern: raw.to_string(),
            details: error.to_string(),
        })?;
        self.rules.push(Rule {
            source: raw.trim().to_string(),
            pattern,
            whole_path,
            directory,
        });
        Ok(())
    }

    /// The first rule matching a root-relative, `/`-separated path.
    #[must_use]
    pub fn first_match(&self, relative: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(relative))
            .map(|rule| rule.source.as_str())
    }

    #[must_use]
    pub fn is_excluded(&self, relative: &str) -> bool {
        self.first_match(relative).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.source.as_str())
    }
}
