//! Predicate composition over stored objects.
//!
//! Filters are pure; the chain short-circuits on the first rejection.
//! A filter may also volunteer a literal prefix that remote traversers use
//! to narrow the listing request before anything is even produced.

use anyhow::{Context, Result};
use regex::{Regex, RegexSet};

use crate::object::{EntityType, StoredObject};

pub trait ObjectFilter: Send + Sync {
    fn admits(&self, so: &StoredObject) -> bool;

    /// A literal prefix every admitted object's relative path starts with,
    /// if this filter implies one.
    fn prefix_hint(&self) -> Option<&str> {
        None
    }
}

pub fn passes(filters: &[Box<dyn ObjectFilter>], so: &StoredObject) -> bool {
    filters.iter().all(|f| f.admits(so))
}

/// The longest prefix hint any filter in the chain offers.
pub fn narrowest_prefix<'a>(filters: &'a [Box<dyn ObjectFilter>]) -> Option<&'a str> {
    filters
        .iter()
        .filter_map(|f| f.prefix_hint())
        .max_by_key(|p| p.len())
}

/// Compile a `*`/`?` wildcard pattern into an anchored regex.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    re
}

/// Admit files whose name matches at least one pattern.
/// Folders pass untouched so traversal can keep descending.
pub struct IncludePatterns {
    set: RegexSet,
}

impl IncludePatterns {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let set = RegexSet::new(patterns.iter().map(|p| wildcard_to_regex(p.as_ref())))
            .context("Include patterns don't compile")?;
        Ok(Self { set })
    }
}

impl ObjectFilter for IncludePatterns {
    fn admits(&self, so: &StoredObject) -> bool {
        so.is_folder() || self.set.is_match(&so.name)
    }
}

/// Reject files whose name matches any pattern.
pub struct ExcludePatterns {
    set: RegexSet,
}

impl ExcludePatterns {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let set = RegexSet::new(patterns.iter().map(|p| wildcard_to_regex(p.as_ref())))
            .context("Exclude patterns don't compile")?;
        Ok(Self { set })
    }
}

impl ObjectFilter for ExcludePatterns {
    fn admits(&self, so: &StoredObject) -> bool {
        so.is_folder() || !self.set.is_match(&so.name)
    }
}

/// Reject everything under the given relative paths.
pub struct ExcludePaths {
    prefixes: Vec<String>,
}

impl ExcludePaths {
    pub fn new<S: Into<String>>(prefixes: impl IntoIterator<Item = S>) -> Self {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl ObjectFilter for ExcludePaths {
    fn admits(&self, so: &StoredObject) -> bool {
        let rel = so.relative_path.as_str();
        !self.prefixes.iter().any(|p| {
            rel == p || (rel.starts_with(p.as_str()) && rel.as_bytes().get(p.len()) == Some(&b'/'))
        })
    }
}

/// Admit only objects under one subtree; doubles as a listing pre-filter.
pub struct PathPrefix {
    prefix: String,
}

impl PathPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl ObjectFilter for PathPrefix {
    fn admits(&self, so: &StoredObject) -> bool {
        so.relative_path.starts_with(&self.prefix)
    }

    fn prefix_hint(&self) -> Option<&str> {
        Some(&self.prefix)
    }
}

/// Admit only the listed entity types.
pub struct EntityFilter {
    allowed: Vec<EntityType>,
}

impl EntityFilter {
    pub fn new(allowed: impl IntoIterator<Item = EntityType>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    pub fn files_only() -> Self {
        Self::new([EntityType::File, EntityType::Hardlink])
    }
}

impl ObjectFilter for EntityFilter {
    fn admits(&self, so: &StoredObject) -> bool {
        self.allowed.contains(&so.entity_type)
    }
}

/// A single compiled wildcard, for things that aren't stored objects
/// (container names in an account traversal).
pub fn wildcard_matcher(pattern: &str) -> Result<Regex> {
    Regex::new(&wildcard_to_regex(pattern)).context("Wildcard pattern doesn't compile")
}
