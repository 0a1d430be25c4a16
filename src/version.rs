//! Version parsing and the per-add-on version map.
//!
//! Versions are totally ordered values parsed from dotted components.
//! Each component is a numeric run followed by an optional textual suffix;
//! components compare numerically first, then by suffix. Purely textual
//! components carry a zero numeric part, so they sort lexicographically
//! among themselves. Parsing never fails for a non-empty string, and two
//! strings that parse equal denote the same version ("1.0" == "1.0.0").
//! The textual form first stored is the canonical one.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::document::Document;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
struct Component {
    num: u64,
    suffix: String,
}

/// A totally ordered add-on version.
#[derive(Debug, Clone)]
pub struct Version {
    canonical: String,
    components: Vec<Component>,
}

impl Version {
    pub fn parse(text: &str) -> Version {
        let components = text
            .split('.')
            .map(|part| {
                let digits_end = part
                    .char_indices()
                    .find(|(_, c)| !c.is_ascii_digit())
                    .map(|(i, _)| i)
                    .unwrap_or(part.len());
                let num = part[..digits_end].parse().unwrap_or(u64::MAX);
                Component {
                    num: if digits_end == 0 { 0 } else { num },
                    suffix: part[digits_end..].to_string(),
                }
            })
            .collect();
        Version {
            canonical: text.to_string(),
            components,
        }
    }

    /// The textual form the version was parsed from.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    fn component(&self, idx: usize) -> Component {
        self.components.get(idx).cloned().unwrap_or_default()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

// Ordering ignores the canonical text; "1.0" and "1.0.0" are the same key.
impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for idx in 0..len {
            match self.component(idx).cmp(&other.component(idx)) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

/// One known version of an add-on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    /// Canonical version string.
    pub version: String,
    /// Full-pack file basename for this version.
    pub filename: String,
}

/// Ordered map of a single add-on's known versions.
#[derive(Debug, Clone, Default)]
pub struct VersionMap {
    inner: BTreeMap<Version, VersionRecord>,
}

impl VersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the map from the `version` children of a metadata document.
    pub fn from_metadata(meta: &Document) -> Self {
        let mut map = VersionMap::new();
        for child in meta.children("version") {
            let version = child.attr_or_empty("version");
            map.insert(VersionRecord {
                version: version.to_string(),
                filename: child.attr_or_empty("filename").to_string(),
            });
        }
        map
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Inserts a record, replacing any record under an equal key. The new
    /// record's textual form becomes canonical for the slot.
    pub fn insert(&mut self, record: VersionRecord) {
        let key = Version::parse(&record.version);
        self.inner.remove(&key);
        self.inner.insert(key, record);
    }

    pub fn remove(&mut self, version: &Version) {
        self.inner.remove(version);
    }

    pub fn get(&self, version: &Version) -> Option<&VersionRecord> {
        self.inner.get(version)
    }

    pub fn contains(&self, version: &Version) -> bool {
        self.inner.contains_key(version)
    }

    pub fn first(&self) -> Option<&VersionRecord> {
        self.inner.values().next()
    }

    pub fn latest(&self) -> Option<&VersionRecord> {
        self.inner.values().next_back()
    }

    /// The newest record whose version is not newer than `version`.
    pub fn nearest_older(&self, version: &Version) -> Option<&VersionRecord> {
        self.inner.range(..=version.clone()).next_back().map(|(_, r)| r)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Version, &VersionRecord)> {
        self.inner.iter()
    }

    pub fn records(&self) -> impl Iterator<Item = &VersionRecord> {
        self.inner.values()
    }

    /// Consecutive `(older, newer)` pairs in version order.
    pub fn pairs(&self) -> impl Iterator<Item = (&VersionRecord, &VersionRecord)> {
        self.inner.values().zip(self.inner.values().skip(1))
    }
}
