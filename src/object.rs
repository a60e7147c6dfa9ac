//! The uniform in-memory descriptor every traverser produces.

use std::collections::BTreeMap;
use std::mem;

use jiff::Timestamp;
use serde_derive::{Deserialize, Serialize};

use crate::sidecar::HashData;

/// Relative path standing in for "the root, with trailing slash semantics".
///
/// A blob named exactly like the search prefix but ending in `/` would
/// otherwise collapse to the empty relative path of the root itself.
pub const ROOT_TRAILING_SLASH: &str = "\x00";

/// Metadata key object stores use to mark an object as a directory stub.
pub const FOLDER_STUB_KEY: &str = "hdi_isfolder";

#[derive(
    Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub enum EntityType {
    #[default]
    File,
    Folder,
    Symlink,
    Hardlink,
    Other,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum BlobType {
    #[serde(rename = "BlockBlob")]
    Block,
    #[serde(rename = "AppendBlob")]
    Append,
    #[serde(rename = "PageBlob")]
    Page,
}

/// HTTP-ish content properties carried through a transfer verbatim.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ObjectProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub content_language: Option<String>,
    pub cache_control: Option<String>,
    pub content_md5: Option<Vec<u8>>,
}

/// One enumerated file/folder/symlink/hardlink, backend-agnostic.
///
/// `relative_path` always uses forward slashes and is relative to the
/// traversal root; the root itself gets the empty string.
/// Within one traversal, `(entity_type, relative_path)` is unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredObject {
    pub name: String,
    pub relative_path: String,
    pub entity_type: EntityType,
    pub last_modified: Option<Timestamp>,
    /// Change time (ctime) where the backend has one.
    pub last_changed: Option<Timestamp>,
    pub size: u64,
    pub properties: ObjectProperties,
    pub metadata: BTreeMap<String, String>,
    pub blob_type: Option<BlobType>,
    pub access_tier: Option<String>,
    pub blob_tags: BTreeMap<String, String>,
    pub version_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub deleted: bool,
    /// The bucket/share/container this object belongs to at the remote.
    pub container: Option<String>,
    /// Filled in by the hash sidecar engine for local sources.
    pub hash: Option<HashData>,
}

impl StoredObject {
    pub fn new(entity_type: EntityType, relative_path: impl Into<String>) -> Self {
        let relative_path = relative_path.into();
        Self {
            name: name_of(&relative_path).to_owned(),
            relative_path,
            entity_type,
            ..Self::default()
        }
    }

    /// Any folder signal is decisive: the entity type, or stub metadata left
    /// behind by stores that fake directories with marker objects.
    pub fn is_folder(&self) -> bool {
        self.entity_type == EntityType::Folder
            || self
                .metadata
                .get(FOLDER_STUB_KEY)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn parent(&self) -> &str {
        parent_of(&self.relative_path)
    }

    /// Rough accounting of what this object costs to keep in the folder
    /// index. Close enough for back-pressure; not an allocator audit.
    pub fn indexed_size(&self) -> u64 {
        let strings = self.name.len()
            + self.relative_path.len()
            + [
                &self.properties.content_type,
                &self.properties.content_encoding,
                &self.properties.content_disposition,
                &self.properties.content_language,
                &self.properties.cache_control,
                &self.access_tier,
                &self.version_id,
                &self.snapshot_id,
                &self.container,
            ]
            .iter()
            .map(|o| o.as_deref().map_or(0, str::len))
            .sum::<usize>();
        let maps = self
            .metadata
            .iter()
            .chain(self.blob_tags.iter())
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>();
        let md5 = self
            .properties
            .content_md5
            .as_ref()
            .map_or(0, |b| b.len());
        (mem::size_of::<Self>() + strings + maps + md5) as u64
    }
}

/// Everything before the last `/` of a relative path; `""` for top-level
/// entries and the root itself.
pub fn parent_of(relative_path: &str) -> &str {
    match relative_path.rfind('/') {
        Some(i) => &relative_path[..i],
        None => "",
    }
}

/// The basename of a relative path; the whole thing if it has no `/`.
pub fn name_of(relative_path: &str) -> &str {
    match relative_path.rfind('/') {
        Some(i) => &relative_path[i + 1..],
        None => relative_path,
    }
}

/// `parent/child` without producing a leading slash when parent is the root.
pub fn join_relative(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_owned()
    } else {
        format!("{parent}/{child}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(parent_of("a/b/c"), "a/b");
        assert_eq!(parent_of("a"), "");
        assert_eq!(parent_of(""), "");
        assert_eq!(name_of("a/b/c"), "c");
        assert_eq!(name_of("a"), "a");
        assert_eq!(join_relative("", "x"), "x");
        assert_eq!(join_relative("a/b", "x"), "a/b/x");
    }

    #[test]
    fn folder_signals() {
        let folder = StoredObject::new(EntityType::Folder, "d");
        assert!(folder.is_folder());

        let mut stub = StoredObject::new(EntityType::File, "d");
        stub.metadata
            .insert(FOLDER_STUB_KEY.to_owned(), "true".to_owned());
        assert!(stub.is_folder());

        let file = StoredObject::new(EntityType::File, "f");
        assert!(!file.is_folder());
    }

    #[test]
    fn indexed_size_tracks_heap_contents() {
        let small = StoredObject::new(EntityType::File, "f");
        let mut big = StoredObject::new(EntityType::File, "f");
        big.metadata
            .insert("some-key".to_owned(), "some-value".to_owned());
        assert!(big.indexed_size() > small.indexed_size());
    }
}
