//! Collaborator seams for remote backends.
//!
//! Wire formats, authentication, retries, and per-operation timeouts all
//! live behind these traits; the traversers only care about listings and
//! probes. The in-memory realizations in [`memory`] are great for testing.

use std::collections::BTreeMap;

use anyhow::Result;
use jiff::Timestamp;

use crate::object::{BlobType, EntityType, ObjectProperties};

pub mod memory;

/// One object as a store reports it in a listing or a properties probe.
#[derive(Debug, Clone, Default)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<Timestamp>,
    pub properties: ObjectProperties,
    pub metadata: BTreeMap<String, String>,
    pub blob_type: Option<BlobType>,
    pub access_tier: Option<String>,
    pub version_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub deleted: bool,
}

/// Extra listing fan-out: soft-deleted entries, snapshots, versions.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ListInclude {
    pub deleted: bool,
    pub snapshots: bool,
    pub versions: bool,
}

impl ListInclude {
    /// Anything here forces serial listing to keep the service's ordering.
    pub fn any(&self) -> bool {
        self.deleted || self.snapshots || self.versions
    }
}

/// One page of a listing, in the service's lexicographic order.
#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    /// Virtual directories, each ending in `/`. Only with delimited listing.
    pub prefixes: Vec<String>,
    /// Marker for the next page; `None` means this was the last.
    pub next: Option<String>,
}

pub trait StoreClient: Send + Sync {
    /// One page of keys under `prefix`, `/`-delimited when asked.
    fn list(
        &self,
        container: &str,
        prefix: &str,
        delimited: bool,
        marker: Option<&str>,
        include: ListInclude,
    ) -> Result<ListPage>;

    /// Properties of a single object; `None` if it doesn't exist.
    fn head(&self, container: &str, key: &str) -> Result<Option<ObjectSummary>>;

    /// Tags are a separate call on real services, so they're one here too.
    fn tags(&self, container: &str, key: &str) -> Result<BTreeMap<String, String>>;

    fn containers(&self) -> Result<Vec<String>>;

    /// Every version of one key, oldest first.
    fn versions(&self, container: &str, key: &str) -> Result<Vec<ObjectSummary>>;
}

/// One entry of a file share, where directories are first-class.
#[derive(Debug, Clone)]
pub struct ShareEntry {
    pub name: String,
    pub entity_type: EntityType,
    pub size: u64,
    pub last_modified: Option<Timestamp>,
    pub last_changed: Option<Timestamp>,
    pub properties: ObjectProperties,
    pub metadata: BTreeMap<String, String>,
}

pub trait ShareClient: Send + Sync {
    /// Immediate children of one directory, lexicographic.
    fn list_dir(&self, share: &str, dir: &str) -> Result<Vec<ShareEntry>>;

    /// One entry (file or directory) by path; `None` if absent.
    fn stat(&self, share: &str, path: &str) -> Result<Option<ShareEntry>>;
}
