//! In-memory store and share doubles.
//!
//! Great for testing: build the remote you want, then traverse it.

use super::*;

use std::collections::BTreeSet;

use crate::object::FOLDER_STUB_KEY;

/// A store that keeps every container as a sorted key -> summary map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    containers: BTreeMap<String, BTreeMap<String, ObjectSummary>>,
    snapshots: BTreeMap<(String, String), Vec<ObjectSummary>>,
    version_lists: BTreeMap<(String, String), Vec<ObjectSummary>>,
    tag_lists: BTreeMap<(String, String), BTreeMap<String, String>>,
    page_size: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            page_size: 5000,
            ..Self::default()
        }
    }

    /// Small pages exercise the marker loop in tests.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    pub fn add_container(&mut self, container: &str) {
        self.containers.entry(container.to_owned()).or_default();
    }

    pub fn insert(&mut self, container: &str, summary: ObjectSummary) {
        self.containers
            .entry(container.to_owned())
            .or_default()
            .insert(summary.key.clone(), summary);
    }

    pub fn add_object(&mut self, container: &str, key: &str, size: u64, lmt_second: i64) {
        self.insert(
            container,
            ObjectSummary {
                key: key.to_owned(),
                size,
                last_modified: Timestamp::from_second(lmt_second).ok(),
                ..ObjectSummary::default()
            },
        );
    }

    /// A zero-byte marker object standing in for a directory.
    pub fn add_stub(&mut self, container: &str, key: &str) {
        let mut summary = ObjectSummary {
            key: key.to_owned(),
            ..ObjectSummary::default()
        };
        summary
            .metadata
            .insert(FOLDER_STUB_KEY.to_owned(), "true".to_owned());
        self.insert(container, summary);
    }

    pub fn add_snapshot(&mut self, container: &str, key: &str, snapshot_id: &str) {
        let snap = ObjectSummary {
            key: key.to_owned(),
            snapshot_id: Some(snapshot_id.to_owned()),
            ..ObjectSummary::default()
        };
        self.snapshots
            .entry((container.to_owned(), key.to_owned()))
            .or_default()
            .push(snap);
    }

    pub fn add_version(&mut self, container: &str, key: &str, version_id: &str) {
        let version = ObjectSummary {
            key: key.to_owned(),
            version_id: Some(version_id.to_owned()),
            ..ObjectSummary::default()
        };
        self.version_lists
            .entry((container.to_owned(), key.to_owned()))
            .or_default()
            .push(version);
    }

    pub fn add_tags(&mut self, container: &str, key: &str, tags: BTreeMap<String, String>) {
        self.tag_lists
            .insert((container.to_owned(), key.to_owned()), tags);
    }
}

impl StoreClient for MemoryStore {
    fn list(
        &self,
        container: &str,
        prefix: &str,
        delimited: bool,
        marker: Option<&str>,
        include: ListInclude,
    ) -> Result<ListPage> {
        let Some(keys) = self.containers.get(container) else {
            anyhow::bail!("no such container {container}");
        };

        let mut objects = Vec::new();
        let mut prefixes = BTreeSet::new();
        for (key, summary) in keys.range(prefix.to_owned()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if summary.deleted && !include.deleted {
                continue;
            }
            if delimited {
                let rest = &key[prefix.len()..];
                if let Some(slash) = rest.find('/') {
                    prefixes.insert(key[..prefix.len() + slash + 1].to_owned());
                    continue;
                }
            }
            objects.push(summary.clone());
            if include.snapshots {
                if let Some(snaps) = self.snapshots.get(&(container.to_owned(), key.clone())) {
                    objects.extend(snaps.iter().cloned());
                }
            }
            if include.versions {
                if let Some(versions) =
                    self.version_lists.get(&(container.to_owned(), key.clone()))
                {
                    objects.extend(versions.iter().cloned());
                }
            }
        }

        // Real services paginate; we slice the object list by a decimal
        // marker and hand the prefixes out with the first page.
        let start: usize = marker.map(|m| m.parse().unwrap_or(0)).unwrap_or(0);
        let end = (start + self.page_size.max(1)).min(objects.len());
        let next = (end < objects.len()).then(|| end.to_string());
        Ok(ListPage {
            objects: objects[start..end].to_vec(),
            prefixes: if start == 0 {
                prefixes.into_iter().collect()
            } else {
                Vec::new()
            },
            next,
        })
    }

    fn head(&self, container: &str, key: &str) -> Result<Option<ObjectSummary>> {
        Ok(self
            .containers
            .get(container)
            .and_then(|keys| keys.get(key))
            .filter(|s| !s.deleted)
            .cloned())
    }

    fn tags(&self, container: &str, key: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .tag_lists
            .get(&(container.to_owned(), key.to_owned()))
            .cloned()
            .unwrap_or_default())
    }

    fn containers(&self) -> Result<Vec<String>> {
        Ok(self.containers.keys().cloned().collect())
    }

    fn versions(&self, container: &str, key: &str) -> Result<Vec<ObjectSummary>> {
        Ok(self
            .version_lists
            .get(&(container.to_owned(), key.to_owned()))
            .cloned()
            .unwrap_or_default())
    }
}

/// A share that keeps every entry keyed by full path. Parent directories
/// come into being as needed.
#[derive(Debug, Default)]
pub struct MemoryShare {
    shares: BTreeMap<String, BTreeMap<String, ShareEntry>>,
}

impl MemoryShare {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_share(&mut self, share: &str) {
        self.shares.entry(share.to_owned()).or_default();
    }

    pub fn add_dir(&mut self, share: &str, path: &str) {
        self.ensure_parents(share, path);
        self.put(
            share,
            path,
            ShareEntry {
                name: crate::object::name_of(path).to_owned(),
                entity_type: EntityType::Folder,
                size: 0,
                last_modified: None,
                last_changed: None,
                properties: ObjectProperties::default(),
                metadata: BTreeMap::new(),
            },
        );
    }

    pub fn add_file(&mut self, share: &str, path: &str, size: u64, lmt_second: i64) {
        self.ensure_parents(share, path);
        self.put(
            share,
            path,
            ShareEntry {
                name: crate::object::name_of(path).to_owned(),
                entity_type: EntityType::File,
                size,
                last_modified: Timestamp::from_second(lmt_second).ok(),
                last_changed: Timestamp::from_second(lmt_second).ok(),
                properties: ObjectProperties::default(),
                metadata: BTreeMap::new(),
            },
        );
    }

    fn ensure_parents(&mut self, share: &str, path: &str) {
        let parent = crate::object::parent_of(path);
        if !parent.is_empty()
            && !self
                .shares
                .get(share)
                .is_some_and(|entries| entries.contains_key(parent))
        {
            self.add_dir(share, parent);
        }
    }

    fn put(&mut self, share: &str, path: &str, entry: ShareEntry) {
        self.shares
            .entry(share.to_owned())
            .or_default()
            .insert(path.to_owned(), entry);
    }
}

impl ShareClient for MemoryShare {
    fn list_dir(&self, share: &str, dir: &str) -> Result<Vec<ShareEntry>> {
        let Some(entries) = self.shares.get(share) else {
            anyhow::bail!("no such share {share}");
        };
        Ok(entries
            .iter()
            .filter(|(path, _)| crate::object::parent_of(path) == dir && !path.is_empty())
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    fn stat(&self, share: &str, path: &str) -> Result<Option<ShareEntry>> {
        let Some(entries) = self.shares.get(share) else {
            return Ok(None);
        };
        if path.is_empty() {
            // The share root is always a directory.
            return Ok(Some(ShareEntry {
                name: String::new(),
                entity_type: EntityType::Folder,
                size: 0,
                last_modified: None,
                last_changed: None,
                properties: ObjectProperties::default(),
                metadata: BTreeMap::new(),
            }));
        }
        Ok(entries.get(path).cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delimited_listing_groups_prefixes() -> Result<()> {
        let mut store = MemoryStore::new();
        store.add_object("bkt", "dir/a", 1, 100);
        store.add_object("bkt", "dir/b", 1, 100);
        store.add_object("bkt", "dir/nested/c", 1, 100);

        let page = store.list("bkt", "dir/", true, None, ListInclude::default())?;
        let keys: Vec<_> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["dir/a", "dir/b"]);
        assert_eq!(page.prefixes, ["dir/nested/"]);
        assert_eq!(page.next, None);
        Ok(())
    }

    #[test]
    fn markers_page_through() -> Result<()> {
        let mut store = MemoryStore::with_page_size(2);
        for k in ["a", "b", "c", "d", "e"] {
            store.add_object("bkt", k, 1, 100);
        }

        let mut seen = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = store.list("bkt", "", false, marker.as_deref(), ListInclude::default())?;
            seen.extend(page.objects.into_iter().map(|o| o.key));
            match page.next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, ["a", "b", "c", "d", "e"]);
        Ok(())
    }

    #[test]
    fn share_parents_spring_into_being() -> Result<()> {
        let mut share = MemoryShare::new();
        share.add_file("sh", "a/b/c.txt", 3, 100);

        let root = share.list_dir("sh", "")?;
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "a");
        assert_eq!(root[0].entity_type, EntityType::Folder);

        let nested = share.list_dir("sh", "a/b")?;
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].name, "c.txt");
        Ok(())
    }
}
