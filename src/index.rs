//! The parent-keyed folder index sync comparison runs against, plus the
//! ordered handoff queue and the possibly-renamed set.
//!
//! The index is a two-level map: parent relative path -> (child name ->
//! stored object). A directory's own descriptor lives under the reserved
//! child key `"."`. The contract with traversers: by the time a directory
//! is handed off, its own entry and all of its children's entries are in
//! the map, so the comparator can take the whole folder in one go.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, unbounded};
use jiff::Timestamp;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::counters::{self, Op};
use crate::errors::Error;
use crate::object::{StoredObject, name_of, parent_of};
use crate::pool::CancelToken;

/// Reserved basename a traverser tacks on to mean "this directory itself".
/// Rewritten to [`SELF_CHILD`] on store so the entry lands at
/// `folder[rel]["."]`.
pub const DUMMY_CHILD: &str = "96009b95-26ea-4db5-9a95-b72ee6f1c2aa";

/// Child key of a directory's own descriptor within its own folder slot.
pub const SELF_CHILD: &str = ".";

pub struct FolderIndex {
    map: RwLock<FxHashMap<String, FxHashMap<String, StoredObject>>>,
    bytes: AtomicU64,
    /// Memory cap in bytes; 0 means uncapped.
    cap: u64,
    case_insensitive: bool,
    gate: Mutex<()>,
    gate_cv: Condvar,
}

impl FolderIndex {
    pub fn new(cap_bytes: u64, case_insensitive: bool) -> Self {
        Self {
            map: RwLock::default(),
            bytes: AtomicU64::new(0),
            cap: cap_bytes,
            case_insensitive,
            gate: Mutex::new(()),
            gate_cv: Condvar::new(),
        }
    }

    /// How the destination's case rules fold a key.
    pub fn child_key(&self, name: &str) -> String {
        if self.case_insensitive {
            name.to_lowercase()
        } else {
            name.to_owned()
        }
    }

    /// Place an object under `(parent(rel), basename(rel))`, blocking first
    /// if the configured memory cap is exceeded. Two objects landing on the
    /// same slot is a caller bug, not something to paper over.
    pub fn store(&self, so: StoredObject, cancel: &CancelToken) -> Result<()> {
        self.wait_below_cap(cancel);

        let rel = so.relative_path.as_str();
        let (folder, child) = if rel.is_empty() {
            (String::new(), SELF_CHILD.to_owned())
        } else {
            let name = name_of(rel);
            let child = if name == DUMMY_CHILD {
                SELF_CHILD.to_owned()
            } else {
                self.child_key(name)
            };
            (self.child_key(parent_of(rel)), child)
        };

        let size = so.indexed_size();
        {
            let mut map = self.map.write().unwrap();
            let slot = map.entry(folder.clone()).or_default();
            if slot.insert(child.clone(), so).is_some() {
                return Err(Error::DuplicateEntry { folder, child }.into());
            }
        }
        self.bytes.fetch_add(size, Ordering::SeqCst);
        counters::bump(Op::IndexStores);
        Ok(())
    }

    /// The directory's own descriptor, if it has been indexed.
    pub fn get_directory(&self, rel: &str) -> Option<StoredObject> {
        let map = self.map.read().unwrap();
        map.get(&self.child_key(rel))?.get(SELF_CHILD).cloned()
    }

    /// Did any child's change-time post-date the baseline? Only meaningful
    /// once the directory has been indexed in full (i.e. after handoff).
    pub fn files_changed_in(&self, rel: &str, baseline: Timestamp) -> bool {
        let map = self.map.read().unwrap();
        let Some(slot) = map.get(&self.child_key(rel)) else {
            return false;
        };
        slot.iter()
            .filter(|(child, _)| child.as_str() != SELF_CHILD)
            .any(|(_, so)| so.last_changed.is_some_and(|ctime| ctime > baseline))
    }

    /// Remove a whole folder slot, returning it and releasing its memory.
    pub fn drain(&self, rel: &str) -> FxHashMap<String, StoredObject> {
        let removed = self
            .map
            .write()
            .unwrap()
            .remove(&self.child_key(rel))
            .unwrap_or_default();
        let freed: u64 = removed.values().map(StoredObject::indexed_size).sum();
        if freed > 0 {
            self.bytes.fetch_sub(freed, Ordering::SeqCst);
            let _held = self.gate.lock().unwrap();
            self.gate_cv.notify_all();
        }
        counters::bump(Op::IndexDrains);
        removed
    }

    pub fn memory_bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Once every handed-off directory has been compared and drained, the
    /// index must be empty. A residual is a bug worth surfacing loudly.
    pub fn assert_drained(&self) -> Result<()> {
        let residual = self.memory_bytes();
        if residual == 0 && self.map.read().unwrap().is_empty() {
            Ok(())
        } else {
            Err(Error::IndexerLeak(residual).into())
        }
    }

    fn wait_below_cap(&self, cancel: &CancelToken) {
        if self.cap == 0 {
            return;
        }
        let mut guard = self.gate.lock().unwrap();
        while self.bytes.load(Ordering::SeqCst) >= self.cap && !cancel.is_cancelled() {
            let (next, _timeout) = self
                .gate_cv
                .wait_timeout(guard, Duration::from_millis(50))
                .unwrap();
            guard = next;
        }
    }
}

/// Ordered handoff from the source traverser to the target side: a
/// directory is enqueued only once all of its children are indexed.
pub fn handoff_queue() -> (HandoffTx, HandoffRx) {
    let (tx, rx) = unbounded();
    (HandoffTx { tx }, HandoffRx { rx })
}

pub struct HandoffTx {
    tx: Sender<String>,
}

impl HandoffTx {
    pub fn enqueue(&self, rel: impl Into<String>) {
        let _ = self.tx.send(rel.into());
    }

    /// Signal the target side that enumeration is complete.
    pub fn close(self) {}
}

pub struct HandoffRx {
    rx: Receiver<String>,
}

impl HandoffRx {
    /// Blocks until a directory is ready; `None` once the queue is closed
    /// and empty.
    pub fn dequeue(&self) -> Option<String> {
        self.rx.recv().ok()
    }

    pub fn try_dequeue(&self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

/// Directories the source flagged as possibly renamed; anything under one
/// gets its target subtree fully re-enumerated.
#[derive(Default)]
pub struct PossiblyRenamedSet {
    set: RwLock<FxHashSet<String>>,
}

impl PossiblyRenamedSet {
    pub fn insert(&self, rel: impl Into<String>) {
        self.set.write().unwrap().insert(rel.into());
    }

    /// True if `rel` or any prefix directory of it is in the set.
    pub fn has_ancestor_in(&self, rel: &str) -> bool {
        let set = self.set.read().unwrap();
        if set.is_empty() {
            return false;
        }
        let mut current = rel;
        loop {
            if set.contains(current) {
                return true;
            }
            match current.rfind('/') {
                Some(i) => current = &current[..i],
                None => return false,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::object::{EntityType, join_relative};

    fn folder(rel: impl Into<String>) -> StoredObject {
        StoredObject::new(EntityType::Folder, rel)
    }

    fn file(rel: impl Into<String>) -> StoredObject {
        StoredObject::new(EntityType::File, rel)
    }

    #[test]
    fn store_and_drain_balance_to_zero() -> Result<()> {
        let index = FolderIndex::new(0, false);
        let cancel = CancelToken::new();

        index.store(folder(""), &cancel)?;
        index.store(folder("d"), &cancel)?;
        index.store(folder(join_relative("d", DUMMY_CHILD)), &cancel)?;
        index.store(file("d/a"), &cancel)?;
        index.store(file("d/b"), &cancel)?;
        assert!(index.memory_bytes() > 0);

        let d = index.drain("d");
        assert_eq!(d.len(), 3);
        assert!(d.contains_key(SELF_CHILD));
        assert!(d.contains_key("a"));
        assert!(d.contains_key("b"));

        let root = index.drain("");
        assert_eq!(root.len(), 2); // the root itself and its child "d"

        assert_eq!(index.memory_bytes(), 0);
        index.assert_drained()
    }

    #[test]
    fn undrained_index_is_a_leak() -> Result<()> {
        let index = FolderIndex::new(0, false);
        index.store(file("x"), &CancelToken::new())?;
        let err = index.assert_drained().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::IndexerLeak(_))
        ));
        Ok(())
    }

    #[test]
    fn duplicate_entries_rejected() -> Result<()> {
        let index = FolderIndex::new(0, false);
        let cancel = CancelToken::new();
        index.store(file("d/a"), &cancel)?;
        let err = index.store(file("d/a"), &cancel).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::DuplicateEntry { .. })
        ));
        Ok(())
    }

    #[test]
    fn dummy_child_becomes_self_entry() -> Result<()> {
        let index = FolderIndex::new(0, false);
        index.store(
            folder(join_relative("some/dir", DUMMY_CHILD)),
            &CancelToken::new(),
        )?;
        assert!(index.get_directory("some/dir").is_some());
        Ok(())
    }

    #[test]
    fn case_insensitive_keys_fold_but_values_keep_case() -> Result<()> {
        let index = FolderIndex::new(0, true);
        let cancel = CancelToken::new();
        index.store(file("Dir/File.TXT"), &cancel)?;

        let slot = index.drain("dir");
        let so = slot.get("file.txt").expect("folded key");
        assert_eq!(so.relative_path, "Dir/File.TXT");
        Ok(())
    }

    #[test]
    fn changed_children_detected() -> Result<()> {
        let index = FolderIndex::new(0, false);
        let cancel = CancelToken::new();
        let baseline = Timestamp::from_second(1000)?;

        let mut quiet = file("d/old");
        quiet.last_changed = Some(Timestamp::from_second(900)?);
        index.store(quiet, &cancel)?;
        assert!(!index.files_changed_in("d", baseline));

        let mut touched = file("d/new");
        touched.last_changed = Some(Timestamp::from_second(1100)?);
        index.store(touched, &cancel)?;
        assert!(index.files_changed_in("d", baseline));
        Ok(())
    }

    #[test]
    fn handoff_preserves_order() {
        let (tx, rx) = handoff_queue();
        tx.enqueue("a");
        tx.enqueue("a/b");
        tx.enqueue("c");
        tx.close();
        assert_eq!(rx.dequeue().as_deref(), Some("a"));
        assert_eq!(rx.dequeue().as_deref(), Some("a/b"));
        assert_eq!(rx.dequeue().as_deref(), Some("c"));
        assert_eq!(rx.dequeue(), None);
    }

    #[test]
    fn renamed_ancestors_found() {
        let set = PossiblyRenamedSet::default();
        assert!(!set.has_ancestor_in("a/b/c"));
        set.insert("a/b");
        assert!(set.has_ancestor_in("a/b/c"));
        assert!(set.has_ancestor_in("a/b"));
        assert!(!set.has_ancestor_in("a"));
        assert!(!set.has_ancestor_in("ab/c"));
    }
}
