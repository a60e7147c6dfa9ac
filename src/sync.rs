//! Decide what a sync actually has to move.
//!
//! The source traverser folds its stream into the [folder index](FolderIndex)
//! and hands each directory off once its children are fully indexed. This
//! side dequeues directories in that order, pairs every destination object
//! with its source counterpart, and emits copy/metadata/delete decisions.
//! Entries left in a folder's slot after pairing are source-only and become
//! copies; then the slot is drained and its memory comes back.

use std::thread;

use anyhow::Result;
use byte_unit::{Byte, UnitType};
use camino::Utf8PathBuf;
use jiff::Timestamp;
use serde_derive::Deserialize;
use tracing::{debug, info};

use crate::config::{DeleteDestination, JobOptions};
use crate::index::{
    FolderIndex, HandoffTx, PossiblyRenamedSet, SELF_CHILD, handoff_queue,
};
use crate::object::{EntityType, StoredObject, join_relative};
use crate::pool::CancelToken;
use crate::remote::{ListInclude, ShareClient, StoreClient};
use crate::sidecar;
use crate::traverse::{FolderDone, Processor};

/// Change-file-detection: how the comparator decides something changed.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize)]
pub enum CfdMode {
    /// Never trust times; enumerate both sides and compare.
    #[default]
    TargetCompare,
    /// Trust mtime for data and ctime for metadata, against the last-sync
    /// baseline.
    CtimeMtime,
    /// Trust only ctime; when it post-dates the baseline, compare
    /// attributes against the destination entry.
    Ctime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Transfer the data (and everything riding along with it).
    Copy(StoredObject),
    /// The data is fine; refresh properties and metadata only.
    MetadataOnly(StoredObject),
    /// The destination has this and the source doesn't.
    Delete(StoredObject),
}

pub type DecisionSink<'a> = dyn FnMut(Decision) -> Result<()> + 'a;

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub cfd: CfdMode,
    pub last_sync: Option<Timestamp>,
    pub delete_destination: DeleteDestination,
    pub metadata_only_sync: bool,
    pub max_index_bytes: u64,
    pub case_insensitive_destination: bool,
}

impl SyncOptions {
    pub fn from_job(options: &JobOptions, case_insensitive_destination: bool) -> Self {
        Self {
            cfd: options.cfd_mode,
            last_sync: options.last_sync_time,
            delete_destination: options.delete_destination,
            metadata_only_sync: options.metadata_only_sync,
            max_index_bytes: options.max_index_bytes(),
            case_insensitive_destination,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub copied: u64,
    pub copied_bytes: u64,
    pub metadata_only: u64,
    pub deleted: u64,
    pub skipped: u64,
}

/// The destination side of a sync: list one directory's immediate children.
pub trait TargetLister: Send + Sync {
    /// `None` means the directory doesn't exist on the destination at all.
    fn list_folder(&self, rel: &str) -> Result<Option<Vec<StoredObject>>>;
}

/// Drive a whole sync: enumerate `source` into the index on one thread while
/// this thread drains the handoff queue through the comparator.
///
/// `source` gets the processor to feed and the per-directory completion
/// hook; wire both into the traverser (`traverse_with_handoff`).
pub fn run<F>(
    source: F,
    target: &dyn TargetLister,
    options: &SyncOptions,
    cancel: &CancelToken,
    decisions: &mut DecisionSink<'_>,
) -> Result<SyncSummary>
where
    F: FnOnce(&mut Processor<'_>, &FolderDone<'_>) -> Result<()> + Send,
{
    let index = FolderIndex::new(options.max_index_bytes, options.case_insensitive_destination);
    let renamed = PossiblyRenamedSet::default();
    let (handoff_tx, handoff_rx) = handoff_queue();

    let summary = thread::scope(|s| -> Result<SyncSummary> {
        let index = &index;
        let renamed = &renamed;

        let source_thread = s.spawn(move || -> Result<()> {
            let result = enumerate_source(source, index, renamed, options, cancel, handoff_tx);
            if result.is_err() {
                cancel.cancel();
            }
            result
        });

        let mut comparator = Comparator {
            index,
            renamed,
            options,
            target,
            decisions,
            summary: SyncSummary::default(),
        };

        let mut compared = Ok(());
        while let Some(dir) = handoff_rx.dequeue() {
            if cancel.is_cancelled() {
                // Drain the queue as empty so the source never blocks.
                continue;
            }
            if let Err(e) = comparator.process_folder(&dir) {
                cancel.cancel();
                compared = Err(e);
            }
        }

        let enumerated = source_thread.join().unwrap();
        compared?;
        enumerated?;
        // A cancelled run legitimately leaves the index half-full.
        if !cancel.is_cancelled() {
            index.assert_drained()?;
        }
        Ok(comparator.summary)
    })?;

    let bytes = Byte::from_u64(summary.copied_bytes).get_appropriate_unit(UnitType::Binary);
    info!(
        "sync decided on {} copies ({bytes:.2}), {} metadata refreshes, {} deletions, {} skips",
        summary.copied, summary.metadata_only, summary.deleted, summary.skipped
    );
    Ok(summary)
}

/// Feed the source traverser into the index, flagging suspected renames and
/// double-storing each folder (as its parent's child, and as its own `"."`
/// entry).
fn enumerate_source<F>(
    source: F,
    index: &FolderIndex,
    renamed: &PossiblyRenamedSet,
    options: &SyncOptions,
    cancel: &CancelToken,
    handoff_tx: HandoffTx,
) -> Result<()>
where
    F: FnOnce(&mut Processor<'_>, &FolderDone<'_>) -> Result<()> + Send,
{
    let baseline = options.last_sync;
    let cfd = options.cfd;

    let mut store = move |so: StoredObject| -> Result<()> {
        if so.is_folder() && !so.relative_path.is_empty() {
            // A rename bumps the directory's ctime without touching its
            // mtime; anything under a suspect gets fully re-enumerated.
            if cfd != CfdMode::TargetCompare {
                if let (Some(baseline), Some(ctime)) = (baseline, so.last_changed) {
                    if ctime > baseline {
                        debug!("{} may have been renamed", so.relative_path);
                        renamed.insert(so.relative_path.clone());
                    }
                }
            }
            let mut own = so.clone();
            own.relative_path =
                join_relative(&so.relative_path, crate::index::DUMMY_CHILD);
            index.store(own, cancel)?;
        }
        index.store(so, cancel)
    };

    let handoff = move |rel: &str| -> Result<()> {
        handoff_tx.enqueue(rel);
        Ok(())
    };

    source(&mut store, &handoff)
    // `handoff` (and the queue's sender with it) drops here, which is the
    // close signal the comparator loop ends on.
}

enum Change {
    Data,
    Metadata,
    Nothing,
}

struct Comparator<'a, 'd> {
    index: &'a FolderIndex,
    renamed: &'a PossiblyRenamedSet,
    options: &'a SyncOptions,
    target: &'a dyn TargetLister,
    decisions: &'a mut DecisionSink<'d>,
    summary: SyncSummary,
}

impl Comparator<'_, '_> {
    fn process_folder(&mut self, dir: &str) -> Result<()> {
        let dir_entry = self.index.get_directory(dir);

        if !self.must_enumerate(dir, dir_entry.as_ref()) {
            return self.fast_path(dir);
        }

        match self.target.list_folder(dir)? {
            None => {
                // Nothing on the destination: everything here is new.
                for (_, so) in sorted(self.index.drain(dir)) {
                    self.emit(Decision::Copy(so))?;
                }
            }
            Some(children) => {
                let mut slice = self.index.drain(dir);
                slice.remove(SELF_CHILD);

                for t in children {
                    match slice.remove(&self.index.child_key(&t.name)) {
                        None => {
                            if self.deletes_enabled() {
                                self.emit(Decision::Delete(t))?;
                            } else {
                                self.summary.skipped += 1;
                            }
                        }
                        Some(s) => self.decide_pair(s, t)?,
                    }
                }

                // Whatever's left never matched a destination child.
                for (_, so) in sorted(slice) {
                    self.emit(Decision::Copy(so))?;
                }
            }
        }
        Ok(())
    }

    /// Can we get away without listing the destination directory?
    fn must_enumerate(&self, dir: &str, dir_entry: Option<&StoredObject>) -> bool {
        if self.options.cfd == CfdMode::TargetCompare {
            return true;
        }
        // Extras can only be found by looking.
        if self.deletes_enabled() {
            return true;
        }
        if self.renamed.has_ancestor_in(dir) {
            return true;
        }
        let Some(baseline) = self.options.last_sync else {
            return true;
        };
        // An unchanged directory ctime means the same name set as last
        // sync, so per-file times are enough to decide.
        let dir_unchanged = matches!(
            dir_entry.and_then(|d| d.last_changed),
            Some(ctime) if ctime <= baseline
        );
        if !dir_unchanged {
            return true;
        }
        // In pure-ctime mode, a quiet directory can skip wholesale.
        self.options.cfd == CfdMode::Ctime && self.index.files_changed_in(dir, baseline)
    }

    /// Decide from source times alone; the destination isn't listed.
    fn fast_path(&mut self, dir: &str) -> Result<()> {
        let baseline = self
            .options
            .last_sync
            .expect("fast path only runs with a baseline");

        let mut slice = self.index.drain(dir);
        slice.remove(SELF_CHILD);
        for (_, so) in sorted(slice) {
            if so.is_folder() {
                self.summary.skipped += 1;
                continue;
            }
            let mtime_past = so.last_modified.is_some_and(|t| t > baseline);
            let ctime_past = so.last_changed.is_some_and(|t| t > baseline);
            match self.options.cfd {
                CfdMode::CtimeMtime if mtime_past => self.emit(Decision::Copy(so))?,
                CfdMode::CtimeMtime if ctime_past && self.options.metadata_only_sync => {
                    self.emit(Decision::MetadataOnly(so))?
                }
                // Pure-ctime fast path only runs when nothing changed.
                _ => self.summary.skipped += 1,
            }
        }
        Ok(())
    }

    fn decide_pair(&mut self, s: StoredObject, t: StoredObject) -> Result<()> {
        if self.renamed.has_ancestor_in(&s.relative_path) {
            return self.emit(Decision::Copy(s));
        }

        if s.is_folder() || t.is_folder() {
            if s.is_folder() != t.is_folder() {
                // A file became a folder or vice versa; replace wholesale.
                if self.deletes_enabled() {
                    self.emit(Decision::Delete(t))?;
                }
                return self.emit(Decision::Copy(s));
            }
            let changed = self
                .options
                .last_sync
                .zip(s.last_changed)
                .is_some_and(|(baseline, ctime)| ctime > baseline);
            if self.options.metadata_only_sync && changed {
                return self.emit(Decision::MetadataOnly(s));
            }
            self.summary.skipped += 1;
            return Ok(());
        }

        match self.change_for_pair(&s, &t) {
            Change::Data => self.emit(Decision::Copy(s)),
            Change::Metadata if self.options.metadata_only_sync => {
                self.emit(Decision::MetadataOnly(s))
            }
            Change::Metadata | Change::Nothing => {
                self.summary.skipped += 1;
                Ok(())
            }
        }
    }

    fn change_for_pair(&self, s: &StoredObject, t: &StoredObject) -> Change {
        let newer_than_target = match (s.last_modified, t.last_modified) {
            (Some(source), Some(target)) => source > target,
            // Can't verify; moving the data is the safe answer.
            _ => true,
        };
        let baseline = self.options.last_sync;
        let ctime_past = baseline
            .zip(s.last_changed)
            .is_some_and(|(baseline, ctime)| ctime > baseline);

        match self.options.cfd {
            CfdMode::TargetCompare => {
                if newer_than_target || s.size != t.size {
                    Change::Data
                } else if metadata_differs(s, t) {
                    Change::Metadata
                } else {
                    Change::Nothing
                }
            }
            CfdMode::CtimeMtime => {
                if newer_than_target {
                    Change::Data
                } else if ctime_past {
                    Change::Metadata
                } else {
                    Change::Nothing
                }
            }
            CfdMode::Ctime => {
                if !ctime_past {
                    Change::Nothing
                } else if newer_than_target || s.size != t.size {
                    Change::Data
                } else {
                    Change::Metadata
                }
            }
        }
    }

    fn deletes_enabled(&self) -> bool {
        self.options.delete_destination != DeleteDestination::False
    }

    fn emit(&mut self, decision: Decision) -> Result<()> {
        match &decision {
            Decision::Copy(so) => {
                self.summary.copied += 1;
                self.summary.copied_bytes += so.size;
            }
            Decision::MetadataOnly(_) => self.summary.metadata_only += 1,
            Decision::Delete(_) => self.summary.deleted += 1,
        }
        (self.decisions)(decision)
    }
}

fn sorted(
    slice: rustc_hash::FxHashMap<String, StoredObject>,
) -> impl Iterator<Item = (String, StoredObject)> {
    let mut entries: Vec<_> = slice
        .into_iter()
        .filter(|(child, _)| child != SELF_CHILD)
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.into_iter()
}

fn metadata_differs(s: &StoredObject, t: &StoredObject) -> bool {
    s.metadata != t.metadata || s.properties != t.properties || s.blob_tags != t.blob_tags
}

/// Destination lister over a local directory tree.
pub struct LocalTarget {
    root: Utf8PathBuf,
}

impl LocalTarget {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TargetLister for LocalTarget {
    fn list_folder(&self, rel: &str) -> Result<Option<Vec<StoredObject>>> {
        let dir = if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        };
        let entries = match dir.read_dir_utf8() {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::from(e)
                    .context(format!("Couldn't list destination {dir}")));
            }
        };

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if sidecar::is_sidecar_name(name) {
                continue;
            }
            let meta = entry.path().symlink_metadata()?;
            let entity = if meta.is_dir() {
                EntityType::Folder
            } else {
                EntityType::File
            };
            let mut so = StoredObject::new(entity, join_relative(rel, name));
            if entity == EntityType::File {
                so.size = meta.len();
            }
            so.last_modified = meta.modified().ok().and_then(|t| Timestamp::try_from(t).ok());
            children.push(so);
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(children))
    }
}

/// Destination lister over an object-store prefix.
pub struct StoreTarget<'a> {
    client: &'a dyn StoreClient,
    container: String,
    /// `""` or `/`-terminated.
    prefix: String,
}

impl<'a> StoreTarget<'a> {
    pub fn new(
        client: &'a dyn StoreClient,
        container: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self {
            client,
            container: container.into(),
            prefix,
        }
    }
}

impl TargetLister for StoreTarget<'_> {
    fn list_folder(&self, rel: &str) -> Result<Option<Vec<StoredObject>>> {
        let dir_prefix = if rel.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}{}/", self.prefix, rel)
        };

        let mut children = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self.client.list(
                &self.container,
                &dir_prefix,
                true,
                marker.as_deref(),
                ListInclude::default(),
            )?;
            for summary in page.objects {
                if summary.key == dir_prefix {
                    continue;
                }
                let name = summary.key.strip_prefix(&dir_prefix).unwrap_or(&summary.key);
                let entity = if summary
                    .metadata
                    .get(crate::object::FOLDER_STUB_KEY)
                    .is_some_and(|v| v.eq_ignore_ascii_case("true"))
                {
                    EntityType::Folder
                } else {
                    EntityType::File
                };
                let mut so = StoredObject::new(entity, join_relative(rel, name));
                so.size = summary.size;
                so.last_modified = summary.last_modified;
                so.metadata = summary.metadata;
                so.properties = summary.properties;
                so.blob_type = summary.blob_type;
                so.container = Some(self.container.clone());
                children.push(so);
            }
            for prefix in page.prefixes {
                let name = prefix
                    .strip_prefix(&dir_prefix)
                    .unwrap_or(&prefix)
                    .trim_end_matches('/');
                // A virtual directory may coexist with a stub object of the
                // same name; the stub already produced a Folder above.
                if children
                    .iter()
                    .any(|c| c.name == name && c.entity_type == EntityType::Folder)
                {
                    continue;
                }
                children.push(StoredObject::new(
                    EntityType::Folder,
                    join_relative(rel, name),
                ));
            }
            match page.next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        if children.is_empty() && !rel.is_empty() {
            // Distinguish "empty" from "absent": an empty virtual directory
            // without even a stub doesn't exist.
            let stub = self
                .client
                .head(&self.container, dir_prefix.trim_end_matches('/'))?;
            if stub.is_none() {
                return Ok(None);
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(children))
    }
}

/// Destination lister over a file share.
pub struct ShareTarget<'a> {
    client: &'a dyn ShareClient,
    share: String,
    /// `""` for the share root.
    root: String,
}

impl<'a> ShareTarget<'a> {
    pub fn new(
        client: &'a dyn ShareClient,
        share: impl Into<String>,
        root: impl Into<String>,
    ) -> Self {
        Self {
            client,
            share: share.into(),
            root: root.into(),
        }
    }
}

impl TargetLister for ShareTarget<'_> {
    fn list_folder(&self, rel: &str) -> Result<Option<Vec<StoredObject>>> {
        let dir = join_relative(&self.root, rel);
        if self.client.stat(&self.share, &dir)?.is_none() {
            return Ok(None);
        }
        let mut children = Vec::new();
        for entry in self.client.list_dir(&self.share, &dir)? {
            let mut so = StoredObject::new(entry.entity_type, join_relative(rel, &entry.name));
            so.size = entry.size;
            so.last_modified = entry.last_modified;
            so.last_changed = entry.last_changed;
            so.metadata = entry.metadata;
            so.properties = entry.properties;
            children.push(so);
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(children))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ts(second: i64) -> Timestamp {
        Timestamp::from_second(second).unwrap()
    }

    fn file(rel: &str, size: u64, mtime: i64) -> StoredObject {
        let mut so = StoredObject::new(EntityType::File, rel);
        so.size = size;
        so.last_modified = Some(ts(mtime));
        so.last_changed = Some(ts(mtime));
        so
    }

    struct NoTarget;
    impl TargetLister for NoTarget {
        fn list_folder(&self, _rel: &str) -> Result<Option<Vec<StoredObject>>> {
            Ok(None)
        }
    }

    fn comparator_options(cfd: CfdMode, last_sync: i64) -> SyncOptions {
        SyncOptions {
            cfd,
            last_sync: Some(ts(last_sync)),
            delete_destination: DeleteDestination::True,
            metadata_only_sync: false,
            max_index_bytes: 0,
            case_insensitive_destination: false,
        }
    }

    fn decide(options: &SyncOptions, s: StoredObject, t: StoredObject) -> Vec<Decision> {
        let index = FolderIndex::new(0, false);
        let renamed = PossiblyRenamedSet::default();
        let target = NoTarget;
        let mut out = Vec::new();
        let mut sink = |d: Decision| {
            out.push(d);
            Ok(())
        };
        let mut comparator = Comparator {
            index: &index,
            renamed: &renamed,
            options,
            target: &target,
            decisions: &mut sink,
            summary: SyncSummary::default(),
        };
        comparator.decide_pair(s, t).unwrap();
        out
    }

    #[test]
    fn ctime_mtime_trusts_target_times_for_pairs() {
        let options = comparator_options(CfdMode::CtimeMtime, 150);

        // Source older than the destination's copy: leave it be.
        assert_eq!(decide(&options, file("x", 1, 100), file("x", 1, 200)), []);
        // Source newer than the destination's copy: move it.
        assert_eq!(
            decide(&options, file("y", 1, 100), file("y", 1, 50)),
            [Decision::Copy(file("y", 1, 100))]
        );
    }

    #[test]
    fn target_compare_checks_sizes_too() {
        let options = comparator_options(CfdMode::TargetCompare, 0);
        assert_eq!(
            decide(&options, file("f", 10, 100), file("f", 11, 100)),
            [Decision::Copy(file("f", 10, 100))]
        );
        assert_eq!(decide(&options, file("f", 10, 100), file("f", 10, 100)), []);
    }

    #[test]
    fn ctime_gate_skips_untouched_files() {
        let options = comparator_options(CfdMode::Ctime, 150);
        // ctime 100 <= baseline 150: don't even compare attributes.
        assert_eq!(decide(&options, file("f", 10, 100), file("f", 99, 0)), []);
        // ctime past the baseline and sizes differ: data changed.
        assert_eq!(
            decide(&options, file("f", 10, 200), file("f", 99, 300)),
            [Decision::Copy(file("f", 10, 200))]
        );
    }

    #[test]
    fn metadata_only_needs_the_flag() {
        let mut options = comparator_options(CfdMode::CtimeMtime, 150);
        // ctime past baseline, data not newer than target.
        let mut s = file("f", 1, 100);
        s.last_changed = Some(ts(200));
        assert_eq!(decide(&options, s.clone(), file("f", 1, 100)), []);

        options.metadata_only_sync = true;
        assert_eq!(
            decide(&options, s.clone(), file("f", 1, 100)),
            [Decision::MetadataOnly(s)]
        );
    }
}
