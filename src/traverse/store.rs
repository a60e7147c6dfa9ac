//! Traverse an object-store container: flat pages or a parallel
//! hierarchical crawl over `/`-delimited virtual directories.
//!
//! Object stores don't really have directories, so this is where the fakery
//! gets handled: stub objects that mark folders, phantom files named after
//! folders, and blobs whose name *is* the search prefix plus a slash.

use std::collections::BTreeSet;
use std::sync::Once;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::counters::{self, Op};
use crate::filter::{self, ObjectFilter};
use crate::location::Location;
use crate::object::{EntityType, ROOT_TRAILING_SLASH, StoredObject, name_of};
use crate::pool::{CancelToken, Enqueue, enumeration_workers};
use crate::remote::{ListInclude, ObjectSummary, StoreClient};
use crate::traverse::{
    self, EnumerationFailure, FolderDone, Preprocessor, Processor, Traverser, WalkSink, deliver,
    report_failure,
};

static SERIAL_LISTING_WARNING: Once = Once::new();

pub struct StoreTraverser<'a> {
    client: &'a dyn StoreClient,
    container: String,
    /// Object-path portion of the root, wildcards already stripped.
    /// `""` means the whole container.
    prefix: String,
    recursive: bool,
    include: ListInclude,
    include_stubs: bool,
    preserve_tags: bool,
    workers: usize,
    cancel: CancelToken,
    errors: Option<Sender<EnumerationFailure>>,
}

struct DirJob {
    /// Listing prefix for one virtual directory; empty or `/`-terminated.
    prefix: String,
}

impl<'a> StoreTraverser<'a> {
    pub fn new(
        client: &'a dyn StoreClient,
        container: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            client,
            container: container.into(),
            prefix: prefix.into(),
            recursive: true,
            include: ListInclude::default(),
            include_stubs: false,
            preserve_tags: false,
            workers: enumeration_workers(),
            cancel: CancelToken::new(),
            errors: None,
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn include(mut self, include: ListInclude) -> Self {
        self.include = include;
        self
    }

    pub fn include_directory_stubs(mut self, include_stubs: bool) -> Self {
        self.include_stubs = include_stubs;
        self
    }

    pub fn preserve_tags(mut self, preserve_tags: bool) -> Self {
        self.preserve_tags = preserve_tags;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn error_channel(mut self, errors: Sender<EnumerationFailure>) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Like [`Traverser::traverse`], plus the sync handoff hook. The hook
    /// forces the hierarchical crawl; it's meaningless for flat pages.
    pub fn traverse_with_handoff(
        &self,
        preprocessor: Option<&Preprocessor<'_>>,
        processor: &mut Processor<'_>,
        filters: &[Box<dyn ObjectFilter>],
        folder_done: Option<&FolderDone<'_>>,
    ) -> Result<()> {
        let mut sink = |so: StoredObject| processor(so);
        let mut consumer = |so: StoredObject| deliver(preprocessor, filters, &mut sink, so);

        // Narrow the listing when the filter chain implies a prefix.
        let hint = filter::narrowest_prefix(filters).unwrap_or("");

        let dir_root = match self.resolve_root(&mut consumer)? {
            Some(dir_root) => dir_root,
            // The root was a single object; we already emitted it.
            None => return Ok(()),
        };

        if self.include.any() {
            // Deleted/snapshot/version fan-out only makes sense in the order
            // the service reports it, so no parallel crawl.
            SERIAL_LISTING_WARNING.call_once(|| {
                warn!("including deleted, snapshot, or version entries; listing serially");
            });
            return self.flat(&dir_root, hint, &mut consumer);
        }

        let seed = vec![DirJob {
            prefix: format!("{dir_root}{hint}"),
        }];
        let dir_root = dir_root.as_str();
        traverse::drive(
            self.workers,
            seed,
            &self.cancel,
            |job, enqueue, out| self.list_dir(dir_root, job, enqueue, out),
            &mut consumer,
            folder_done,
        )
    }

    /// Work out what the root is, emitting it when it's a lone object.
    /// Returns the directory prefix to crawl, or `None` for single objects.
    fn resolve_root(
        &self,
        consumer: &mut dyn FnMut(StoredObject) -> Result<()>,
    ) -> Result<Option<String>> {
        if self.prefix.is_empty() || self.prefix.ends_with('/') {
            let mut root = StoredObject::new(EntityType::Folder, "");
            root.name = if self.prefix.is_empty() {
                self.container.clone()
            } else {
                name_of(self.prefix.trim_end_matches('/')).to_owned()
            };
            root.container = Some(self.container.clone());
            consumer(root)?;
            return Ok(Some(self.prefix.clone()));
        }

        // `dir` vs `dir/`: try the flat name, then the slashed one.
        let flat = self
            .client
            .head(&self.container, &self.prefix)
            .with_context(|| format!("Couldn't probe {}", self.prefix))?;
        counters::bump(Op::StubProbes);
        match flat {
            Some(summary) if !is_stub(&summary) => {
                // Root-as-blob: emit exactly that object and we're done.
                let mut so = self.finish_object(summary, String::new())?;
                so.name = name_of(&self.prefix).to_owned();
                consumer(so)?;
                return Ok(None);
            }
            Some(summary) => {
                // A stub marking the directory itself.
                let mut so = self.object_from(summary, String::new());
                so.entity_type = EntityType::Folder;
                so.name = name_of(&self.prefix).to_owned();
                consumer(so)?;
            }
            None => {
                let slashed = format!("{}/", self.prefix);
                if let Some(summary) = self
                    .client
                    .head(&self.container, &slashed)
                    .with_context(|| format!("Couldn't probe {slashed}"))?
                {
                    // A blob literally named `dir/`: hand it through with
                    // the sentinel so downstream knows about the slash.
                    let so = self.object_from(summary, ROOT_TRAILING_SLASH.to_owned());
                    consumer(so)?;
                } else {
                    let mut root = StoredObject::new(EntityType::Folder, "");
                    root.name = name_of(&self.prefix).to_owned();
                    root.container = Some(self.container.clone());
                    consumer(root)?;
                }
            }
        }
        Ok(Some(format!("{}/", self.prefix)))
    }

    /// One flat, serial pass over everything under the prefix.
    fn flat(
        &self,
        dir_root: &str,
        hint: &str,
        consumer: &mut dyn FnMut(StoredObject) -> Result<()>,
    ) -> Result<()> {
        let prefix = format!("{dir_root}{hint}");
        let mut marker: Option<String> = None;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let page = self
                .client
                .list(
                    &self.container,
                    &prefix,
                    false,
                    marker.as_deref(),
                    self.include,
                )
                .with_context(|| format!("Couldn't list {prefix}"))?;
            counters::bump(Op::DirsListed);

            for summary in page.objects {
                let relative = self.relative_of(dir_root, &summary.key);
                if relative != ROOT_TRAILING_SLASH && !self.recursive && relative.contains('/') {
                    continue;
                }
                let stub = is_stub(&summary);
                if stub && !self.include_stubs {
                    continue;
                }
                let mut so = self.finish_object(summary, relative)?;
                if stub {
                    so.entity_type = EntityType::Folder;
                }
                consumer(so)?;
            }
            match page.next {
                Some(next) => marker = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// List one virtual directory, emitting its children and queueing its
    /// subdirectories.
    fn list_dir(
        &self,
        dir_root: &str,
        job: DirJob,
        enqueue: &Enqueue<'_, DirJob>,
        out: &WalkSink<'_>,
    ) -> Result<()> {
        counters::bump(Op::DirsListed);

        // Gather the whole directory before emitting: stub resolution needs
        // to see the prefixes next to the objects.
        let mut objects = Vec::new();
        let mut prefixes = BTreeSet::new();
        let mut marker: Option<String> = None;
        loop {
            let page = match self.client.list(
                &self.container,
                &job.prefix,
                true,
                marker.as_deref(),
                ListInclude::default(),
            ) {
                Ok(page) => page,
                Err(e) => {
                    self.report(&job.prefix, true, &format!("{e:#}"));
                    out.folder_done(self.dir_relative(dir_root, &job.prefix));
                    return Ok(());
                }
            };
            objects.extend(page.objects);
            prefixes.extend(page.prefixes);
            match page.next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        for summary in objects {
            if summary.key == job.prefix {
                // A marker blob named like the directory we're listing;
                // the directory itself was already emitted.
                debug!("skipping marker object {}", summary.key);
                continue;
            }
            let relative = self.relative_of(dir_root, &summary.key);
            if is_stub(&summary) {
                if prefixes.contains(&format!("{}/", summary.key)) {
                    // A sibling prefix wins; don't emit a phantom file.
                    debug!("preferring prefix over stub {}", summary.key);
                } else if self.include_stubs {
                    let mut so = self.finish_object(summary, relative.clone())?;
                    so.entity_type = EntityType::Folder;
                    out.object(so);
                    // A childless directory is complete the moment it's
                    // seen; hand it off right away.
                    out.folder_done(relative);
                }
                continue;
            }
            let so = self.finish_object(summary, relative)?;
            out.object(so);
        }

        for prefix in prefixes {
            let trimmed = prefix.trim_end_matches('/');
            let relative = self.relative_of(dir_root, trimmed);
            if !self.recursive {
                continue;
            }
            let so = match self.probe_folder(trimmed, &prefix)? {
                Some(summary) => {
                    let mut so = self.object_from(summary, relative);
                    so.entity_type = EntityType::Folder;
                    so
                }
                None => {
                    // A pure virtual prefix; synthesize the folder.
                    let mut so = StoredObject::new(EntityType::Folder, relative);
                    so.container = Some(self.container.clone());
                    so
                }
            };
            out.object(so);
            enqueue.push(DirJob { prefix });
        }

        out.folder_done(self.dir_relative(dir_root, &job.prefix));
        Ok(())
    }

    /// Probe `foo` then `foo/` for a stub carrying the folder's properties.
    fn probe_folder(&self, trimmed: &str, slashed: &str) -> Result<Option<ObjectSummary>> {
        if !self.include_stubs {
            return Ok(None);
        }
        counters::bump(Op::StubProbes);
        for candidate in [trimmed, slashed] {
            if let Some(summary) = self.client.head(&self.container, candidate)? {
                if is_stub(&summary) {
                    return Ok(Some(summary));
                }
            }
        }
        Ok(None)
    }

    fn relative_of(&self, dir_root: &str, key: &str) -> String {
        if key == dir_root {
            return ROOT_TRAILING_SLASH.to_owned();
        }
        key.strip_prefix(dir_root).unwrap_or(key).to_owned()
    }

    fn dir_relative(&self, dir_root: &str, prefix: &str) -> String {
        if prefix == dir_root {
            return String::new();
        }
        prefix
            .strip_prefix(dir_root)
            .unwrap_or(prefix)
            .trim_end_matches('/')
            .to_owned()
    }

    fn object_from(&self, summary: ObjectSummary, relative: String) -> StoredObject {
        let mut so = StoredObject::new(EntityType::File, relative);
        so.size = summary.size;
        so.last_modified = summary.last_modified;
        so.properties = summary.properties;
        so.metadata = summary.metadata;
        so.blob_type = summary.blob_type;
        so.access_tier = summary.access_tier;
        so.version_id = summary.version_id;
        so.snapshot_id = summary.snapshot_id;
        so.deleted = summary.deleted;
        so.container = Some(self.container.clone());
        so
    }

    /// Build the full stored object, fetching tags only when asked to.
    fn finish_object(&self, summary: ObjectSummary, relative: String) -> Result<StoredObject> {
        let key = summary.key.clone();
        let mut so = self.object_from(summary, relative);
        if self.preserve_tags {
            so.blob_tags = self
                .client
                .tags(&self.container, &key)
                .with_context(|| format!("Couldn't fetch tags for {key}"))?;
        }
        Ok(so)
    }

    fn report(&self, path: &str, is_dir: bool, message: &str) {
        report_failure(
            self.errors.as_ref(),
            EnumerationFailure {
                full_path: format!("{}/{}", self.container, path),
                name: name_of(path.trim_end_matches('/')).to_owned(),
                size: 0,
                last_modified: None,
                is_dir,
                message: message.to_owned(),
                location: Location::Store,
            },
        );
    }
}

impl Traverser for StoreTraverser<'_> {
    fn is_directory(&self, as_source: bool) -> Result<bool> {
        if self.prefix.is_empty() || self.prefix.ends_with('/') {
            return Ok(true);
        }
        if !as_source {
            // Destinations get the syntactic answer only.
            return Ok(false);
        }
        if let Some(summary) = self.client.head(&self.container, &self.prefix)? {
            return Ok(is_stub(&summary));
        }
        // One page tells us whether anything lives under `prefix/`.
        let page = self.client.list(
            &self.container,
            &format!("{}/", self.prefix),
            true,
            None,
            ListInclude::default(),
        )?;
        Ok(!page.objects.is_empty() || !page.prefixes.is_empty())
    }

    fn traverse(
        &self,
        preprocessor: Option<&Preprocessor<'_>>,
        processor: &mut Processor<'_>,
        filters: &[Box<dyn ObjectFilter>],
    ) -> Result<()> {
        self.traverse_with_handoff(preprocessor, processor, filters, None)
    }
}

fn is_stub(summary: &ObjectSummary) -> bool {
    summary
        .metadata
        .get(crate::object::FOLDER_STUB_KEY)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
