//! Traverse a file share, where directories are first-class.
//!
//! This mirrors the local walk: list a directory, recurse into its
//! subdirectories, and always emit a folder before its children so the
//! sync indexer's ordering contract holds.

use anyhow::{Context, Result, bail};
use crossbeam_channel::Sender;
use tracing::warn;

use crate::counters::{self, Op};
use crate::filter::ObjectFilter;
use crate::location::Location;
use crate::object::{EntityType, StoredObject, join_relative, name_of};
use crate::pool::{CancelToken, Enqueue, enumeration_workers};
use crate::remote::{ShareClient, ShareEntry};
use crate::traverse::{
    self, EnumerationFailure, FolderDone, Preprocessor, Processor, Traverser, WalkSink, deliver,
    report_failure,
};

pub struct ShareTraverser<'a> {
    client: &'a dyn ShareClient,
    share: String,
    /// Directory or file path within the share; `""` is the share root.
    root: String,
    recursive: bool,
    workers: usize,
    cancel: CancelToken,
    errors: Option<Sender<EnumerationFailure>>,
}

struct DirJob {
    path: String,
    relative: String,
}

impl<'a> ShareTraverser<'a> {
    pub fn new(
        client: &'a dyn ShareClient,
        share: impl Into<String>,
        root: impl Into<String>,
    ) -> Self {
        Self {
            client,
            share: share.into(),
            root: root.into(),
            recursive: true,
            workers: enumeration_workers(),
            cancel: CancelToken::new(),
            errors: None,
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
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

    pub fn traverse_with_handoff(
        &self,
        preprocessor: Option<&Preprocessor<'_>>,
        processor: &mut Processor<'_>,
        filters: &[Box<dyn ObjectFilter>],
        folder_done: Option<&FolderDone<'_>>,
    ) -> Result<()> {
        let mut sink = |so: StoredObject| processor(so);
        let mut consumer = |so: StoredObject| deliver(preprocessor, filters, &mut sink, so);

        let root = self.root.trim_end_matches('/');
        let Some(entry) = self
            .client
            .stat(&self.share, root)
            .with_context(|| format!("Couldn't stat {}/{root}", self.share))?
        else {
            bail!("{}/{root} doesn't exist", self.share);
        };

        if entry.entity_type != EntityType::Folder {
            let mut so = self.object_from(&entry, String::new());
            so.name = entry.name.clone();
            return consumer(so);
        }

        let mut root_so = self.object_from(&entry, String::new());
        root_so.name = if root.is_empty() {
            self.share.clone()
        } else {
            name_of(root).to_owned()
        };
        consumer(root_so)?;

        let seed = vec![DirJob {
            path: root.to_owned(),
            relative: String::new(),
        }];
        traverse::drive(
            self.workers,
            seed,
            &self.cancel,
            |job, enqueue, out| self.list_one(job, enqueue, out),
            &mut consumer,
            folder_done,
        )
    }

    fn list_one(
        &self,
        job: DirJob,
        enqueue: &Enqueue<'_, DirJob>,
        out: &WalkSink<'_>,
    ) -> Result<()> {
        counters::bump(Op::DirsListed);

        let entries = match self.client.list_dir(&self.share, &job.path) {
            Ok(entries) => entries,
            Err(e) => {
                self.report(&job.path, true, &format!("{e:#}"));
                out.folder_done(job.relative);
                return Ok(());
            }
        };

        for entry in entries {
            let relative = join_relative(&job.relative, &entry.name);
            match entry.entity_type {
                EntityType::Folder => {
                    if !self.recursive {
                        continue;
                    }
                    out.object(self.object_from(&entry, relative.clone()));
                    enqueue.push(DirJob {
                        path: join_relative(&job.path, &entry.name),
                        relative,
                    });
                }
                EntityType::Other => {
                    warn!(
                        "{}/{} isn't a file, folder, or link; skipping it",
                        self.share, relative
                    );
                }
                _ => out.object(self.object_from(&entry, relative)),
            }
        }

        out.folder_done(job.relative);
        Ok(())
    }

    fn object_from(&self, entry: &ShareEntry, relative: String) -> StoredObject {
        let mut so = StoredObject::new(entry.entity_type, relative);
        so.size = entry.size;
        so.last_modified = entry.last_modified;
        so.last_changed = entry.last_changed;
        so.properties = entry.properties.clone();
        so.metadata = entry.metadata.clone();
        so.container = Some(self.share.clone());
        so
    }

    fn report(&self, path: &str, is_dir: bool, message: &str) {
        report_failure(
            self.errors.as_ref(),
            EnumerationFailure {
                full_path: format!("{}/{path}", self.share),
                name: name_of(path).to_owned(),
                size: 0,
                last_modified: None,
                is_dir,
                message: message.to_owned(),
                location: Location::Share,
            },
        );
    }
}

impl Traverser for ShareTraverser<'_> {
    fn is_directory(&self, as_source: bool) -> Result<bool> {
        if self.root.is_empty() || self.root.ends_with('/') {
            return Ok(true);
        }
        if !as_source {
            return Ok(false);
        }
        let entry = self
            .client
            .stat(&self.share, self.root.trim_end_matches('/'))?;
        Ok(entry.is_some_and(|e| e.entity_type == EntityType::Folder))
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
