//! Walk a local filesystem tree.
//!
//! Recursive walks fan out over a worker pool; delivery still happens on
//! one thread, in listing order, folders before their children. Symlink,
//! hardlink, and special-file policy lives here too.

use std::fs::Metadata;
use std::sync::Mutex;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::Sender;
use jiff::Timestamp;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::config::{HardlinkHandling, SymlinkHandling};
use crate::counters::{self, Op};
use crate::errors::Error;
use crate::filter::ObjectFilter;
use crate::location::Location;
use crate::object::{EntityType, StoredObject, join_relative};
use crate::pool::{CancelToken, Enqueue, enumeration_workers};
use crate::sidecar::{self, HashMode};
use crate::traverse::{
    self, EnumerationFailure, FolderDone, Preprocessor, Processor, Traverser, WalkSink, deliver,
    report_failure,
};

/// Symlink chains longer than this are somebody's idea of a joke.
pub const MAX_SYMLINK_CHAIN: usize = 40;

pub struct LocalTraverser {
    root: Utf8PathBuf,
    recursive: bool,
    symlinks: SymlinkHandling,
    hardlinks: HardlinkHandling,
    hash_mode: HashMode,
    workers: usize,
    cancel: CancelToken,
    errors: Option<Sender<EnumerationFailure>>,
}

struct DirJob {
    absolute: Utf8PathBuf,
    relative: String,
}

impl LocalTraverser {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            recursive: true,
            symlinks: SymlinkHandling::None,
            hardlinks: HardlinkHandling::Follow,
            hash_mode: HashMode::None,
            workers: enumeration_workers(),
            cancel: CancelToken::new(),
            errors: None,
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn symlinks(mut self, handling: SymlinkHandling) -> Self {
        self.symlinks = handling;
        self
    }

    pub fn hardlinks(mut self, handling: HardlinkHandling) -> Self {
        self.hardlinks = handling;
        self
    }

    pub fn hash_mode(mut self, mode: HashMode) -> Self {
        self.hash_mode = mode;
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

    /// Like [`Traverser::traverse`], plus a per-directory completion hook
    /// for the sync handoff.
    pub fn traverse_with_handoff(
        &self,
        preprocessor: Option<&Preprocessor<'_>>,
        processor: &mut Processor<'_>,
        filters: &[Box<dyn ObjectFilter>],
        folder_done: Option<&FolderDone<'_>>,
    ) -> Result<()> {
        if self.hash_mode != HashMode::None && folder_done.is_some() {
            return Err(Error::ConfigurationInvalid(
                "background hashing and folder handoff don't mix".to_owned(),
            )
            .into());
        }
        match self.hash_mode {
            HashMode::None => {
                let mut sink = |so: StoredObject| processor(so);
                self.walk(preprocessor, filters, &mut sink, folder_done)
            }
            HashMode::MD5 => {
                sidecar::with_engine(self.hash_mode, &self.root, &self.cancel, processor, |agent| {
                    let mut sink = |so: StoredObject| agent.process(so);
                    self.walk(preprocessor, filters, &mut sink, None)
                })
            }
        }
    }

    fn stat_root(&self) -> Result<Metadata> {
        let meta = if self.symlinks == SymlinkHandling::Follow {
            self.root.metadata()
        } else {
            self.root.symlink_metadata()
        };
        // Failing to stat the root is the one local failure that's fatal.
        meta.with_context(|| format!("Couldn't stat {}", self.root))
    }

    fn walk(
        &self,
        preprocessor: Option<&Preprocessor<'_>>,
        filters: &[Box<dyn ObjectFilter>],
        sink: &mut dyn FnMut(StoredObject) -> Result<()>,
        folder_done: Option<&FolderDone<'_>>,
    ) -> Result<()> {
        let root_meta = self.stat_root()?;

        if root_meta.file_type().is_symlink() {
            // Only reachable when we're not following links.
            return match self.symlinks {
                SymlinkHandling::Preserve => {
                    let so = self.root_object(EntityType::Symlink, &root_meta);
                    deliver(preprocessor, filters, sink, so)
                }
                _ => {
                    warn!("{} is a symlink; skipping it", self.root);
                    Ok(())
                }
            };
        }

        if !root_meta.is_dir() {
            let so = self.root_object(EntityType::File, &root_meta);
            return deliver(preprocessor, filters, sink, so);
        }

        // Directories already descended into, so followed links can't loop.
        // Only directories go in, to bound memory by the directory count.
        let seen: Mutex<FxHashSet<Utf8PathBuf>> = Mutex::new(FxHashSet::default());
        if self.symlinks == SymlinkHandling::Follow {
            let canonical = self
                .root
                .canonicalize_utf8()
                .with_context(|| format!("Couldn't canonicalize {}", self.root))?;
            seen.lock().unwrap().insert(canonical);
        }

        let mut consumer = |so: StoredObject| deliver(preprocessor, filters, sink, so);

        // The root's own folder entry goes first, before any child.
        consumer(object_for(EntityType::Folder, String::new(), &root_meta))?;

        let seed = vec![DirJob {
            absolute: self.root.clone(),
            relative: String::new(),
        }];
        traverse::drive(
            self.workers,
            seed,
            &self.cancel,
            |job, enqueue, out| self.list_one(job, enqueue, out, &seen),
            &mut consumer,
            folder_done,
        )
    }

    fn list_one(
        &self,
        job: DirJob,
        enqueue: &Enqueue<'_, DirJob>,
        out: &WalkSink<'_>,
        seen: &Mutex<FxHashSet<Utf8PathBuf>>,
    ) -> Result<()> {
        counters::bump(Op::DirsListed);

        let entries = match job.absolute.read_dir_utf8() {
            Ok(entries) => entries,
            Err(e) => {
                self.report(&job.absolute, true, &e.to_string());
                out.folder_done(job.relative);
                return Ok(());
            }
        };

        // Sort so delivery order matches what a remote listing would give.
        let mut children = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => children.push(entry),
                Err(e) => self.report(&job.absolute, false, &e.to_string()),
            }
        }
        children.sort_by(|a, b| a.file_name().cmp(b.file_name()));

        for entry in children {
            let name = entry.file_name();
            if sidecar::is_sidecar_name(name) {
                continue;
            }
            let relative = join_relative(&job.relative, name);
            let path = entry.path();

            let meta = match path.symlink_metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    self.report(path, false, &e.to_string());
                    continue;
                }
            };
            let ft = meta.file_type();

            if ft.is_symlink() {
                match self.symlinks {
                    SymlinkHandling::None => debug!("skipping symlink {path}"),
                    SymlinkHandling::Preserve => {
                        out.object(object_for(EntityType::Symlink, relative, &meta));
                    }
                    SymlinkHandling::Follow => {
                        self.follow_symlink(path, relative, enqueue, out, seen);
                    }
                }
            } else if ft.is_dir() {
                if !self.recursive {
                    continue;
                }
                if self.symlinks == SymlinkHandling::Follow {
                    match path.canonicalize_utf8() {
                        Ok(canonical) => {
                            if !seen.lock().unwrap().insert(canonical) {
                                debug!("{path} was already reached through a link; skipping");
                                continue;
                            }
                        }
                        Err(e) => {
                            self.report(path, true, &e.to_string());
                            continue;
                        }
                    }
                }
                out.object(object_for(EntityType::Folder, relative.clone(), &meta));
                enqueue.push(DirJob {
                    absolute: entry.into_path(),
                    relative,
                });
            } else if is_special(&meta) {
                warn!("{path} is a device, socket, or FIFO; skipping it");
            } else if hard_link_count(&meta) > 1 {
                match self.hardlinks {
                    HardlinkHandling::Follow => {
                        warn!("{path} is a hard link; transferring it as a regular file");
                        out.object(object_for(EntityType::File, relative, &meta));
                    }
                    HardlinkHandling::Preserve => {
                        out.object(object_for(EntityType::Hardlink, relative, &meta));
                    }
                }
            } else {
                out.object(object_for(EntityType::File, relative, &meta));
            }
        }

        out.folder_done(job.relative);
        Ok(())
    }

    fn follow_symlink(
        &self,
        link: &Utf8Path,
        relative: String,
        enqueue: &Enqueue<'_, DirJob>,
        out: &WalkSink<'_>,
        seen: &Mutex<FxHashSet<Utf8PathBuf>>,
    ) {
        let target = match resolve_chain(link) {
            Ok(target) => target,
            Err(e) => {
                self.report(link, false, &format!("{e:#}"));
                return;
            }
        };
        let meta = match target.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                self.report(link, false, &e.to_string());
                return;
            }
        };

        if meta.is_dir() {
            let canonical = match target.canonicalize_utf8() {
                Ok(canonical) => canonical,
                Err(e) => {
                    self.report(link, true, &e.to_string());
                    return;
                }
            };
            if !seen.lock().unwrap().insert(canonical) {
                debug!("{link} points at a directory we already linked; skipping");
                return;
            }
            out.object(object_for(EntityType::Folder, relative.clone(), &meta));
            if self.recursive {
                enqueue.push(DirJob {
                    absolute: target,
                    relative,
                });
            }
        } else {
            out.object(object_for(EntityType::File, relative, &meta));
        }
    }

    fn root_object(&self, entity: EntityType, meta: &Metadata) -> StoredObject {
        let mut so = object_for(entity, String::new(), meta);
        so.name = self.root.file_name().unwrap_or_default().to_owned();
        so
    }

    fn report(&self, path: &Utf8Path, is_dir: bool, message: &str) {
        report_failure(
            self.errors.as_ref(),
            EnumerationFailure {
                full_path: path.to_string(),
                name: path.file_name().unwrap_or_default().to_owned(),
                size: 0,
                last_modified: None,
                is_dir,
                message: message.to_owned(),
                location: Location::Local,
            },
        );
    }
}

impl Traverser for LocalTraverser {
    fn is_directory(&self, as_source: bool) -> Result<bool> {
        let s = self.root.as_str();
        if s.ends_with('/') || s.ends_with('\\') {
            return Ok(true);
        }
        match self.stat_root() {
            Ok(meta) => Ok(meta.is_dir()),
            // A destination that doesn't exist yet is whatever its path
            // shape says; no trailing separator means file.
            Err(_) if !as_source => Ok(false),
            Err(e) => Err(e),
        }
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

/// Chase a chain of links to something real, giving up after
/// [`MAX_SYMLINK_CHAIN`] hops.
fn resolve_chain(link: &Utf8Path) -> Result<Utf8PathBuf> {
    let mut current = link.to_owned();
    for _ in 0..MAX_SYMLINK_CHAIN {
        let target = current
            .read_link_utf8()
            .with_context(|| format!("Couldn't read link {current}"))?;
        let resolved = if target.is_absolute() {
            target
        } else {
            current
                .parent()
                .unwrap_or(Utf8Path::new(""))
                .join(target)
        };
        let meta = resolved
            .symlink_metadata()
            .with_context(|| format!("Couldn't stat link target {resolved}"))?;
        if !meta.file_type().is_symlink() {
            return Ok(resolved);
        }
        current = resolved;
    }
    Err(Error::SymlinkChainTooDeep {
        path: link.to_string(),
        limit: MAX_SYMLINK_CHAIN,
    }
    .into())
}

fn object_for(entity: EntityType, relative: String, meta: &Metadata) -> StoredObject {
    let (last_modified, last_changed) = times(meta);
    let mut so = StoredObject::new(entity, relative);
    so.last_modified = last_modified;
    so.last_changed = last_changed;
    if entity == EntityType::File || entity == EntityType::Hardlink {
        so.size = meta.len();
    }
    so
}

#[cfg(unix)]
fn times(meta: &Metadata) -> (Option<Timestamp>, Option<Timestamp>) {
    use std::os::unix::fs::MetadataExt;
    (
        Timestamp::new(meta.mtime(), meta.mtime_nsec() as i32).ok(),
        Timestamp::new(meta.ctime(), meta.ctime_nsec() as i32).ok(),
    )
}

#[cfg(not(unix))]
fn times(meta: &Metadata) -> (Option<Timestamp>, Option<Timestamp>) {
    let lmt = meta
        .modified()
        .ok()
        .and_then(|t| Timestamp::try_from(t).ok());
    (lmt, None)
}

#[cfg(unix)]
fn hard_link_count(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink()
}

#[cfg(not(unix))]
fn hard_link_count(_meta: &Metadata) -> u64 {
    1
}

#[cfg(unix)]
fn is_special(meta: &Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    let ft = meta.file_type();
    ft.is_block_device() || ft.is_char_device() || ft.is_socket() || ft.is_fifo()
}

#[cfg(not(unix))]
fn is_special(_meta: &Metadata) -> bool {
    false
}
