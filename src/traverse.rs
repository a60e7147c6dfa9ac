//! The uniform contract every backend traverser realizes, and the walk
//! plumbing they share.
//!
//! Backends fan out across a worker pool but deliver through a single
//! consumer, so the processor sees objects in production order and a
//! directory's folder entry always lands before its children.

use anyhow::Result;
use crossbeam_channel::{Sender, unbounded};
use jiff::Timestamp;
use tracing::warn;

use crate::counters::{self, Op};
use crate::filter::{self, ObjectFilter};
use crate::location::Location;
use crate::object::StoredObject;
use crate::pool::{self, CancelToken, Enqueue};

pub mod account;
pub mod local;
pub mod share;
pub mod store;
pub mod versions;

/// Applied once to every object at production time, before filtering
/// (e.g. stamping the container an account-level traversal is inside).
pub type Preprocessor<'a> = dyn Fn(&mut StoredObject) + Sync + 'a;

/// Receives every object that survives the filter chain, in production
/// order. `Send` because the hash sidecar engine may call it from a worker.
pub type Processor<'a> = dyn FnMut(StoredObject) -> Result<()> + Send + 'a;

/// Called once per directory, after all of its children have been delivered.
/// This is the sync handoff point.
pub type FolderDone<'a> = dyn Fn(&str) -> Result<()> + Sync + 'a;

pub trait Traverser {
    /// For destinations this is a syntactic check; for sources it may cost
    /// one remote probe and a one-page listing.
    fn is_directory(&self, as_source: bool) -> Result<bool>;

    /// Walk the resource, pushing everything that passes `filters` through
    /// `processor`. Returns when enumeration completes, is cancelled, or
    /// hits a fatal error; per-entry failures go to the error channel.
    fn traverse(
        &self,
        preprocessor: Option<&Preprocessor<'_>>,
        processor: &mut Processor<'_>,
        filters: &[Box<dyn ObjectFilter>],
    ) -> Result<()>;
}

/// One non-fatal per-entry failure. Enumeration continues past these.
#[derive(Debug, Clone)]
pub struct EnumerationFailure {
    pub full_path: String,
    pub name: String,
    pub size: u64,
    pub last_modified: Option<Timestamp>,
    pub is_dir: bool,
    pub message: String,
    pub location: Location,
}

/// Report on the error channel when there is one, otherwise just log.
pub(crate) fn report_failure(
    errors: Option<&Sender<EnumerationFailure>>,
    failure: EnumerationFailure,
) {
    match errors {
        Some(tx) => {
            let _ = tx.send(failure);
        }
        None => warn!(
            "skipping {}: {} ({:?})",
            failure.full_path, failure.message, failure.location
        ),
    }
}

/// Run the preprocessor and the filter chain, then hand off to `sink`.
pub(crate) fn deliver(
    preprocessor: Option<&Preprocessor<'_>>,
    filters: &[Box<dyn ObjectFilter>],
    sink: &mut dyn FnMut(StoredObject) -> Result<()>,
    mut so: StoredObject,
) -> Result<()> {
    counters::bump(Op::ObjectsEnumerated);
    if let Some(pre) = preprocessor {
        pre(&mut so);
    }
    if !filter::passes(filters, &so) {
        counters::bump(Op::ObjectsFiltered);
        return Ok(());
    }
    sink(so)
}

/// What walk workers push toward the consumer.
pub(crate) enum Walked {
    Object(StoredObject),
    FolderDone(String),
}

/// The worker side of the walk channel.
pub(crate) struct WalkSink<'a> {
    tx: &'a Sender<Walked>,
}

impl WalkSink<'_> {
    pub fn object(&self, so: StoredObject) {
        let _ = self.tx.send(Walked::Object(so));
    }

    pub fn folder_done(&self, relative: String) {
        let _ = self.tx.send(Walked::FolderDone(relative));
    }
}

/// Fan `list_one` out over a worker pool while this thread consumes the
/// results in channel order. The ordering argument: a worker sends a
/// directory's own object before enqueueing its job, and one worker lists
/// one directory, so the single consumer always sees a folder before its
/// children and `FolderDone` after them.
pub(crate) fn drive<J, F>(
    workers: usize,
    seed: Vec<J>,
    cancel: &CancelToken,
    list_one: F,
    sink: &mut dyn FnMut(StoredObject) -> Result<()>,
    folder_done: Option<&FolderDone<'_>>,
) -> Result<()>
where
    J: Send,
    F: Fn(J, &Enqueue<'_, J>, &WalkSink<'_>) -> Result<()> + Sync,
{
    let (out_tx, out_rx) = unbounded();

    std::thread::scope(|s| {
        let list_one = &list_one;
        let walker = s.spawn(move || {
            pool::run_queue(workers, seed, cancel, |job, enqueue| {
                list_one(job, enqueue, &WalkSink { tx: &out_tx })
            })
            // out_tx drops here, ending the consumer loop below.
        });

        let mut consumed = Ok(());
        for msg in out_rx.iter() {
            let step = match msg {
                Walked::Object(so) => sink(so),
                Walked::FolderDone(rel) => match folder_done {
                    Some(f) => f(&rel),
                    None => Ok(()),
                },
            };
            if let Err(e) = step {
                // Sends are unbounded, so the walker can't block; cancelling
                // makes it drain quickly.
                cancel.cancel();
                consumed = Err(e);
                break;
            }
        }

        let walked = walker.join().unwrap();
        consumed.and(walked)
    })
}
