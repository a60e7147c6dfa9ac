//! Content-hash sidecars: lazily hash local files with bounded parallelism
//! and keep the digest next to the data for reuse.
//!
//! A record is only trusted when its mode matches the requested one and its
//! LMT exactly equals the file's current LMT; anything else goes back
//! through the hashing queue.

use std::fs::File;
use std::io::Read;
use std::sync::Mutex;
use std::thread;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::bounded;
use jiff::Timestamp;
use md5::{Digest, Md5};
use serde_derive::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::counters::{self, Op};
use crate::object::{EntityType, StoredObject};
use crate::pool::{self, CancelToken};
use crate::traverse::Processor;

/// Suffix of the hidden sibling file a record is persisted to.
pub const SIDECAR_SUFFIX: &str = ".ferryhash";

/// Files queued for background hashing before the enqueuer blocks.
pub const HASH_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum HashMode {
    #[default]
    None,
    MD5,
}

/// What gets persisted next to the data.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub mode: HashMode,
    #[serde(with = "digest_base64")]
    pub digest: Vec<u8>,
    pub lmt: Timestamp,
}

impl SidecarRecord {
    /// Trustworthy iff the mode matches and the LMT is exactly the file's
    /// current one.
    pub fn is_valid(&self, mode: HashMode, current_lmt: Option<Timestamp>) -> bool {
        self.mode == mode && current_lmt.is_some_and(|lmt| lmt == self.lmt)
    }
}

/// The digest a stored object carries once the engine has vouched for it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HashData {
    pub mode: HashMode,
    pub digest: Vec<u8>,
}

mod digest_base64 {
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s.as_bytes()).map_err(D::Error::custom)
    }
}

/// Where `file`'s record lives: a hidden sibling.
pub fn sidecar_path(file: &Utf8Path) -> Utf8PathBuf {
    let name = file.file_name().unwrap_or_default();
    let sidecar = format!(".{name}{SIDECAR_SUFFIX}");
    match file.parent() {
        Some(dir) => dir.join(sidecar),
        None => Utf8PathBuf::from(sidecar),
    }
}

/// Traversers use this to keep our own droppings out of the enumeration.
pub fn is_sidecar_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(SIDECAR_SUFFIX)
}

/// Best-effort read; any failure just means "no usable record".
pub fn load(file: &Utf8Path) -> Option<SidecarRecord> {
    let path = sidecar_path(file);
    let s = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&s) {
        Ok(rec) => Some(rec),
        Err(e) => {
            trace!("Ignoring unreadable sidecar {path}: {e}");
            None
        }
    }
}

/// Persist a record next to its file, atomically: write a temporary sibling
/// and rename it into place.
pub fn store(file: &Utf8Path, record: &SidecarRecord) -> Result<()> {
    let path = sidecar_path(file);
    let dir = file.parent().unwrap_or(Utf8Path::new("."));
    let temp = tempfile::Builder::new()
        .prefix(".ferry-temp-")
        .tempfile_in(dir)
        .with_context(|| format!("Couldn't open a temporary sidecar in {dir}"))?;
    serde_json::to_writer(&temp, record)
        .with_context(|| format!("Couldn't write sidecar for {file}"))?;
    temp.persist(&path)
        .with_context(|| format!("Couldn't persist sidecar to {path}"))?;
    Ok(())
}

/// Stream a file through MD5, returning the digest and the LMT it was
/// hashed at.
pub fn hash_file(path: &Utf8Path) -> Result<(Vec<u8>, Timestamp)> {
    let mut fh = File::open(path).with_context(|| format!("Couldn't open {path}"))?;
    let lmt = Timestamp::try_from(
        fh.metadata()
            .with_context(|| format!("Couldn't stat {path}"))?
            .modified()?,
    )?;

    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let count = fh.read(&mut buf)?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }
    Ok((hasher.finalize().to_vec(), lmt))
}

struct HashJob {
    absolute: Utf8PathBuf,
    so: StoredObject,
}

/// The main traversal path's handle on the engine: consult the sidecar, and
/// either deliver immediately or queue for background hashing.
pub struct HashAgent<'a, 'b, 'p> {
    mode: HashMode,
    root: Utf8PathBuf,
    tx: crossbeam_channel::Sender<HashJob>,
    shared: &'a Mutex<&'b mut Processor<'p>>,
}

impl HashAgent<'_, '_, '_> {
    pub fn process(&self, mut so: StoredObject) -> Result<()> {
        if so.entity_type != EntityType::File && so.entity_type != EntityType::Hardlink {
            return self.call(so);
        }

        let absolute = if so.relative_path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&so.relative_path)
        };

        match load(&absolute) {
            Some(rec) if rec.is_valid(self.mode, so.last_modified) => {
                counters::bump(Op::SidecarHit);
                so.hash = Some(HashData {
                    mode: rec.mode,
                    digest: rec.digest,
                });
                self.call(so)
            }
            _ => {
                counters::bump(Op::SidecarMiss);
                // Blocks when the queue is full; that's the back-pressure.
                self.tx
                    .send(HashJob { absolute, so })
                    .context("hash queue closed early")?;
                Ok(())
            }
        }
    }

    fn call(&self, so: StoredObject) -> Result<()> {
        let mut guard = self.shared.lock().unwrap();
        let processor: &mut Processor<'_> = &mut **guard;
        processor(so)
    }
}

fn hash_one(mode: HashMode, job: HashJob) -> Result<StoredObject> {
    let HashJob { absolute, mut so } = job;
    let (digest, lmt) = hash_file(&absolute)?;
    let record = SidecarRecord {
        mode,
        digest: digest.clone(),
        lmt,
    };
    // A failure to persist isn't fatal; the object still proceeds with its
    // fresh digest, we'll just hash again next run.
    if let Err(e) = store(&absolute, &record) {
        counters::bump(Op::SidecarStoreFailed);
        warn!("Couldn't store sidecar for {absolute}: {e:#}");
    }
    so.hash = Some(HashData { mode, digest });
    Ok(so)
}

/// Run `run` with background hashing workers standing by.
///
/// Workers drain the queue, hash, persist the record, then push the
/// augmented object through the shared processor (commits are serialized by
/// its mutex). The first hashing error is surfaced after `run` returns; an
/// error from `run` itself wins and cancels outstanding work.
pub fn with_engine<R>(
    mode: HashMode,
    root: &Utf8Path,
    cancel: &CancelToken,
    processor: &mut Processor<'_>,
    run: impl FnOnce(&HashAgent<'_, '_, '_>) -> Result<R>,
) -> Result<R> {
    let shared = Mutex::new(processor);
    let (tx, rx) = bounded::<HashJob>(HASH_QUEUE_CAPACITY);
    let worker_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    let main_result = thread::scope(|s| {
        let shared = &shared;
        let worker_error = &worker_error;
        for _ in 0..pool::hashing_workers() {
            let rx = rx.clone();
            s.spawn(move || {
                for job in rx.iter() {
                    if cancel.is_cancelled() {
                        // Abandon outstanding hashes, but keep draining so
                        // the enqueuer never blocks on a full queue.
                        continue;
                    }
                    let step = hash_one(mode, job).and_then(|so| {
                        let mut guard = shared.lock().unwrap();
                        let processor: &mut Processor<'_> = &mut **guard;
                        processor(so)
                    });
                    if let Err(e) = step {
                        let mut guard = worker_error.lock().unwrap();
                        if guard.is_none() {
                            *guard = Some(e);
                        }
                    }
                }
            });
        }
        drop(rx);

        let agent = HashAgent {
            mode,
            root: root.to_owned(),
            tx,
            shared,
        };
        let result = run(&agent);
        if result.is_err() {
            cancel.cancel();
        }
        result
        // The agent (and its queue sender) drops here; workers finish and
        // the scope joins them.
    });

    let hashing = worker_error.into_inner().unwrap();
    match (main_result, hashing) {
        (Err(e), _) => Err(e),
        (Ok(_), Some(e)) => Err(e),
        (Ok(r), None) => Ok(r),
    }
}
