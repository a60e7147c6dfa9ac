//! A bounded pool of workers chewing through a shared, growable queue.
//!
//! This is the "fan-out directory walker" shape: seed the queue with the
//! root, and every worker may push more jobs (subdirectories) while it
//! handles one. The pool drains when the outstanding-work count hits zero.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use anyhow::Result;
use crossbeam_channel::{Sender, unbounded};

/// One root cancellation signal, observed by every pool between entries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(std::sync::Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handed to each worker so it can grow the queue.
pub struct Enqueue<'a, T> {
    tx: &'a Sender<Option<T>>,
    pending: &'a AtomicUsize,
}

impl<T> Enqueue<'_, T> {
    pub fn push(&self, job: T) {
        // Bump before sending so the count never dips to zero while a job
        // is in flight.
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(Some(job));
    }
}

/// Run `work` over `seed` and everything it pushes, on `workers` threads.
///
/// The first error cancels the pool and is returned once every worker has
/// stopped; a cancelled pool still drains its queue (skipping the work) so
/// nobody blocks forever.
pub fn run_queue<T, F>(workers: usize, seed: Vec<T>, cancel: &CancelToken, work: F) -> Result<()>
where
    T: Send,
    F: Fn(T, &Enqueue<'_, T>) -> Result<()> + Sync,
{
    if seed.is_empty() {
        return Ok(());
    }
    let workers = workers.max(1);

    let (tx, rx) = unbounded::<Option<T>>();
    let pending = AtomicUsize::new(seed.len());
    for job in seed {
        let _ = tx.send(Some(job));
    }

    let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    thread::scope(|s| {
        let work = &work;
        let pending = &pending;
        let first_error = &first_error;
        for _ in 0..workers {
            let tx = tx.clone();
            let rx = rx.clone();
            s.spawn(move || {
                while let Ok(Some(job)) = rx.recv() {
                    if !cancel.is_cancelled() {
                        let enqueue = Enqueue {
                            tx: &tx,
                            pending,
                        };
                        if let Err(e) = work(job, &enqueue) {
                            let mut guard = first_error.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(e);
                            }
                            cancel.cancel();
                        }
                    }
                    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        // That was the last job; wake everyone up to exit.
                        for _ in 0..workers {
                            let _ = tx.send(None);
                        }
                    }
                }
            });
        }
    });

    match first_error.into_inner().unwrap() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Default fan-out for enumeration.
pub fn enumeration_workers() -> usize {
    num_cpus::get().max(1)
}

/// Default fan-out for background hashing.
pub fn hashing_workers() -> usize {
    (num_cpus::get() / 2).max(1)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::AtomicU64;

    use anyhow::bail;

    #[test]
    fn visits_everything_pushed() -> Result<()> {
        // Sum 1..=100 by fanning out in halves.
        let total = AtomicU64::new(0);
        let cancel = CancelToken::new();
        run_queue(4, vec![(1u64, 100u64)], &cancel, |(lo, hi), enqueue| {
            if lo == hi {
                total.fetch_add(lo, Ordering::SeqCst);
            } else {
                let mid = (lo + hi) / 2;
                enqueue.push((lo, mid));
                enqueue.push((mid + 1, hi));
            }
            Ok(())
        })?;
        assert_eq!(total.load(Ordering::SeqCst), 5050);
        Ok(())
    }

    #[test]
    fn first_error_wins_and_pool_drains() {
        let cancel = CancelToken::new();
        let res = run_queue(2, vec![0u32, 1, 2, 3], &cancel, |job, enqueue| {
            if job == 0 {
                bail!("job zero is cursed");
            }
            if job < 100 {
                enqueue.push(job + 100);
            }
            Ok(())
        });
        assert!(res.is_err());
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn empty_seed_is_a_no_op() -> Result<()> {
        run_queue(4, Vec::<u32>::new(), &CancelToken::new(), |_job, _enqueue| {
            unreachable!()
        })
    }
}
