//! Performance counters: count how many times we do various important operations.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use enum_map::{Enum, EnumMap};
use tracing::debug;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    DirsListed,
    ObjectsEnumerated,
    ObjectsFiltered,
    StubProbes,
    SidecarHit,
    SidecarMiss,
    SidecarStoreFailed,
    IndexStores,
    IndexDrains,
    PartsSubmitted,
}

static COUNTER_MAP: LazyLock<EnumMap<Op, AtomicUsize>> = LazyLock::new(EnumMap::default);

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

pub fn get(which: Op) -> usize {
    COUNTER_MAP[which].load(Ordering::Relaxed)
}

pub fn log_counts() {
    // Probably not needed; but we're probably calling this once at job exit.
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0) // Ignore things we didn't do
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::DirsListed => "directories listed",
        Op::ObjectsEnumerated => "objects enumerated",
        Op::ObjectsFiltered => "objects filtered out",
        Op::StubProbes => "directory stub probes",
        Op::SidecarHit => "hash sidecar hits",
        Op::SidecarMiss => "hash sidecar misses",
        Op::SidecarStoreFailed => "hash sidecar store failures",
        Op::IndexStores => "folder index stores",
        Op::IndexDrains => "folder index drains",
        Op::PartsSubmitted => "parts submitted",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:6} {}", count, opname(*op));
    }
}
