//! Differential sync against an object store, with deletion of extras:
//! pair every destination object with its source counterpart, move what's
//! newer, drop what's gone.

use anyhow::Result;

use ferry::config::DeleteDestination;
use ferry::pool::CancelToken;
use ferry::remote::memory::{MemoryShare, MemoryStore};
use ferry::sync::{self, CfdMode, Decision, StoreTarget, SyncOptions};
use ferry::traverse::share::ShareTraverser;
use ferry::traverse::{FolderDone, Processor};

mod common;

/// Source: x and y, both last written at t=100.
fn scenario_source() -> MemoryShare {
    let mut share = MemoryShare::new();
    share.add_share("src");
    share.add_file("src", "x", 10, 100);
    share.add_file("src", "y", 10, 100);
    share
}

/// Destination: x is newer than the source's copy, y is older, z has no
/// source counterpart at all.
fn scenario_target() -> MemoryStore {
    let mut store = MemoryStore::new();
    store.add_object("bkt", "x", 10, 200);
    store.add_object("bkt", "y", 10, 50);
    store.add_object("bkt", "z", 10, 200);
    store
}

fn options() -> SyncOptions {
    SyncOptions {
        cfd: CfdMode::CtimeMtime,
        last_sync: Some(common::ts(150)),
        delete_destination: DeleteDestination::True,
        metadata_only_sync: false,
        max_index_bytes: 0,
        case_insensitive_destination: false,
    }
}

fn run_once(decisions: &mut Vec<Decision>) -> Result<sync::SyncSummary> {
    let share = scenario_source();
    let store = scenario_target();
    let traverser = ShareTraverser::new(&share, "src", "");
    let target = StoreTarget::new(&store, "bkt", "");
    let cancel = CancelToken::new();

    let mut sink = |d: Decision| {
        decisions.push(d);
        Ok(())
    };
    sync::run(
        |processor: &mut Processor<'_>, folder_done: &FolderDone<'_>| {
            traverser.traverse_with_handoff(None, processor, &[], Some(folder_done))
        },
        &target,
        &options(),
        &cancel,
        &mut sink,
    )
}

#[test]
fn newer_copies_older_skips_extras_delete() -> Result<()> {
    common::init();

    let mut decisions = Vec::new();
    let summary = run_once(&mut decisions)?;

    let described: Vec<String> = decisions
        .iter()
        .map(|d| match d {
            Decision::Copy(so) => format!("copy {}", so.relative_path),
            Decision::MetadataOnly(so) => format!("meta {}", so.relative_path),
            Decision::Delete(so) => format!("delete {}", so.relative_path),
        })
        .collect();
    assert_eq!(described, ["copy y", "delete z"]);

    assert_eq!(summary.copied, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.skipped, 1); // x
    Ok(())
}

#[test]
fn read_only_source_syncs_identically_twice() -> Result<()> {
    common::init();

    let mut first = Vec::new();
    let mut second = Vec::new();
    run_once(&mut first)?;
    run_once(&mut second)?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn fresh_destination_copies_everything() -> Result<()> {
    common::init();

    let mut share = MemoryShare::new();
    share.add_share("src");
    share.add_file("src", "a", 1, 100);
    share.add_file("src", "d/b", 2, 100);
    share.add_file("src", "d/e/c", 3, 100);

    // The container exists but holds nothing at all.
    let mut empty = MemoryStore::new();
    empty.add_container("bkt");

    let traverser = ShareTraverser::new(&share, "src", "");
    let target = StoreTarget::new(&empty, "bkt", "");
    let cancel = CancelToken::new();

    let mut copied = Vec::new();
    let mut sink = |d: Decision| {
        match &d {
            Decision::Copy(so) => copied.push(so.relative_path.clone()),
            other => panic!("unexpected decision {other:?}"),
        }
        Ok(())
    };
    let summary = sync::run(
        |processor: &mut Processor<'_>, folder_done: &FolderDone<'_>| {
            traverser.traverse_with_handoff(None, processor, &[], Some(folder_done))
        },
        &target,
        &SyncOptions {
            cfd: CfdMode::TargetCompare,
            last_sync: None,
            delete_destination: DeleteDestination::False,
            metadata_only_sync: false,
            max_index_bytes: 0,
            case_insensitive_destination: false,
        },
        &cancel,
        &mut sink,
    )?;

    copied.sort();
    assert_eq!(copied, ["a", "d", "d/b", "d/e", "d/e/c"]);
    assert_eq!(summary.copied, 5);
    assert_eq!(summary.copied_bytes, 6);
    Ok(())
}

#[test]
fn case_insensitive_destination_pairs_across_case() -> Result<()> {
    common::init();

    let mut share = MemoryShare::new();
    share.add_share("src");
    share.add_file("src", "File.TXT", 10, 100);

    let mut store = MemoryStore::new();
    store.add_object("bkt", "file.txt", 10, 200);

    let traverser = ShareTraverser::new(&share, "src", "");
    let target = StoreTarget::new(&store, "bkt", "");
    let cancel = CancelToken::new();

    let mut decisions = Vec::new();
    let mut sink = |d: Decision| {
        decisions.push(d);
        Ok(())
    };
    let summary = sync::run(
        |processor: &mut Processor<'_>, folder_done: &FolderDone<'_>| {
            traverser.traverse_with_handoff(None, processor, &[], Some(folder_done))
        },
        &target,
        &SyncOptions {
            case_insensitive_destination: true,
            ..options()
        },
        &cancel,
        &mut sink,
    )?;

    // The differently-cased pair matched up: nothing to copy or delete.
    assert!(decisions.is_empty(), "{decisions:?}");
    assert_eq!(summary.skipped, 1);
    Ok(())
}

#[test]
fn folders_pair_with_folders() -> Result<()> {
    common::init();

    let mut share = MemoryShare::new();
    share.add_share("src");
    share.add_file("src", "d/inner", 5, 100);

    // The destination already has d/ as a virtual directory.
    let mut store = MemoryStore::new();
    store.add_object("bkt", "d/inner", 5, 200);

    let traverser = ShareTraverser::new(&share, "src", "");
    let target = StoreTarget::new(&store, "bkt", "");
    let cancel = CancelToken::new();

    let mut decisions = Vec::new();
    let mut sink = |d: Decision| {
        decisions.push(d);
        Ok(())
    };
    sync::run(
        |processor: &mut Processor<'_>, folder_done: &FolderDone<'_>| {
            traverser.traverse_with_handoff(None, processor, &[], Some(folder_done))
        },
        &target,
        &options(),
        &cancel,
        &mut sink,
    )?;

    // d paired with the virtual d/, inner was older on the source: no work.
    assert!(decisions.is_empty(), "{decisions:?}");
    Ok(())
}
