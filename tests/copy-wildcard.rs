//! A one-shot copy from an object-store prefix search into a local
//! directory: `s3://host/bkt/dir/*` means "the contents of dir/", and
//! non-recursive means nested keys stay put.

use anyhow::Result;

use ferry::dispatch::{Dispatcher, FromTo, RecordingEngine, TransferItem};
use ferry::filter::EntityFilter;
use ferry::filter::ObjectFilter;
use ferry::location::{self, Location};
use ferry::object::StoredObject;
use ferry::remote::memory::MemoryStore;
use ferry::traverse::Traverser;
use ferry::traverse::store::StoreTraverser;

mod common;

fn scenario_store() -> MemoryStore {
    let mut store = MemoryStore::new();
    store.add_object("bkt", "dir/a", 3, 100);
    store.add_object("bkt", "dir/b", 4, 100);
    store.add_object("bkt", "dir/nested/c", 5, 100);
    store
}

#[test]
fn wildcard_copies_contents_nonrecursively() -> Result<()> {
    common::init();

    let resource = "s3://host/bkt/dir/*";
    assert!(location::points_to_contents(resource));
    location::validate_store_wildcards(resource)?;
    let root = location::resource_root(resource, Location::Store)?;
    assert_eq!(root, "s3://host/bkt/dir/");

    let store = scenario_store();
    let traverser = StoreTraverser::new(&store, "bkt", "dir/").recursive(false);

    let mut engine = RecordingEngine::default();
    let mut dispatcher = Dispatcher::new(
        &mut engine,
        "job-1",
        FromTo::StoreLocal,
        "s3://host/bkt/dir",
        "/tmp/out",
    );

    let filters: Vec<Box<dyn ObjectFilter>> = vec![Box::new(EntityFilter::files_only())];
    let mut processor = |so: StoredObject| {
        let item = TransferItem::from_object(
            &so,
            location::combine("s3://host/bkt/dir", &so.relative_path),
            location::combine("/tmp/out", &so.relative_path),
        );
        dispatcher.schedule_copy(item)
    };
    traverser.traverse(None, &mut processor, &filters)?;
    drop(processor);
    dispatcher.close()?;

    assert_eq!(engine.parts.len(), 1);
    let part = &engine.parts[0];
    assert!(part.is_final);

    let pairs: Vec<(&str, &str)> = part
        .transfers
        .iter()
        .map(|t| (t.source.as_str(), t.destination.as_str()))
        .collect();
    assert_eq!(
        pairs,
        [
            ("s3://host/bkt/dir/a", "/tmp/out/a"),
            ("s3://host/bkt/dir/b", "/tmp/out/b"),
        ]
    );
    Ok(())
}

#[test]
fn recursive_copy_includes_nested_keys() -> Result<()> {
    common::init();

    let store = scenario_store();
    let traverser = StoreTraverser::new(&store, "bkt", "dir/");

    let mut rels = Vec::new();
    let filters: Vec<Box<dyn ObjectFilter>> = vec![Box::new(EntityFilter::files_only())];
    let mut processor = |so: StoredObject| {
        rels.push(so.relative_path);
        Ok(())
    };
    traverser.traverse(None, &mut processor, &filters)?;
    drop(processor);

    rels.sort();
    assert_eq!(rels, ["a", "b", "nested/c"]);
    Ok(())
}

#[test]
fn every_relative_path_is_unique() -> Result<()> {
    common::init();

    let store = scenario_store();
    let traverser = StoreTraverser::new(&store, "bkt", "dir/");

    let mut seen = std::collections::HashSet::new();
    let mut processor = |so: StoredObject| {
        assert!(
            seen.insert((so.entity_type, so.relative_path.clone())),
            "duplicate (entity, relative path): {:?} {}",
            so.entity_type,
            so.relative_path
        );
        Ok(())
    };
    traverser.traverse(None, &mut processor, &[])?;
    Ok(())
}
