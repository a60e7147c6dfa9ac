//! Account-wide traversal stamps each object with its container; the
//! versions traverser fans one path out into its versions.

use anyhow::Result;

use ferry::object::StoredObject;
use ferry::remote::memory::MemoryStore;
use ferry::traverse::Traverser;
use ferry::traverse::account::AccountTraverser;
use ferry::traverse::versions::VersionsTraverser;

mod common;

#[test]
fn account_scan_stamps_containers_and_honors_the_pattern() -> Result<()> {
    common::init();

    let mut store = MemoryStore::new();
    store.add_object("logs-a", "one", 1, 100);
    store.add_object("logs-b", "two", 2, 100);
    store.add_object("media", "three", 3, 100);

    let traverser =
        AccountTraverser::new(&store, "host.example.region").pattern("logs-*");

    let mut seen = Vec::new();
    let mut processor = |so: StoredObject| {
        seen.push((so.container.clone().unwrap_or_default(), so.relative_path));
        Ok(())
    };
    traverser.traverse(None, &mut processor, &[])?;
    drop(processor);

    seen.sort();
    // Only the matching containers were scanned, and every object knows
    // where it came from (folder roots included).
    assert_eq!(
        seen,
        [
            ("logs-a".to_owned(), String::new()),
            ("logs-a".to_owned(), "one".to_owned()),
            ("logs-b".to_owned(), String::new()),
            ("logs-b".to_owned(), "two".to_owned()),
        ]
    );
    Ok(())
}

#[test]
fn versions_traverser_emits_one_object_per_version() -> Result<()> {
    common::init();

    let mut store = MemoryStore::new();
    store.add_object("bkt", "k", 4, 100);
    store.add_version("bkt", "k", "v1");
    store.add_version("bkt", "k", "v2");

    let traverser = VersionsTraverser::new(&store, "bkt", "k");
    assert!(!traverser.is_directory(true)?);

    let mut versions = Vec::new();
    let mut processor = |so: StoredObject| {
        versions.push(so.version_id.clone().unwrap_or_default());
        Ok(())
    };
    traverser.traverse(None, &mut processor, &[])?;
    drop(processor);

    assert_eq!(versions, ["v1", "v2"]);
    Ok(())
}
