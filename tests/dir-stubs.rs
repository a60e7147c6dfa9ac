//! The object-store directory fakery: stub objects, phantom files named
//! after folders, root-as-blob, and the trailing-slash sentinel.

use anyhow::Result;

use ferry::object::{EntityType, ROOT_TRAILING_SLASH, StoredObject};
use ferry::remote::ObjectSummary;
use ferry::remote::memory::MemoryStore;
use ferry::traverse::Traverser;
use ferry::traverse::store::StoreTraverser;

mod common;

fn collect(traverser: &StoreTraverser<'_>) -> Result<Vec<(EntityType, String)>> {
    let mut seen = Vec::new();
    let mut processor = |so: StoredObject| {
        seen.push((so.entity_type, so.relative_path));
        Ok(())
    };
    traverser.traverse(None, &mut processor, &[])?;
    Ok(seen)
}

#[test]
fn stub_and_prefix_collapse_to_one_folder() -> Result<()> {
    common::init();

    let mut store = MemoryStore::new();
    store.add_stub("bkt", "foo");
    store.add_object("bkt", "foo/bar", 3, 100);

    let traverser = StoreTraverser::new(&store, "bkt", "");
    let seen = collect(&traverser)?;

    let folders: Vec<_> = seen
        .iter()
        .filter(|(e, _)| *e == EntityType::Folder)
        .map(|(_, rel)| rel.as_str())
        .collect();
    assert_eq!(folders, ["", "foo"]);

    let files: Vec<_> = seen
        .iter()
        .filter(|(e, _)| *e == EntityType::File)
        .map(|(_, rel)| rel.as_str())
        .collect();
    assert_eq!(files, ["foo/bar"]);
    Ok(())
}

#[test]
fn lone_stub_needs_the_flag_to_show_up() -> Result<()> {
    common::init();

    let mut store = MemoryStore::new();
    store.add_stub("bkt", "empty-dir");
    store.add_object("bkt", "file", 1, 100);

    let plain = collect(&StoreTraverser::new(&store, "bkt", ""))?;
    assert!(!plain.iter().any(|(_, rel)| rel == "empty-dir"));

    let with_stubs = collect(
        &StoreTraverser::new(&store, "bkt", "").include_directory_stubs(true),
    )?;
    assert!(
        with_stubs
            .iter()
            .any(|(e, rel)| *e == EntityType::Folder && rel == "empty-dir")
    );
    Ok(())
}

#[test]
fn root_as_blob_emits_exactly_that_object() -> Result<()> {
    common::init();

    let mut store = MemoryStore::new();
    store.add_object("bkt", "solo", 9, 100);
    store.add_object("bkt", "solo-sibling", 1, 100);

    let traverser = StoreTraverser::new(&store, "bkt", "solo");
    let seen = collect(&traverser)?;

    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], (EntityType::File, String::new()));
    Ok(())
}

#[test]
fn blob_named_like_the_prefix_gets_the_sentinel() -> Result<()> {
    common::init();

    let mut store = MemoryStore::new();
    store.insert(
        "bkt",
        ObjectSummary {
            key: "dir/".to_owned(),
            size: 0,
            ..ObjectSummary::default()
        },
    );
    store.add_object("bkt", "dir/child", 2, 100);

    let traverser = StoreTraverser::new(&store, "bkt", "dir");
    let seen = collect(&traverser)?;

    assert!(
        seen.iter()
            .any(|(_, rel)| rel == ROOT_TRAILING_SLASH),
        "expected the \\x00 sentinel in {seen:?}"
    );
    assert!(seen.iter().any(|(_, rel)| rel == "child"));
    Ok(())
}

#[test]
fn tags_are_fetched_only_when_preserving() -> Result<()> {
    common::init();

    let mut store = MemoryStore::new();
    store.add_object("bkt", "tagged", 1, 100);
    store.add_tags(
        "bkt",
        "tagged",
        std::collections::BTreeMap::from([("team".to_owned(), "infra".to_owned())]),
    );

    let mut without = Vec::new();
    let mut processor = |so: StoredObject| {
        without.push(so.blob_tags.clone());
        Ok(())
    };
    StoreTraverser::new(&store, "bkt", "tagged").traverse(None, &mut processor, &[])?;
    drop(processor);
    assert!(without.iter().all(|tags| tags.is_empty()));

    let mut with = Vec::new();
    let mut processor = |so: StoredObject| {
        if so.entity_type == EntityType::File {
            with.push(so.blob_tags.clone());
        }
        Ok(())
    };
    StoreTraverser::new(&store, "bkt", "tagged")
        .preserve_tags(true)
        .traverse(None, &mut processor, &[])?;
    drop(processor);
    assert_eq!(with.len(), 1);
    assert_eq!(with[0].get("team").map(String::as_str), Some("infra"));
    Ok(())
}
