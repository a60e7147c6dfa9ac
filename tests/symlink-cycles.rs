//! Symlink policy on the local walker: skip, preserve, or follow - and
//! when following, never loop and never chase absurd chains.

#![cfg(unix)]

use std::os::unix::fs::symlink;

use anyhow::Result;
use camino::Utf8PathBuf;

use ferry::config::SymlinkHandling;
use ferry::object::{EntityType, StoredObject};
use ferry::traverse::Traverser;
use ferry::traverse::local::LocalTraverser;

mod common;

fn collect(traverser: &LocalTraverser) -> Result<Vec<(EntityType, String)>> {
    let mut seen = Vec::new();
    let mut processor = |so: StoredObject| {
        seen.push((so.entity_type, so.relative_path));
        Ok(())
    };
    traverser.traverse(None, &mut processor, &[])?;
    let mut seen = seen;
    seen.sort();
    Ok(seen)
}

#[test]
fn self_loop_visits_the_directory_once() -> Result<()> {
    common::init();

    let dir = tempfile::tempdir()?;
    common::write_file(&dir.path().join("f1"), b"one")?;
    common::write_file(&dir.path().join("f2"), b"two")?;
    symlink(dir.path(), dir.path().join("loop"))?;

    let root = Utf8PathBuf::try_from(dir.path().to_path_buf())?;
    let traverser = LocalTraverser::new(root).symlinks(SymlinkHandling::Follow);
    let seen = collect(&traverser)?;

    // The loop is noticed, not followed: two files and the root, period.
    assert_eq!(
        seen,
        [
            (EntityType::File, "f1".to_owned()),
            (EntityType::File, "f2".to_owned()),
            (EntityType::Folder, String::new()),
        ]
    );
    Ok(())
}

#[test]
fn mutual_loops_terminate_too() -> Result<()> {
    common::init();

    let dir = tempfile::tempdir()?;
    common::write_file(&dir.path().join("a/fa"), b"a")?;
    common::write_file(&dir.path().join("b/fb"), b"b")?;
    symlink(dir.path().join("b"), dir.path().join("a/to-b"))?;
    symlink(dir.path().join("a"), dir.path().join("b/to-a"))?;

    let root = Utf8PathBuf::try_from(dir.path().to_path_buf())?;
    let traverser = LocalTraverser::new(root).symlinks(SymlinkHandling::Follow);
    let seen = collect(&traverser)?;

    // Each real directory shows up exactly once, whichever road got there
    // first.
    let files: Vec<_> = seen
        .iter()
        .filter(|(e, _)| *e == EntityType::File)
        .map(|(_, rel)| ferry::object::name_of(rel).to_owned())
        .collect();
    assert_eq!(files.len(), 2);
    assert!(files.contains(&"fa".to_owned()));
    assert!(files.contains(&"fb".to_owned()));
    Ok(())
}

#[test]
fn preserve_emits_symlink_entities() -> Result<()> {
    common::init();

    let dir = tempfile::tempdir()?;
    common::write_file(&dir.path().join("real"), b"data")?;
    symlink(dir.path().join("real"), dir.path().join("link"))?;

    let root = Utf8PathBuf::try_from(dir.path().to_path_buf())?;
    let traverser = LocalTraverser::new(root).symlinks(SymlinkHandling::Preserve);
    let seen = collect(&traverser)?;

    assert!(seen.contains(&(EntityType::Symlink, "link".to_owned())));
    Ok(())
}

#[test]
fn skipping_is_the_default() -> Result<()> {
    common::init();

    let dir = tempfile::tempdir()?;
    common::write_file(&dir.path().join("real"), b"data")?;
    symlink(dir.path().join("real"), dir.path().join("link"))?;

    let root = Utf8PathBuf::try_from(dir.path().to_path_buf())?;
    let seen = collect(&LocalTraverser::new(root))?;

    assert!(!seen.iter().any(|(_, rel)| rel == "link"));
    Ok(())
}

#[test]
fn absurd_chains_fail_the_entry_not_the_walk() -> Result<()> {
    common::init();

    let dir = tempfile::tempdir()?;
    common::write_file(&dir.path().join("end"), b"data")?;
    // end <- l45 <- l44 <- ... <- l1
    symlink(dir.path().join("end"), dir.path().join("l45"))?;
    for i in (1..45).rev() {
        symlink(
            dir.path().join(format!("l{}", i + 1)),
            dir.path().join(format!("l{i}")),
        )?;
    }

    let (err_tx, err_rx) = crossbeam_channel::unbounded();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf())?;
    let traverser = LocalTraverser::new(root)
        .symlinks(SymlinkHandling::Follow)
        .error_channel(err_tx);
    let seen = collect(&traverser)?;
    drop(traverser);

    // The real file still made it, plus the short-enough tail of the chain.
    assert!(seen.contains(&(EntityType::File, "end".to_owned())));

    let failures: Vec<_> = err_rx.try_iter().collect();
    assert!(
        failures.iter().any(|f| f.message.contains("links")),
        "expected a chain-depth failure in {failures:?}"
    );
    Ok(())
}
