#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use jiff::Timestamp;

pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn ts(second: i64) -> Timestamp {
    Timestamp::from_second(second).unwrap()
}

pub fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut fh = File::create(path)?;
    fh.write_all(contents)?;
    Ok(())
}

/// Pin a file's mtime so change detection sees what we want it to.
pub fn set_mtime(path: &Path, second: u64) -> Result<()> {
    let fh = File::options().write(true).open(path)?;
    fh.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(second))?;
    Ok(())
}
