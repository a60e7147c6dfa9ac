//! Job options: the enum-typed knobs the command layer cooks for us.

use std::{fs, io};

use anyhow::{Context, Result};
use camino::Utf8Path;
use jiff::Timestamp;
use serde_derive::Deserialize;

use crate::errors::Error;
use crate::location::{Location, LocationLevel, location_level};
use crate::sidecar::HashMode;
use crate::sync::CfdMode;

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize)]
pub enum SymlinkHandling {
    /// Skip symlinks entirely.
    #[default]
    None,
    /// Emit them as symlink entities.
    Preserve,
    /// Resolve them and descend into their targets.
    Follow,
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize)]
pub enum HardlinkHandling {
    /// Treat hard links as regular files, with a warning per link.
    #[default]
    Follow,
    /// Emit them as hardlink entities.
    Preserve,
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize)]
pub enum DeleteDestination {
    #[default]
    False,
    True,
    Prompt,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct JobOptions {
    pub symlink_handling: SymlinkHandling,
    pub hardlink_handling: HardlinkHandling,
    pub hash_mode: HashMode,
    pub cfd_mode: CfdMode,
    pub metadata_only_sync: bool,
    pub delete_destination: DeleteDestination,
    pub max_index_memory_gb: u32,
    pub last_sync_time: Option<Timestamp>,
    pub include_directory_stubs: bool,
    pub include_deleted: bool,
    pub include_snapshot: bool,
    pub include_version: bool,
    pub preserve_permissions: bool,
    pub preserve_owner: bool,
    pub preserve_info: bool,
    pub is_recursive: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            symlink_handling: SymlinkHandling::default(),
            hardlink_handling: HardlinkHandling::default(),
            hash_mode: HashMode::default(),
            cfd_mode: CfdMode::default(),
            metadata_only_sync: false,
            delete_destination: DeleteDestination::default(),
            max_index_memory_gb: 2,
            last_sync_time: None,
            include_directory_stubs: false,
            include_deleted: false,
            include_snapshot: false,
            include_version: false,
            preserve_permissions: false,
            preserve_owner: false,
            preserve_info: false,
            is_recursive: true,
        }
    }
}

impl JobOptions {
    pub fn max_index_bytes(&self) -> u64 {
        u64::from(self.max_index_memory_gb) * 1024 * 1024 * 1024
    }

    /// Cook-time rejection of option/resource combinations that can't work.
    /// Everything here fails before enumeration starts.
    pub fn validate(&self, source: &str, source_loc: Location, destination: &str) -> Result<()> {
        if location_level(source, source_loc, true) == LocationLevel::Service {
            return Err(Error::ConfigurationInvalid(format!(
                "{source} names a whole service; sync needs a container or below"
            ))
            .into());
        }
        if self.cfd_mode != CfdMode::TargetCompare && self.last_sync_time.is_none() {
            return Err(Error::ConfigurationInvalid(
                "change-time detection modes need a last-sync baseline".to_owned(),
            )
            .into());
        }
        if destination.is_empty() {
            return Err(
                Error::ConfigurationInvalid("destination must not be empty".to_owned()).into(),
            );
        }
        Ok(())
    }
}

/// Read options from a TOML file; a missing file just means defaults.
pub fn load(path: &Utf8Path) -> Result<JobOptions> {
    let s = match fs::read_to_string(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(JobOptions::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {path}"))?;
    let opts = toml::from_str(&s).with_context(|| format!("Couldn't parse {path}"))?;
    Ok(opts)
}
