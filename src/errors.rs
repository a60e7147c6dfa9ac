//! Failures callers and tests need to tell apart.
//!
//! Everything still travels as [`anyhow::Error`]; these are the kinds worth
//! downcasting to. Per-entry access failures don't show up here - they go to
//! the traverser's error channel and enumeration continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A wildcard appeared somewhere other than the terminal segment of a
    /// remote resource, or in both the container and the object components.
    #[error("wildcard in a non-terminal segment of {0}")]
    WildcardInNonTerminalSegment(String),

    /// More than one `*`, or a `*` before the final path component.
    #[error("invalid wildcard in {0}: only a single trailing * is supported")]
    InvalidWildcard(String),

    /// File shares can't be reached anonymously.
    #[error("{0} has no access token")]
    MissingShareAuth(String),

    #[error("symlink chain at {path} exceeds {limit} links")]
    SymlinkChainTooDeep { path: String, limit: usize },

    /// Two stored objects landed on the same (folder, child) index slot.
    #[error("duplicate index entry {child:?} under {folder:?}")]
    DuplicateEntry { folder: String, child: String },

    /// The folder index should be empty once every handed-off directory has
    /// been compared. A residual means somebody forgot to drain.
    #[error("folder index retained {0} bytes after the sync drained")]
    IndexerLeak(u64),

    #[error("transfer engine rejected part {part}: {message}")]
    DispatchRejected { part: u32, message: String },

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
}
