//! The enumeration and synchronization core of a big dumb data mover.
//!
//! Traversers walk a resource root (a local tree, an object-store container,
//! a file share) and emit a uniform stream of [stored objects](object::StoredObject).
//! For sync, the source stream is folded into a [folder index](index::FolderIndex),
//! directories are handed to the destination side in indexing order, and a
//! [comparator](sync) decides copy/metadata/skip/delete per pair.
//! Decisions are batched into parts for an external transfer engine by the
//! [dispatch adapter](dispatch), or printed by [dry-run](dryrun).

pub mod config;
pub mod counters;
pub mod dispatch;
pub mod dryrun;
pub mod errors;
pub mod filter;
pub mod index;
pub mod location;
pub mod object;
pub mod pool;
pub mod remote;
pub mod sidecar;
pub mod sync;
pub mod traverse;
