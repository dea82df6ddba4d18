//! Per-tenant Markov chain storage
//!
//! This crate holds the sampling and persistence core:
//! - `AliasTable`: O(1) weighted categorical sampling (Vose's method)
//! - `PrefixEntry`: per-prefix suffix accumulator with lazy alias build
//! - `ChainStore`: the tenant's prefix map behind one reader/writer lock,
//!   with load/save, debounced snapshots, and generation
//!
//! # Concurrency
//!
//! Training writes and generation reads interleave on one store. The
//! prefix map sits behind a single `RwLock`; the lazily built alias table
//! of each entry sits behind its own short mutex, so samplers of
//! unrelated prefixes never contend.
//!
//! # Persistence
//!
//! Mutations mark the store dirty and re-arm a per-store debounce timer;
//! the fired save serializes under the read lock and writes the snapshot
//! atomically (tmp + fsync + rename + dir fsync). AliasTables are never
//! persisted.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alias;
pub mod debounce;
pub mod entry;
pub mod snapshot;
pub mod store;

pub use alias::AliasTable;
pub use debounce::SaveDebouncer;
pub use entry::PrefixEntry;
pub use snapshot::{snapshot_path, ChainRecord, SnapshotDocument, SNAPSHOT_MAGIC, SNAPSHOT_SCHEMA_VERSION};
pub use store::{BatchOutcome, ChainStore};
