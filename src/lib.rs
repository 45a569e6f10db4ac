//! An embeddable, crash-safe persistent graph store built around a
//! fixed-record, memory-mapped node file.
//!
//! The pieces, bottom up:
//!
//! - [`record`]: the bit-exact node record every other layer deals in.
//! - [`store`]: the [`Lattice`] itself. Fixed size records in three parallel
//!   cache arrays, backed by either an atomic-snapshot file (RAM mode) or a
//!   shared writable mapping (disk mode), with O(1) dense-id lookup through
//!   a verified reverse index and O(k) name queries through a lazily built
//!   prefix index. Payloads bigger than one record are chunked across
//!   sequential child records.
//! - [`wal`]: a write-ahead log with adaptive batching and a background
//!   flusher, so a crash between saves replays instead of losing work.
//! - [`isolation`]: an optional seqlock wrapper for parallel readers with a
//!   single exclusive writer.
//! - [`license`]: the per-machine admission counter gating the free tier.
//!
//! A store is a single-writer structure by contract. Wrap it in
//! [`SharedLattice`] when reader threads are in play.

mod env;
mod error;
pub mod index;
mod isolation;
pub mod license;
pub mod record;
pub mod store;
pub mod wal;

pub use error::{LatticeError, Result};
pub use isolation::SharedLattice;
pub use license::{LicenseInfo, LicenseState};
pub use record::{Node, NodeId, NodeType};
pub use store::{
    ChunkMeta, Lattice, LatticeOptions, NameFilters, PatternStats, PerformanceRecord,
    CHUNK_PAYLOAD, DEFAULT_MAX_RAM_NODES,
};
pub use wal::{WalOptions, WalRecord};
