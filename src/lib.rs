//! loamdb: an embedded log-structured merge storage engine.
//!
//! An ordered key-value store layered over a collection of immutable
//! on-disk chunks and one mutable in-memory chunk, with Bloom filters
//! accelerating negative lookups and a bounded worker pool performing
//! switches, flushes, bloom construction, merges, and chunk reclamation.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!   writes ───────►│  primary chunk   │   in memory, newest
//!                  │   (skip list)    │
//!                  └──────┬───────────┘
//!                         │ switch + flush
//!                         ▼
//!   ┌────────┐  ┌────────┐  ┌────────┐
//!   │chunk 1 │  │chunk 2 │  │chunk 3 │ ...  on disk, oldest → newest
//!   │+ bloom │  │+ bloom │  │+ bloom │
//!   └────┬───┘  └───┬────┘  └───┬────┘
//!        └──────────┼───────────┘
//!                   │ merge (generation + 1), then drop inputs
//!                   ▼
//!              ┌─────────┐
//!              │ merged  │
//!              │ chunk   │
//!              └─────────┘
//! ```
//!
//! # Background maintenance
//!
//! All lifecycle work flows through three FIFO queues (switches;
//! application work: flush, bloom, drop; manager work: merges) drained by
//! a bounded pool of flag-masked worker threads. Switches never wait
//! behind merges, and at least one worker always services the flush path.
//!
//! # Reading
//!
//! [`MergedCursor`] presents one ordered view over every chunk, with
//! snapshot isolation by transaction id, bloom-pruned point lookups, and
//! tombstone suppression.

mod bloom;
mod chunk;
mod codec;
mod collator;
mod config;
mod cursor;
mod error;
mod manifest;
mod stats;
#[cfg(test)]
mod tmpfs;
mod tree;
mod worker;

pub use bloom::Bloom;
pub use codec::{RawCodec, RecordCodec};
pub use collator::{BytewiseCollator, Collator, CollatorRegistry};
pub use config::{ManagerConfig, TreeConfig, BLOOM_MERGED, BLOOM_OFF, BLOOM_OLDEST, MAX_WORKERS};
pub use cursor::{
    CursorRecord, MergedCursor, CURSOR_ACTIVE, CURSOR_ITERATE_NEXT, CURSOR_ITERATE_PREV,
    CURSOR_MERGE, CURSOR_MINOR_MERGE, CURSOR_MULTIPLE, CURSOR_OPEN_READ, CURSOR_OPEN_SNAPSHOT,
};
pub use error::{Error, Result};
pub use stats::{Stats, StatsSnapshot};
pub use tree::LsmTree;
pub use worker::manager::LsmManager;
