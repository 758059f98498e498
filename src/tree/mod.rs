//! The LSM tree: chunk lists, lifecycle operations, and throttling.
//!
//! Each lifecycle routine lives in its own file and runs as a work unit on
//! the worker pool: switch seals the primary, flush persists sealed chunks,
//! bloom builds filters, merge collapses chunk runs, and drop reclaims
//! old chunks once nothing references them.

pub mod bloom_work;
pub mod drop_chunks;
pub mod flush;
pub mod merge;
pub mod switch;
#[allow(clippy::module_inception)]
mod tree;

pub use tree::{LsmTree, TreeState};

/// Tree status bits, mutated under the tree write lock.
pub const TREE_OPEN: u32 = 0x01;
pub const TREE_ACTIVE: u32 = 0x02;
pub const TREE_COMPACTING: u32 = 0x04;
pub const TREE_NEED_SWITCH: u32 = 0x08;
pub const TREE_THROTTLE: u32 = 0x10;

/// Lock-free open-mode bit, held apart from the other flags with
/// acquire/release ordering.
pub const TREE_EXCLUSIVE: u32 = 0x01;
