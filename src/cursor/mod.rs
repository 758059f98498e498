//! Cursors over an LSM tree.
//!
//! A merged cursor presents one ordered view over every chunk: one
//! sub-cursor per non-empty chunk, bloom filters pruning point lookups,
//! snapshot isolation via per-chunk transaction bounds, and tombstone
//! suppression (merge cursors see tombstones, everyone else does not).

mod chunk_cursor;
mod merged;

pub use chunk_cursor::CursorRecord;
pub(crate) use chunk_cursor::ChunkCursor;
pub use merged::MergedCursor;

/// Cursor flag bits.
pub const CURSOR_ACTIVE: u32 = 0x01;
/// Forward iteration in progress.
pub const CURSOR_ITERATE_NEXT: u32 = 0x02;
/// Backward iteration in progress.
pub const CURSOR_ITERATE_PREV: u32 = 0x04;
/// Merge cursor: read-only over its chunks.
pub const CURSOR_MERGE: u32 = 0x08;
/// Minor merge: tombstones are returned rather than suppressed.
pub const CURSOR_MINOR_MERGE: u32 = 0x10;
/// Multiple sub-cursors hold the current key.
pub const CURSOR_MULTIPLE: u32 = 0x20;
/// Opened for reads.
pub const CURSOR_OPEN_READ: u32 = 0x40;
/// Opened with snapshot isolation at the cursor's transaction id.
pub const CURSOR_OPEN_SNAPSHOT: u32 = 0x80;
