//! Flush: persist a sealed chunk to its data file.

use std::sync::Arc;

use super::LsmTree;
use crate::chunk::file::ChunkFileWriter;
use crate::chunk::memchunk::MemChunk;
use crate::chunk::{Chunk, CHUNK_ONDISK, CHUNK_STABLE};
use crate::error::{Error, Result};
use crate::manifest::edit::TreeEdit;
use crate::stats::Stats;
use crate::worker::WorkKind;

/// Write the oldest sealed, unflushed chunk to disk and set ONDISK.
/// Idempotent: with nothing to flush this is a no-op. On failure the
/// partial file is removed and the chunk keeps its pre-flush flags, so a
/// requeued unit starts clean.
pub(crate) fn work(tree: &Arc<LsmTree>) -> Result<()> {
    if !tree.is_active() {
        return Err(Error::Shutdown);
    }

    let target = {
        let state = tree.state.read()?;
        state
            .chunks
            .iter()
            .find(|c| {
                c.has_flag(CHUNK_STABLE)
                    && !c.has_flag(CHUNK_ONDISK)
                    && !c.is_empty_chunk()
                    && c.mem().is_some()
            })
            .cloned()
    };
    let Some(chunk) = target else {
        return Ok(());
    };
    let Some(mem) = chunk.mem() else {
        return Ok(());
    };

    chunk.pin();
    let result = flush_chunk(tree, &chunk, &mem);
    chunk.unpin();

    if let Err(e) = result {
        let _ = std::fs::remove_file(chunk.uri());
        return Err(e);
    }

    Stats::incr(&tree.stats.flushes);
    tracing::info!(
        tree = tree.name(),
        chunk = chunk.id(),
        count = chunk.count(),
        size = chunk.size(),
        "flushed chunk"
    );

    let elected = {
        let state = tree.state.read()?;
        state
            .chunks
            .iter()
            .position(|c| Arc::ptr_eq(c, &chunk))
            .is_some_and(|position| tree.bloom_elects(&chunk, position))
    };
    if elected {
        tree.enqueue_work(WorkKind::Bloom, false);
    }
    if tree.needs_merge() {
        tree.enqueue_work(WorkKind::Merge, false);
    }
    tree.update_throttle();
    Ok(())
}

fn flush_chunk(tree: &Arc<LsmTree>, chunk: &Arc<Chunk>, mem: &Arc<MemChunk>) -> Result<()> {
    let mut writer = ChunkFileWriter::create(&chunk.uri())?;

    let mut written = 0u64;
    for (ikey, value) in mem.entries() {
        if written % 1024 == 0 && !tree.is_active() {
            return Err(Error::Shutdown);
        }
        writer.add(&ikey, value.as_deref())?;
        written += 1;
    }
    let (count, size) = writer.finish()?;

    chunk.set_counts(count, size);
    chunk.set_flag(CHUNK_ONDISK);

    tree.manifest.append(TreeEdit::Flush {
        seq: tree.manifest.next_seq(),
        chunk_id: chunk.id(),
        count,
        size,
    })?;
    tree.manifest.sync()?;

    // Readers fall through to the file from here on; cursors holding the
    // memchunk keep their own handle.
    chunk.evict_mem();
    Ok(())
}
