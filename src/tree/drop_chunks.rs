//! Drop: reclaim old chunks once nothing references them.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::LsmTree;
use crate::chunk::{Chunk, CHUNK_BLOOM, CHUNK_ONDISK};
use crate::error::{Error, Result};
use crate::manifest::edit::TreeEdit;
use crate::stats::Stats;

/// Sweep the old-chunk list: entries with no remaining references lose
/// their files and metadata; pinned entries wait for a later cycle. The
/// `freeing_old_chunks` guard keeps concurrent sweeps out.
pub(crate) fn work(tree: &Arc<LsmTree>) -> Result<()> {
    if !tree.is_active() {
        return Err(Error::Shutdown);
    }
    if tree
        .freeing_old_chunks
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    let result = sweep(tree);
    tree.freeing_old_chunks.store(false, Ordering::SeqCst);
    result
}

fn sweep(tree: &Arc<LsmTree>) -> Result<()> {
    let reclaimed: Vec<Arc<Chunk>> = {
        let mut state = tree.state.write()?;
        let (free, keep): (Vec<_>, Vec<_>) = state
            .old_chunks
            .drain(..)
            .partition(|c| c.refcnt() == 0);
        state.old_chunks = keep;

        if free.is_empty() {
            return Ok(());
        }

        let edit = TreeEdit::Drop {
            seq: tree.manifest.next_seq(),
            chunks: free.iter().map(|c| (c.id(), c.generation())).collect(),
        };
        if let Err(e) = tree.manifest.append(edit).and_then(|_| tree.manifest.sync()) {
            // Leave the chunks in old_chunks for a retry cycle.
            state.old_chunks.extend(free);
            return Err(e);
        }
        free
    };

    for chunk in &reclaimed {
        if chunk.has_flag(CHUNK_ONDISK) {
            if let Err(e) = std::fs::remove_file(chunk.uri()) {
                tracing::warn!(
                    chunk = chunk.id(),
                    error = %e,
                    "failed to remove chunk file"
                );
            }
        }
        if chunk.has_flag(CHUNK_BLOOM) {
            if let Err(e) = std::fs::remove_file(chunk.bloom_uri()) {
                tracing::warn!(
                    chunk = chunk.id(),
                    error = %e,
                    "failed to remove bloom file"
                );
            }
        }
        Stats::incr(&tree.stats.chunks_dropped);
    }

    tracing::info!(
        tree = tree.name(),
        dropped = reclaimed.len(),
        "dropped old chunks"
    );
    Ok(())
}
