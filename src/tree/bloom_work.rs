//! Bloom construction: stream a flushed chunk's keys into a filter file.

use std::sync::Arc;

use super::LsmTree;
use crate::bloom::Bloom;
use crate::chunk::key::user_key;
use crate::chunk::{Chunk, CHUNK_BLOOM, CHUNK_ONDISK};
use crate::error::{Error, Result};
use crate::manifest::edit::TreeEdit;
use crate::stats::Stats;

/// Build the bloom for one flushed chunk the policy elects. At most one
/// build runs per chunk (`bloom_busy`); losers of that race, and units
/// for chunks whose bloom already exists, are no-ops.
pub(crate) fn work(tree: &Arc<LsmTree>) -> Result<()> {
    if !tree.is_active() {
        return Err(Error::Shutdown);
    }

    let target = {
        let state = tree.state.read()?;
        state
            .chunks
            .iter()
            .enumerate()
            .find(|(position, c)| {
                c.has_flag(CHUNK_ONDISK)
                    && !c.has_flag(CHUNK_BLOOM)
                    && !c.is_empty_chunk()
                    && tree.bloom_elects(c, *position)
            })
            .map(|(_, c)| c.clone())
    };
    let Some(chunk) = target else {
        return Ok(());
    };

    if !chunk.try_claim_bloom_build() {
        return Ok(());
    }
    chunk.pin();
    let result = build(tree, &chunk);
    chunk.unpin();
    chunk.release_bloom_build();

    if let Err(e) = result {
        let _ = std::fs::remove_file(chunk.bloom_uri());
        return Err(e);
    }
    Ok(())
}

fn build(tree: &Arc<LsmTree>, chunk: &Arc<Chunk>) -> Result<()> {
    if chunk.has_flag(CHUNK_BLOOM) {
        return Ok(());
    }

    let reader = chunk.reader(tree.collator.clone())?;
    let mut bloom = Bloom::new(
        tree.config.bloom_bit_count,
        tree.config.bloom_hash_count,
        chunk.count().max(reader.entry_count()),
    );

    let mut last_user: Option<Vec<u8>> = None;
    let mut scanned = 0u64;
    for entry in reader.iter() {
        let entry = entry?;
        if scanned % 1024 == 0 && !tree.is_active() {
            return Err(Error::Shutdown);
        }
        scanned += 1;

        let user = user_key(&entry.ikey);
        if last_user.as_deref() != Some(user) {
            bloom.insert(user);
            last_user = Some(user.to_vec());
        }
    }

    bloom.write_to(&chunk.bloom_uri())?;
    chunk.install_bloom(Arc::new(bloom));

    tree.manifest.append(TreeEdit::BloomBuilt {
        seq: tree.manifest.next_seq(),
        chunk_id: chunk.id(),
    })?;
    tree.manifest.sync()?;

    Stats::incr(&tree.stats.blooms_built);
    tracing::info!(tree = tree.name(), chunk = chunk.id(), "built bloom filter");
    Ok(())
}
