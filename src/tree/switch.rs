//! Switch: seal the primary chunk and start a new one.

use std::sync::Arc;

use super::{LsmTree, TREE_NEED_SWITCH};
use crate::chunk::{Chunk, CHUNK_STABLE};
use crate::error::{Error, Result};
use crate::manifest::edit::TreeEdit;
use crate::stats::Stats;
use crate::worker::WorkKind;

/// Seal the primary and install a fresh one. Idempotent: without
/// NEED_SWITCH or `force`, or with an empty primary, this is a no-op, so
/// duplicate queued units are harmless.
pub(crate) fn work(tree: &Arc<LsmTree>, force: bool) -> Result<()> {
    if !tree.is_active() {
        return Err(Error::Shutdown);
    }

    // Cheap precheck before taking the write lock.
    {
        let state = tree.state.read()?;
        let Some(primary) = state.chunks.last() else {
            return Ok(());
        };
        if !tree.has_tree_flag(TREE_NEED_SWITCH) && !force {
            return Ok(());
        }
        let nonempty = primary.mem().is_some_and(|m| !m.is_empty());
        if !nonempty {
            tree.clear_tree_flag(TREE_NEED_SWITCH);
            return Ok(());
        }
    }

    let (sealed_id, switch_txn, new_id) = {
        let mut state = tree.state.write()?;
        let Some(primary) = state.chunks.last().cloned() else {
            return Ok(());
        };
        if primary.has_flag(CHUNK_STABLE) {
            // Lost the race with another switch.
            return Ok(());
        }
        let Some(mem) = primary.mem() else {
            return Ok(());
        };
        if mem.is_empty() {
            tree.clear_tree_flag(TREE_NEED_SWITCH);
            return Ok(());
        }

        // Seal: no write can slip in past this point, writers hold the
        // read lock while inserting.
        mem.seal();
        let switch_txn = tree.current_txn();
        primary.set_switch_txn(switch_txn);
        primary.set_counts(mem.count(), mem.size());
        primary.set_flag(CHUNK_STABLE);

        let new_id = tree.next_chunk_id();
        let new_primary = Chunk::new_primary(&tree.config.dir, new_id, tree.collator.clone());
        let edit = TreeEdit::Switch {
            seq: tree.manifest.next_seq(),
            chunk: new_primary.meta(),
            sealed_id: primary.id(),
            sealed_switch_txn: switch_txn,
        };
        state.chunks.push(new_primary);

        tree.clear_tree_flag(TREE_NEED_SWITCH);
        tree.bump_dsk_gen();
        tree.update_fill_estimate();
        tree.manifest.append(edit)?;
        tree.manifest.sync()?;
        debug_assert!(LsmTree::validate_state(&state).is_ok());

        (primary.id(), switch_txn, new_id)
    };

    Stats::incr(&tree.stats.switches);
    tracing::info!(
        tree = tree.name(),
        sealed = sealed_id,
        switch_txn = switch_txn,
        new_chunk = new_id,
        "switched primary chunk"
    );

    tree.update_throttle();
    tree.enqueue_work(WorkKind::Flush, false);
    Ok(())
}
