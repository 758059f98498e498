use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use itertools::Itertools;

use super::{
    switch, TREE_ACTIVE, TREE_COMPACTING, TREE_EXCLUSIVE, TREE_NEED_SWITCH, TREE_OPEN,
    TREE_THROTTLE,
};
use crate::chunk::{Chunk, CHUNK_BLOOM, CHUNK_MERGING, CHUNK_ONDISK, CHUNK_STABLE};
use crate::collator::Collator;
use crate::config::TreeConfig;
use crate::cursor::MergedCursor;
use crate::error::{Error, Result};
use crate::manifest::edit::TreeEdit;
use crate::manifest::Manifest;
use crate::stats::{Stats, StatsSnapshot};
use crate::worker::manager::LsmManager;
use crate::worker::WorkKind;

const MANIFEST_FILE: &str = "manifest.log";

/// The chunk lists, guarded by the tree's reader-writer lock. Readers see
/// a consistent snapshot; structural changes (switch, merge replace, move
/// to old, drop) require the write half.
pub struct TreeState {
    /// Active chunks, oldest to newest. The primary is the last element
    /// and the only chunk accepting writes.
    pub chunks: Vec<Arc<Chunk>>,
    /// Post-merge inputs awaiting drop.
    pub old_chunks: Vec<Arc<Chunk>>,
}

pub struct LsmTree {
    name: String,
    pub(crate) config: TreeConfig,
    pub(crate) collator: Arc<dyn Collator>,
    pub(crate) manager: Arc<LsmManager>,
    pub(crate) manifest: Manifest,
    pub stats: Stats,

    pub(crate) state: RwLock<TreeState>,
    flags: AtomicU32,
    flags_atomic: AtomicU32,

    /// Structural generation; bumped on every chunk-array change so
    /// cursors can detect drift and rebuild.
    pub(crate) dsk_gen: AtomicU64,
    last_chunk_id: AtomicU32,
    next_txn: AtomicU64,

    /// EWMA over observed chunk fill times, in milliseconds.
    pub(crate) chunk_fill_ms: AtomicU64,
    ckpt_throttle_us: AtomicU64,
    merge_throttle_us: AtomicU64,
    last_switch: Mutex<Instant>,

    pub(crate) merge_aggressiveness: AtomicU32,
    pub(crate) freeing_old_chunks: AtomicBool,
    disabled_work: AtomicU32,

    pub(crate) weak_self: Weak<LsmTree>,
}

impl LsmTree {
    /// Open (or create) a tree under the given manager. Called through
    /// [`LsmManager::open_tree`], which deduplicates handles by name.
    pub(crate) fn open(
        manager: &Arc<LsmManager>,
        name: &str,
        config: TreeConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let collator = manager.collators().resolve(&config.collator)?;

        fs::create_dir_all(&config.dir)?;
        let manifest = Manifest::open(config.dir.join(MANIFEST_FILE), collator.name())?;
        let replayed = manifest.replay()?;

        let mut chunks: Vec<Arc<Chunk>> = replayed
            .active
            .iter()
            .map(|meta| Chunk::from_meta(&config.dir, meta))
            .collect();
        let old_chunks: Vec<Arc<Chunk>> = replayed
            .old
            .iter()
            .map(|meta| Chunk::from_meta(&config.dir, meta))
            .collect();

        let mut last_chunk_id = replayed.next_chunk_id.saturating_sub(1);
        let next_txn = replayed
            .active
            .iter()
            .chain(replayed.old.iter())
            .map(|meta| meta.switch_txn)
            .max()
            .unwrap_or(0);

        // Re-arm the primary. A recovered non-STABLE tail was the primary
        // at crash; its in-memory contents are gone, so it restarts fresh
        // under the same id. Otherwise allocate a new one.
        let mut initial_edit = None;
        match chunks.last_mut() {
            Some(last) if !last.has_flag(CHUNK_STABLE) => {
                let id = last.id();
                *last = Chunk::new_primary(&config.dir, id, collator.clone());
            }
            _ => {
                last_chunk_id += 1;
                let primary = Chunk::new_primary(&config.dir, last_chunk_id, collator.clone());
                initial_edit = Some(TreeEdit::Switch {
                    seq: manifest.next_seq(),
                    chunk: primary.meta(),
                    sealed_id: 0,
                    sealed_switch_txn: 0,
                });
                chunks.push(primary);
            }
        }
        if let Some(edit) = initial_edit {
            manifest.append(edit)?;
            manifest.sync()?;
        }

        let state = TreeState { chunks, old_chunks };
        Self::validate_state(&state)?;

        let tree = Arc::new_cyclic(|weak| Self {
            name: name.to_string(),
            config,
            collator,
            manager: Arc::clone(manager),
            manifest,
            stats: Stats::default(),
            state: RwLock::new(state),
            flags: AtomicU32::new(TREE_OPEN | TREE_ACTIVE),
            flags_atomic: AtomicU32::new(0),
            dsk_gen: AtomicU64::new(1),
            last_chunk_id: AtomicU32::new(last_chunk_id),
            next_txn: AtomicU64::new(next_txn),
            chunk_fill_ms: AtomicU64::new(0),
            ckpt_throttle_us: AtomicU64::new(0),
            merge_throttle_us: AtomicU64::new(0),
            last_switch: Mutex::new(Instant::now()),
            merge_aggressiveness: AtomicU32::new(0),
            freeing_old_chunks: AtomicBool::new(false),
            disabled_work: AtomicU32::new(0),
            weak_self: weak.clone(),
        });

        {
            let state = tree.state.read()?;
            tracing::info!(
                tree = name,
                chunks = state.chunks.len(),
                old_chunks = state.old_chunks.len(),
                "opened lsm tree"
            );
        }
        Ok(tree)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // --- flags ---

    pub(crate) fn has_tree_flag(&self, bit: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & bit != 0
    }

    pub(crate) fn set_tree_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::SeqCst);
    }

    pub(crate) fn clear_tree_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.has_tree_flag(TREE_OPEN)
    }

    pub fn is_active(&self) -> bool {
        self.has_tree_flag(TREE_ACTIVE)
    }

    /// Claim exclusive use of this tree handle. Fails with `Busy` if some
    /// other caller already holds it.
    pub fn set_exclusive(&self) -> Result<()> {
        self.flags_atomic
            .compare_exchange(0, TREE_EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    pub fn clear_exclusive(&self) {
        self.flags_atomic.store(0, Ordering::Release);
    }

    pub fn is_exclusive(&self) -> bool {
        self.flags_atomic.load(Ordering::Acquire) & TREE_EXCLUSIVE != 0
    }

    // --- transactions ---

    /// Allocate a transaction id. Ids are strictly increasing from one.
    pub fn begin_txn(&self) -> u64 {
        self.next_txn.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The largest transaction id allocated so far.
    pub(crate) fn current_txn(&self) -> u64 {
        self.next_txn.load(Ordering::SeqCst)
    }

    // --- write path ---

    pub fn insert(&self, key: &[u8], value: &[u8], txn: u64) -> Result<()> {
        self.write(key, txn, Some(value.to_vec()))
    }

    /// Same as insert; the newer version shadows the older one.
    pub fn update(&self, key: &[u8], value: &[u8], txn: u64) -> Result<()> {
        self.write(key, txn, Some(value.to_vec()))
    }

    /// Write a tombstone for the key.
    pub fn remove(&self, key: &[u8], txn: u64) -> Result<()> {
        self.write(key, txn, None)
    }

    fn write(&self, key: &[u8], txn: u64, value: Option<Vec<u8>>) -> Result<()> {
        if !self.is_open() || !self.is_active() {
            return Err(Error::Shutdown);
        }
        self.throttle_wait()?;

        loop {
            let state = self.state.read()?;
            let primary = state
                .chunks
                .last()
                .cloned()
                .ok_or_else(|| Error::Corruption("tree has no primary chunk".to_string()))?;
            let Some(mem) = primary.mem() else {
                // Mid-switch; the new primary appears under the write lock.
                drop(state);
                std::thread::yield_now();
                continue;
            };

            match mem.put(key, txn, value.clone()) {
                Ok(()) => {
                    let size = mem.size();
                    drop(state);
                    if size > self.config.chunk_size && !self.has_tree_flag(TREE_NEED_SWITCH) {
                        self.set_tree_flag(TREE_NEED_SWITCH);
                        self.enqueue_work(WorkKind::Switch, false);
                    }
                    return Ok(());
                }
                Err(Error::ReadOnly) => {
                    // The primary was sealed under us; retry on the new one.
                    drop(state);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // --- read path ---

    /// Point lookup: newest chunk first, bloom filters skipping chunks
    /// that cannot hold the key, tombstones surfacing as `NotFound`.
    pub fn search(&self, key: &[u8], txn: u64) -> Result<Vec<u8>> {
        if !self.is_open() {
            return Err(Error::Shutdown);
        }
        Stats::incr(&self.stats.searches);

        let state = self.state.read()?;
        for chunk in state.chunks.iter().rev() {
            if chunk.is_empty_chunk() {
                continue;
            }

            let mut bloom_consulted = false;
            if chunk.mem().is_none() && chunk.has_flag(CHUNK_BLOOM) {
                if let Some(bloom) = chunk.bloom_handle()? {
                    if !bloom.check(key) {
                        Stats::incr(&self.stats.bloom_skips);
                        continue;
                    }
                    bloom_consulted = true;
                }
            }

            match chunk.get(key, txn, self.collator.clone())? {
                Some(Some(value)) => return Ok(value),
                Some(None) => return Err(Error::NotFound),
                None => {
                    if bloom_consulted {
                        Stats::incr(&self.stats.bloom_false_positives);
                    }
                }
            }
        }
        Err(Error::NotFound)
    }

    /// Open a merged cursor over the tree. See [`crate::cursor`] for the
    /// flag bits.
    pub fn open_cursor(self: &Arc<Self>, flags: u32, txn: u64) -> Result<MergedCursor> {
        if !self.is_open() {
            return Err(Error::Shutdown);
        }
        MergedCursor::open(self, flags, txn)
    }

    // --- maintenance entry points ---

    /// Seal the primary immediately, regardless of size.
    pub fn switch_now(self: &Arc<Self>) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Shutdown);
        }
        switch::work(self, true)
    }

    /// Drive aggressive merging until the tree holds at most `merge_max`
    /// chunks or no further progress is possible.
    pub fn compact(self: &Arc<Self>) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Shutdown);
        }
        self.set_tree_flag(TREE_COMPACTING);
        let result = self.compact_inner();
        self.clear_tree_flag(TREE_COMPACTING);
        result
    }

    fn compact_inner(self: &Arc<Self>) -> Result<()> {
        switch::work(self, true)?;

        let mut stalls = 0u32;
        loop {
            while self.needs_flush() {
                super::flush::work(self)?;
            }
            let before = self.state.read()?.chunks.len();

            super::merge::work(self)?;
            super::drop_chunks::work(self)?;

            let after = self.state.read()?.chunks.len();
            if after <= self.config.merge_max {
                break;
            }
            if !self.is_active() {
                return Err(Error::Shutdown);
            }
            if after >= before {
                stalls += 1;
                if stalls > 10 {
                    tracing::warn!(tree = self.name(), chunks = after, "compaction stalled");
                    break;
                }
            } else {
                stalls = 0;
            }
        }
        Ok(())
    }

    /// Stop background work for this tree: clear ACTIVE and discard its
    /// queued units. In-flight units abort at their next ACTIVE check.
    pub fn worker_stop(&self) {
        self.clear_tree_flag(TREE_ACTIVE);
        self.manager.discard_tree(&self.weak_self);
    }

    /// Close the tree: stop work, persist a full snapshot so a reopen
    /// replays identical state, and release the handle flags.
    pub fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.worker_stop();

        {
            let state = self.state.read()?;
            let edit = TreeEdit::Snapshot {
                seq: self.manifest.next_seq(),
                active: state.chunks.iter().map(|c| c.meta()).collect(),
                old: state.old_chunks.iter().map(|c| c.meta()).collect(),
                next_chunk_id: self.last_chunk_id.load(Ordering::SeqCst) + 1,
            };
            self.manifest.append(edit)?;
            self.manifest.sync()?;
        }

        self.clear_tree_flag(TREE_OPEN);
        self.clear_exclusive();
        self.stats.log(&self.name);
        tracing::info!(tree = self.name(), "closed lsm tree");
        Ok(())
    }

    /// Discard every record in the tree, leaving one fresh primary chunk.
    pub fn truncate(&self) -> Result<()> {
        if !self.is_open() || !self.is_active() {
            return Err(Error::Shutdown);
        }

        let stale_files = {
            let mut state = self.state.write()?;
            let mut files = Vec::new();
            for chunk in state.chunks.iter().chain(state.old_chunks.iter()) {
                if chunk.has_flag(CHUNK_ONDISK) {
                    files.push(chunk.uri());
                }
                if chunk.has_flag(CHUNK_BLOOM) {
                    files.push(chunk.bloom_uri());
                }
            }

            let id = self.last_chunk_id.fetch_add(1, Ordering::SeqCst) + 1;
            let primary = Chunk::new_primary(&self.config.dir, id, self.collator.clone());
            let edit = TreeEdit::Snapshot {
                seq: self.manifest.next_seq(),
                active: vec![primary.meta()],
                old: Vec::new(),
                next_chunk_id: id + 1,
            };
            state.chunks = vec![primary];
            state.old_chunks.clear();
            self.bump_dsk_gen();
            self.manifest.append(edit)?;
            self.manifest.sync()?;
            files
        };

        for path in stale_files {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove file");
            }
        }
        tracing::info!(tree = self.name(), "truncated lsm tree");
        Ok(())
    }

    /// Close the tree and delete every file it owns.
    pub fn drop_tree(&self) -> Result<()> {
        self.close()?;
        fs::remove_dir_all(&self.config.dir)?;
        tracing::info!(tree = self.name(), "dropped lsm tree");
        Ok(())
    }

    // --- worker coordination ---

    pub(crate) fn enqueue_work(&self, kind: WorkKind, force: bool) {
        if !self.is_active() || self.work_disabled(kind) {
            return;
        }
        Stats::incr(&self.stats.units_queued);
        self.manager.enqueue(crate::worker::WorkUnit::new(
            kind,
            force,
            self.weak_self.clone(),
        ));
    }

    pub(crate) fn disable_work(&self, kind: WorkKind) {
        self.disabled_work.fetch_or(kind.mask(), Ordering::SeqCst);
    }

    pub(crate) fn work_disabled(&self, kind: WorkKind) -> bool {
        self.disabled_work.load(Ordering::SeqCst) & kind.mask() != 0
    }

    /// Does a sealed chunk await flushing?
    pub fn needs_flush(&self) -> bool {
        let state = match self.state.read() {
            Ok(state) => state,
            Err(_) => return false,
        };
        state.chunks.iter().any(|c| {
            c.has_flag(CHUNK_STABLE)
                && !c.has_flag(CHUNK_ONDISK)
                && !c.is_empty_chunk()
                && c.mem().is_some()
        })
    }

    /// Are there enough mergeable chunks for a merge to be worth queueing?
    pub fn needs_merge(&self) -> bool {
        let state = match self.state.read() {
            Ok(state) => state,
            Err(_) => return false,
        };
        let n = state.chunks.len();
        if n < 2 {
            return false;
        }
        let eligible = state.chunks[..n - 1]
            .iter()
            .filter(|c| {
                c.has_flag(CHUNK_ONDISK)
                    && c.has_flag(CHUNK_STABLE)
                    && !c.has_flag(CHUNK_MERGING)
                    && !c.is_empty_chunk()
            })
            .count();
        eligible >= self.config.merge_min
    }

    // --- structural bookkeeping ---

    pub(crate) fn bump_dsk_gen(&self) {
        self.dsk_gen.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn next_chunk_id(&self) -> u32 {
        self.last_chunk_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Structural invariants: ids strictly increasing in active order and
    /// at most one non-STABLE chunk (the primary, last).
    pub(crate) fn validate_state(state: &TreeState) -> Result<()> {
        for (a, b) in state.chunks.iter().tuple_windows() {
            if a.id() >= b.id() {
                return Err(Error::Corruption(format!(
                    "active chunk ids out of order: {} before {}",
                    a.id(),
                    b.id()
                )));
            }
        }
        let non_stable = state
            .chunks
            .iter()
            .filter(|c| !c.has_flag(CHUNK_STABLE))
            .count();
        if non_stable > 1 {
            return Err(Error::Corruption(format!(
                "{non_stable} chunks accept writes, expected at most one"
            )));
        }
        if let Some((position, _)) = state
            .chunks
            .iter()
            .find_position(|c| !c.has_flag(CHUNK_STABLE))
        {
            if position != state.chunks.len() - 1 {
                return Err(Error::Corruption(
                    "writable chunk is not the newest".to_string(),
                ));
            }
        }
        Ok(())
    }

    // --- throttling ---

    fn throttle_wait(&self) -> Result<()> {
        if !self.has_tree_flag(TREE_THROTTLE) {
            return Ok(());
        }
        let sleep_us = self.ckpt_throttle_us.load(Ordering::SeqCst)
            + self.merge_throttle_us.load(Ordering::SeqCst);
        if sleep_us == 0 {
            return Ok(());
        }
        let budget = self.config.throttle_budget_us;
        if budget == 0 {
            Stats::incr(&self.stats.busy_rejections);
            return Err(Error::Busy);
        }
        std::thread::sleep(Duration::from_micros(sleep_us.min(budget)));
        Ok(())
    }

    /// Recompute throttle magnitudes from the flush backlog and chunk
    /// count. Called after switches, flushes, and merges.
    pub(crate) fn update_throttle(&self) {
        let (unflushed, nchunks) = {
            let state = match self.state.read() {
                Ok(state) => state,
                Err(_) => return,
            };
            let unflushed = state
                .chunks
                .iter()
                .filter(|c| {
                    c.has_flag(CHUNK_STABLE) && !c.has_flag(CHUNK_ONDISK) && !c.is_empty_chunk()
                })
                .count();
            (unflushed, state.chunks.len())
        };

        let fill_ms = self.chunk_fill_ms.load(Ordering::SeqCst);
        let mut ckpt = 0u64;
        if unflushed > 1 {
            ckpt = self.config.ckpt_throttle_us.saturating_mul(unflushed as u64);
            if fill_ms > 0 {
                // Never slow writers past the rate chunks actually fill at.
                ckpt = ckpt.min(fill_ms.saturating_mul(1000));
            }
        }

        let excess = nchunks.saturating_sub(self.config.merge_max) as u64;
        let mut merge = 0u64;
        if excess > 0 {
            merge = self.config.merge_throttle_us.saturating_mul(excess);
            if self.manager.merge_idle() == 0 {
                // No merge worker is idle: merges are starved, push harder.
                merge = merge.saturating_mul(2);
            }
        }

        self.ckpt_throttle_us.store(ckpt, Ordering::SeqCst);
        self.merge_throttle_us.store(merge, Ordering::SeqCst);
        if ckpt + merge > 0 {
            self.set_tree_flag(TREE_THROTTLE);
        } else {
            self.clear_tree_flag(TREE_THROTTLE);
        }
    }

    /// Fold the time since the last switch into the fill-time EWMA.
    pub(crate) fn update_fill_estimate(&self) {
        let mut last = match self.last_switch.lock() {
            Ok(last) => last,
            Err(_) => return,
        };
        let elapsed = last.elapsed().as_millis() as u64;
        *last = Instant::now();

        let old = self.chunk_fill_ms.load(Ordering::SeqCst);
        let next = if old == 0 {
            elapsed
        } else {
            (3 * old + elapsed) / 4
        };
        self.chunk_fill_ms.store(next, Ordering::SeqCst);
    }

    /// Does the bloom policy elect this chunk? `position` is its index in
    /// the active array.
    pub(crate) fn bloom_elects(&self, chunk: &Chunk, position: usize) -> bool {
        let policy = self.config.bloom;
        if policy & crate::config::BLOOM_OFF != 0 {
            return false;
        }
        if policy & crate::config::BLOOM_MERGED != 0 {
            return chunk.generation() > 0
                || (policy & crate::config::BLOOM_OLDEST != 0 && position == 0);
        }
        // Default: every chunk except the still-filling newest.
        true
    }
}

impl std::fmt::Debug for LsmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmTree")
            .field("name", &self.name)
            .field("dsk_gen", &self.dsk_gen.load(Ordering::SeqCst))
            .field("flags", &self.flags.load(Ordering::SeqCst))
            .finish()
    }
}
