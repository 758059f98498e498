//! The merged cursor: one ordered, snapshot-consistent view over every
//! chunk of a tree.
//!
//! Iteration keeps one sub-cursor per chunk positioned and repeatedly
//! takes the smallest (or largest, going backward) user key among them.
//! When several chunks hold the current key, the newest chunk's version
//! wins and the older sub-cursors advance past it on the following step;
//! the MULTIPLE flag records that state. Tombstones are suppressed unless
//! the cursor is a minor-merge cursor, which must carry them into merge
//! outputs.
//!
//! Before every operation the cursor compares the tree's structural
//! generation against the one it captured; on drift it rebuilds its
//! sub-cursors under the tree read lock and re-seeks its position.

use std::cmp::Ordering;
use std::sync::Arc;

use super::chunk_cursor::{ChunkCursor, CursorRecord};
use super::{
    CURSOR_ACTIVE, CURSOR_ITERATE_NEXT, CURSOR_ITERATE_PREV, CURSOR_MERGE, CURSOR_MINOR_MERGE,
    CURSOR_MULTIPLE, CURSOR_OPEN_SNAPSHOT,
};
use crate::chunk::CHUNK_BLOOM;
use crate::error::{Error, Result};
use crate::stats::Stats;
use crate::tree::LsmTree;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Next,
    Prev,
}

pub struct MergedCursor {
    tree: Arc<LsmTree>,
    flags: u32,
    /// The cursor's own transaction, used for its writes.
    txn: u64,
    /// Upper bound on visible transactions; `u64::MAX` without
    /// OPEN_SNAPSHOT.
    snapshot: u64,
    /// Tree structural generation the sub-cursors were built against.
    dsk_gen: u64,
    /// Sub-cursors in active-chunk order, oldest to newest.
    cursors: Vec<ChunkCursor>,
    /// How many of the newest chunks may hold writes past the snapshot
    /// and must be consulted on update conflict checks.
    nupdates: usize,
    /// Key of the record last returned (or sought), for re-positioning.
    last_key: Option<Vec<u8>>,
    positioned: Option<Direction>,
    update_count: u64,
}

impl MergedCursor {
    pub(crate) fn open(tree: &Arc<LsmTree>, flags: u32, txn: u64) -> Result<Self> {
        let snapshot = if flags & CURSOR_OPEN_SNAPSHOT != 0 {
            txn
        } else {
            u64::MAX
        };
        let mut cursor = Self {
            tree: Arc::clone(tree),
            flags: flags | CURSOR_ACTIVE,
            txn,
            snapshot,
            dsk_gen: 0,
            cursors: Vec::new(),
            nupdates: 0,
            last_key: None,
            positioned: None,
            update_count: 0,
        };
        cursor.rebuild()?;
        Ok(cursor)
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    fn rebuild(&mut self) -> Result<()> {
        self.cursors.clear();

        let state = self.tree.state.read()?;
        for chunk in &state.chunks {
            if chunk.is_empty_chunk() {
                continue;
            }
            self.cursors.push(ChunkCursor::open(
                Arc::clone(chunk),
                self.snapshot,
                self.tree.collator.clone(),
            )?);
        }
        // Capture the generation while the lock still excludes structural
        // changes, so drift after this point is always detected.
        self.dsk_gen = self.tree.dsk_gen.load(std::sync::atomic::Ordering::SeqCst);
        drop(state);

        self.nupdates = self
            .cursors
            .iter()
            .rev()
            .take_while(|c| {
                let switch_txn = c.chunk().switch_txn();
                switch_txn == 0 || switch_txn > self.snapshot
            })
            .count();
        Ok(())
    }

    /// Rebuild the sub-cursor array if the tree's structure moved under
    /// us; the next positioning re-seeks from `last_key`.
    fn ensure_valid(&mut self) -> Result<()> {
        if self.tree.dsk_gen.load(std::sync::atomic::Ordering::SeqCst) == self.dsk_gen {
            return Ok(());
        }
        Stats::incr(&self.tree.stats.cursor_rebuilds);
        self.rebuild()?;
        self.positioned = None;
        Ok(())
    }

    // --- ordered iteration ---

    /// Step to the next record in collator order. `None` past the end.
    pub fn next(&mut self) -> Result<Option<CursorRecord>> {
        self.ensure_valid()?;
        self.flags = (self.flags & !CURSOR_ITERATE_PREV) | CURSOR_ITERATE_NEXT;

        match self.positioned {
            Some(Direction::Next) => {
                if let Some(last) = self.last_key.clone() {
                    self.advance_past(&last)?;
                }
            }
            _ => {
                match self.last_key.clone() {
                    None => {
                        for cursor in &mut self.cursors {
                            cursor.first()?;
                        }
                    }
                    Some(last) => {
                        for cursor in &mut self.cursors {
                            cursor.seek_ge(&last)?;
                        }
                        self.advance_past(&last)?;
                    }
                }
                self.positioned = Some(Direction::Next);
            }
        }

        loop {
            let Some(best) = self.pick(Direction::Next) else {
                return Ok(None);
            };
            let record = self.cursors[best]
                .current()
                .cloned()
                .ok_or_else(|| Error::Corruption("unpositioned winning sub-cursor".to_string()))?;
            self.last_key = Some(record.key.clone());

            if record.value.is_none() && self.flags & CURSOR_MINOR_MERGE == 0 {
                let key = record.key;
                self.advance_past(&key)?;
                continue;
            }
            return Ok(Some(record));
        }
    }

    /// Step to the previous record in collator order. `None` before the
    /// start.
    pub fn prev(&mut self) -> Result<Option<CursorRecord>> {
        self.ensure_valid()?;
        self.flags = (self.flags & !CURSOR_ITERATE_NEXT) | CURSOR_ITERATE_PREV;

        match self.positioned {
            Some(Direction::Prev) => {
                if let Some(last) = self.last_key.clone() {
                    self.retreat_past(&last)?;
                }
            }
            _ => {
                match self.last_key.clone() {
                    None => {
                        for cursor in &mut self.cursors {
                            cursor.last()?;
                        }
                    }
                    Some(last) => {
                        for cursor in &mut self.cursors {
                            cursor.seek_le(&last)?;
                        }
                        self.retreat_past(&last)?;
                    }
                }
                self.positioned = Some(Direction::Prev);
            }
        }

        loop {
            let Some(best) = self.pick(Direction::Prev) else {
                return Ok(None);
            };
            let record = self.cursors[best]
                .current()
                .cloned()
                .ok_or_else(|| Error::Corruption("unpositioned winning sub-cursor".to_string()))?;
            self.last_key = Some(record.key.clone());

            if record.value.is_none() && self.flags & CURSOR_MINOR_MERGE == 0 {
                let key = record.key;
                self.retreat_past(&key)?;
                continue;
            }
            return Ok(Some(record));
        }
    }

    fn advance_past(&mut self, key: &[u8]) -> Result<()> {
        for cursor in &mut self.cursors {
            if cursor.current_key() == Some(key) {
                cursor.next()?;
            }
        }
        Ok(())
    }

    fn retreat_past(&mut self, key: &[u8]) -> Result<()> {
        for cursor in &mut self.cursors {
            if cursor.current_key() == Some(key) {
                cursor.prev()?;
            }
        }
        Ok(())
    }

    /// The winning sub-cursor for the current step: smallest (forward) or
    /// largest (backward) key, newest chunk on ties. Maintains MULTIPLE.
    fn pick(&mut self, direction: Direction) -> Option<usize> {
        let want = match direction {
            Direction::Next => Ordering::Less,
            Direction::Prev => Ordering::Greater,
        };

        let mut best: Option<usize> = None;
        let mut multiple = false;
        for (i, cursor) in self.cursors.iter().enumerate() {
            let Some(key) = cursor.current_key() else {
                continue;
            };
            match best {
                None => best = Some(i),
                Some(b) => {
                    let Some(best_key) = self.cursors[b].current_key() else {
                        best = Some(i);
                        continue;
                    };
                    let cmp = self.tree.collator.compare(key, best_key);
                    if cmp == want {
                        best = Some(i);
                        multiple = false;
                    } else if cmp == Ordering::Equal {
                        // Higher index is the newer chunk; it wins and the
                        // older value is suppressed.
                        best = Some(i);
                        multiple = true;
                    }
                }
            }
        }

        if multiple {
            self.flags |= CURSOR_MULTIPLE;
        } else {
            self.flags &= !CURSOR_MULTIPLE;
        }
        best
    }

    // --- point lookup ---

    /// Exact lookup, newest chunk first, bloom filters pruning chunks the
    /// key cannot be in. A tombstone is `NotFound`.
    pub fn search(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.ensure_valid()?;
        Stats::incr(&self.tree.stats.searches);

        for i in (0..self.cursors.len()).rev() {
            let chunk = Arc::clone(self.cursors[i].chunk());
            let mut bloom_consulted = false;
            if chunk.mem().is_none() && chunk.has_flag(CHUNK_BLOOM) {
                if let Some(bloom) = chunk.bloom_handle()? {
                    if !bloom.check(key) {
                        Stats::incr(&self.tree.stats.bloom_skips);
                        continue;
                    }
                    bloom_consulted = true;
                }
            }

            if self.cursors[i].search(key)? {
                let record = self.cursors[i].current().cloned().ok_or_else(|| {
                    Error::Corruption("search hit without a positioned record".to_string())
                })?;
                self.last_key = Some(record.key.clone());
                self.positioned = None;
                return match record.value {
                    Some(value) => Ok(value),
                    None => Err(Error::NotFound),
                };
            }
            if bloom_consulted {
                Stats::incr(&self.tree.stats.bloom_false_positives);
            }
        }
        Err(Error::NotFound)
    }

    /// Position at the nearest visible record: exact if present, else the
    /// successor, else the predecessor. The ordering reports which side
    /// the match landed on relative to the sought key.
    pub fn search_near(&mut self, key: &[u8]) -> Result<(CursorRecord, Ordering)> {
        self.ensure_valid()?;

        for cursor in &mut self.cursors {
            cursor.seek_ge(key)?;
        }
        self.positioned = Some(Direction::Next);
        loop {
            let Some(best) = self.pick(Direction::Next) else {
                break;
            };
            let record = self.cursors[best].current().cloned().ok_or_else(|| {
                Error::Corruption("unpositioned winning sub-cursor".to_string())
            })?;
            self.last_key = Some(record.key.clone());
            if record.value.is_none() && self.flags & CURSOR_MINOR_MERGE == 0 {
                let found = record.key;
                self.advance_past(&found)?;
                continue;
            }
            let cmp = if record.key == key {
                Ordering::Equal
            } else {
                Ordering::Greater
            };
            return Ok((record, cmp));
        }

        for cursor in &mut self.cursors {
            cursor.seek_le(key)?;
        }
        self.positioned = Some(Direction::Prev);
        loop {
            let Some(best) = self.pick(Direction::Prev) else {
                return Err(Error::NotFound);
            };
            let record = self.cursors[best].current().cloned().ok_or_else(|| {
                Error::Corruption("unpositioned winning sub-cursor".to_string())
            })?;
            self.last_key = Some(record.key.clone());
            if record.value.is_none() && self.flags & CURSOR_MINOR_MERGE == 0 {
                let found = record.key;
                self.retreat_past(&found)?;
                continue;
            }
            return Ok((record, Ordering::Less));
        }
    }

    // --- updates ---

    /// Insert through the cursor's transaction. Fails with `Conflict`
    /// under snapshot isolation when a newer committed write exists.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.modify(key, Some(value))
    }

    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.modify(key, Some(value))
    }

    /// Write a tombstone for the key.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.modify(key, None)
    }

    fn modify(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if self.flags & (CURSOR_MERGE | CURSOR_MINOR_MERGE) != 0 {
            return Err(Error::ReadOnly);
        }
        self.ensure_valid()?;
        self.check_conflict(key)?;

        match value {
            Some(value) => self.tree.insert(key, value, self.txn)?,
            None => self.tree.remove(key, self.txn)?,
        }
        self.update_count += 1;
        Ok(())
    }

    /// Under snapshot isolation, refuse the write when any chunk new
    /// enough to postdate the snapshot holds a newer committed version.
    fn check_conflict(&self, key: &[u8]) -> Result<()> {
        if self.flags & CURSOR_OPEN_SNAPSHOT == 0 {
            return Ok(());
        }
        let n = self.cursors.len();
        for i in (n - self.nupdates.min(n)..n).rev() {
            if let Some(txn) = self.cursors[i].newest_txn(key)? {
                if txn > self.snapshot && txn != self.txn {
                    Stats::incr(&self.tree.stats.conflicts);
                    return Err(Error::Conflict);
                }
                break;
            }
        }
        Ok(())
    }

    // --- lifecycle ---

    /// Forget the cursor's position without touching the tree.
    pub fn reset(&mut self) {
        self.last_key = None;
        self.positioned = None;
        self.flags &= !(CURSOR_ITERATE_NEXT | CURSOR_ITERATE_PREV | CURSOR_MULTIPLE);
        for cursor in &mut self.cursors {
            cursor.clear();
        }
    }

    /// Close the cursor, releasing every chunk pin synchronously.
    pub fn close(mut self) {
        self.cursors.clear();
        self.flags &= !CURSOR_ACTIVE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ManagerConfig, TreeConfig};
    use crate::cursor::{CURSOR_OPEN_READ, CURSOR_OPEN_SNAPSHOT};
    use crate::tmpfs::TestDir;
    use crate::worker::manager::LsmManager;
    use std::time::Duration;

    fn paused_manager() -> Arc<LsmManager> {
        let manager = LsmManager::start(
            ManagerConfig::default()
                .workers_max(2)
                .merge_threads(1)
                .work_wait(Duration::from_millis(10)),
        )
        .expect("manager");
        manager.stop().expect("stop");
        manager
    }

    /// Three layers: two flushed chunks and the primary, with key "c"
    /// written in all three.
    fn layered_tree(dir: &TestDir) -> (Arc<LsmManager>, Arc<LsmTree>) {
        let manager = paused_manager();
        let config = TreeConfig::new(dir.path()).chunk_size(1 << 20);
        let tree = manager.open_tree("test", config).expect("open tree");

        for (key, value) in [("a", "a1"), ("c", "c1")] {
            let txn = tree.begin_txn();
            tree.insert(key.as_bytes(), value.as_bytes(), txn).unwrap();
        }
        tree.switch_now().unwrap();
        crate::tree::flush::work(&tree).unwrap();

        for (key, value) in [("b", "b2"), ("c", "c2")] {
            let txn = tree.begin_txn();
            tree.insert(key.as_bytes(), value.as_bytes(), txn).unwrap();
        }
        tree.switch_now().unwrap();
        crate::tree::flush::work(&tree).unwrap();

        for (key, value) in [("d", "d3"), ("c", "c3")] {
            let txn = tree.begin_txn();
            tree.insert(key.as_bytes(), value.as_bytes(), txn).unwrap();
        }

        (manager, tree)
    }

    fn collect_forward(cursor: &mut MergedCursor) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(record) = cursor.next().unwrap() {
            out.push((record.key, record.value.expect("no tombstones here")));
        }
        out
    }

    #[test]
    fn test_forward_iteration_newest_wins() {
        let dir = TestDir::new();
        let (_manager, tree) = layered_tree(&dir);

        let mut cursor = tree.open_cursor(CURSOR_OPEN_READ, tree.current_txn()).unwrap();
        let records = collect_forward(&mut cursor);
        assert_eq!(
            records,
            vec![
                (b"a".to_vec(), b"a1".to_vec()),
                (b"b".to_vec(), b"b2".to_vec()),
                (b"c".to_vec(), b"c3".to_vec()),
                (b"d".to_vec(), b"d3".to_vec()),
            ]
        );
        cursor.close();
    }

    #[test]
    fn test_multiple_flag_tracks_ties() {
        let dir = TestDir::new();
        let (_manager, tree) = layered_tree(&dir);

        let mut cursor = tree.open_cursor(CURSOR_OPEN_READ, tree.current_txn()).unwrap();

        let a = cursor.next().unwrap().unwrap();
        assert_eq!(a.key, b"a");
        assert_eq!(cursor.flags() & CURSOR_MULTIPLE, 0);

        cursor.next().unwrap();
        let c = cursor.next().unwrap().unwrap();
        assert_eq!(c.key, b"c");
        // All three chunks hold "c".
        assert_ne!(cursor.flags() & CURSOR_MULTIPLE, 0);
        cursor.close();
    }

    #[test]
    fn test_backward_iteration() {
        let dir = TestDir::new();
        let (_manager, tree) = layered_tree(&dir);

        let mut cursor = tree.open_cursor(CURSOR_OPEN_READ, tree.current_txn()).unwrap();
        let mut keys = Vec::new();
        while let Some(record) = cursor.prev().unwrap() {
            assert!(record.value.is_some());
            keys.push(record.key);
        }
        assert_eq!(
            keys,
            vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]
        );
        cursor.close();
    }

    #[test]
    fn test_direction_change_mid_iteration() {
        let dir = TestDir::new();
        let (_manager, tree) = layered_tree(&dir);

        let mut cursor = tree.open_cursor(CURSOR_OPEN_READ, tree.current_txn()).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().key, b"a");
        assert_eq!(cursor.next().unwrap().unwrap().key, b"b");
        // Reversing returns the predecessor of the last returned record.
        assert_eq!(cursor.prev().unwrap().unwrap().key, b"a");
        assert_eq!(cursor.next().unwrap().unwrap().key, b"b");
        cursor.close();
    }

    #[test]
    fn test_tombstone_suppression() {
        let dir = TestDir::new();
        let (_manager, tree) = layered_tree(&dir);

        let txn = tree.begin_txn();
        tree.remove(b"c", txn).unwrap();

        let mut cursor = tree.open_cursor(CURSOR_OPEN_READ, tree.current_txn()).unwrap();
        let keys: Vec<_> = collect_forward(&mut cursor)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]);

        assert_eq!(cursor.search(b"c"), Err(Error::NotFound));
        cursor.close();

        // A minor-merge cursor sees the tombstone itself.
        let mut merge_cursor = tree
            .open_cursor(CURSOR_MERGE | CURSOR_MINOR_MERGE, tree.current_txn())
            .unwrap();
        let mut saw_tombstone = false;
        while let Some(record) = merge_cursor.next().unwrap() {
            if record.key == b"c" {
                assert_eq!(record.value, None);
                saw_tombstone = true;
            }
        }
        assert!(saw_tombstone);
        merge_cursor.close();
    }

    #[test]
    fn test_snapshot_bounds_iteration() {
        let dir = TestDir::new();
        let (_manager, tree) = layered_tree(&dir);

        // Transactions: a=1, c=2 | b=3, c=4 | d=5, c=6.
        let mut cursor = tree
            .open_cursor(CURSOR_OPEN_READ | CURSOR_OPEN_SNAPSHOT, 4)
            .unwrap();
        let records = collect_forward(&mut cursor);
        assert_eq!(
            records,
            vec![
                (b"a".to_vec(), b"a1".to_vec()),
                (b"b".to_vec(), b"b2".to_vec()),
                (b"c".to_vec(), b"c2".to_vec()),
            ]
        );
        assert_eq!(cursor.search(b"d"), Err(Error::NotFound));
        cursor.close();
    }

    #[test]
    fn test_search_near_sides() {
        let dir = TestDir::new();
        let (_manager, tree) = layered_tree(&dir);

        let mut cursor = tree.open_cursor(CURSOR_OPEN_READ, tree.current_txn()).unwrap();

        let (record, cmp) = cursor.search_near(b"b").unwrap();
        assert_eq!(record.key, b"b");
        assert_eq!(cmp, Ordering::Equal);

        let (record, cmp) = cursor.search_near(b"bb").unwrap();
        assert_eq!(record.key, b"c");
        assert_eq!(cmp, Ordering::Greater);

        let (record, cmp) = cursor.search_near(b"zz").unwrap();
        assert_eq!(record.key, b"d");
        assert_eq!(cmp, Ordering::Less);
        cursor.close();
    }

    #[test]
    fn test_reset_restarts_iteration() {
        let dir = TestDir::new();
        let (_manager, tree) = layered_tree(&dir);

        let mut cursor = tree.open_cursor(CURSOR_OPEN_READ, tree.current_txn()).unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().key, b"a");
        assert_eq!(cursor.next().unwrap().unwrap().key, b"b");

        cursor.reset();
        assert_eq!(cursor.next().unwrap().unwrap().key, b"a");
        cursor.close();
    }

    #[test]
    fn test_snapshot_conflict_on_update() {
        let dir = TestDir::new();
        let manager = paused_manager();
        let config = TreeConfig::new(dir.path()).chunk_size(1 << 20);
        let tree = manager.open_tree("test", config).unwrap();

        let txn1 = tree.begin_txn();
        tree.insert(b"k", b"v1", txn1).unwrap();

        let snapshot_txn = tree.begin_txn();
        let mut cursor = tree
            .open_cursor(CURSOR_OPEN_SNAPSHOT, snapshot_txn)
            .unwrap();

        // A later writer commits a newer version.
        let txn3 = tree.begin_txn();
        tree.insert(b"k", b"v3", txn3).unwrap();

        assert_eq!(cursor.insert(b"k", b"mine"), Err(Error::Conflict));
        assert_eq!(tree.stats().conflicts, 1);

        // Untouched keys update fine through the same cursor.
        assert!(cursor.insert(b"fresh", b"value").is_ok());
        assert_eq!(cursor.update_count(), 1);
        cursor.close();
    }

    #[test]
    fn test_merge_cursor_rejects_updates() {
        let dir = TestDir::new();
        let (_manager, tree) = layered_tree(&dir);

        let mut cursor = tree
            .open_cursor(CURSOR_MERGE | CURSOR_MINOR_MERGE, tree.current_txn())
            .unwrap();
        assert_eq!(cursor.insert(b"x", b"y"), Err(Error::ReadOnly));
        assert_eq!(cursor.remove(b"a"), Err(Error::ReadOnly));
        cursor.close();
    }

    #[test]
    fn test_cursor_pins_released_on_close() {
        let dir = TestDir::new();
        let (_manager, tree) = layered_tree(&dir);

        let chunks: Vec<_> = tree.state.read().unwrap().chunks.clone();
        assert!(chunks.iter().all(|c| c.refcnt() == 0));

        let cursor = tree.open_cursor(CURSOR_OPEN_READ, tree.current_txn()).unwrap();
        assert!(chunks.iter().all(|c| c.refcnt() == 1));

        cursor.close();
        assert!(chunks.iter().all(|c| c.refcnt() == 0));
    }
}
