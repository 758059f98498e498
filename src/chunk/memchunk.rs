//! The mutable in-memory chunk.
//!
//! The primary chunk of a tree buffers writes in a concurrent skip list
//! keyed by internal key, so every version a key receives while this chunk
//! is primary stays addressable: snapshot reads pick the newest version at
//! or below their transaction id. crossbeam's `SkipMap` supports lock-free
//! concurrent readers alongside the writer path without any unsafe code.
//!
//! A switch seals the chunk: sealed chunks reject writes and are flushed to
//! a chunk file by a worker.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use super::key::{OrderedKey, INTERNAL_KEY_TAIL};
use crate::collator::Collator;
use crate::error::{Error, Result};

/// In-memory sorted chunk data. `None` values are tombstones.
pub struct MemChunk {
    data: SkipMap<OrderedKey, Option<Vec<u8>>>,
    collator: Arc<dyn Collator>,
    size: AtomicU64,
    count: AtomicU64,
    sealed: AtomicBool,
}

impl MemChunk {
    pub fn new(collator: Arc<dyn Collator>) -> Self {
        Self {
            data: SkipMap::new(),
            collator,
            size: AtomicU64::new(0),
            count: AtomicU64::new(0),
            sealed: AtomicBool::new(false),
        }
    }

    /// Insert one version of a key. `None` writes a tombstone.
    pub fn put(&self, key: &[u8], txn: u64, value: Option<Vec<u8>>) -> Result<()> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        let entry_size =
            (key.len() + INTERNAL_KEY_TAIL + value.as_ref().map_or(0, |v| v.len())) as u64;

        self.data
            .insert(OrderedKey::from_parts(key, txn, self.collator.clone()), value);
        self.size.fetch_add(entry_size, Ordering::SeqCst);
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// The newest version of `key` visible at `snapshot`, if any.
    /// `Some(None)` is a tombstone.
    pub fn get(&self, key: &[u8], snapshot: u64) -> Option<Option<Vec<u8>>> {
        let from = OrderedKey::from_parts(key, snapshot, self.collator.clone());
        let entry = self.data.range(from..).next()?;
        if entry.key().user_key() != key {
            return None;
        }
        Some(entry.value().clone())
    }

    /// First entry at or after `ikey` in internal-key order.
    pub fn seek(&self, ikey: &OrderedKey) -> Option<(OrderedKey, Option<Vec<u8>>)> {
        self.data
            .range(ikey.clone()..)
            .next()
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    /// Last entry strictly before `ikey` in internal-key order.
    pub fn seek_before(&self, ikey: &OrderedKey) -> Option<(OrderedKey, Option<Vec<u8>>)> {
        self.data
            .range((Bound::Unbounded, Bound::Excluded(ikey.clone())))
            .next_back()
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    pub fn first(&self) -> Option<(OrderedKey, Option<Vec<u8>>)> {
        self.data
            .front()
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    pub fn last(&self) -> Option<(OrderedKey, Option<Vec<u8>>)> {
        self.data
            .back()
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    /// All entries in internal-key order. Used by flush.
    pub fn entries(&self) -> impl Iterator<Item = (Vec<u8>, Option<Vec<u8>>)> + '_ {
        self.data
            .iter()
            .map(|e| (e.key().ikey.clone(), e.value().clone()))
    }

    /// Estimated bytes held.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Number of record versions held.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Seal the chunk against further writes. Idempotent.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MemChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemChunk")
            .field("count", &self.count())
            .field("size", &self.size())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
