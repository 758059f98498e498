//! Sub-cursor over one chunk.
//!
//! A chunk cursor positions on user keys, resolving each to the newest
//! version visible at the cursor's snapshot. Stepping works by internal-key
//! seeks against the chunk's source, so the same logic serves the
//! in-memory primary and on-disk chunk files. The cursor pins its chunk
//! for as long as it lives.

use std::sync::Arc;

use crate::chunk::file::ChunkFileReader;
use crate::chunk::key::{encode_internal, split_internal, user_key, OrderedKey};
use crate::chunk::memchunk::MemChunk;
use crate::chunk::{Chunk, CHUNK_ONDISK};
use crate::collator::Collator;
use crate::error::{Error, Result};

/// One positioned record: the newest visible version of a user key.
/// `value: None` is a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorRecord {
    pub key: Vec<u8>,
    pub txn: u64,
    pub value: Option<Vec<u8>>,
}

enum Source {
    Mem(Arc<MemChunk>),
    File(Arc<ChunkFileReader>),
}

pub(crate) struct ChunkCursor {
    chunk: Arc<Chunk>,
    source: Source,
    snapshot: u64,
    collator: Arc<dyn Collator>,
    current: Option<CursorRecord>,
}

impl ChunkCursor {
    /// Open a cursor over the chunk, pinning it until drop.
    pub fn open(chunk: Arc<Chunk>, snapshot: u64, collator: Arc<dyn Collator>) -> Result<Self> {
        let source = if let Some(mem) = chunk.mem() {
            Source::Mem(mem)
        } else if chunk.has_flag(CHUNK_ONDISK) {
            Source::File(chunk.reader(collator.clone())?)
        } else {
            return Err(Error::Corruption(format!(
                "chunk {} has neither memory nor file contents",
                chunk.id()
            )));
        };

        chunk.pin();
        Ok(Self {
            chunk,
            source,
            snapshot,
            collator,
            current: None,
        })
    }

    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    pub fn current(&self) -> Option<&CursorRecord> {
        self.current.as_ref()
    }

    pub fn current_key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|r| r.key.as_slice())
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    // --- raw internal-key access ---

    fn raw_seek(&self, ikey: &[u8]) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        match &self.source {
            Source::Mem(mem) => Ok(mem
                .seek(&OrderedKey::new(ikey.to_vec(), self.collator.clone()))
                .map(|(k, v)| (k.ikey, v))),
            Source::File(reader) => Ok(reader.seek_entry(ikey)?.map(|e| (e.ikey, e.value))),
        }
    }

    fn raw_seek_before(&self, ikey: &[u8]) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        match &self.source {
            Source::Mem(mem) => Ok(mem
                .seek_before(&OrderedKey::new(ikey.to_vec(), self.collator.clone()))
                .map(|(k, v)| (k.ikey, v))),
            Source::File(reader) => Ok(reader.seek_before(ikey)?.map(|e| (e.ikey, e.value))),
        }
    }

    fn raw_first(&self) -> Result<Option<Vec<u8>>> {
        match &self.source {
            Source::Mem(mem) => Ok(mem.first().map(|(k, _)| k.ikey)),
            Source::File(reader) => Ok(reader.first_entry()?.map(|e| e.ikey)),
        }
    }

    fn raw_last(&self) -> Result<Option<Vec<u8>>> {
        match &self.source {
            Source::Mem(mem) => Ok(mem.last().map(|(k, _)| k.ikey)),
            Source::File(reader) => Ok(reader.last_entry()?.map(|e| e.ikey)),
        }
    }

    // --- visibility ---

    /// The newest version of `key` at or below the snapshot, if any.
    fn visible_of(&self, key: &[u8]) -> Result<Option<CursorRecord>> {
        let seek = encode_internal(key, self.snapshot);
        let Some((ikey, value)) = self.raw_seek(&seek)? else {
            return Ok(None);
        };
        let (user, txn) = split_internal(&ikey);
        if user != key {
            return Ok(None);
        }
        Ok(Some(CursorRecord {
            key: user.to_vec(),
            txn,
            value,
        }))
    }

    /// Position at the first visible user key whose newest visible version
    /// starts at or after `seek` in internal-key order.
    fn seek_visible(&mut self, mut seek: Vec<u8>) -> Result<()> {
        loop {
            let Some((ikey, value)) = self.raw_seek(&seek)? else {
                self.current = None;
                return Ok(());
            };
            let (user, txn) = split_internal(&ikey);
            if txn <= self.snapshot {
                self.current = Some(CursorRecord {
                    key: user.to_vec(),
                    txn,
                    value,
                });
                return Ok(());
            }
            // Only invisible versions at the head of this key; jump to its
            // visible window (or past the key entirely).
            seek = encode_internal(user, self.snapshot);
        }
    }

    // --- positioning ---

    /// Position at the first user key >= `key` with a visible version.
    pub fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        self.seek_visible(encode_internal(key, self.snapshot))
    }

    /// Position at the last user key <= `key` with a visible version.
    pub fn seek_le(&mut self, key: &[u8]) -> Result<()> {
        if let Some(record) = self.visible_of(key)? {
            self.current = Some(record);
            return Ok(());
        }
        self.step_back_from(key.to_vec())
    }

    /// Advance to the next user key with a visible version.
    pub fn next(&mut self) -> Result<()> {
        let Some(current) = &self.current else {
            return self.first();
        };
        // Transaction ids start at one, so txn zero sorts after every real
        // version of the key.
        let seek = encode_internal(&current.key, 0);
        self.seek_visible(seek)
    }

    /// Retreat to the previous user key with a visible version.
    pub fn prev(&mut self) -> Result<()> {
        let Some(current) = self.current.clone() else {
            return self.last();
        };
        self.step_back_from(current.key)
    }

    fn step_back_from(&mut self, mut key: Vec<u8>) -> Result<()> {
        loop {
            // The txn=MAX encoding sorts before every version of `key`.
            let bound = encode_internal(&key, u64::MAX);
            let Some((ikey, _)) = self.raw_seek_before(&bound)? else {
                self.current = None;
                return Ok(());
            };
            let previous = user_key(&ikey).to_vec();
            if let Some(record) = self.visible_of(&previous)? {
                self.current = Some(record);
                return Ok(());
            }
            key = previous;
        }
    }

    /// Position at the smallest visible user key.
    pub fn first(&mut self) -> Result<()> {
        let Some(ikey) = self.raw_first()? else {
            self.current = None;
            return Ok(());
        };
        let user = user_key(&ikey).to_vec();
        self.seek_ge(&user)
    }

    /// Position at the largest visible user key.
    pub fn last(&mut self) -> Result<()> {
        let Some(ikey) = self.raw_last()? else {
            self.current = None;
            return Ok(());
        };
        let user = user_key(&ikey).to_vec();
        self.seek_le(&user)
    }

    /// Exact lookup; positions the cursor on a hit.
    pub fn search(&mut self, key: &[u8]) -> Result<bool> {
        self.current = self.visible_of(key)?;
        Ok(self.current.is_some())
    }

    /// The newest version's txn for `key`, ignoring the snapshot. Used
    /// for conflict checks.
    pub fn newest_txn(&self, key: &[u8]) -> Result<Option<u64>> {
        let seek = encode_internal(key, u64::MAX);
        match self.raw_seek(&seek)? {
            Some((ikey, _)) if user_key(&ikey) == key => Ok(Some(split_internal(&ikey).1)),
            _ => Ok(None),
        }
    }
}

impl Drop for ChunkCursor {
    fn drop(&mut self) {
        self.chunk.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collator::BytewiseCollator;
    use crate::tmpfs::TestDir;

    fn collator() -> Arc<dyn Collator> {
        Arc::new(BytewiseCollator::default())
    }

    fn mem_chunk(entries: &[(&[u8], u64, Option<&[u8]>)]) -> (TestDir, Arc<Chunk>) {
        let dir = TestDir::new();
        let chunk = Chunk::new_primary(dir.path(), 1, collator());
        let mem = chunk.mem().unwrap();
        for (key, txn, value) in entries {
            mem.put(key, *txn, value.map(|v| v.to_vec())).unwrap();
        }
        (dir, chunk)
    }

    #[test]
    fn test_forward_iteration() {
        let (_dir, chunk) = mem_chunk(&[
            (b"a", 1, Some(b"va")),
            (b"b", 2, Some(b"vb")),
            (b"c", 3, Some(b"vc")),
        ]);
        let mut cursor = ChunkCursor::open(chunk, u64::MAX, collator()).unwrap();

        cursor.first().unwrap();
        assert_eq!(cursor.current_key(), Some(b"a".as_slice()));
        cursor.next().unwrap();
        assert_eq!(cursor.current_key(), Some(b"b".as_slice()));
        cursor.next().unwrap();
        assert_eq!(cursor.current_key(), Some(b"c".as_slice()));
        cursor.next().unwrap();
        assert_eq!(cursor.current_key(), None);
    }

    #[test]
    fn test_backward_iteration() {
        let (_dir, chunk) = mem_chunk(&[
            (b"a", 1, Some(b"va")),
            (b"b", 2, Some(b"vb")),
            (b"c", 3, Some(b"vc")),
        ]);
        let mut cursor = ChunkCursor::open(chunk, u64::MAX, collator()).unwrap();

        cursor.last().unwrap();
        assert_eq!(cursor.current_key(), Some(b"c".as_slice()));
        cursor.prev().unwrap();
        assert_eq!(cursor.current_key(), Some(b"b".as_slice()));
        cursor.prev().unwrap();
        assert_eq!(cursor.current_key(), Some(b"a".as_slice()));
        cursor.prev().unwrap();
        assert_eq!(cursor.current_key(), None);
    }

    #[test]
    fn test_snapshot_filters_versions() {
        let (_dir, chunk) = mem_chunk(&[
            (b"k", 2, Some(b"v2")),
            (b"k", 5, Some(b"v5")),
            (b"k", 9, Some(b"v9")),
        ]);
        let mut cursor = ChunkCursor::open(chunk.clone(), 5, collator()).unwrap();
        assert!(cursor.search(b"k").unwrap());
        let record = cursor.current().unwrap();
        assert_eq!(record.txn, 5);
        assert_eq!(record.value, Some(b"v5".to_vec()));

        // Nothing visible below the first version.
        let mut early = ChunkCursor::open(chunk, 1, collator()).unwrap();
        assert!(!early.search(b"k").unwrap());
    }

    #[test]
    fn test_invisible_keys_skipped_in_iteration() {
        let (_dir, chunk) = mem_chunk(&[
            (b"a", 1, Some(b"va")),
            (b"b", 9, Some(b"vb")),
            (b"c", 2, Some(b"vc")),
        ]);
        let mut cursor = ChunkCursor::open(chunk, 3, collator()).unwrap();

        cursor.first().unwrap();
        assert_eq!(cursor.current_key(), Some(b"a".as_slice()));
        // "b" was written past the snapshot and is skipped entirely.
        cursor.next().unwrap();
        assert_eq!(cursor.current_key(), Some(b"c".as_slice()));
        cursor.prev().unwrap();
        assert_eq!(cursor.current_key(), Some(b"a".as_slice()));
    }

    #[test]
    fn test_tombstones_are_returned() {
        let (_dir, chunk) = mem_chunk(&[(b"k", 1, Some(b"v")), (b"k", 2, None)]);
        let mut cursor = ChunkCursor::open(chunk, u64::MAX, collator()).unwrap();

        assert!(cursor.search(b"k").unwrap());
        let record = cursor.current().unwrap();
        assert_eq!(record.txn, 2);
        assert_eq!(record.value, None);
    }

    #[test]
    fn test_newest_txn_ignores_snapshot() {
        let (_dir, chunk) = mem_chunk(&[(b"k", 3, Some(b"v3")), (b"k", 8, Some(b"v8"))]);
        let cursor = ChunkCursor::open(chunk, 3, collator()).unwrap();
        assert_eq!(cursor.newest_txn(b"k").unwrap(), Some(8));
        assert_eq!(cursor.newest_txn(b"other").unwrap(), None);
    }

    #[test]
    fn test_pin_released_on_drop() {
        let (_dir, chunk) = mem_chunk(&[(b"k", 1, Some(b"v"))]);
        assert_eq!(chunk.refcnt(), 0);
        {
            let _cursor = ChunkCursor::open(chunk.clone(), u64::MAX, collator()).unwrap();
            assert_eq!(chunk.refcnt(), 1);
        }
        assert_eq!(chunk.refcnt(), 0);
    }

    #[test]
    fn test_file_backed_cursor() {
        use crate::chunk::file::ChunkFileWriter;
        use crate::chunk::CHUNK_STABLE;

        let dir = TestDir::new();
        let chunk = Chunk::new_output(dir.path(), 2, 0);
        let mut writer = ChunkFileWriter::create(&chunk.uri()).unwrap();
        for (key, txn, value) in [
            (b"a".as_slice(), 5u64, Some(b"va".as_slice())),
            (b"b", 9, Some(b"new")),
            (b"b", 4, Some(b"old")),
            (b"c", 6, None),
        ] {
            writer.add(&encode_internal(key, txn), value).unwrap();
        }
        writer.finish().unwrap();
        chunk.set_flag(CHUNK_ONDISK | CHUNK_STABLE);

        let mut cursor = ChunkCursor::open(chunk, 6, collator()).unwrap();
        cursor.first().unwrap();
        assert_eq!(cursor.current_key(), Some(b"a".as_slice()));
        cursor.next().unwrap();
        // txn 9 is invisible at snapshot 6, so the older version shows.
        let record = cursor.current().unwrap();
        assert_eq!(record.key, b"b");
        assert_eq!(record.value, Some(b"old".to_vec()));
        cursor.next().unwrap();
        assert_eq!(cursor.current().unwrap().value, None);
        cursor.next().unwrap();
        assert_eq!(cursor.current_key(), None);
    }
}
