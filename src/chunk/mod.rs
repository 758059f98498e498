//! Chunk metadata and data access.
//!
//! A chunk is one file of the tree (or, for the primary, an in-memory
//! buffer not yet written). The [`Chunk`] record tracks identity, size
//! estimates, the switch transaction bounding its contents, a reference
//! count pinning it while cursors or workers use it, and the status bits
//! {BLOOM, MERGING, ONDISK, STABLE} that drive the lifecycle.
//!
//! Structural fields (position in the active array) belong to the tree and
//! change only under its write lock; everything on the chunk itself is
//! atomic so readers and workers touch chunks without that lock.

pub mod file;
pub mod key;
pub mod memchunk;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::bloom::Bloom;
use crate::collator::Collator;
use crate::error::{Error, Result};
use crate::manifest::meta::ChunkMeta;
use file::ChunkFileReader;
use memchunk::MemChunk;

pub use crate::manifest::meta::{CHUNK_BLOOM, CHUNK_MERGING, CHUNK_ONDISK, CHUNK_STABLE};

pub struct Chunk {
    id: u32,
    generation: u32,
    create_ts: SystemTime,
    dir: PathBuf,

    count: AtomicU64,
    size: AtomicU64,
    switch_txn: AtomicU64,
    refcnt: AtomicU32,
    bloom_busy: AtomicBool,
    empty: AtomicBool,
    evicted: AtomicBool,
    flags: AtomicU32,

    mem: RwLock<Option<Arc<MemChunk>>>,
    reader: RwLock<Option<Arc<ChunkFileReader>>>,
    bloom: RwLock<Option<Arc<Bloom>>>,
}

impl Chunk {
    /// Create a fresh primary chunk: generation zero, in-memory, writable.
    pub fn new_primary(dir: &Path, id: u32, collator: Arc<dyn Collator>) -> Arc<Self> {
        Arc::new(Self {
            id,
            generation: 0,
            create_ts: SystemTime::now(),
            dir: dir.to_path_buf(),
            count: AtomicU64::new(0),
            size: AtomicU64::new(0),
            switch_txn: AtomicU64::new(0),
            refcnt: AtomicU32::new(0),
            bloom_busy: AtomicBool::new(false),
            empty: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            flags: AtomicU32::new(0),
            mem: RwLock::new(Some(Arc::new(MemChunk::new(collator)))),
            reader: RwLock::new(None),
            bloom: RwLock::new(None),
        })
    }

    /// Create the record for a merge output chunk. The caller writes the
    /// file first and then sets ONDISK and STABLE.
    pub fn new_output(dir: &Path, id: u32, generation: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            generation,
            create_ts: SystemTime::now(),
            dir: dir.to_path_buf(),
            count: AtomicU64::new(0),
            size: AtomicU64::new(0),
            switch_txn: AtomicU64::new(0),
            refcnt: AtomicU32::new(0),
            bloom_busy: AtomicBool::new(false),
            empty: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            flags: AtomicU32::new(0),
            mem: RwLock::new(None),
            reader: RwLock::new(None),
            bloom: RwLock::new(None),
        })
    }

    /// Rebuild a chunk record from its manifest entry during recovery.
    /// Chunks whose data file is missing are marked empty and elided from
    /// cursors rather than failing the open.
    pub fn from_meta(dir: &Path, meta: &ChunkMeta) -> Arc<Self> {
        let chunk = Self {
            id: meta.id,
            generation: meta.generation,
            create_ts: SystemTime::now(),
            dir: dir.to_path_buf(),
            count: AtomicU64::new(meta.count),
            size: AtomicU64::new(meta.size),
            switch_txn: AtomicU64::new(meta.switch_txn),
            refcnt: AtomicU32::new(0),
            bloom_busy: AtomicBool::new(false),
            empty: AtomicBool::new(false),
            evicted: AtomicBool::new(true),
            flags: AtomicU32::new(meta.flags),
            mem: RwLock::new(None),
            reader: RwLock::new(None),
            bloom: RwLock::new(None),
        };

        if meta.flags & CHUNK_ONDISK != 0 && !chunk.uri().exists() {
            tracing::warn!(
                chunk = meta.id,
                uri = %chunk.uri().display(),
                "chunk file missing, marking empty"
            );
            chunk.empty.store(true, Ordering::SeqCst);
        }
        if meta.flags & CHUNK_ONDISK == 0 {
            // The chunk's contents only ever lived in memory; nothing to
            // recover. The tree re-arms the primary itself.
            chunk.empty.store(true, Ordering::SeqCst);
        }
        if meta.flags & CHUNK_BLOOM != 0 && !chunk.bloom_uri().exists() {
            tracing::warn!(
                chunk = meta.id,
                "bloom file missing, clearing bloom flag"
            );
            chunk.clear_flag(CHUNK_BLOOM);
        }

        Arc::new(chunk)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn create_ts(&self) -> SystemTime {
        self.create_ts
    }

    /// Path of the chunk's data file. The generation is part of the name:
    /// a merge output reuses its newest input's id, and the two must not
    /// share a file while the input awaits drop.
    pub fn uri(&self) -> PathBuf {
        self.dir
            .join(format!("chunk-{:06}-g{}.lsm", self.id, self.generation))
    }

    /// Path of the chunk's bloom file.
    pub fn bloom_uri(&self) -> PathBuf {
        self.dir
            .join(format!("bloom-{:06}-g{}.blm", self.id, self.generation))
    }

    // --- flags ---

    pub fn has_flag(&self, bit: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & bit != 0
    }

    pub fn set_flag(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::SeqCst);
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::SeqCst)
    }

    // --- counters ---

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn set_counts(&self, count: u64, size: u64) {
        self.count.store(count, Ordering::SeqCst);
        self.size.store(size, Ordering::SeqCst);
    }

    pub fn switch_txn(&self) -> u64 {
        self.switch_txn.load(Ordering::SeqCst)
    }

    pub fn set_switch_txn(&self, txn: u64) {
        self.switch_txn.store(txn, Ordering::SeqCst);
    }

    pub fn is_empty_chunk(&self) -> bool {
        self.empty.load(Ordering::SeqCst)
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    // --- reference counting ---

    /// Pin the chunk for a cursor or worker. The chunk's files outlive
    /// every pin.
    pub fn pin(&self) {
        self.refcnt.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unpin(&self) {
        let prev = self.refcnt.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unpin without matching pin");
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::SeqCst)
    }

    /// Claim the right to build this chunk's bloom. At most one builder
    /// wins; losers skip the work.
    pub fn try_claim_bloom_build(&self) -> bool {
        self.bloom_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release_bloom_build(&self) {
        self.bloom_busy.store(false, Ordering::SeqCst);
    }

    // --- data access ---

    pub fn mem(&self) -> Option<Arc<MemChunk>> {
        self.mem.read().unwrap().clone()
    }

    /// Release the in-memory data after a flush. Cursors already holding
    /// the memchunk keep their own Arc.
    pub fn evict_mem(&self) {
        *self.mem.write().unwrap() = None;
        self.evicted.store(true, Ordering::SeqCst);
    }

    /// The cached file reader, opened on first use.
    pub fn reader(&self, collator: Arc<dyn Collator>) -> Result<Arc<ChunkFileReader>> {
        if let Some(reader) = self.reader.read().unwrap().as_ref() {
            return Ok(Arc::clone(reader));
        }
        let mut slot = self.reader.write().unwrap();
        if let Some(reader) = slot.as_ref() {
            return Ok(Arc::clone(reader));
        }
        if !self.has_flag(CHUNK_ONDISK) {
            return Err(Error::Corruption(format!(
                "chunk {} has no file to read",
                self.id
            )));
        }
        let reader = Arc::new(ChunkFileReader::open(&self.uri(), collator)?);
        *slot = Some(Arc::clone(&reader));
        Ok(reader)
    }

    /// The cached bloom handle, loaded on first use. `None` when the chunk
    /// has no bloom.
    pub fn bloom_handle(&self) -> Result<Option<Arc<Bloom>>> {
        if !self.has_flag(CHUNK_BLOOM) {
            return Ok(None);
        }
        if let Some(bloom) = self.bloom.read().unwrap().as_ref() {
            return Ok(Some(Arc::clone(bloom)));
        }
        let mut slot = self.bloom.write().unwrap();
        if let Some(bloom) = slot.as_ref() {
            return Ok(Some(Arc::clone(bloom)));
        }
        let bloom = Arc::new(Bloom::load(&self.bloom_uri())?);
        *slot = Some(Arc::clone(&bloom));
        Ok(Some(bloom))
    }

    /// Publish a freshly built bloom.
    pub fn install_bloom(&self, bloom: Arc<Bloom>) {
        *self.bloom.write().unwrap() = Some(bloom);
        self.set_flag(CHUNK_BLOOM);
    }

    /// The newest version of `key` visible at `snapshot`. `Some(None)` is
    /// a tombstone.
    pub fn get(
        &self,
        key: &[u8],
        snapshot: u64,
        collator: Arc<dyn Collator>,
    ) -> Result<Option<Option<Vec<u8>>>> {
        if self.is_empty_chunk() {
            return Ok(None);
        }
        if let Some(mem) = self.mem() {
            return Ok(mem.get(key, snapshot));
        }
        if self.has_flag(CHUNK_ONDISK) {
            return self.reader(collator)?.get(key, snapshot);
        }
        Ok(None)
    }

    /// The manifest record for this chunk's current state.
    pub fn meta(&self) -> ChunkMeta {
        ChunkMeta {
            id: self.id,
            generation: self.generation,
            count: self.count(),
            size: self.size(),
            switch_txn: self.switch_txn(),
            flags: self.flags(),
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("count", &self.count())
            .field("size", &self.size())
            .field("switch_txn", &self.switch_txn())
            .field("refcnt", &self.refcnt())
            .field("flags", &self.flags())
            .field("empty", &self.is_empty_chunk())
            .finish()
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

    #[test]
    fn test_primary_chunk_writable() {
        let dir = TestDir::new();
        let chunk = Chunk::new_primary(dir.path(), 1, collator());

        assert_eq!(chunk.generation(), 0);
        assert!(!chunk.has_flag(CHUNK_STABLE));
        assert!(!chunk.has_flag(CHUNK_ONDISK));

        let mem = chunk.mem().unwrap();
        mem.put(b"k", 1, Some(b"v".to_vec())).unwrap();
        assert_eq!(
            chunk.get(b"k", u64::MAX, collator()).unwrap(),
            Some(Some(b"v".to_vec()))
        );
    }

    #[test]
    fn test_flag_operations() {
        let dir = TestDir::new();
        let chunk = Chunk::new_primary(dir.path(), 1, collator());

        chunk.set_flag(CHUNK_STABLE);
        chunk.set_flag(CHUNK_ONDISK);
        assert!(chunk.has_flag(CHUNK_STABLE));
        assert!(chunk.has_flag(CHUNK_ONDISK));

        chunk.clear_flag(CHUNK_STABLE);
        assert!(!chunk.has_flag(CHUNK_STABLE));
        assert!(chunk.has_flag(CHUNK_ONDISK));
    }

    #[test]
    fn test_refcnt_pin_unpin() {
        let dir = TestDir::new();
        let chunk = Chunk::new_primary(dir.path(), 1, collator());

        assert_eq!(chunk.refcnt(), 0);
        chunk.pin();
        chunk.pin();
        assert_eq!(chunk.refcnt(), 2);
        chunk.unpin();
        assert_eq!(chunk.refcnt(), 1);
        chunk.unpin();
        assert_eq!(chunk.refcnt(), 0);
    }

    #[test]
    fn test_bloom_build_claim_exclusive() {
        let dir = TestDir::new();
        let chunk = Chunk::new_primary(dir.path(), 1, collator());

        assert!(chunk.try_claim_bloom_build());
        assert!(!chunk.try_claim_bloom_build());
        chunk.release_bloom_build();
        assert!(chunk.try_claim_bloom_build());
    }

    #[test]
    fn test_missing_file_marks_empty() {
        let dir = TestDir::new();
        let meta = ChunkMeta {
            id: 9,
            generation: 0,
            count: 10,
            size: 100,
            switch_txn: 5,
            flags: CHUNK_ONDISK | CHUNK_STABLE,
        };
        let chunk = Chunk::from_meta(dir.path(), &meta);
        assert!(chunk.is_empty_chunk());
        assert_eq!(chunk.get(b"k", u64::MAX, collator()).unwrap(), None);
    }

    #[test]
    fn test_uri_naming() {
        let dir = TestDir::new();
        let chunk = Chunk::new_primary(dir.path(), 42, collator());
        assert!(chunk.uri().ends_with("chunk-000042-g0.lsm"));
        assert!(chunk.bloom_uri().ends_with("bloom-000042-g0.blm"));

        let output = Chunk::new_output(dir.path(), 42, 3);
        assert!(output.uri().ends_with("chunk-000042-g3.lsm"));
    }

    #[test]
    fn test_meta_roundtrips_state() {
        let dir = TestDir::new();
        let chunk = Chunk::new_primary(dir.path(), 3, collator());
        chunk.set_flag(CHUNK_STABLE);
        chunk.set_switch_txn(12);
        chunk.set_counts(7, 700);

        let meta = chunk.meta();
        assert_eq!(meta.id, 3);
        assert_eq!(meta.switch_txn, 12);
        assert_eq!(meta.count, 7);
        assert_eq!(meta.flags, CHUNK_STABLE);
    }
}
