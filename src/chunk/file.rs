//! On-disk chunk files.
//!
//! A chunk file holds the sorted record versions of one sealed chunk:
//! prefix-compressed blocks over internal keys, a block index, and a fixed
//! footer. Every block and the index carry a CRC-32 so corruption is caught
//! at read time rather than surfacing as wrong results.
//!
//! # File layout
//!
//! ```text
//! +--------------------+
//! | header (16 bytes)  |  magic, version
//! +--------------------+
//! | block 0 | crc32    |
//! +--------------------+
//! | block 1 | crc32    |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | index | crc32      |  (offset, len, first internal key) per block
//! +--------------------+
//! | footer (32 bytes)  |  index offset/len, entry count, magic
//! +--------------------+
//! ```
//!
//! # Block layout
//!
//! Entries are delta-encoded against the previous key with restart points
//! every [`RESTART_INTERVAL`] entries:
//!
//! ```text
//! +-----------+-------------+---------+----------+---------------+
//! |shared: u16|unshared: u16|plen: u32| key tail | kind + value  |
//! +-----------+-------------+---------+----------+---------------+
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::key::compare_internal;
use crate::collator::Collator;
use crate::error::{Error, Result};

const MAGIC: &[u8; 8] = b"LOAMCHNK";
const VERSION: u32 = 1;
const HEADER_SIZE: u64 = 16;
const FOOTER_SIZE: u64 = 32;

const RESTART_INTERVAL: usize = 16;
const MAX_BLOCK_SIZE: usize = 4096;

const KIND_TOMBSTONE: u8 = 0;
const KIND_VALUE: u8 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// One decoded record version.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub ikey: Vec<u8>,
    /// `None` is a tombstone.
    pub value: Option<Vec<u8>>,
}

struct IndexEntry {
    offset: u64,
    len: u32,
    first_ikey: Vec<u8>,
}

// --- Block builder ---

struct BlockBuilder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    fn add(&mut self, ikey: &[u8], value: Option<&[u8]>) {
        let shared = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            self.last_key
                .iter()
                .zip(ikey.iter())
                .take_while(|&(a, b)| a == b)
                .count()
        };
        let unshared = ikey.len() - shared;
        let payload_len = 1 + value.map_or(0, |v| v.len());

        self.buffer.write_u16::<BigEndian>(shared as u16).unwrap();
        self.buffer.write_u16::<BigEndian>(unshared as u16).unwrap();
        self.buffer
            .write_u32::<BigEndian>(payload_len as u32)
            .unwrap();
        self.buffer.extend_from_slice(&ikey[shared..]);
        match value {
            Some(v) => {
                self.buffer.push(KIND_VALUE);
                self.buffer.extend_from_slice(v);
            }
            None => self.buffer.push(KIND_TOMBSTONE),
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(ikey);
        self.entry_count += 1;
    }

    fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .unwrap();
        self.buffer
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Decode a block payload into its entries.
fn decode_block(data: &[u8]) -> Result<Vec<Entry>> {
    if data.len() < 4 {
        return Err(Error::Corruption("block too short".to_string()));
    }
    let num_restarts = (&data[data.len() - 4..]).read_u32::<BigEndian>()? as usize;
    let restart_array = num_restarts * 4;
    if data.len() < 4 + restart_array {
        return Err(Error::Corruption(
            "block restart array out of bounds".to_string(),
        ));
    }
    let data_end = data.len() - 4 - restart_array;

    let mut entries = Vec::new();
    let mut last_key: Vec<u8> = Vec::new();
    let mut pos = 0usize;
    while pos < data_end {
        if pos + 8 > data_end {
            return Err(Error::Corruption("block entry header truncated".to_string()));
        }
        let shared = (&data[pos..]).read_u16::<BigEndian>()? as usize;
        let unshared = (&data[pos + 2..]).read_u16::<BigEndian>()? as usize;
        let payload_len = (&data[pos + 4..]).read_u32::<BigEndian>()? as usize;
        pos += 8;

        if shared > last_key.len() || pos + unshared + payload_len > data_end || payload_len == 0 {
            return Err(Error::Corruption("block entry out of bounds".to_string()));
        }

        let mut ikey = Vec::with_capacity(shared + unshared);
        ikey.extend_from_slice(&last_key[..shared]);
        ikey.extend_from_slice(&data[pos..pos + unshared]);
        pos += unshared;

        let kind = data[pos];
        let value = match kind {
            KIND_VALUE => Some(data[pos + 1..pos + payload_len].to_vec()),
            KIND_TOMBSTONE => None,
            other => {
                return Err(Error::Corruption(format!(
                    "unknown record kind: {other}"
                )))
            }
        };
        pos += payload_len;

        last_key = ikey.clone();
        entries.push(Entry { ikey, value });
    }

    Ok(entries)
}

// --- Writer ---

/// Streams sorted entries into a new chunk file.
pub struct ChunkFileWriter {
    file: File,
    path: PathBuf,
    builder: BlockBuilder,
    index: Vec<IndexEntry>,
    offset: u64,
    entry_count: u64,
    first_in_block: Option<Vec<u8>>,
}

impl ChunkFileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[..8].copy_from_slice(MAGIC);
        (&mut header[8..12]).write_u32::<BigEndian>(VERSION)?;
        file.write_all(&header)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            builder: BlockBuilder::new(),
            index: Vec::new(),
            offset: HEADER_SIZE,
            entry_count: 0,
            first_in_block: None,
        })
    }

    /// Append one entry. Entries must arrive in ascending internal-key
    /// order; the writer does not re-sort.
    pub fn add(&mut self, ikey: &[u8], value: Option<&[u8]>) -> Result<()> {
        if self.first_in_block.is_none() {
            self.first_in_block = Some(ikey.to_vec());
        }
        self.builder.add(ikey, value);
        self.entry_count += 1;

        if self.builder.len() >= MAX_BLOCK_SIZE {
            self.cut_block()?;
        }
        Ok(())
    }

    fn cut_block(&mut self) -> Result<()> {
        let builder = std::mem::replace(&mut self.builder, BlockBuilder::new());
        let data = builder.finish();
        let checksum = CRC32.checksum(&data);

        self.file.write_all(&data)?;
        self.file.write_u32::<BigEndian>(checksum)?;

        let first_ikey = self
            .first_in_block
            .take()
            .ok_or_else(|| Error::Corruption("block cut with no first key".to_string()))?;
        self.index.push(IndexEntry {
            offset: self.offset,
            len: data.len() as u32,
            first_ikey,
        });
        self.offset += data.len() as u64 + 4;
        Ok(())
    }

    /// Write the index and footer, fsync, and return (entry count, size).
    pub fn finish(mut self) -> Result<(u64, u64)> {
        if !self.builder.is_empty() {
            self.cut_block()?;
        }

        let mut index_buf = Vec::new();
        index_buf.write_u32::<BigEndian>(self.index.len() as u32)?;
        for entry in &self.index {
            index_buf.write_u64::<BigEndian>(entry.offset)?;
            index_buf.write_u32::<BigEndian>(entry.len)?;
            index_buf.write_u32::<BigEndian>(entry.first_ikey.len() as u32)?;
            index_buf.extend_from_slice(&entry.first_ikey);
        }
        let index_crc = CRC32.checksum(&index_buf);

        let index_offset = self.offset;
        self.file.write_all(&index_buf)?;

        let mut footer = [0u8; FOOTER_SIZE as usize];
        (&mut footer[0..8]).write_u64::<BigEndian>(index_offset)?;
        (&mut footer[8..12]).write_u32::<BigEndian>(index_buf.len() as u32)?;
        (&mut footer[12..20]).write_u64::<BigEndian>(self.entry_count)?;
        (&mut footer[20..24]).write_u32::<BigEndian>(index_crc)?;
        footer[24..32].copy_from_slice(MAGIC);
        self.file.write_all(&footer)?;
        self.file.sync_all()?;

        let size = index_offset + index_buf.len() as u64 + FOOTER_SIZE;
        Ok((self.entry_count, size))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// --- Reader ---

/// Read access to a finished chunk file: point seek plus block-wise
/// iteration in both directions.
pub struct ChunkFileReader {
    file: Mutex<File>,
    index: Vec<IndexEntry>,
    entry_count: u64,
    collator: Arc<dyn Collator>,
    path: PathBuf,
}

impl ChunkFileReader {
    pub fn open(path: &Path, collator: Arc<dyn Collator>) -> Result<Self> {
        let mut file = File::open(path)?;

        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE + FOOTER_SIZE {
            return Err(Error::Corruption(format!(
                "chunk file {} truncated",
                path.display()
            )));
        }

        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        file.read_exact(&mut footer)?;
        if &footer[24..32] != MAGIC {
            return Err(Error::Corruption(format!(
                "chunk file {} bad footer magic",
                path.display()
            )));
        }
        let index_offset = (&footer[0..8]).read_u64::<BigEndian>()?;
        let index_len = (&footer[8..12]).read_u32::<BigEndian>()? as usize;
        let entry_count = (&footer[12..20]).read_u64::<BigEndian>()?;
        let index_crc = (&footer[20..24]).read_u32::<BigEndian>()?;

        let mut index_buf = vec![0u8; index_len];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index_buf)?;
        if CRC32.checksum(&index_buf) != index_crc {
            return Err(Error::Corruption(format!(
                "chunk file {} index checksum mismatch",
                path.display()
            )));
        }

        let mut cursor = index_buf.as_slice();
        let block_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut index = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let offset = cursor.read_u64::<BigEndian>()?;
            let len = cursor.read_u32::<BigEndian>()?;
            let klen = cursor.read_u32::<BigEndian>()? as usize;
            if cursor.len() < klen {
                return Err(Error::Corruption(format!(
                    "chunk file {} index truncated",
                    path.display()
                )));
            }
            let first_ikey = cursor[..klen].to_vec();
            cursor = &cursor[klen..];
            index.push(IndexEntry {
                offset,
                len,
                first_ikey,
            });
        }

        Ok(Self {
            file: Mutex::new(file),
            index,
            entry_count,
            collator,
            path: path.to_path_buf(),
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and verify one block.
    pub fn read_block(&self, block: usize) -> Result<Vec<Entry>> {
        let entry = self
            .index
            .get(block)
            .ok_or_else(|| Error::Corruption(format!("block {block} out of range")))?;

        let mut buf = vec![0u8; entry.len as usize + 4];
        {
            let mut file = self.file.lock()?;
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut buf)?;
        }

        let data = &buf[..entry.len as usize];
        let stored = (&buf[entry.len as usize..]).read_u32::<BigEndian>()?;
        if CRC32.checksum(data) != stored {
            return Err(Error::Corruption(format!(
                "chunk file {} block {block} checksum mismatch",
                self.path.display()
            )));
        }

        decode_block(data)
    }

    /// Index of the block that may contain the first entry >= `ikey`:
    /// the last block whose first key is <= `ikey`.
    pub fn find_block(&self, ikey: &[u8]) -> usize {
        let mut left = 0usize;
        let mut right = self.index.len();
        while left < right {
            let mid = left + (right - left) / 2;
            match compare_internal(self.collator.as_ref(), &self.index[mid].first_ikey, ikey) {
                std::cmp::Ordering::Greater => right = mid,
                _ => left = mid + 1,
            }
        }
        left.saturating_sub(1)
    }

    /// Locate the first entry >= `ikey`. Returns (block, index-in-block).
    pub fn seek(&self, ikey: &[u8]) -> Result<Option<(usize, usize)>> {
        if self.index.is_empty() {
            return Ok(None);
        }
        let mut block = self.find_block(ikey);
        loop {
            let entries = self.read_block(block)?;
            for (i, entry) in entries.iter().enumerate() {
                if compare_internal(self.collator.as_ref(), &entry.ikey, ikey)
                    != std::cmp::Ordering::Less
                {
                    return Ok(Some((block, i)));
                }
            }
            block += 1;
            if block >= self.index.len() {
                return Ok(None);
            }
        }
    }

    /// The first entry >= `ikey`, if any.
    pub fn seek_entry(&self, ikey: &[u8]) -> Result<Option<Entry>> {
        match self.seek(ikey)? {
            Some((block, idx)) => {
                let entries = self.read_block(block)?;
                Ok(Some(entries[idx].clone()))
            }
            None => Ok(None),
        }
    }

    /// The last entry strictly before `ikey`, if any.
    pub fn seek_before(&self, ikey: &[u8]) -> Result<Option<Entry>> {
        if self.index.is_empty() {
            return Ok(None);
        }
        match self.seek(ikey)? {
            Some((block, 0)) if block == 0 => Ok(None),
            Some((block, 0)) => {
                let entries = self.read_block(block - 1)?;
                Ok(entries.last().cloned())
            }
            Some((block, idx)) => {
                let entries = self.read_block(block)?;
                Ok(Some(entries[idx - 1].clone()))
            }
            None => self.last_entry(),
        }
    }

    /// The first entry of the file, if any.
    pub fn first_entry(&self) -> Result<Option<Entry>> {
        if self.index.is_empty() {
            return Ok(None);
        }
        Ok(self.read_block(0)?.into_iter().next())
    }

    /// The last entry of the file, if any.
    pub fn last_entry(&self) -> Result<Option<Entry>> {
        if self.index.is_empty() {
            return Ok(None);
        }
        let mut entries = self.read_block(self.index.len() - 1)?;
        Ok(entries.pop())
    }

    /// The newest version of `key` visible at `snapshot`, if any.
    /// `Some(None)` is a tombstone.
    pub fn get(&self, key: &[u8], snapshot: u64) -> Result<Option<Option<Vec<u8>>>> {
        let seek_key = super::key::encode_internal(key, snapshot);
        let Some((block, idx)) = self.seek(&seek_key)? else {
            return Ok(None);
        };
        let entries = self.read_block(block)?;
        let entry = &entries[idx];
        if super::key::user_key(&entry.ikey) != key {
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    /// Stream every entry in order. Used by merges and bloom construction.
    pub fn iter(self: &Arc<Self>) -> ChunkFileIter {
        ChunkFileIter {
            reader: Arc::clone(self),
            block: 0,
            entries: Vec::new(),
            pos: 0,
        }
    }
}

/// Forward iterator over all entries of a chunk file.
pub struct ChunkFileIter {
    reader: Arc<ChunkFileReader>,
    block: usize,
    entries: Vec<Entry>,
    pos: usize,
}

impl Iterator for ChunkFileIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pos < self.entries.len() {
                let entry = self.entries[self.pos].clone();
                self.pos += 1;
                return Some(Ok(entry));
            }
            if self.block >= self.reader.block_count() {
                return None;
            }
            match self.reader.read_block(self.block) {
                Ok(entries) => {
                    self.entries = entries;
                    self.pos = 0;
                    self.block += 1;
                }
                Err(e) => {
                    self.block = self.reader.block_count();
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::key::encode_internal;
    use crate::collator::BytewiseCollator;
    use crate::tmpfs::TestDir;

    fn collator() -> Arc<dyn Collator> {
        Arc::new(BytewiseCollator::default())
    }

    fn write_chunk(path: &Path, entries: &[(Vec<u8>, u64, Option<Vec<u8>>)]) -> (u64, u64) {
        let mut writer = ChunkFileWriter::create(path).unwrap();
        for (key, txn, value) in entries {
            let ikey = encode_internal(key, *txn);
            writer.add(&ikey, value.as_deref()).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TestDir::new();
        let path = dir.file("chunk-000001.lsm");

        let mut entries = Vec::new();
        for i in 0..500u32 {
            entries.push((
                format!("key_{i:05}").into_bytes(),
                10,
                Some(format!("value_{i}").into_bytes()),
            ));
        }
        let (count, size) = write_chunk(&path, &entries);
        assert_eq!(count, 500);
        assert_eq!(size, std::fs::metadata(&path).unwrap().len());

        let reader = Arc::new(ChunkFileReader::open(&path, collator()).unwrap());
        assert_eq!(reader.entry_count(), 500);
        assert!(reader.block_count() > 1, "expected multiple blocks");

        for i in (0..500u32).step_by(37) {
            let key = format!("key_{i:05}");
            let value = reader.get(key.as_bytes(), u64::MAX).unwrap();
            assert_eq!(value, Some(Some(format!("value_{i}").into_bytes())));
        }
        assert_eq!(reader.get(b"key_99999", u64::MAX).unwrap(), None);

        // Full iteration returns everything in order.
        let streamed: Vec<_> = reader.iter().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(streamed.len(), 500);
        for window in streamed.windows(2) {
            assert!(window[0].ikey < window[1].ikey);
        }
    }

    #[test]
    fn test_versions_and_snapshots() {
        let dir = TestDir::new();
        let path = dir.file("chunk-000002.lsm");

        let entries = vec![
            (b"k".to_vec(), 9, Some(b"v9".to_vec())),
            (b"k".to_vec(), 4, Some(b"v4".to_vec())),
            (b"k".to_vec(), 2, None),
        ];
        write_chunk(&path, &entries);

        let reader = ChunkFileReader::open(&path, collator()).unwrap();
        assert_eq!(reader.get(b"k", u64::MAX).unwrap(), Some(Some(b"v9".to_vec())));
        assert_eq!(reader.get(b"k", 8).unwrap(), Some(Some(b"v4".to_vec())));
        assert_eq!(reader.get(b"k", 3).unwrap(), Some(None));
        assert_eq!(reader.get(b"k", 1).unwrap(), None);
    }

    #[test]
    fn test_empty_chunk_file() {
        let dir = TestDir::new();
        let path = dir.file("chunk-000003.lsm");

        let writer = ChunkFileWriter::create(&path).unwrap();
        let (count, _) = writer.finish().unwrap();
        assert_eq!(count, 0);

        let reader = Arc::new(ChunkFileReader::open(&path, collator()).unwrap());
        assert_eq!(reader.block_count(), 0);
        assert_eq!(reader.get(b"anything", u64::MAX).unwrap(), None);
        assert_eq!(reader.iter().count(), 0);
    }

    #[test]
    fn test_corrupt_block_detected() {
        let dir = TestDir::new();
        let path = dir.file("chunk-000004.lsm");

        let entries = vec![(b"key".to_vec(), 1, Some(b"value".to_vec()))];
        write_chunk(&path, &entries);

        // Damage a data byte inside the first block.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE as usize + 9] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let reader = ChunkFileReader::open(&path, collator()).unwrap();
        assert!(matches!(
            reader.read_block(0),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_seek_across_block_boundary() {
        let dir = TestDir::new();
        let path = dir.file("chunk-000005.lsm");

        let mut entries = Vec::new();
        for i in 0..300u32 {
            entries.push((
                format!("key_{:05}", i * 2).into_bytes(),
                1,
                Some(vec![0u8; 32]),
            ));
        }
        write_chunk(&path, &entries);

        let reader = ChunkFileReader::open(&path, collator()).unwrap();
        // A key between two stored keys seeks to its successor.
        let seek_key = encode_internal(b"key_00101", u64::MAX);
        let (block, idx) = reader.seek(&seek_key).unwrap().unwrap();
        let found = &reader.read_block(block).unwrap()[idx];
        assert_eq!(super::super::key::user_key(&found.ikey), b"key_00102");

        // Past the last key there is nothing.
        let beyond = encode_internal(b"key_99999", u64::MAX);
        assert_eq!(reader.seek(&beyond).unwrap(), None);
    }
}
