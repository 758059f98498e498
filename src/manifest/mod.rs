//! Manifest log for chunk metadata and tree structure.
//!
//! The manifest is an append-only log of structural changes: which chunks
//! exist, in what order, which are old and awaiting reclamation, and the
//! flags each carries. Replaying it on open rebuilds the tree's chunk
//! lists exactly as they were recorded.
//!
//! # File format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | TreeEdit 1       |
//! +------------------+
//! | TreeEdit 2       |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Each edit is framed as:
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | serialized edit  |crc32:u32  |
//! +-----------+------------------+-----------+
//! ```
//!
//! Big-endian encoding throughout; CRC-32 per edit; the header is rewritten
//! and the file synced on [`Manifest::sync`].

pub mod edit;
pub mod header;
pub mod meta;

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};
use edit::TreeEdit;
use header::{ManifestHeader, HEADER_SIZE};
use meta::{ChunkMeta, CHUNK_BLOOM, CHUNK_MERGING, CHUNK_ONDISK, CHUNK_STABLE};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub struct Manifest {
    path: PathBuf,
    /// Edit appends. Opened in append mode with its own cursor so header
    /// rewrites can never land in the edit stream.
    writer: Mutex<BufWriter<File>>,
    header: RwLock<ManifestHeader>,
}

impl Manifest {
    /// Open (or create) the manifest. `collator` is the name of the key
    /// order the tree uses; a manifest written under a different collator
    /// refuses to open.
    pub fn open(path: impl Into<PathBuf>, collator: &str) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let header = if file.metadata()?.len() == 0 {
            let h = ManifestHeader::new(collator)?;
            file.write_all(&h.encode())?;
            file.sync_all()?;
            h
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let h = ManifestHeader::decode(&buf)?;
            h.check_collator(collator)?;
            h
        };

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            header: RwLock::new(header),
        })
    }

    pub fn append(&self, edit: TreeEdit) -> Result<()> {
        let edit_bytes = edit.encode();
        let checksum = CRC32.checksum(&edit_bytes);

        let mut writer = self.writer.lock()?;
        writer.write_u32::<BigEndian>(edit_bytes.len() as u32)?;
        writer.write_all(&edit_bytes)?;
        writer.write_u32::<BigEndian>(checksum)?;
        drop(writer);

        let mut header = self.header.write()?;
        header.current_seq = header.current_seq.max(edit.seq());
        match &edit {
            TreeEdit::Switch { chunk, .. } => {
                header.next_chunk_id = header.next_chunk_id.max(chunk.id + 1);
            }
            TreeEdit::Merge { output, .. } => {
                header.next_chunk_id = header.next_chunk_id.max(output.id + 1);
            }
            TreeEdit::Snapshot { next_chunk_id, .. } => {
                header.next_chunk_id = header.next_chunk_id.max(*next_chunk_id);
            }
            _ => {}
        }

        Ok(())
    }

    /// Flush buffered edits, rewrite the header, and fsync.
    pub fn sync(&self) -> Result<()> {
        {
            let mut writer = self.writer.lock()?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        let header_bytes = self.header.read()?.encode();

        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.write_all(&header_bytes)?;
        file.sync_all()?;

        Ok(())
    }

    pub fn next_seq(&self) -> u64 {
        let mut header = self.header.write().unwrap();
        header.current_seq += 1;
        header.current_seq
    }

    pub fn iter(&self) -> Result<ManifestIterator> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(ManifestIterator { reader })
    }

    /// Rebuild the chunk lists by applying every edit in sequence.
    pub fn replay(&self) -> Result<ManifestState> {
        let mut state = ManifestState::new();

        for edit in self.iter()? {
            match edit? {
                TreeEdit::Switch {
                    chunk,
                    sealed_id,
                    sealed_switch_txn,
                    ..
                } => {
                    if sealed_id != 0 {
                        if let Some(sealed) = state.active_mut(sealed_id) {
                            sealed.switch_txn = sealed_switch_txn;
                            sealed.flags |= CHUNK_STABLE;
                        }
                    }
                    state.next_chunk_id = state.next_chunk_id.max(chunk.id + 1);
                    state.active.push(chunk);
                }

                TreeEdit::Flush {
                    chunk_id,
                    count,
                    size,
                    ..
                } => {
                    if let Some(chunk) = state.active_mut(chunk_id) {
                        chunk.flags |= CHUNK_ONDISK | CHUNK_STABLE;
                        chunk.count = count;
                        chunk.size = size;
                    }
                }

                TreeEdit::BloomBuilt { chunk_id, .. } => {
                    if let Some(chunk) = state.active_mut(chunk_id) {
                        chunk.flags |= CHUNK_BLOOM;
                    }
                }

                TreeEdit::Merge {
                    input_ids, output, ..
                } => {
                    state.next_chunk_id = state.next_chunk_id.max(output.id + 1);
                    let position = state
                        .active
                        .iter()
                        .position(|c| input_ids.contains(&c.id))
                        .unwrap_or(state.active.len());
                    let mut moved = Vec::new();
                    state.active.retain(|c| {
                        if input_ids.contains(&c.id) {
                            let mut old = c.clone();
                            old.flags &= !CHUNK_MERGING;
                            moved.push(old);
                            false
                        } else {
                            true
                        }
                    });
                    state.active.insert(position.min(state.active.len()), output);
                    state.old.extend(moved);
                }

                TreeEdit::Drop { chunks, .. } => {
                    state
                        .old
                        .retain(|c| !chunks.contains(&(c.id, c.generation)));
                }

                TreeEdit::Snapshot {
                    active,
                    old,
                    next_chunk_id,
                    ..
                } => {
                    state.active = active;
                    state.old = old;
                    state.next_chunk_id = next_chunk_id;
                }
            }
        }

        Ok(state)
    }
}

/// Chunk lists reconstructed from the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestState {
    /// Active chunks, oldest to newest; the primary is last.
    pub active: Vec<ChunkMeta>,
    /// Post-merge chunks awaiting drop.
    pub old: Vec<ChunkMeta>,
    pub next_chunk_id: u32,
}

impl ManifestState {
    fn new() -> Self {
        Self {
            active: Vec::new(),
            old: Vec::new(),
            next_chunk_id: 1,
        }
    }

    fn active_mut(&mut self, id: u32) -> Option<&mut ChunkMeta> {
        self.active.iter_mut().find(|c| c.id == id)
    }
}

pub struct ManifestIterator {
    reader: BufReader<File>,
}

impl Iterator for ManifestIterator {
    type Item = Result<TreeEdit>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        };

        let mut edit_bytes = vec![0u8; len];
        if let Err(e) = self.reader.read_exact(&mut edit_bytes) {
            return Some(Err(e.into()));
        }
        let stored = match self.reader.read_u32::<BigEndian>() {
            Ok(crc) => crc,
            Err(e) => return Some(Err(e.into())),
        };

        if CRC32.checksum(&edit_bytes) != stored {
            return Some(Err(Error::Corruption(
                "manifest edit checksum mismatch".to_string(),
            )));
        }

        Some(TreeEdit::decode(&edit_bytes))
    }
}
