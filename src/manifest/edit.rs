use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::meta::ChunkMeta;
use crate::error::{Error, Result};

const SWITCH: u8 = 0x01;
const FLUSH: u8 = 0x02;
const BLOOM_BUILT: u8 = 0x03;
const MERGE: u8 = 0x04;
const DROP: u8 = 0x05;
const SNAPSHOT: u8 = 0x06;

/// One atomic change to the tree's chunk structure, as logged in the
/// manifest. Replaying the edits in sequence rebuilds the active and old
/// chunk lists.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeEdit {
    /// A new primary chunk was created; the previous primary (if any) was
    /// sealed with the recorded switch transaction.
    Switch {
        seq: u64,
        chunk: ChunkMeta,
        sealed_id: u32,
        sealed_switch_txn: u64,
    },

    /// A chunk was written to disk.
    Flush {
        seq: u64,
        chunk_id: u32,
        count: u64,
        size: u64,
    },

    /// A chunk's bloom filter was built.
    BloomBuilt { seq: u64, chunk_id: u32 },

    /// A contiguous run of chunks was replaced by one merged output; the
    /// inputs moved to the old-chunk list.
    Merge {
        seq: u64,
        input_ids: Vec<u32>,
        output: ChunkMeta,
    },

    /// Old chunks were reclaimed and their files deleted. Chunks are
    /// identified by (id, generation): a merge output reuses its newest
    /// input's id at a higher generation.
    Drop { seq: u64, chunks: Vec<(u32, u32)> },

    /// Full state: replaces everything recorded so far.
    Snapshot {
        seq: u64,
        active: Vec<ChunkMeta>,
        old: Vec<ChunkMeta>,
        next_chunk_id: u32,
    },
}

impl TreeEdit {
    pub fn seq(&self) -> u64 {
        match self {
            TreeEdit::Switch { seq, .. }
            | TreeEdit::Flush { seq, .. }
            | TreeEdit::BloomBuilt { seq, .. }
            | TreeEdit::Merge { seq, .. }
            | TreeEdit::Drop { seq, .. }
            | TreeEdit::Snapshot { seq, .. } => *seq,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            TreeEdit::Switch {
                seq,
                chunk,
                sealed_id,
                sealed_switch_txn,
            } => {
                buf.write_u8(SWITCH).unwrap();
                buf.write_u64::<BigEndian>(*seq).unwrap();
                buf.write_u32::<BigEndian>(*sealed_id).unwrap();
                buf.write_u64::<BigEndian>(*sealed_switch_txn).unwrap();
                chunk.encode_into(&mut buf);
            }

            TreeEdit::Flush {
                seq,
                chunk_id,
                count,
                size,
            } => {
                buf.write_u8(FLUSH).unwrap();
                buf.write_u64::<BigEndian>(*seq).unwrap();
                buf.write_u32::<BigEndian>(*chunk_id).unwrap();
                buf.write_u64::<BigEndian>(*count).unwrap();
                buf.write_u64::<BigEndian>(*size).unwrap();
            }

            TreeEdit::BloomBuilt { seq, chunk_id } => {
                buf.write_u8(BLOOM_BUILT).unwrap();
                buf.write_u64::<BigEndian>(*seq).unwrap();
                buf.write_u32::<BigEndian>(*chunk_id).unwrap();
            }

            TreeEdit::Merge {
                seq,
                input_ids,
                output,
            } => {
                buf.write_u8(MERGE).unwrap();
                buf.write_u64::<BigEndian>(*seq).unwrap();
                buf.write_u32::<BigEndian>(input_ids.len() as u32).unwrap();
                for id in input_ids {
                    buf.write_u32::<BigEndian>(*id).unwrap();
                }
                output.encode_into(&mut buf);
            }

            TreeEdit::Drop { seq, chunks } => {
                buf.write_u8(DROP).unwrap();
                buf.write_u64::<BigEndian>(*seq).unwrap();
                buf.write_u32::<BigEndian>(chunks.len() as u32).unwrap();
                for (id, generation) in chunks {
                    buf.write_u32::<BigEndian>(*id).unwrap();
                    buf.write_u32::<BigEndian>(*generation).unwrap();
                }
            }

            TreeEdit::Snapshot {
                seq,
                active,
                old,
                next_chunk_id,
            } => {
                buf.write_u8(SNAPSHOT).unwrap();
                buf.write_u64::<BigEndian>(*seq).unwrap();
                buf.write_u32::<BigEndian>(*next_chunk_id).unwrap();
                buf.write_u32::<BigEndian>(active.len() as u32).unwrap();
                for chunk in active {
                    chunk.encode_into(&mut buf);
                }
                buf.write_u32::<BigEndian>(old.len() as u32).unwrap();
                for chunk in old {
                    chunk.encode_into(&mut buf);
                }
            }
        }

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let edit_type = cursor.read_u8()?;

        match edit_type {
            SWITCH => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let sealed_id = cursor.read_u32::<BigEndian>()?;
                let sealed_switch_txn = cursor.read_u64::<BigEndian>()?;
                let chunk = ChunkMeta::decode_from(&mut cursor)?;
                Ok(TreeEdit::Switch {
                    seq,
                    chunk,
                    sealed_id,
                    sealed_switch_txn,
                })
            }

            FLUSH => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let chunk_id = cursor.read_u32::<BigEndian>()?;
                let count = cursor.read_u64::<BigEndian>()?;
                let size = cursor.read_u64::<BigEndian>()?;
                Ok(TreeEdit::Flush {
                    seq,
                    chunk_id,
                    count,
                    size,
                })
            }

            BLOOM_BUILT => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let chunk_id = cursor.read_u32::<BigEndian>()?;
                Ok(TreeEdit::BloomBuilt { seq, chunk_id })
            }

            MERGE => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let input_count = cursor.read_u32::<BigEndian>()? as usize;
                let mut input_ids = Vec::with_capacity(input_count);
                for _ in 0..input_count {
                    input_ids.push(cursor.read_u32::<BigEndian>()?);
                }
                let output = ChunkMeta::decode_from(&mut cursor)?;
                Ok(TreeEdit::Merge {
                    seq,
                    input_ids,
                    output,
                })
            }

            DROP => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let count = cursor.read_u32::<BigEndian>()? as usize;
                let mut chunks = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = cursor.read_u32::<BigEndian>()?;
                    let generation = cursor.read_u32::<BigEndian>()?;
                    chunks.push((id, generation));
                }
                Ok(TreeEdit::Drop { seq, chunks })
            }

            SNAPSHOT => {
                let seq = cursor.read_u64::<BigEndian>()?;
                let next_chunk_id = cursor.read_u32::<BigEndian>()?;
                let active_count = cursor.read_u32::<BigEndian>()? as usize;
                let mut active = Vec::with_capacity(active_count);
                for _ in 0..active_count {
                    active.push(ChunkMeta::decode_from(&mut cursor)?);
                }
                let old_count = cursor.read_u32::<BigEndian>()? as usize;
                let mut old = Vec::with_capacity(old_count);
                for _ in 0..old_count {
                    old.push(ChunkMeta::decode_from(&mut cursor)?);
                }
                Ok(TreeEdit::Snapshot {
                    seq,
                    active,
                    old,
                    next_chunk_id,
                })
            }

            _ => Err(Error::Corruption(format!(
                "invalid manifest edit type: {edit_type}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta(id: u32) -> ChunkMeta {
        ChunkMeta {
            id,
            generation: 1,
            count: 100,
            size: 4096,
            switch_txn: 55,
            flags: 0x0c,
        }
    }

    #[test]
    fn test_switch_roundtrip() {
        let original = TreeEdit::Switch {
            seq: 1,
            chunk: sample_meta(2),
            sealed_id: 1,
            sealed_switch_txn: 40,
        };
        let decoded = TreeEdit::decode(&original.encode()).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_flush_roundtrip() {
        let original = TreeEdit::Flush {
            seq: 2,
            chunk_id: 1,
            count: 500,
            size: 8192,
        };
        let decoded = TreeEdit::decode(&original.encode()).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_bloom_built_roundtrip() {
        let original = TreeEdit::BloomBuilt { seq: 3, chunk_id: 1 };
        let decoded = TreeEdit::decode(&original.encode()).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_merge_roundtrip() {
        let original = TreeEdit::Merge {
            seq: 4,
            input_ids: vec![1, 2, 3, 4],
            output: sample_meta(5),
        };
        let decoded = TreeEdit::decode(&original.encode()).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_drop_roundtrip() {
        let original = TreeEdit::Drop {
            seq: 5,
            chunks: vec![(1, 0), (2, 1)],
        };
        let decoded = TreeEdit::decode(&original.encode()).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let original = TreeEdit::Snapshot {
            seq: 6,
            active: vec![sample_meta(5), sample_meta(6)],
            old: vec![sample_meta(1)],
            next_chunk_id: 7,
        };
        let decoded = TreeEdit::decode(&original.encode()).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_invalid_edit_type() {
        let invalid = vec![0xFF, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            TreeEdit::decode(&invalid),
            Err(Error::Corruption(_))
        ));
    }
}
