use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

/// Chunk status bits, persisted in [`ChunkMeta::flags`] and mirrored on the
/// in-memory chunk record.
pub const CHUNK_BLOOM: u32 = 0x01;
pub const CHUNK_MERGING: u32 = 0x02;
pub const CHUNK_ONDISK: u32 = 0x04;
pub const CHUNK_STABLE: u32 = 0x08;

/// Persisted description of one chunk, as recorded in the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeta {
    pub id: u32,
    pub generation: u32,
    pub count: u64,
    pub size: u64,
    pub switch_txn: u64,
    pub flags: u32,
}

impl ChunkMeta {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(self.id).unwrap();
        buf.write_u32::<BigEndian>(self.generation).unwrap();
        buf.write_u64::<BigEndian>(self.count).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
        buf.write_u64::<BigEndian>(self.switch_txn).unwrap();
        buf.write_u32::<BigEndian>(self.flags).unwrap();
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let id = cursor.read_u32::<BigEndian>()?;
        let generation = cursor.read_u32::<BigEndian>()?;
        let count = cursor.read_u64::<BigEndian>()?;
        let size = cursor.read_u64::<BigEndian>()?;
        let switch_txn = cursor.read_u64::<BigEndian>()?;
        let flags = cursor.read_u32::<BigEndian>()?;

        Ok(ChunkMeta {
            id,
            generation,
            count,
            size,
            switch_txn,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> ChunkMeta {
        ChunkMeta {
            id: 7,
            generation: 2,
            count: 1000,
            size: 65536,
            switch_txn: 42,
            flags: 0x0c,
        }
    }

    #[test]
    fn test_meta_roundtrip() {
        let original = sample_meta();
        let mut buf = Vec::new();
        original.encode_into(&mut buf);

        let mut cursor = Cursor::new(buf.as_slice());
        let decoded = ChunkMeta::decode_from(&mut cursor).expect("decode");

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_meta_zeroes() {
        let original = ChunkMeta {
            id: 1,
            generation: 0,
            count: 0,
            size: 0,
            switch_txn: 0,
            flags: 0,
        };
        let mut buf = Vec::new();
        original.encode_into(&mut buf);

        let mut cursor = Cursor::new(buf.as_slice());
        let decoded = ChunkMeta::decode_from(&mut cursor).expect("decode");
        assert_eq!(decoded, original);
    }
}
