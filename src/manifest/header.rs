//! Fixed manifest header.
//!
//! Besides identifying the file, the header binds the tree to the key
//! order it was written with: chunk files and the skip list are only
//! meaningful under one collator, so the collator's name is stored here
//! and checked on every open. The sequence and chunk-id watermarks give
//! recovery a starting point without replaying the whole log first.
//!
//! ```text
//! +--------+---------+-------------+---------------+-----+---------------+
//! | magic  | version | current_seq | next_chunk_id | len | collator name |
//! | 8B     | u32     | u64         | u32           | u8  | <= 39 bytes   |
//! +--------+---------+-------------+---------------+-----+---------------+
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 64;
const MAGIC: &[u8; 8] = b"LOAMDB\0M";
const VERSION: u32 = 1;

/// Bytes left for the collator name after the fixed fields.
const COLLATOR_MAX: usize = HEADER_SIZE - 25;

#[derive(Debug, Clone)]
pub struct ManifestHeader {
    pub version: u32,
    pub current_seq: u64,
    pub next_chunk_id: u32,
    /// Name of the collator the tree was created with.
    pub collator: String,
}

impl ManifestHeader {
    pub fn new(collator: &str) -> Result<Self> {
        if collator.len() > COLLATOR_MAX {
            return Err(Error::Config(format!(
                "collator name \"{collator}\" exceeds {COLLATOR_MAX} bytes"
            )));
        }
        Ok(Self {
            version: VERSION,
            current_seq: 0,
            next_chunk_id: 1,
            collator: collator.to_string(),
        })
    }

    /// Refuse reopening the tree under a different key order than it was
    /// written with.
    pub fn check_collator(&self, collator: &str) -> Result<()> {
        if self.collator != collator {
            return Err(Error::Config(format!(
                "tree was created with collator \"{}\", cannot open with \"{collator}\"",
                self.collator
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        (&mut buf[8..12])
            .write_u32::<BigEndian>(self.version)
            .unwrap();
        (&mut buf[12..20])
            .write_u64::<BigEndian>(self.current_seq)
            .unwrap();
        (&mut buf[20..24])
            .write_u32::<BigEndian>(self.next_chunk_id)
            .unwrap();
        buf[24] = self.collator.len() as u8;
        buf[25..25 + self.collator.len()].copy_from_slice(self.collator.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &buf[0..8] != MAGIC {
            return Err(Error::Corruption("not a loamdb manifest".to_string()));
        }
        let version = (&buf[8..12]).read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::Corruption(format!(
                "manifest version {version} is newer than this build supports"
            )));
        }
        let current_seq = (&buf[12..20]).read_u64::<BigEndian>()?;
        let next_chunk_id = (&buf[20..24]).read_u32::<BigEndian>()?;

        let collator_len = buf[24] as usize;
        if collator_len > COLLATOR_MAX {
            return Err(Error::Corruption(
                "collator name length out of range".to_string(),
            ));
        }
        let collator = std::str::from_utf8(&buf[25..25 + collator_len])
            .map_err(|_| Error::Corruption("collator name is not utf-8".to_string()))?
            .to_string();

        Ok(Self {
            version,
            current_seq,
            next_chunk_id,
            collator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collator_name_survives_roundtrip() {
        let header = ManifestHeader::new("bytewise").unwrap();
        let decoded = ManifestHeader::decode(&header.encode()).expect("decode header");

        assert_eq!(decoded.collator, "bytewise");
        assert_eq!(decoded.version, VERSION);
        assert_eq!(decoded.current_seq, 0);
        assert_eq!(decoded.next_chunk_id, 1);
        assert!(decoded.check_collator("bytewise").is_ok());
    }

    #[test]
    fn test_watermarks_survive_roundtrip() {
        let mut header = ManifestHeader::new("bytewise").unwrap();
        header.current_seq = 812;
        header.next_chunk_id = 17;

        let decoded = ManifestHeader::decode(&header.encode()).expect("decode header");
        assert_eq!(decoded.current_seq, 812);
        assert_eq!(decoded.next_chunk_id, 17);
    }

    #[test]
    fn test_collator_mismatch_refused() {
        let header = ManifestHeader::new("bytewise").unwrap();
        let result = header.check_collator("reverse");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_collator_name_too_long_rejected() {
        let name = "x".repeat(COLLATOR_MAX + 1);
        assert!(matches!(
            ManifestHeader::new(&name),
            Err(Error::Config(_))
        ));

        // A name that exactly fills the header is fine.
        let name = "y".repeat(COLLATOR_MAX);
        let header = ManifestHeader::new(&name).unwrap();
        let decoded = ManifestHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.collator, name);
    }

    #[test]
    fn test_foreign_file_refused() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(b"SQLITE\0\0");
        assert!(matches!(
            ManifestHeader::decode(&buf),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_future_version_refused() {
        let mut header = ManifestHeader::new("bytewise").unwrap();
        header.version = VERSION + 1;
        assert!(matches!(
            ManifestHeader::decode(&header.encode()),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_garbage_collator_length_refused() {
        let header = ManifestHeader::new("bytewise").unwrap();
        let mut buf = header.encode();
        buf[24] = 0xff;
        assert!(matches!(
            ManifestHeader::decode(&buf),
            Err(Error::Corruption(_))
        ));
    }
}
