//! Per-chunk Bloom filters.
//!
//! A bloom answers "is this key definitely absent from the chunk?" so point
//! lookups can skip chunks without touching their files. Sizing comes from
//! the tree's `bloom_bit_count` (bits per key) and `bloom_hash_count`
//! (probes); probing is double hashing, `h1 + i * h2` over the bit array.
//!
//! # File format
//!
//! ```text
//! +------------------+
//! | magic (8 bytes)  |
//! +------------------+
//! | version: u32     |
//! | hash_count: u32  |
//! | bit_count: u64   |
//! +------------------+
//! | bit array bytes  |
//! +------------------+
//! | crc32: u32       |
//! +------------------+
//! ```

use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions};
use std::hash::Hasher;
use std::io::{Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};

const MAGIC: &[u8; 8] = b"LOAM\0BLM";
const VERSION: u32 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// An in-memory Bloom filter over a chunk's user keys.
pub struct Bloom {
    bits: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
}

impl Bloom {
    /// Size a filter for `est_keys` keys at `bit_count` bits per key with
    /// `hash_count` probes.
    pub fn new(bit_count: u32, hash_count: u32, est_keys: u64) -> Self {
        let bit_count = (est_keys.max(1)) * bit_count as u64;
        let byte_count = bit_count.div_ceil(8) as usize;
        Self {
            bits: vec![0u8; byte_count],
            bit_count,
            hash_count,
        }
    }

    /// Insert a key into the filter.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_key(key);
        for i in 0..self.hash_count {
            let bit = probe(h1, h2, i, self.bit_count);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Check whether a key may be present. `false` means the key is
    /// definitely not in the chunk.
    pub fn check(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_key(key);
        for i in 0..self.hash_count {
            let bit = probe(h1, h2, i, self.bit_count);
            if self.bits[(bit / 8) as usize] >> (bit % 8) & 1 == 0 {
                return false;
            }
        }
        true
    }

    /// Persist the filter, fsyncing before returning.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut payload = Vec::with_capacity(24 + self.bits.len());
        payload.extend_from_slice(MAGIC);
        payload.write_u32::<BigEndian>(VERSION)?;
        payload.write_u32::<BigEndian>(self.hash_count)?;
        payload.write_u64::<BigEndian>(self.bit_count)?;
        payload.extend_from_slice(&self.bits);
        let checksum = CRC32.checksum(&payload);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        file.write_all(&payload)?;
        file.write_u32::<BigEndian>(checksum)?;
        file.sync_all()?;
        Ok(())
    }

    /// Load a filter previously written with [`Bloom::write_to`].
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        if buf.len() < 28 {
            return Err(Error::Corruption(format!(
                "bloom file {} truncated",
                path.display()
            )));
        }

        let payload = &buf[..buf.len() - 4];
        let stored = (&buf[buf.len() - 4..]).read_u32::<BigEndian>()?;
        if CRC32.checksum(payload) != stored {
            return Err(Error::Corruption(format!(
                "bloom file {} checksum mismatch",
                path.display()
            )));
        }

        if &payload[..8] != MAGIC {
            return Err(Error::Corruption(format!(
                "bloom file {} bad magic",
                path.display()
            )));
        }
        let mut cursor = &payload[8..];
        let version = cursor.read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::Corruption(format!(
                "bloom file {} unsupported version {version}",
                path.display()
            )));
        }
        let hash_count = cursor.read_u32::<BigEndian>()?;
        let bit_count = cursor.read_u64::<BigEndian>()?;
        let bits = cursor.to_vec();
        if bits.len() as u64 != bit_count.div_ceil(8) {
            return Err(Error::Corruption(format!(
                "bloom file {} bit array length mismatch",
                path.display()
            )));
        }

        Ok(Self {
            bits,
            bit_count,
            hash_count,
        })
    }
}

fn hash_key(key: &[u8]) -> (u64, u64) {
    let mut hasher = DefaultHasher::new();
    hasher.write(key);
    let h1 = hasher.finish();

    let mut hasher = DefaultHasher::new();
    hasher.write_u64(h1);
    let h2 = hasher.finish();

    (h1, h2)
}

fn probe(h1: u64, h2: u64, i: u32, bit_count: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % bit_count
}
