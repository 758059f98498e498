use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Hard cap on worker threads, regardless of configuration.
pub const MAX_WORKERS: usize = 10;

/// Bloom creation policy bits.
pub const BLOOM_OFF: u32 = 0x01;
/// Build blooms only on merge output chunks.
pub const BLOOM_MERGED: u32 = 0x02;
/// Also build a bloom on the oldest chunk.
pub const BLOOM_OLDEST: u32 = 0x04;

/// Configuration for one LSM tree.
///
/// The worker pool has its own [`ManagerConfig`]; everything keyed per tree
/// (chunk sizing, merge bounds, bloom policy, record formats, throttling)
/// lives here.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Directory holding the tree's chunk, bloom, and manifest files.
    pub dir: PathBuf,

    /// Soft cap on the in-memory chunk; crossing it triggers a switch
    /// (default: 2MB).
    pub chunk_size: u64,

    /// Hard cap on a merged output chunk (default: 1GB).
    pub chunk_max: u64,

    /// Minimum number of chunks combined by one merge (default: 4).
    pub merge_min: usize,

    /// Maximum number of chunks combined by one merge (default: 15).
    pub merge_max: usize,

    /// Bits per key when sizing bloom filters (default: 16).
    pub bloom_bit_count: u32,

    /// Hash functions per bloom probe (default: 8).
    pub bloom_hash_count: u32,

    /// Bloom creation policy bitset; 0 means every chunk except the newest.
    pub bloom: u32,

    /// Record codec format for keys (opaque to the engine).
    pub key_format: String,

    /// Record codec format for values (opaque to the engine).
    pub value_format: String,

    /// Collator name, resolved at open (default: "bytewise").
    pub collator: String,

    /// Microseconds writers sleep per write while checkpoint throttling.
    pub ckpt_throttle_us: u64,

    /// Microseconds writers sleep per write while merge throttling.
    pub merge_throttle_us: u64,

    /// Upper bound on one write's throttle sleep. Zero makes throttled
    /// writes fail with [`Error::Busy`] instead of sleeping.
    pub throttle_budget_us: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./loamdb"),
            chunk_size: 2 * 1024 * 1024,
            chunk_max: 1024 * 1024 * 1024,
            merge_min: 4,
            merge_max: 15,
            bloom_bit_count: 16,
            bloom_hash_count: 8,
            bloom: 0,
            key_format: "u".to_string(),
            value_format: "u".to_string(),
            collator: "bytewise".to_string(),
            ckpt_throttle_us: 0,
            merge_throttle_us: 0,
            throttle_budget_us: 10_000,
        }
    }
}

impl TreeConfig {
    /// Create a new config rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the in-memory chunk switch threshold.
    pub fn chunk_size(mut self, size: u64) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the merged chunk size cap.
    pub fn chunk_max(mut self, size: u64) -> Self {
        self.chunk_max = size;
        self
    }

    /// Set the merge run length bounds.
    pub fn merge_bounds(mut self, min: usize, max: usize) -> Self {
        self.merge_min = min;
        self.merge_max = max;
        self
    }

    /// Set the bloom sizing parameters.
    pub fn bloom_sizing(mut self, bit_count: u32, hash_count: u32) -> Self {
        self.bloom_bit_count = bit_count;
        self.bloom_hash_count = hash_count;
        self
    }

    /// Set the bloom creation policy bitset.
    pub fn bloom_policy(mut self, policy: u32) -> Self {
        self.bloom = policy;
        self
    }

    /// Set the record codec formats.
    pub fn formats(mut self, key_format: &str, value_format: &str) -> Self {
        self.key_format = key_format.to_string();
        self.value_format = value_format.to_string();
        self
    }

    /// Set the collator by name.
    pub fn collator(mut self, name: &str) -> Self {
        self.collator = name.to_string();
        self
    }

    /// Set the throttle tunables.
    pub fn throttle(mut self, ckpt_us: u64, merge_us: u64, budget_us: u64) -> Self {
        self.ckpt_throttle_us = ckpt_us;
        self.merge_throttle_us = merge_us;
        self.throttle_budget_us = budget_us;
        self
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be nonzero".to_string()));
        }
        if self.chunk_max < self.chunk_size {
            return Err(Error::Config(format!(
                "chunk_max ({}) must be at least chunk_size ({})",
                self.chunk_max, self.chunk_size
            )));
        }
        if self.merge_min < 2 {
            return Err(Error::Config("merge_min must be at least 2".to_string()));
        }
        if self.merge_max < self.merge_min {
            return Err(Error::Config(format!(
                "merge_max ({}) must be at least merge_min ({})",
                self.merge_max, self.merge_min
            )));
        }
        if self.bloom & BLOOM_OFF == 0 && (self.bloom_bit_count == 0 || self.bloom_hash_count == 0)
        {
            return Err(Error::Config(
                "bloom sizing must be nonzero while blooms are enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the shared worker pool.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Total worker threads (default: 4, capped at [`MAX_WORKERS`]).
    pub workers_max: usize,

    /// Workers that also service merges (default: 1). Always strictly fewer
    /// than `workers_max` so at least one worker carries switch, flush, and
    /// drop work.
    pub merge_threads: usize,

    /// Bound on the condvar wait so timed maintenance can fire
    /// (default: 100ms).
    pub work_wait: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers_max: 4,
            merge_threads: 1,
            work_wait: Duration::from_millis(100),
        }
    }
}

impl ManagerConfig {
    /// Set the worker pool size.
    pub fn workers_max(mut self, n: usize) -> Self {
        self.workers_max = n;
        self
    }

    /// Set how many workers service merges.
    pub fn merge_threads(mut self, n: usize) -> Self {
        self.merge_threads = n;
        self
    }

    /// Set the bounded condvar wait.
    pub fn work_wait(mut self, wait: Duration) -> Self {
        self.work_wait = wait;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers_max == 0 {
            return Err(Error::Config("workers_max must be nonzero".to_string()));
        }
        if self.workers_max > MAX_WORKERS {
            return Err(Error::Config(format!(
                "workers_max ({}) exceeds the {} worker cap",
                self.workers_max, MAX_WORKERS
            )));
        }
        if self.merge_threads >= self.workers_max {
            return Err(Error::Config(format!(
                "merge_threads ({}) must leave at least one non-merge worker of {}",
                self.merge_threads, self.workers_max
            )));
        }
        Ok(())
    }
}
