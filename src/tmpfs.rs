//! Scratch directories for tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_SERIAL: AtomicU32 = AtomicU32::new(0);

/// A per-test scratch directory under the system temp dir, removed on
/// drop. Uniqueness comes from the process id plus a counter, so tests
/// running in parallel never share a directory.
pub struct TestDir {
    root: PathBuf,
}

impl TestDir {
    pub fn new() -> Self {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "loamdb-test-{}-{serial}",
            std::process::id()
        ));
        if root.exists() {
            fs::remove_dir_all(&root).expect("clear stale test dir");
        }
        fs::create_dir_all(&root).expect("create test dir");
        Self { root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path for a file inside the directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}
