use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A Collator provides the total order over user keys used by every chunk
/// and cursor of a tree. Implementations must be thread-safe since chunks
/// are read concurrently from worker and application threads.
pub trait Collator: Send + Sync {
    /// Three-way comparison. Returns:
    /// Ordering::Less iff a < b
    /// Ordering::Equal iff a == b
    /// Ordering::Greater iff a > b
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// The name of the collator. Recorded in tree configuration so a tree
    /// is never reopened under a different order than it was written with.
    fn name(&self) -> &str;
}

/// `BytewiseCollator` uses lexicographic byte-wise ordering.
#[derive(Default)]
pub struct BytewiseCollator {}

impl Collator for BytewiseCollator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &str {
        "bytewise"
    }
}

/// Registry mapping collator names to implementations, injected at manager
/// creation instead of living in a mutable global. "bytewise" is always
/// registered.
pub struct CollatorRegistry {
    collators: Vec<Arc<dyn Collator>>,
}

impl Default for CollatorRegistry {
    fn default() -> Self {
        Self {
            collators: vec![Arc::new(BytewiseCollator::default())],
        }
    }
}

impl CollatorRegistry {
    pub fn register(&mut self, collator: Arc<dyn Collator>) {
        self.collators.push(collator);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Collator>> {
        self.collators
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown collator: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytewise_order() {
        let c = BytewiseCollator::default();
        let tests = vec![
            ("", "a", Ordering::Less),
            ("a", "a", Ordering::Equal),
            ("ab", "a", Ordering::Greater),
            ("abc", "abd", Ordering::Less),
            ("zz", "za", Ordering::Greater),
        ];
        for (a, b, expect) in tests {
            assert_eq!(c.compare(a.as_bytes(), b.as_bytes()), expect);
        }
    }

    #[test]
    fn test_registry_resolve() {
        let registry = CollatorRegistry::default();
        assert_eq!(registry.resolve("bytewise").unwrap().name(), "bytewise");
        assert!(matches!(
            registry.resolve("reverse"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_registry_custom() {
        struct ReverseCollator;
        impl Collator for ReverseCollator {
            fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
                b.cmp(a)
            }
            fn name(&self) -> &str {
                "reverse"
            }
        }

        let mut registry = CollatorRegistry::default();
        registry.register(Arc::new(ReverseCollator));
        let c = registry.resolve("reverse").unwrap();
        assert_eq!(c.compare(b"a", b"b"), Ordering::Greater);
    }
}
