//! Internal key layout.
//!
//! A chunk stores every version a key received while it was the primary, so
//! records are addressed by an internal key: the user key followed by the
//! transaction id inverted and big-endian encoded. Under the tree's collator
//! (user part) plus bytewise order on the tail, versions of one key sort
//! newest-first, and seeking to `(key, snapshot)` lands on the newest
//! version visible at that snapshot.
//!
//! ```text
//!   +----------------+------------------------+
//!   | user key bytes | !txn_id (8B big-endian)|
//!   +----------------+------------------------+
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::collator::Collator;

/// Length of the inverted transaction id tail.
pub const INTERNAL_KEY_TAIL: usize = 8;

/// Encode `(user_key, txn)` into an internal key.
pub fn encode_internal(user_key: &[u8], txn: u64) -> Vec<u8> {
    let mut ikey = Vec::with_capacity(user_key.len() + INTERNAL_KEY_TAIL);
    ikey.extend_from_slice(user_key);
    let mut tail = [0u8; INTERNAL_KEY_TAIL];
    BigEndian::write_u64(&mut tail, u64::MAX - txn);
    ikey.extend_from_slice(&tail);
    ikey
}

/// Split an internal key into its user key and transaction id.
///
/// Callers guarantee the key carries a tail; internal keys never reach this
/// function undersized.
pub fn split_internal(ikey: &[u8]) -> (&[u8], u64) {
    let split = ikey.len() - INTERNAL_KEY_TAIL;
    let inverted = BigEndian::read_u64(&ikey[split..]);
    (&ikey[..split], u64::MAX - inverted)
}

/// The user-key prefix of an internal key.
pub fn user_key(ikey: &[u8]) -> &[u8] {
    &ikey[..ikey.len() - INTERNAL_KEY_TAIL]
}

/// Compare two internal keys: user parts under the collator, then the
/// inverted-txn tails bytewise (newer transactions first).
pub fn compare_internal(collator: &dyn Collator, a: &[u8], b: &[u8]) -> Ordering {
    collator
        .compare(user_key(a), user_key(b))
        .then_with(|| a[a.len() - INTERNAL_KEY_TAIL..].cmp(&b[b.len() - INTERNAL_KEY_TAIL..]))
}

/// An internal key ordered by a tree's collator, usable as a map key.
///
/// Carrying the collator handle in the key keeps crossbeam's skip list (and
/// any other `Ord`-keyed structure) sorted in collator order without a
/// type parameter spreading through the tree.
#[derive(Clone)]
pub struct OrderedKey {
    pub ikey: Vec<u8>,
    collator: Arc<dyn Collator>,
}

impl OrderedKey {
    pub fn new(ikey: Vec<u8>, collator: Arc<dyn Collator>) -> Self {
        Self { ikey, collator }
    }

    pub fn from_parts(user_key: &[u8], txn: u64, collator: Arc<dyn Collator>) -> Self {
        Self::new(encode_internal(user_key, txn), collator)
    }

    pub fn user_key(&self) -> &[u8] {
        user_key(&self.ikey)
    }

    pub fn txn(&self) -> u64 {
        split_internal(&self.ikey).1
    }
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_internal(self.collator.as_ref(), &self.ikey, &other.ikey)
    }
}

impl std::fmt::Debug for OrderedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (user, txn) = split_internal(&self.ikey);
        f.debug_struct("OrderedKey")
            .field("user_key", &user)
            .field("txn", &txn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collator::BytewiseCollator;

    #[test]
    fn test_roundtrip() {
        let ikey = encode_internal(b"apple", 42);
        let (user, txn) = split_internal(&ikey);
        assert_eq!(user, b"apple");
        assert_eq!(txn, 42);
    }

    #[test]
    fn test_versions_sort_newest_first() {
        let c = BytewiseCollator::default();
        let old = encode_internal(b"key", 5);
        let new = encode_internal(b"key", 9);
        assert_eq!(compare_internal(&c, &new, &old), Ordering::Less);

        // Different user keys order by user key regardless of txn.
        let a = encode_internal(b"a", 1);
        let b = encode_internal(b"b", 100);
        assert_eq!(compare_internal(&c, &a, &b), Ordering::Less);
    }

    #[test]
    fn test_seek_key_lands_on_visible_version() {
        let c = BytewiseCollator::default();
        // Versions at txn 3 and 7; a snapshot at 5 must land on txn 3.
        let v3 = encode_internal(b"key", 3);
        let v7 = encode_internal(b"key", 7);
        let seek = encode_internal(b"key", 5);
        assert_eq!(compare_internal(&c, &v7, &seek), Ordering::Less);
        assert_eq!(compare_internal(&c, &seek, &v3), Ordering::Less);
    }

    #[test]
    fn test_ordered_key() {
        let collator: Arc<dyn Collator> = Arc::new(BytewiseCollator::default());
        let a = OrderedKey::from_parts(b"k", 2, collator.clone());
        let b = OrderedKey::from_parts(b"k", 1, collator.clone());
        assert!(a < b);
        assert_eq!(a.user_key(), b"k");
        assert_eq!(a.txn(), 2);
    }
}
