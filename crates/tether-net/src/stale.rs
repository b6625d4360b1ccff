//! Latest-wins filtering for unreliable, high-frequency traffic.
//!
//! Cursor-style updates travel on the unreliable channel and may arrive
//! late, twice, or out of order. Each carries a sender timestamp; only a
//! strictly newer timestamp per key is accepted.

use std::collections::HashMap;
use std::hash::Hash;

/// Tracks the newest timestamp seen per key.
#[derive(Debug)]
pub struct LatestWins<K> {
    newest: HashMap<K, u64>,
}

impl<K: Eq + Hash> LatestWins<K> {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self {
            newest: HashMap::new(),
        }
    }

    /// Returns `true` if `timestamp` supersedes everything seen for `key`.
    pub fn accept(&mut self, key: K, timestamp: u64) -> bool {
        match self.newest.get_mut(&key) {
            Some(seen) if *seen >= timestamp => false,
            Some(seen) => {
                *seen = timestamp;
                true
            }
            None => {
                self.newest.insert(key, timestamp);
                true
            }
        }
    }

    /// Forget a key (e.g. the peer left).
    pub fn forget(&mut self, key: &K) {
        self.newest.remove(key);
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.newest.clear();
    }
}

impl<K: Eq + Hash> Default for LatestWins<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_updates_are_superseded() {
        let mut filter = LatestWins::new();
        assert!(filter.accept(1u64, 10));
        assert!(!filter.accept(1, 9), "older update must be dropped");
        assert!(!filter.accept(1, 10), "duplicate must be dropped");
        assert!(filter.accept(1, 11));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut filter = LatestWins::new();
        assert!(filter.accept(1u64, 100));
        assert!(filter.accept(2u64, 5));
        filter.forget(&1);
        assert!(filter.accept(1, 1));
    }
}
