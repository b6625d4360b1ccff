//! Order-independent per-category checksums.
//!
//! A category checksum combines per-element hashes with wrapping addition and
//! XOR, so host and client agree whenever they hold the same set of elements,
//! regardless of iteration order. Continuous fields are not scanned
//! exhaustively: [`sample_indices`] picks a deterministic subset of cells from
//! an RNG seeded with the simulation tick, so both peers sample the same cells.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::category::{CategoryMask, SyncCategory};

// ---------------------------------------------------------------------------
// Checksum values
// ---------------------------------------------------------------------------

/// Checksum of one category, with an optional element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryChecksum {
    /// Combined element hash.
    pub checksum: i64,
    /// Number of elements folded in, when the category is enumerable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u64>,
}

impl CategoryChecksum {
    /// A checksum without an element count.
    pub fn new(checksum: i64) -> Self {
        Self {
            checksum,
            item_count: None,
        }
    }

    /// A checksum carrying its element count.
    pub fn with_count(checksum: i64, item_count: u64) -> Self {
        Self {
            checksum,
            item_count: Some(item_count),
        }
    }

    /// Two checksums agree if the hashes match and, where both sides report
    /// a count, the counts match too.
    pub fn agrees_with(&self, other: &CategoryChecksum) -> bool {
        if self.checksum != other.checksum {
            return false;
        }
        match (self.item_count, other.item_count) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Checksums of every category at one simulation tick. This is the
/// `SyncCheck` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSet {
    /// Tick the checksums were computed at. Also seeds continuous sampling.
    pub tick: i64,
    /// Per-category checksums.
    pub entries: BTreeMap<SyncCategory, CategoryChecksum>,
}

impl ChecksumSet {
    /// An empty set for `tick`.
    pub fn new(tick: i64) -> Self {
        Self {
            tick,
            entries: BTreeMap::new(),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, category: SyncCategory, checksum: CategoryChecksum) -> Self {
        self.entries.insert(category, checksum);
        self
    }

    /// Set the checksum for `category`.
    pub fn insert(&mut self, category: SyncCategory, checksum: CategoryChecksum) {
        self.entries.insert(category, checksum);
    }

    /// Checksum for `category`, if computed.
    pub fn get(&self, category: SyncCategory) -> Option<&CategoryChecksum> {
        self.entries.get(&category)
    }

    /// Categories present in the set.
    pub fn categories(&self) -> CategoryMask {
        self.entries.keys().copied().collect()
    }
}

/// Categories whose host checksum disagrees with the local one.
///
/// A category the host reports but the local side did not compute counts as
/// a mismatch. Categories only present locally are ignored.
pub fn get_mismatched_categories(host: &ChecksumSet, local: &ChecksumSet) -> CategoryMask {
    host.entries
        .iter()
        .filter(|(category, expected)| {
            local
                .get(**category)
                .is_none_or(|actual| !expected.agrees_with(actual))
        })
        .map(|(category, _)| *category)
        .collect()
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Deterministic 64-bit hash of `value`.
///
/// FxHash output is passed through a splitmix64 finalizer so that nearby
/// inputs do not produce correlated sums.
pub fn stable_hash<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    finalize(hasher.finish())
}

fn finalize(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Order-independent accumulator for element hashes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChecksumAccumulator {
    sum: u64,
    xor: u64,
    count: u64,
}

impl ChecksumAccumulator {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one element in.
    pub fn add<T: Hash + ?Sized>(&mut self, element: &T) {
        self.add_hash(stable_hash(element));
    }

    /// Fold an already-computed element hash in.
    pub fn add_hash(&mut self, hash: u64) {
        self.sum = self.sum.wrapping_add(hash);
        self.xor ^= hash.rotate_left(29);
        self.count += 1;
    }

    /// Elements folded in so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Final checksum with element count.
    pub fn finish(&self) -> CategoryChecksum {
        CategoryChecksum::with_count((self.sum ^ self.xor) as i64, self.count)
    }
}

/// Checksum of an enumerable category.
pub fn checksum_elements<'a, T, I>(elements: I) -> CategoryChecksum
where
    T: Hash + ?Sized + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut acc = ChecksumAccumulator::new();
    for element in elements {
        acc.add(element);
    }
    acc.finish()
}

// ---------------------------------------------------------------------------
// Deterministic sampling
// ---------------------------------------------------------------------------

/// Pick `count` cell indices out of `len`, seeded by `tick`.
///
/// Host and client calling this with the same arguments get the same indices.
/// When `count >= len` every index is returned in order.
pub fn sample_indices(tick: i64, len: usize, count: usize) -> Vec<usize> {
    if count >= len {
        return (0..len).collect();
    }
    let mut rng = ChaCha8Rng::seed_from_u64(tick as u64);
    (0..count).map(|_| rng.random_range(0..len)).collect()
}

/// Checksum of a continuous field by deterministic sampling.
///
/// Each sampled cell contributes the hash of `(index, cell)`, so identical
/// values at different positions are distinguished. The item count is the
/// number of samples taken.
pub fn checksum_sampled<T: Hash>(tick: i64, cells: &[T], sample_count: usize) -> CategoryChecksum {
    let mut acc = ChecksumAccumulator::new();
    for index in sample_indices(tick, cells.len(), sample_count) {
        acc.add(&(index as u64, &cells[index]));
    }
    acc.finish()
}
