//! Fixed-size Bloom filter

use std::collections::hash_map::DefaultHasher;
use std::f64::consts::LN_2;
use std::hash::{Hash, Hasher};

/// Seeds for the two base hashes combined by double hashing
const SEED_A: u64 = 0x9e37_79b9_7f4a_7c15;
const SEED_B: u64 = 0xc2b2_ae3d_27d4_eb4f;

/// A Bloom filter built once from a complete item set.
///
/// Answers "definitely absent" or "possibly present". Items cannot be
/// removed; the owner rebuilds the whole filter instead.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    items: usize,
}

impl BloomFilter {
    /// Size a filter for `expected_items` at `false_positive_rate`
    pub fn with_rate(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5);

        let num_bits = (-(n * p.ln()) / (LN_2 * LN_2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * LN_2).round().clamp(1.0, 32.0) as u32;
        let words = num_bits.div_ceil(64) as usize;

        Self {
            bits: vec![0; words],
            num_bits,
            num_hashes,
            items: 0,
        }
    }

    /// Build a filter holding exactly `items`
    pub fn from_items<I, T>(items: I, false_positive_rate: f64) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
        T: AsRef<str>,
    {
        let iter = items.into_iter();
        let mut filter = Self::with_rate(iter.len(), false_positive_rate);
        for item in iter {
            filter.insert(item.as_ref());
        }
        filter
    }

    pub fn insert(&mut self, item: &str) {
        let (h1, h2) = base_hashes(item);
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.items += 1;
    }

    pub fn might_contain(&self, item: &str) -> bool {
        let (h1, h2) = base_hashes(item);
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_index(h1, h2, i);
            self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.num_bits
    }
}

fn base_hashes(item: &str) -> (u64, u64) {
    let hash_with = |seed: u64| {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        item.hash(&mut hasher);
        hasher.finish()
    };
    // An odd step keeps probes from collapsing onto one bit
    (hash_with(SEED_A), hash_with(SEED_B) | 1)
}
