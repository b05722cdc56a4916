//! # Bloom Filter
//!
//! A space-efficient probabilistic data structure for set membership testing.
//!
//! A bloom filter can tell you with certainty that a key is **not** in the set
//! (no false negatives), but may occasionally report that a key **is** in the
//! set when it isn't (false positives).
//!
//! ## Usage in tidepool
//!
//! Each SSTable embeds a bloom filter built from its keys. During point
//! lookups the store checks the bloom filter first — if it says "not present",
//! the SSTable is skipped entirely, avoiding index lookups and disk I/O.
//!
//! ## Example
//!
//! ```rust
//! use bloom::BloomFilter;
//!
//! let mut bf = BloomFilter::with_capacity(1000);
//! bf.insert(b"hello");
//! assert!(bf.may_contain(b"hello"));
//! ```

use std::io::{self, Read, Write};

/// Number of hash functions applied at write time.
const NUM_HASHES: u64 = 3;

/// Bits allocated per expected key.
const BITS_PER_KEY: u64 = 10;

/// Minimum filter size in bits, so tiny tables still get a usable filter.
const MIN_BITS: u64 = 64;

/// Safety cap on the deserialized bitset (128 MiB). Prevents OOM on corrupt files.
const MAX_WORDS: usize = 16 * 1024 * 1024;

/// A bloom filter backed by a vector of 64-bit words with `k` hash functions.
///
/// Each hash probe is an independent FNV-1a whose starting basis is derived
/// from the hash index, so the `k` probes are decorrelated without a second
/// hash family.
pub struct BloomFilter {
    /// The bitset, packed into 64-bit words.
    words: Vec<u64>,
    /// Number of addressable bits in the filter.
    bit_count: u64,
    /// Number of hash functions (k).
    num_hashes: u64,
}

impl BloomFilter {
    /// Creates a bloom filter sized for `expected_keys` entries.
    ///
    /// Sizing heuristic: `max(64, 10·n)` bits, rounded up to whole 64-bit
    /// words, with k = 3 hash functions.
    #[must_use]
    pub fn with_capacity(expected_keys: usize) -> Self {
        let bit_count = MIN_BITS.max(BITS_PER_KEY * expected_keys as u64);
        let word_count = bit_count.div_ceil(64) as usize;
        Self {
            words: vec![0u64; word_count],
            bit_count: word_count as u64 * 64,
            num_hashes: NUM_HASHES,
        }
    }

    /// Inserts a key into the filter.
    pub fn insert(&mut self, key: &[u8]) {
        for i in 0..self.num_hashes {
            let bit = seeded_fnv1a(i, key) % self.bit_count;
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// Returns `true` if the key **might** be in the set, `false` if it is
    /// **definitely not** in the set.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        for i in 0..self.num_hashes {
            let bit = seeded_fnv1a(i, key) % self.bit_count;
            if self.words[(bit / 64) as usize] & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Returns the number of addressable bits in the filter.
    #[must_use]
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Returns the number of hash functions.
    #[must_use]
    pub fn num_hashes(&self) -> u64 {
        self.num_hashes
    }

    /// Returns the size of the serialized filter in bytes.
    ///
    /// Layout: `k(u64) + bit_count(u64) + words`.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        8 + 8 + self.words.len() * 8
    }

    /// Serializes the filter to a writer.
    ///
    /// Wire format (all little-endian):
    /// ```text
    /// [k: u64][bit_count: u64][word0: u64][word1: u64]...
    /// ```
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.num_hashes.to_le_bytes())?;
        w.write_all(&self.bit_count.to_le_bytes())?;
        for word in &self.words {
            w.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    /// Deserializes a filter from a reader, recovering both parameters.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut buf8 = [0u8; 8];

        r.read_exact(&mut buf8)?;
        let num_hashes = u64::from_le_bytes(buf8);

        r.read_exact(&mut buf8)?;
        let bit_count = u64::from_le_bytes(buf8);

        if num_hashes == 0 || bit_count == 0 || bit_count % 64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bloom filter header invalid",
            ));
        }

        let word_count = (bit_count / 64) as usize;
        if word_count > MAX_WORDS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bloom filter too large: {} words", word_count),
            ));
        }

        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            r.read_exact(&mut buf8)?;
            words.push(u64::from_le_bytes(buf8));
        }

        Ok(Self {
            words,
            bit_count,
            num_hashes,
        })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bit_count", &self.bit_count)
            .field("num_hashes", &self.num_hashes)
            .field("bytes", &(self.words.len() * 8))
            .finish()
    }
}

/// FNV-1a 64-bit hash with a basis derived from the hash index.
fn seeded_fnv1a(index: u64, data: &[u8]) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x00000100000001b3;

    let mut hash = FNV_OFFSET_BASIS ^ index.wrapping_mul(0x9e3779b97f4a7c15);
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
