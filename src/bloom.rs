//! Bloom filter with the bit layout shared with the filter builder.
//!
//! Bit `k` lives in byte `k / 8` under the mask `1 << (k % 8)`. Probe `i`
//! of a packed k-mer is `xxh3_64_with_seed(kmer, i) % size`; the same hash
//! must have produced the `.bf` file being queried.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::error::SieveError;

/// Fill `out` with the raw (unreduced) probe hashes for one packed k-mer.
///
/// Filters sharing a `(hash_num, kmer_size)` signature reduce the same raw
/// hashes modulo their own sizes, so one hashing pass serves a whole group.
#[inline]
pub fn seeded_hashes(kmer: &[u8], hash_num: u32, out: &mut Vec<u64>) {
    out.clear();
    for i in 0..hash_num {
        out.push(xxh3_64_with_seed(kmer, u64::from(i)));
    }
}

#[derive(Debug)]
pub struct BloomFilter {
    size: u64,
    hash_num: u32,
    kmer_size: usize,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Empty filter for building. `size` is the bit length.
    pub fn new(size: u64, hash_num: u32, kmer_size: usize) -> Result<Self, SieveError> {
        if size == 0 || size % 8 != 0 {
            return Err(SieveError::FilterIntegrity(format!(
                "filter size {} is not a non-zero multiple of 8",
                size
            )));
        }
        if hash_num == 0 {
            return Err(SieveError::FilterIntegrity(
                "filter needs at least one hash function".to_string(),
            ));
        }
        Ok(BloomFilter {
            size,
            hash_num,
            kmer_size,
            bits: vec![0u8; (size / 8) as usize],
        })
    }

    /// Load the bit array of a `.bf` file. The file must hold exactly
    /// `size / 8` bytes or the filter does not belong to its sidecar.
    pub fn load(
        path: &Path,
        size: u64,
        hash_num: u32,
        kmer_size: usize,
    ) -> Result<Self, SieveError> {
        let mut filter = BloomFilter::new(size, hash_num, kmer_size)?;
        let mut file = File::open(path).map_err(|e| {
            SieveError::FilterIntegrity(format!("filter {:?} could not be read: {}", path, e))
        })?;
        let actual = file
            .metadata()
            .map_err(|e| {
                SieveError::FilterIntegrity(format!("filter {:?} could not be read: {}", path, e))
            })?
            .len();
        let expected = size / 8;
        if actual != expected {
            return Err(SieveError::FilterSizeMismatch {
                path: path.to_path_buf(),
                actual,
                expected,
            });
        }
        file.read_exact(&mut filter.bits)?;
        Ok(filter)
    }

    /// Write the bit array verbatim. No header; random bits compress
    /// poorly anyway.
    pub fn store(&self, path: &Path) -> Result<(), SieveError> {
        let mut file = File::create(path)?;
        file.write_all(&self.bits)?;
        Ok(())
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn hash_num(&self) -> u32 {
        self.hash_num
    }

    #[inline]
    pub fn kmer_size(&self) -> usize {
        self.kmer_size
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    fn set_bit(&mut self, pos: u64) {
        self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
    }

    #[inline]
    fn test_bit(&self, pos: u64) -> bool {
        self.bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0
    }

    pub fn insert(&mut self, kmer: &[u8]) {
        for i in 0..self.hash_num {
            let pos = xxh3_64_with_seed(kmer, u64::from(i)) % self.size;
            self.set_bit(pos);
        }
    }

    pub fn insert_prehashed(&mut self, hashes: &[u64]) {
        for &h in hashes {
            self.set_bit(h % self.size);
        }
    }

    /// True iff every probe bit is set (one-sided error: no false
    /// negatives for inserted k-mers).
    pub fn contains(&self, kmer: &[u8]) -> bool {
        for i in 0..self.hash_num {
            let pos = xxh3_64_with_seed(kmer, u64::from(i)) % self.size;
            if !self.test_bit(pos) {
                return false;
            }
        }
        true
    }

    pub fn contains_prehashed(&self, hashes: &[u64]) -> bool {
        for &h in hashes {
            if !self.test_bit(h % self.size) {
                return false;
            }
        }
        true
    }
}
