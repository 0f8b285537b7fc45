use sha2::{Digest, Sha256};

use crate::error::{invalid_argument, SyncResult};

/// Probabilistic set of document paths sent alongside an existence filter.
///
/// Membership uses double hashing over the first 16 bytes of the SHA-256 digest:
/// `h1` and `h2` are the two little-endian `u64` halves and hash `i` selects bit
/// `(h1 + i * h2) mod bit_count`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> SyncResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Expected padding of 0 when bitmap length is 0, but got {padding}"
            )));
        }
        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    /// Builds a filter containing `values`, sized to `bit_count` bits.
    pub fn build<'a, I>(values: I, bit_count: u64, hash_count: u32) -> SyncResult<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let bytes = bit_count.div_ceil(8) as usize;
        let padding = (bytes as u64 * 8 - bit_count) as i32;
        let mut filter = Self::new(vec![0; bytes], padding, hash_count as i32)?;
        for value in values {
            let (h1, h2) = hash_halves(value);
            for i in 0..filter.hash_count {
                let index = filter.bit_index(h1, h2, i);
                filter.bitmap[(index / 8) as usize] |= 1 << (index % 8);
            }
        }
        Ok(filter)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn padding(&self) -> i32 {
        (self.bitmap.len() as u64 * 8 - self.bit_count) as i32
    }

    /// `false` means definitely absent; `true` may be a false positive.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_halves(value);
        (0..self.hash_count).all(|i| {
            let index = self.bit_index(h1, h2, i);
            self.bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
        })
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(h2.wrapping_mul(i as u64)) % self.bit_count
    }
}

fn hash_halves(value: &str) -> (u64, u64) {
    let digest = Sha256::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[0..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_parameters() {
        assert!(BloomFilter::new(vec![0xff], 8, 1).is_err());
        assert!(BloomFilter::new(vec![0xff], -1, 1).is_err());
        assert!(BloomFilter::new(vec![0xff], 0, 0).is_err());
        assert!(BloomFilter::new(vec![0xff], 0, -1).is_err());
        assert!(BloomFilter::new(Vec::new(), 1, 0).is_err());
        assert!(BloomFilter::new(Vec::new(), 0, 0).is_ok());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain("rooms/a"));
    }

    #[test]
    fn built_filter_contains_every_inserted_value() {
        let paths = ["rooms/a", "rooms/b", "rooms/c"];
        let filter = BloomFilter::build(paths, 1_024, 7).unwrap();
        assert_eq!(filter.padding(), 0);
        for path in paths {
            assert!(filter.might_contain(path));
        }
        let misses = (0..100)
            .filter(|n| filter.might_contain(&format!("rooms/missing{n}")))
            .count();
        assert!(misses < 5, "{misses} false positives");
    }

    #[test]
    fn padding_shrinks_bit_count() {
        let filter = BloomFilter::build(["x"], 13, 3).unwrap();
        assert_eq!(filter.bitmap().len(), 2);
        assert_eq!(filter.padding(), 3);
        assert_eq!(filter.bit_count(), 13);
        assert!(filter.might_contain("x"));
    }
}
