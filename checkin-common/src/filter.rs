use std::f64::consts::LN_2;
use std::hash::Hasher;

use siphasher::sip::SipHasher13;
use thiserror::Error;

// Fixed hash keys: changing them invalidates every filter already stored.
const HASH_KEYS: [(u64, u64); 2] = [
    (0x6e63_635f_6368_6b31, 0x9e37_79b9_7f4a_7c15),
    (0x6e63_635f_6368_6b32, 0xc2b2_ae3d_27d4_eb4f),
];

// Redis bitmaps are capped at 2^32 bits.
const MAX_BITS: u64 = 1 << 32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("filter capacity must be positive")]
    ZeroCapacity,
    #[error("filter error rate must be in (0, 1), got {0}")]
    InvalidErrorRate(f64),
    #[error("filter needs {0} bits, more than a bitmap can hold")]
    TooLarge(u64),
}

/// Bloom filter geometry for the admission dedup check.
///
/// The filter itself lives in the store; this type only knows how many bits
/// and hash functions a given capacity and error rate need, and which bits a
/// key maps to. A key was seen before iff all of its bits are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupFilter {
    bits: u64,
    hashes: u32,
}

impl DedupFilter {
    pub fn new(capacity: u64, error_rate: f64) -> Result<Self, FilterError> {
        if capacity == 0 {
            return Err(FilterError::ZeroCapacity);
        }
        if !(error_rate > 0.0 && error_rate < 1.0) {
            return Err(FilterError::InvalidErrorRate(error_rate));
        }

        let n = capacity as f64;
        let bits = (-n * error_rate.ln() / (LN_2 * LN_2)).ceil() as u64;
        if bits > MAX_BITS {
            return Err(FilterError::TooLarge(bits));
        }
        let hashes = ((bits as f64 / n) * LN_2).ceil().max(1.0) as u32;

        Ok(Self { bits, hashes })
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn hashes(&self) -> u32 {
        self.hashes
    }

    /// Bit offsets for `key`, by double hashing two SipHash digests.
    pub fn positions(&self, key: &str) -> Vec<u64> {
        let [h1, h2] = HASH_KEYS.map(|(k0, k1)| {
            let mut hasher = SipHasher13::new_with_keys(k0, k1);
            hasher.write(key.as_bytes());
            hasher.finish()
        });

        (0..u64::from(self.hashes))
            .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bits)
            .collect()
    }
}
