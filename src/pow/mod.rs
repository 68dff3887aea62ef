//! Proof-of-work primitives: double SHA-256, the 80-byte block header
//! layout, and 256-bit target arithmetic.
//!
//! Pool (vardiff) targets and the network target share one representation so
//! that share validation and block-candidate detection use the same
//! comparison path. A hash meets a target when, interpreted as a
//! little-endian 256-bit integer, it is less than **or equal to** the target;
//! one unit above the target fails.

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use sha2::{Digest, Sha256};

/// 256-bit hash in internal (little-endian) byte order, as produced by
/// double SHA-256.
pub type Hash256 = [u8; 32];

pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// The difficulty-1 target: 0x00000000ffff << 208.
fn diff1_target() -> BigUint {
    let mut bytes = [0u8; 32];
    bytes[4] = 0xff;
    bytes[5] = 0xff;
    BigUint::from_bytes_be(&bytes)
}

fn max_target() -> BigUint {
    BigUint::from_bytes_be(&[0xff; 32])
}

// ─── Target ──────────────────────────────────────────────────────────

/// A 256-bit proof-of-work target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target(BigUint);

impl Target {
    /// Convert a pool difficulty to a target: `diff1_target / difficulty`.
    ///
    /// No clamping is applied here; operational floors and ceilings are the
    /// difficulty controller's concern. Non-positive difficulties map to the
    /// difficulty-1 target.
    pub fn from_difficulty(difficulty: f64) -> Self {
        if difficulty <= 0.0 {
            return Target(diff1_target());
        }
        // Fixed-point division: scale the f64 difficulty into an integer so
        // the 256-bit quotient stays exact.
        const SCALE: u64 = 1 << 32;
        let scaled = ((difficulty * SCALE as f64) as u128).max(1);
        let target = diff1_target() * SCALE / BigUint::from(scaled);
        Target(target.min(max_target()))
    }

    /// Decode a compact "nbits" representation.
    pub fn from_compact(bits: u32) -> Self {
        let exponent = (bits >> 24) as usize;
        let mantissa = BigUint::from(bits & 0x007f_ffff);
        let value = if exponent <= 3 {
            mantissa >> (8 * (3 - exponent))
        } else {
            mantissa << (8 * (exponent - 3))
        };
        Target(value.min(max_target()))
    }

    /// Encode to compact "nbits" form (lossy, like the consensus encoding).
    pub fn to_compact(&self) -> u32 {
        if self.0 == BigUint::from(0u32) {
            return 0;
        }
        let mut size = (self.0.bits() as usize + 7) / 8;
        let mut compact: u32 = if size <= 3 {
            (self.0.to_u64().unwrap_or(0) << (8 * (3 - size))) as u32
        } else {
            ((self.0.clone() >> (8 * (size - 3))).to_u64().unwrap_or(0)) as u32
        };
        // The sign bit of the mantissa must stay clear.
        if compact & 0x0080_0000 != 0 {
            compact >>= 8;
            size += 1;
        }
        ((size as u32) << 24) | (compact & 0x007f_ffff)
    }

    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        Target(BigUint::from_bytes_be(bytes))
    }

    /// Parse a 64-character big-endian hex target (the `target` field of a
    /// block template).
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        Some(Target(BigUint::from_bytes_be(&bytes)))
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let raw = self.0.to_bytes_be();
        let mut out = [0u8; 32];
        out[32 - raw.len()..].copy_from_slice(&raw);
        out
    }

    /// Whether a header hash satisfies this target. Equality counts as met.
    pub fn is_met_by(&self, hash: &Hash256) -> bool {
        BigUint::from_bytes_le(hash) <= self.0
    }

    /// Approximate difficulty represented by this target, for logs and stats.
    pub fn difficulty(&self) -> f64 {
        let target = self.0.to_f64().unwrap_or(f64::MAX);
        if target == 0.0 {
            return f64::MAX;
        }
        diff1_target().to_f64().unwrap_or(0.0) / target
    }
}

// ─── Block Header ────────────────────────────────────────────────────

/// Serialize a block header into the 80-byte hashing format.
///
/// `prev_hash` and `merkle_root` are in internal (little-endian) byte order.
pub fn serialize_header(
    version: u32,
    prev_hash: &Hash256,
    merkle_root: &Hash256,
    ntime: u32,
    bits: u32,
    nonce: u32,
) -> [u8; 80] {
    let mut header = [0u8; 80];
    header[0..4].copy_from_slice(&version.to_le_bytes());
    header[4..36].copy_from_slice(prev_hash);
    header[36..68].copy_from_slice(merkle_root);
    header[68..72].copy_from_slice(&ntime.to_le_bytes());
    header[72..76].copy_from_slice(&bits.to_le_bytes());
    header[76..80].copy_from_slice(&nonce.to_le_bytes());
    header
}

/// Hash an 80-byte header.
pub fn header_hash(header: &[u8; 80]) -> Hash256 {
    double_sha256(header)
}

/// Render an internal-order hash in the display (big-endian) convention.
pub fn display_hash(hash: &Hash256) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}
