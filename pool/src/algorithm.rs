//! Mining algorithm descriptor
//!
//! Holds the constants the share pipeline needs (diff1, multiplier, fixed nonce and
//! solution sizes) and the proof-of-work seam. The PoW primitive itself is supplied
//! by the deployment through [`PowVerifier`].

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// diff1 target (2^256 - 1) as a float. Rounds to 2^256.
pub const DIFF1: f64 = 1.157_920_892_373_162e77;

/// Verifies a solution against a job input. Pure, must be callable from any thread.
pub trait PowVerifier: Send + Sync {
    fn verify(&self, input: &[u8], nonce: &[u8], output: &[u8]) -> bool;
}

impl<F> PowVerifier for F
where
    F: Fn(&[u8], &[u8], &[u8]) -> bool + Send + Sync,
{
    fn verify(&self, input: &[u8], nonce: &[u8], output: &[u8]) -> bool {
        self(input, nonce, output)
    }
}

/// Accepts every solution. Only for trusted test setups.
pub struct NoopVerifier;

impl PowVerifier for NoopVerifier {
    fn verify(&self, _input: &[u8], _nonce: &[u8], _output: &[u8]) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct Algorithm {
    pub name: &'static str,
    pub multiplier: f64,
    /// Nonce length in hex characters.
    pub nonce_hex_len: usize,
    /// Solution length in hex characters.
    pub solution_hex_len: usize,
    verifier: Arc<dyn PowVerifier>,
}

impl fmt::Debug for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Algorithm")
            .field("name", &self.name)
            .field("multiplier", &self.multiplier)
            .field("nonce_hex_len", &self.nonce_hex_len)
            .field("solution_hex_len", &self.solution_hex_len)
            .finish()
    }
}

impl Algorithm {
    /// BeamHash III: 8 byte nonce, 104 byte solution.
    pub fn beam_hash_iii(verifier: Arc<dyn PowVerifier>) -> Self {
        Self {
            name: "BeamHashIII",
            multiplier: 1.0,
            nonce_hex_len: 16,
            solution_hex_len: 208,
            verifier,
        }
    }

    pub fn diff1(&self) -> f64 {
        DIFF1
    }

    pub fn verify(&self, input: &[u8], nonce: &[u8], output: &[u8]) -> bool {
        self.verifier.verify(input, nonce, output)
    }

    /// Difficulty achieved by a solution: diff1 / sha256(output) * multiplier.
    pub fn share_difficulty(&self, output: &[u8]) -> f64 {
        let digest = Sha256::digest(output);
        let value = BigUint::from_bytes_be(&digest).to_f64().unwrap_or(f64::MAX);
        DIFF1 / value * self.multiplier
    }
}

/// Beam packed difficulty: 8 bit order, 24 bit mantissa with an implicit leading bit.
pub mod difficulty {
    const MANTISSA_BITS: u32 = 24;
    const MANTISSA_MASK: u32 = (1 << MANTISSA_BITS) - 1;
    const MAX_ORDER: u32 = 231;
    const INFINITE: u32 = (MAX_ORDER + 1) << MANTISSA_BITS;

    pub fn pack(difficulty: f64) -> u32 {
        if !difficulty.is_finite() {
            return INFINITE;
        }
        if difficulty <= 1.0 {
            return 0;
        }

        let mut order = difficulty.log2().floor() as i32;
        let mut mantissa = (difficulty * 2f64.powi(MANTISSA_BITS as i32 - order)) as u64;
        // log2 can land one off near exact powers of two
        if mantissa >= 1 << (MANTISSA_BITS + 1) {
            order += 1;
            mantissa >>= 1;
        } else if mantissa < 1 << MANTISSA_BITS {
            order -= 1;
            mantissa <<= 1;
        }

        if order as u32 > MAX_ORDER {
            return INFINITE;
        }
        ((order as u32) << MANTISSA_BITS) | (mantissa as u32 & MANTISSA_MASK)
    }

    pub fn unpack(packed: u32) -> f64 {
        let order = packed >> MANTISSA_BITS;
        if order > MAX_ORDER {
            return f64::INFINITY;
        }
        let mantissa = (1u32 << MANTISSA_BITS) | (packed & MANTISSA_MASK);
        mantissa as f64 * 2f64.powi(order as i32 - MANTISSA_BITS as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff1_matches_max_u256() {
        let max = BigUint::from_bytes_be(&[0xff; 32]).to_f64().unwrap();
        assert_eq!(DIFF1, max);
    }

    #[test]
    fn test_pack_known_values() {
        assert_eq!(difficulty::pack(1.0), 0);
        assert_eq!(difficulty::pack(0.25), 0);
        assert_eq!(difficulty::pack(2.0), 1 << 24);
        assert_eq!(difficulty::pack(1024.0), 10 << 24);
        assert_eq!(difficulty::pack(3.0), (1 << 24) | (1 << 23));
    }

    #[test]
    fn test_unpack_reverses_pack() {
        for diff in [1.0, 2.0, 1024.0, 1536.0, 123_456.0, 9.5e12] {
            let unpacked = difficulty::unpack(difficulty::pack(diff));
            assert!((unpacked - diff).abs() / diff < 1e-6, "{} -> {}", diff, unpacked);
        }
    }

    #[test]
    fn test_share_difficulty_is_at_least_one() {
        let algo = Algorithm::beam_hash_iii(Arc::new(NoopVerifier));
        let diff = algo.share_difficulty(&[0u8; 104]);
        assert!(diff >= 1.0);
        assert!(diff.is_finite());
    }

    #[test]
    fn test_closure_verifier() {
        let algo = Algorithm::beam_hash_iii(Arc::new(|_: &[u8], nonce: &[u8], _: &[u8]| nonce[0] == 7));
        assert!(algo.verify(&[], &[7], &[]));
        assert!(!algo.verify(&[], &[8], &[]));
    }
}
