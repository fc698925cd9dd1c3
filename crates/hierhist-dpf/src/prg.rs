//! Length-doubling PRG and value conversion over Keccak-256
//!
//! Left expansion, right expansion and value conversion use distinct
//! domain tags so their outputs are independent.

use tiny_keccak::{Hasher, Keccak};

use crate::params::value_mask;

pub const SEED_LEN: usize = 16;

pub type Seed = [u8; SEED_LEN];

const DOMAIN: &[u8] = b"hierhist-dpf/prg/v1";
const TAG_LEFT: u8 = 0x00;
const TAG_RIGHT: u8 = 0x01;
const TAG_VALUE: u8 = 0x02;

/// Children of one tree node before correction
#[derive(Debug, Clone, Copy)]
pub(crate) struct Expansion {
    pub left: Seed,
    pub left_bit: bool,
    pub right: Seed,
    pub right_bit: bool,
}

impl Expansion {
    /// Seed and control bit of the child selected by `bit`
    pub fn child(&self, bit: bool) -> (Seed, bool) {
        if bit {
            (self.right, self.right_bit)
        } else {
            (self.left, self.left_bit)
        }
    }
}

fn keccak(tag: u8, seed: &Seed) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(DOMAIN);
    hasher.update(&[tag]);
    hasher.update(seed);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out
}

fn split(block: &[u8; 32]) -> (Seed, bool) {
    let mut seed = [0u8; SEED_LEN];
    seed.copy_from_slice(&block[..SEED_LEN]);
    (seed, block[SEED_LEN] & 1 == 1)
}

pub(crate) fn expand(seed: &Seed) -> Expansion {
    let (left, left_bit) = split(&keccak(TAG_LEFT, seed));
    let (right, right_bit) = split(&keccak(TAG_RIGHT, seed));
    Expansion {
        left,
        left_bit,
        right,
        right_bit,
    }
}

/// Map a node seed to a pseudorandom element of Z_{2^value_bits}
pub(crate) fn convert(seed: &Seed, value_bits: u32) -> u64 {
    let block = keccak(TAG_VALUE, seed);
    let mut word = [0u8; 8];
    word.copy_from_slice(&block[..8]);
    u64::from_le_bytes(word) & value_mask(value_bits)
}

pub(crate) fn xor(a: &Seed, b: &Seed) -> Seed {
    let mut out = [0u8; SEED_LEN];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_is_deterministic() {
        let seed = [7u8; SEED_LEN];
        let a = expand(&seed);
        let b = expand(&seed);
        assert_eq!(a.left, b.left);
        assert_eq!(a.right, b.right);
        assert_eq!(a.left_bit, b.left_bit);
        assert_ne!(a.left, a.right);
    }

    #[test]
    fn test_convert_respects_width() {
        let seed = [3u8; SEED_LEN];
        assert!(convert(&seed, 8) <= 0xff);
        assert_eq!(convert(&seed, 64) & 0xff, convert(&seed, 8));
    }

    #[test]
    fn test_xor_self_is_zero() {
        let seed = [0xa5u8; SEED_LEN];
        assert_eq!(xor(&seed, &seed), [0u8; SEED_LEN]);
    }
}
