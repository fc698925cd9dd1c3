//! Key-pair generation for incremental point functions
//!
//! A key pair shares the point function `f(x) = beta if x == alpha else 0`
//! over every level of the hierarchy at once: evaluating both keys at a
//! level-h prefix and adding the results gives `beta` when the prefix equals
//! the top `log_domain_size[h]` bits of `alpha`, and zero otherwise.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::error::{DpfError, Result};
use crate::params::{value_mask, Parameters};
use crate::prg::{self, Seed, SEED_LEN};

/// Correction applied when walking one tree depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionWord {
    pub seed: Seed,
    pub left_bit: bool,
    pub right_bit: bool,
}

impl CorrectionWord {
    pub(crate) fn bit(&self, direction: bool) -> bool {
        if direction {
            self.right_bit
        } else {
            self.left_bit
        }
    }
}

/// One party's share of a point function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShare {
    party: u8,
    seed: Seed,
    correction_words: Vec<CorrectionWord>,
    value_corrections: Vec<u64>,
    parameters_digest: [u8; 32],
}

impl KeyShare {
    /// Party index: 0 or 1
    pub fn party(&self) -> u8 {
        self.party
    }

    pub(crate) fn seed(&self) -> &Seed {
        &self.seed
    }

    pub(crate) fn correction_word(&self, depth: u32) -> &CorrectionWord {
        &self.correction_words[depth as usize]
    }

    pub(crate) fn value_correction(&self, level: usize) -> u64 {
        self.value_corrections[level]
    }

    /// Serialize to the opaque wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| DpfError::encode("key share", e))
    }

    /// Decode the opaque wire format; shape is checked against parameters
    /// when a context is created.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| DpfError::decode("key share", e))
    }

    /// Confirm this share was generated for `parameters`
    pub(crate) fn check_against(&self, parameters: &Parameters) -> Result<()> {
        if self.party > 1 {
            return Err(DpfError::Parameter(format!(
                "key share has invalid party {}",
                self.party
            )));
        }
        if self.parameters_digest != parameters.digest() {
            return Err(DpfError::Parameter(format!(
                "key share was generated for parameters {}, not {}",
                hex::encode(&self.parameters_digest[..8]),
                hex::encode(&parameters.digest()[..8])
            )));
        }
        let depth = parameters.final_log_domain_size() as usize;
        if self.correction_words.len() != depth {
            return Err(DpfError::Parameter(format!(
                "key share has {} correction words, parameters need {}",
                self.correction_words.len(),
                depth
            )));
        }
        if self.value_corrections.len() != parameters.num_levels() {
            return Err(DpfError::Parameter(format!(
                "key share has {} value corrections, parameters need {}",
                self.value_corrections.len(),
                parameters.num_levels()
            )));
        }
        Ok(())
    }
}

/// Share value held by `party` at a node with the given seed and control bit
pub(crate) fn share_value(
    party: u8,
    seed: &Seed,
    control_bit: bool,
    value_correction: u64,
    value_bits: u32,
) -> u64 {
    let mask = value_mask(value_bits);
    let mut value = prg::convert(seed, value_bits);
    if control_bit {
        value = value.wrapping_add(value_correction);
    }
    if party == 1 {
        value = value.wrapping_neg();
    }
    value & mask
}

/// Generate a key pair using the thread-local CSPRNG
pub fn generate_keys(parameters: &Parameters, alpha: u64, beta: u64) -> Result<(KeyShare, KeyShare)> {
    generate_keys_with_rng(parameters, alpha, beta, &mut rand::thread_rng())
}

/// Generate a key pair drawing root seeds from `rng`
pub fn generate_keys_with_rng<R: RngCore + CryptoRng>(
    parameters: &Parameters,
    alpha: u64,
    beta: u64,
    rng: &mut R,
) -> Result<(KeyShare, KeyShare)> {
    parameters.validate()?;

    let depth = parameters.final_log_domain_size();
    if depth < 64 && alpha >> depth != 0 {
        return Err(DpfError::Input(format!(
            "alpha {} does not fit in {} bits",
            alpha, depth
        )));
    }
    let min_bits = parameters.min_value_bits();
    if beta & !value_mask(min_bits) != 0 {
        return Err(DpfError::Input(format!(
            "beta {} does not fit in {} value bits",
            beta, min_bits
        )));
    }

    let mut roots = [[0u8; SEED_LEN]; 2];
    rng.fill_bytes(&mut roots[0]);
    rng.fill_bytes(&mut roots[1]);

    let mut seeds = roots;
    let mut bits = [false, true];
    let mut correction_words = Vec::with_capacity(depth as usize);
    let mut value_corrections = Vec::with_capacity(parameters.num_levels());
    let levels = parameters.levels();
    let mut next_level = 0;

    for d in 0..=depth {
        // Levels whose prefixes end at this depth get their value correction
        // from the current on-path seeds.
        while next_level < levels.len() && levels[next_level].log_domain_size == d {
            let level = &levels[next_level];
            let mask = level.value_mask();
            let c0 = prg::convert(&seeds[0], level.value_bits);
            let c1 = prg::convert(&seeds[1], level.value_bits);
            let mut correction = beta.wrapping_sub(c0).wrapping_add(c1);
            if bits[1] {
                correction = correction.wrapping_neg();
            }
            value_corrections.push(correction & mask);
            next_level += 1;
        }
        if d == depth {
            break;
        }

        let direction = (alpha >> (depth - 1 - d)) & 1 == 1;
        let expansions = [prg::expand(&seeds[0]), prg::expand(&seeds[1])];
        let (lose0, _) = expansions[0].child(!direction);
        let (lose1, _) = expansions[1].child(!direction);

        let cw = CorrectionWord {
            seed: prg::xor(&lose0, &lose1),
            left_bit: expansions[0].left_bit ^ expansions[1].left_bit ^ direction ^ true,
            right_bit: expansions[0].right_bit ^ expansions[1].right_bit ^ direction,
        };

        for party in 0..2 {
            let (keep, keep_bit) = expansions[party].child(direction);
            if bits[party] {
                seeds[party] = prg::xor(&keep, &cw.seed);
                bits[party] = keep_bit ^ cw.bit(direction);
            } else {
                seeds[party] = keep;
                bits[party] = keep_bit;
            }
        }
        correction_words.push(cw);
    }

    let digest = parameters.digest();
    let key = |party: u8| KeyShare {
        party,
        seed: roots[party as usize],
        correction_words: correction_words.clone(),
        value_corrections: value_corrections.clone(),
        parameters_digest: digest,
    };

    Ok((key(0), key(1)))
}
