//! Hierarchy parameters shared by both helpers and both keys of a pair
//!
//! Each level of the prefix tree fixes how many top bits of the index are
//! visible at that level (`log_domain_size`) and how wide the additive
//! output group is (`value_bits`, values live in Z_{2^value_bits}).

use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};

use crate::error::{DpfError, Result};

/// Largest supported index width (indices are `u64`)
pub const MAX_LOG_DOMAIN_SIZE: u32 = 64;

/// Largest supported output element width
pub const MAX_VALUE_BITS: u32 = 64;

/// Parameters for a single hierarchy level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelParameters {
    /// Number of index bits visible at this level
    pub log_domain_size: u32,
    /// Output element width in bits
    pub value_bits: u32,
}

impl LevelParameters {
    pub fn new(log_domain_size: u32, value_bits: u32) -> Self {
        Self {
            log_domain_size,
            value_bits,
        }
    }

    /// Mask selecting the low `value_bits` bits
    pub fn value_mask(&self) -> u64 {
        value_mask(self.value_bits)
    }
}

pub(crate) fn value_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Immutable schema of the prefix tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    levels: Vec<LevelParameters>,
}

impl Parameters {
    /// Build and validate parameters
    pub fn new(levels: Vec<LevelParameters>) -> Result<Self> {
        let params = Self { levels };
        params.validate()?;
        Ok(params)
    }

    /// Convenience constructor using one value width for every level
    pub fn uniform(log_domain_sizes: &[u32], value_bits: u32) -> Result<Self> {
        Self::new(
            log_domain_sizes
                .iter()
                .map(|&bits| LevelParameters::new(bits, value_bits))
                .collect(),
        )
    }

    pub fn levels(&self) -> &[LevelParameters] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> Option<&LevelParameters> {
        self.levels.get(index)
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Depth of the full tree (bit-length of the secret index)
    pub fn final_log_domain_size(&self) -> u32 {
        self.levels.last().map(|l| l.log_domain_size).unwrap_or(0)
    }

    /// Narrowest output width across all levels
    pub fn min_value_bits(&self) -> u32 {
        self.levels
            .iter()
            .map(|l| l.value_bits)
            .min()
            .unwrap_or(MAX_VALUE_BITS)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(DpfError::Parameter(
                "at least one hierarchy level is required".into(),
            ));
        }

        let mut previous: Option<u32> = None;
        for (i, level) in self.levels.iter().enumerate() {
            if level.log_domain_size > MAX_LOG_DOMAIN_SIZE {
                return Err(DpfError::Parameter(format!(
                    "level {}: log_domain_size {} exceeds {}",
                    i, level.log_domain_size, MAX_LOG_DOMAIN_SIZE
                )));
            }
            if level.log_domain_size == 0 {
                return Err(DpfError::Parameter(format!(
                    "level {}: log_domain_size must be at least 1",
                    i
                )));
            }
            if let Some(prev) = previous {
                if level.log_domain_size <= prev {
                    return Err(DpfError::Parameter(format!(
                        "level {}: log_domain_size {} must be greater than previous level's {}",
                        i, level.log_domain_size, prev
                    )));
                }
            }
            if level.value_bits == 0
                || level.value_bits > MAX_VALUE_BITS
                || !level.value_bits.is_power_of_two()
            {
                return Err(DpfError::Parameter(format!(
                    "level {}: value_bits {} must be a power of two in 1..={}",
                    i, level.value_bits, MAX_VALUE_BITS
                )));
            }
            previous = Some(level.log_domain_size);
        }

        Ok(())
    }

    /// Stable digest binding keys and contexts to these parameters
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Keccak::v256();
        hasher.update(b"hierhist-dpf/parameters");
        hasher.update(&(self.levels.len() as u64).to_le_bytes());
        for level in &self.levels {
            hasher.update(&level.log_domain_size.to_le_bytes());
            hasher.update(&level.value_bits.to_le_bytes());
        }
        let mut out = [0u8; 32];
        hasher.finalize(&mut out);
        out
    }

    /// Serialize to the binary wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| DpfError::encode("parameters", e))
    }

    /// Parse and validate the binary wire format
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let params: Parameters =
            bincode::deserialize(data).map_err(|e| DpfError::decode("parameters", e))?;
        params.validate()?;
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_parameters() {
        let params = Parameters::uniform(&[1, 8], 32).unwrap();
        assert_eq!(params.num_levels(), 2);
        assert_eq!(params.final_log_domain_size(), 8);
        assert_eq!(params.min_value_bits(), 32);
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(
            Parameters::new(vec![]),
            Err(DpfError::Parameter(_))
        ));
    }

    #[test]
    fn test_rejects_non_increasing_domains() {
        let err = Parameters::uniform(&[4, 4], 32).unwrap_err();
        assert!(matches!(err, DpfError::Parameter(_)));
        let err = Parameters::uniform(&[8, 2], 32).unwrap_err();
        assert!(matches!(err, DpfError::Parameter(_)));
    }

    #[test]
    fn test_rejects_bad_value_bits() {
        for bits in [0, 3, 12, 128] {
            assert!(
                Parameters::uniform(&[2, 4], bits).is_err(),
                "value_bits {} should be rejected",
                bits
            );
        }
    }

    #[test]
    fn test_rejects_zero_bit_level() {
        let err = Parameters::uniform(&[0, 64], 32).unwrap_err();
        assert!(matches!(err, DpfError::Parameter(_)));
        assert!(Parameters::uniform(&[1, 64], 32).is_ok());
    }

    #[test]
    fn test_rejects_oversized_domain() {
        assert!(Parameters::uniform(&[65], 64).is_err());
        assert!(Parameters::uniform(&[64], 64).is_ok());
    }

    #[test]
    fn test_bytes_roundtrip_and_corruption() {
        let params = Parameters::new(vec![
            LevelParameters::new(2, 64),
            LevelParameters::new(10, 16),
        ])
        .unwrap();
        let bytes = params.to_bytes().unwrap();
        assert_eq!(Parameters::from_bytes(&bytes).unwrap(), params);

        assert!(matches!(
            Parameters::from_bytes(&bytes[..bytes.len() - 1]),
            Err(DpfError::Parameter(_))
        ));
    }

    #[test]
    fn test_digest_changes_with_shape() {
        let a = Parameters::uniform(&[1, 8], 32).unwrap();
        let b = Parameters::uniform(&[1, 8], 64).unwrap();
        let c = Parameters::uniform(&[2, 8], 32).unwrap();
        assert_eq!(a.digest(), Parameters::uniform(&[1, 8], 32).unwrap().digest());
        assert_ne!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_value_mask() {
        assert_eq!(LevelParameters::new(1, 8).value_mask(), 0xff);
        assert_eq!(LevelParameters::new(1, 64).value_mask(), u64::MAX);
        assert_eq!(LevelParameters::new(1, 1).value_mask(), 1);
    }
}
