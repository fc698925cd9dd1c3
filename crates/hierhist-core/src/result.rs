//! Partial results: one helper's per-prefix aggregate shares for one level

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Aggregate share for a single prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramEntry {
    pub prefix: u64,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub query_id: String,
    pub level: u32,
    /// Bit-length of every prefix in `entries`
    pub prefix_bits: u32,
    /// Shares are elements of Z_{2^value_bits}
    pub value_bits: u32,
    /// Privacy budget spent producing this level
    pub epsilon: f64,
    /// Ordered by prefix
    pub entries: Vec<HistogramEntry>,
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

impl PartialResult {
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn prefixes(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|e| e.prefix)
    }

    /// Add two helpers' shares for the same level, recovering the aggregate
    pub fn combine(&self, other: &PartialResult) -> crate::Result<Vec<HistogramEntry>> {
        if self.query_id != other.query_id || self.level != other.level {
            return Err(Error::InvalidResult(format!(
                "cannot combine {}/{} with {}/{}",
                self.query_id, self.level, other.query_id, other.level
            )));
        }
        if self.prefix_bits != other.prefix_bits || self.value_bits != other.value_bits {
            return Err(Error::InvalidResult(format!(
                "shape mismatch: {}/{} bits vs {}/{} bits",
                self.prefix_bits, self.value_bits, other.prefix_bits, other.value_bits
            )));
        }
        if self.entries.len() != other.entries.len()
            || self.prefixes().zip(other.prefixes()).any(|(a, b)| a != b)
        {
            return Err(Error::InvalidResult(format!(
                "results for query {} level {} cover different prefixes",
                self.query_id, self.level
            )));
        }

        let mask = mask(self.value_bits);
        Ok(self
            .entries
            .iter()
            .zip(&other.entries)
            .map(|(a, b)| HistogramEntry {
                prefix: a.prefix,
                value: a.value.wrapping_add(b.value) & mask,
            })
            .collect())
    }
}

/// Prefixes whose combined aggregate reaches `threshold`
///
/// These are the heavy hitters that get refined at the next level.
pub fn select_heavy_prefixes(
    own: &PartialResult,
    partner: &PartialResult,
    threshold: u64,
) -> crate::Result<Vec<u64>> {
    Ok(own
        .combine(partner)?
        .into_iter()
        .filter(|e| e.value >= threshold)
        .map(|e| e.prefix)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(values: &[(u64, u64)]) -> PartialResult {
        PartialResult {
            query_id: "q".into(),
            level: 0,
            prefix_bits: 2,
            value_bits: 8,
            epsilon: 0.5,
            entries: values
                .iter()
                .map(|&(prefix, value)| HistogramEntry { prefix, value })
                .collect(),
        }
    }

    #[test]
    fn test_combine_wraps_at_value_width() {
        let a = result(&[(0, 250), (1, 3)]);
        let b = result(&[(0, 10), (1, 253)]);
        let sums = a.combine(&b).unwrap();
        assert_eq!(sums[0].value, 4);
        assert_eq!(sums[1].value, 0);
    }

    #[test]
    fn test_combine_rejects_different_prefixes() {
        let a = result(&[(0, 1), (1, 1)]);
        let b = result(&[(0, 1), (2, 1)]);
        assert!(matches!(a.combine(&b), Err(Error::InvalidResult(_))));

        let mut c = result(&[(0, 1), (1, 1)]);
        c.level = 1;
        assert!(a.combine(&c).is_err());
    }

    #[test]
    fn test_select_heavy_prefixes() {
        let a = result(&[(0, 5), (1, 200), (2, 7), (3, 0)]);
        let b = result(&[(0, 251), (1, 60), (2, 0), (3, 0)]);
        // combined: 0, 4, 7, 0
        assert_eq!(select_heavy_prefixes(&a, &b, 4).unwrap(), vec![1, 2]);
        assert_eq!(select_heavy_prefixes(&a, &b, 1).unwrap(), vec![1, 2]);
        assert!(select_heavy_prefixes(&a, &b, 8).unwrap().is_empty());
    }

    #[test]
    fn test_bytes_are_deterministic() {
        let a = result(&[(0, 5), (1, 6)]);
        assert_eq!(a.to_bytes().unwrap(), a.clone().to_bytes().unwrap());
        assert_eq!(PartialResult::from_bytes(&a.to_bytes().unwrap()).unwrap(), a);
    }
}
