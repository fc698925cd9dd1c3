//! Prefix files handed to the evaluation work
//!
//! A prefix file lists the heavy prefixes of the previous level. The
//! evaluation work refines each of them to every child at the current
//! level's bit-length. Level 0 has no parents: its file is empty and the
//! whole level-0 domain is evaluated.

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelPrefixes {
    /// Level these prefixes are evaluated for
    pub level: u32,
    /// Bit-length of `parents` (the previous level's prefix length)
    pub parent_bits: u32,
    /// Bit-length of the prefixes evaluated at `level`
    pub prefix_bits: u32,
    /// Sorted heavy prefixes of the previous level
    pub parents: Vec<u64>,
}

impl LevelPrefixes {
    /// Prefix file for level 0: evaluate the full domain
    pub fn root(prefix_bits: u32) -> Self {
        Self {
            level: 0,
            parent_bits: 0,
            prefix_bits,
            parents: Vec::new(),
        }
    }

    pub fn new(level: u32, parent_bits: u32, prefix_bits: u32, mut parents: Vec<u64>) -> crate::Result<Self> {
        if prefix_bits <= parent_bits || prefix_bits > 64 {
            return Err(Error::Config(format!(
                "level {}: prefix bits {} must exceed parent bits {} and be at most 64",
                level, prefix_bits, parent_bits
            )));
        }
        parents.sort_unstable();
        parents.dedup();
        Ok(Self {
            level,
            parent_bits,
            prefix_bits,
            parents,
        })
    }

    pub fn is_root(&self) -> bool {
        self.level == 0
    }

    /// All children of the parents at `prefix_bits`, in ascending order.
    ///
    /// Empty for the root level (the evaluator expands the full domain).
    pub fn expand(&self) -> crate::Result<Vec<u64>> {
        if self.is_root() {
            return Ok(Vec::new());
        }
        let shift = self.prefix_bits - self.parent_bits;
        if shift >= 32 {
            return Err(Error::Config(format!(
                "level {}: refining {} bits at once is not supported",
                self.level, shift
            )));
        }
        let fanout = 1u64 << shift;
        Ok(self
            .parents
            .iter()
            .flat_map(|&parent| (0..fanout).map(move |child| (parent << shift) | child))
            .collect())
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_children() {
        let prefixes = LevelPrefixes::new(1, 1, 3, vec![1, 0, 1]).unwrap();
        assert_eq!(prefixes.parents, vec![0, 1]);
        assert_eq!(prefixes.expand().unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);

        let single = LevelPrefixes::new(2, 3, 4, vec![5]).unwrap();
        assert_eq!(single.expand().unwrap(), vec![10, 11]);
    }

    #[test]
    fn test_root_expands_to_nothing() {
        let root = LevelPrefixes::root(4);
        assert!(root.is_root());
        assert!(root.expand().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_bits() {
        assert!(LevelPrefixes::new(1, 4, 4, vec![]).is_err());
        assert!(LevelPrefixes::new(1, 4, 65, vec![]).is_err());
    }

    #[test]
    fn test_refusing_huge_fanout() {
        let wide = LevelPrefixes::new(1, 8, 48, vec![1]).unwrap();
        assert!(wide.expand().is_err());
    }
}
