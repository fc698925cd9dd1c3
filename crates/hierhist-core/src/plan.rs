//! Per-query expansion plan
//!
//! The plan fixes, for every level of a hierarchical query, how many prefix
//! bits are revealed, which fraction of the total privacy budget the level
//! spends, and the threshold a prefix's aggregate must reach to be refined
//! at the next level.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Tolerance when checking that weights sum to at most 1
const BUDGET_TOLERANCE: f64 = 1e-9;

/// Threshold used when the plan does not specify one
pub const DEFAULT_EXPANSION_THRESHOLD: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionPlan {
    /// Prefix bit-length per level, strictly increasing
    pub prefix_lengths: Vec<u32>,
    /// Fraction of the total privacy budget spent per level
    pub privacy_budget_per_prefix: Vec<f64>,
    /// Minimum combined aggregate for a prefix to be expanded at the next level
    #[serde(default)]
    pub expansion_threshold_per_prefix: Vec<u64>,
}

impl ExpansionPlan {
    pub fn new(prefix_lengths: Vec<u32>, privacy_budget_per_prefix: Vec<f64>) -> Self {
        Self {
            prefix_lengths,
            privacy_budget_per_prefix,
            expansion_threshold_per_prefix: Vec::new(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: Vec<u64>) -> Self {
        self.expansion_threshold_per_prefix = thresholds;
        self
    }

    pub fn num_levels(&self) -> usize {
        self.prefix_lengths.len()
    }

    /// Index of the last level
    pub fn final_level(&self) -> u32 {
        self.prefix_lengths.len().saturating_sub(1) as u32
    }

    pub fn is_final(&self, level: u32) -> bool {
        level == self.final_level()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.prefix_lengths.is_empty() {
            return Err(Error::Config("expansion plan has no levels".into()));
        }
        if self.privacy_budget_per_prefix.len() != self.prefix_lengths.len() {
            return Err(Error::Config(format!(
                "expansion plan has {} prefix lengths but {} budget weights",
                self.prefix_lengths.len(),
                self.privacy_budget_per_prefix.len()
            )));
        }
        if !self.expansion_threshold_per_prefix.is_empty()
            && self.expansion_threshold_per_prefix.len() != self.prefix_lengths.len()
        {
            return Err(Error::Config(format!(
                "expansion plan has {} prefix lengths but {} thresholds",
                self.prefix_lengths.len(),
                self.expansion_threshold_per_prefix.len()
            )));
        }
        for w in self.prefix_lengths.windows(2) {
            if w[1] <= w[0] {
                return Err(Error::Config(format!(
                    "prefix lengths must be strictly increasing, got {} then {}",
                    w[0], w[1]
                )));
            }
        }
        if let Some(&last) = self.prefix_lengths.last() {
            if last > 64 {
                return Err(Error::Config(format!("prefix length {} exceeds 64", last)));
            }
        }
        for (level, &weight) in self.privacy_budget_per_prefix.iter().enumerate() {
            if !weight.is_finite() || weight <= 0.0 || weight > 1.0 {
                return Err(Error::Config(format!(
                    "level {}: budget weight {} must be in (0, 1]",
                    level, weight
                )));
            }
        }
        let total: f64 = self.privacy_budget_per_prefix.iter().sum();
        if total > 1.0 + BUDGET_TOLERANCE {
            return Err(Error::Config(format!(
                "budget weights sum to {}, which exceeds 1",
                total
            )));
        }
        Ok(())
    }

    fn check_level(&self, level: u32) -> crate::Result<usize> {
        let index = level as usize;
        if index >= self.prefix_lengths.len() {
            return Err(Error::LevelOutOfRange {
                level,
                levels: self.prefix_lengths.len(),
            });
        }
        Ok(index)
    }

    /// Prefix bit-length at `level`
    pub fn prefix_bits(&self, level: u32) -> crate::Result<u32> {
        Ok(self.prefix_lengths[self.check_level(level)?])
    }

    /// Privacy budget spent at `level`
    pub fn epsilon_for(&self, total_epsilon: f64, level: u32) -> crate::Result<f64> {
        Ok(total_epsilon * self.privacy_budget_per_prefix[self.check_level(level)?])
    }

    /// Threshold applied to `level`'s combined result when choosing what to refine
    pub fn threshold(&self, level: u32) -> crate::Result<u64> {
        let index = self.check_level(level)?;
        Ok(self
            .expansion_threshold_per_prefix
            .get(index)
            .copied()
            .unwrap_or(DEFAULT_EXPANSION_THRESHOLD))
    }

    pub fn from_json(data: &[u8]) -> crate::Result<Self> {
        let plan: ExpansionPlan = serde_json::from_slice(data)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Load and validate a plan from a JSON file
    pub fn load(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn save(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        std::fs::write(path.as_ref(), self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epsilon_split() {
        let plan = ExpansionPlan::new(vec![1, 8], vec![0.5, 0.5]);
        plan.validate().unwrap();
        assert_eq!(plan.final_level(), 1);
        assert_eq!(plan.epsilon_for(1.0, 0).unwrap(), 0.5);
        assert_eq!(plan.epsilon_for(1.0, 1).unwrap(), 0.5);
        assert!(matches!(
            plan.epsilon_for(1.0, 2),
            Err(Error::LevelOutOfRange { level: 2, levels: 2 })
        ));
    }

    #[test]
    fn test_default_threshold() {
        let plan = ExpansionPlan::new(vec![2, 4], vec![0.5, 0.5]);
        assert_eq!(plan.threshold(0).unwrap(), DEFAULT_EXPANSION_THRESHOLD);

        let plan = plan.with_thresholds(vec![10, 20]);
        assert_eq!(plan.threshold(1).unwrap(), 20);
    }

    #[test]
    fn test_rejects_mismatched_lengths() {
        let plan = ExpansionPlan::new(vec![1, 8], vec![1.0]);
        assert!(matches!(plan.validate(), Err(Error::Config(_))));

        let plan = ExpansionPlan::new(vec![1, 8], vec![0.5, 0.5]).with_thresholds(vec![1]);
        assert!(matches!(plan.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_bad_budget() {
        assert!(ExpansionPlan::new(vec![1, 8], vec![0.7, 0.7]).validate().is_err());
        assert!(ExpansionPlan::new(vec![1, 8], vec![0.0, 0.5]).validate().is_err());
        assert!(ExpansionPlan::new(vec![1, 8], vec![f64::NAN, 0.5]).validate().is_err());
    }

    #[test]
    fn test_rejects_non_increasing_prefixes() {
        assert!(ExpansionPlan::new(vec![8, 8], vec![0.5, 0.5]).validate().is_err());
        assert!(ExpansionPlan::new(vec![], vec![]).validate().is_err());
        assert!(ExpansionPlan::new(vec![65], vec![1.0]).validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_without_thresholds() {
        let json = br#"{"prefix_lengths":[1,8],"privacy_budget_per_prefix":[0.5,0.5]}"#;
        let plan = ExpansionPlan::from_json(json).unwrap();
        assert!(plan.expansion_threshold_per_prefix.is_empty());
        assert_eq!(ExpansionPlan::from_json(&plan.to_json().unwrap()).unwrap(), plan);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ExpansionPlan::load(dir.path().join("missing.json")),
            Err(Error::Io(_))
        ));
    }
}
