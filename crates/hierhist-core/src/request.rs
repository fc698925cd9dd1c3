//! Query-step messages and helper identity documents

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Static identity a helper shares with its partner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperSharedInfo {
    /// Origin identifier of the helper
    pub origin: String,
    /// Base directory holding partner-visible partial results
    pub shared_dir: PathBuf,
}

impl HelperSharedInfo {
    pub fn new(origin: impl Into<String>, shared_dir: impl Into<PathBuf>) -> Self {
        Self {
            origin: origin.into(),
            shared_dir: shared_dir.into(),
        }
    }
}

/// Instruction to advance one query to one level
///
/// Delivered as the JSON payload of a request-channel message. A delivered
/// step is never mutated: advancing builds a new value with
/// [`QueryStep::next_level`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStep {
    pub query_id: String,
    pub level: u32,
    pub partner_shared_info: HelperSharedInfo,
    /// Location of the query's expansion plan
    pub expand_config_uri: PathBuf,
    /// Privacy budget for the whole query
    pub total_epsilon: f64,
    /// Where the final level's result goes (never partner-visible)
    pub result_dir: PathBuf,
    /// This helper's batch of key shares
    pub partial_report_uri: PathBuf,
    /// Point-function parameters the reports were generated against
    pub sum_params_uri: PathBuf,
    /// Prefixes for this level, filled in when the level is resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefixes_uri: Option<PathBuf>,
}

impl QueryStep {
    /// Step for the following level; per-level fields are cleared
    pub fn next_level(&self) -> Self {
        Self {
            level: self.level + 1,
            prefixes_uri: None,
            ..self.clone()
        }
    }

    /// Check fields that later become path components or budgets
    pub fn validate(&self) -> crate::Result<()> {
        if self.query_id.is_empty() {
            return Err(Error::Config("query_id must not be empty".into()));
        }
        if self
            .query_id
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
            || self.query_id.starts_with('.')
        {
            return Err(Error::Config(format!(
                "query_id {:?} may only contain ASCII letters, digits, '-', '_' and '.'",
                self.query_id
            )));
        }
        if !self.total_epsilon.is_finite() || self.total_epsilon <= 0.0 {
            return Err(Error::Config(format!(
                "total_epsilon {} must be positive",
                self.total_epsilon
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
pub(crate) fn sample_step() -> QueryStep {
    QueryStep {
        query_id: "q-1".into(),
        level: 0,
        partner_shared_info: HelperSharedInfo::new("helper-b", "/data/b/shared"),
        expand_config_uri: "/data/plan.json".into(),
        total_epsilon: 1.0,
        result_dir: "/data/a/results".into(),
        partial_report_uri: "/data/a/reports.bin".into(),
        sum_params_uri: "/data/params.bin".into(),
        prefixes_uri: None,
    }
}
