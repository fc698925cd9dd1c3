//! hierhist-core: shared types for two-helper hierarchical histograms
//!
//! Defines the documents that flow between the helpers and their
//! collaborators:
//! - [`QueryStep`]: one "advance query Q to level L" instruction
//! - [`ExpansionPlan`]: per-query prefix lengths, budget weights, thresholds
//! - [`PartialResult`]: one helper's aggregate shares for one level
//! - [`LevelPrefixes`]: the prefixes a level is evaluated over
//! - [`layout`]: where each of these lives on durable storage
//!
//! # Threat Model
//!
//! - Two non-colluding, honest-but-curious helpers
//! - Each helper sees only its own key shares and the partner's non-final
//!   partial results (shares of coarse-level aggregates)
//! - Final-level results go to the result directory only; the partner
//!   never sees them

pub mod layout;
mod error;
mod plan;
mod prefixes;
mod request;
mod result;

pub use error::Error;
pub use plan::{ExpansionPlan, DEFAULT_EXPANSION_THRESHOLD};
pub use prefixes::LevelPrefixes;
pub use request::{HelperSharedInfo, QueryStep};
pub use result::{select_heavy_prefixes, HistogramEntry, PartialResult};

pub type Result<T> = std::result::Result<T, Error>;

/// Binary blob formats shared by reports and contexts
pub mod batch {
    use serde::{Deserialize, Serialize};

    /// Ordered collection of opaque blobs (key shares or contexts)
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BlobBatch {
        pub blobs: Vec<Vec<u8>>,
    }

    impl BlobBatch {
        pub fn new(blobs: Vec<Vec<u8>>) -> Self {
            Self { blobs }
        }

        pub fn len(&self) -> usize {
            self.blobs.len()
        }

        pub fn is_empty(&self) -> bool {
            self.blobs.is_empty()
        }

        pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
            Ok(bincode::serialize(self)?)
        }

        pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
            Ok(bincode::deserialize(data)?)
        }
    }
}
