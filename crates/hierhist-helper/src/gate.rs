//! Dependency gate: the only synchronization signal between helpers
//!
//! Level L of a query may start once the partner's partial result for
//! level L-1 exists in the partner's shared directory. The gate performs a
//! single existence read per delivery and never waits or retries; a missing
//! result is reported back so the channel can redeliver later.

use std::sync::Arc;

use hierhist_core::{layout, QueryStep};

use crate::error::Result;
use crate::store::BlobStore;

#[derive(Clone)]
pub struct DependencyGate {
    store: Arc<dyn BlobStore>,
}

impl DependencyGate {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// True when `step` may proceed. Level 0 has no dependency.
    pub async fn partner_ready(&self, step: &QueryStep) -> Result<bool> {
        if step.level == 0 {
            return Ok(true);
        }
        let location = layout::partial_result_path(
            &step.partner_shared_info.shared_dir,
            &step.query_id,
            step.level - 1,
        );
        let ready = self.store.exists(&location).await?;
        tracing::debug!(
            query_id = %step.query_id,
            level = step.level,
            partner = %step.partner_shared_info.origin,
            path = %location.display(),
            ready,
            "Checked partner dependency"
        );
        Ok(ready)
    }
}
