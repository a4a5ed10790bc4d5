use std::sync::Arc;

use tracing::warn;

use crate::error::{PoolError, Result};
use crate::models::{CheckOutcome, ProxyIdentity};
use crate::repository::ProxyStore;

/// Writes check outcomes back to the store.
///
/// No retries here: a failed write is returned as [`PoolError::StoreWrite`] and
/// the record keeps its previous state until the next successful check.
#[derive(Clone)]
pub struct ResultAggregator {
    store: Arc<dyn ProxyStore>,
}

impl ResultAggregator {
    pub fn new(store: Arc<dyn ProxyStore>) -> Self {
        Self { store }
    }

    pub async fn apply(&self, identity: &ProxyIdentity, outcome: &CheckOutcome) -> Result<()> {
        self.store
            .apply_outcome(identity, outcome)
            .await
            .map_err(|e| {
                warn!(proxy = %identity, error = %e, "Failed to store check outcome");
                PoolError::StoreWrite {
                    identity: identity.to_string(),
                    reason: e.to_string(),
                }
            })
    }
}
