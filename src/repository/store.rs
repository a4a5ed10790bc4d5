use async_trait::async_trait;

use crate::error::Result;
use crate::models::{CheckOutcome, ProxyIdentity, ProxyQuery, ProxyRecord};

/// Persistent home of proxy records.
///
/// Implementations own all record state. `apply_outcome` must fold the outcome
/// into the record as one atomic step, with no read-modify-write window visible
/// to other writers.
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Insert a fresh record, returning `false` when the identity already exists
    async fn upsert_new(&self, identity: &ProxyIdentity) -> Result<bool>;

    /// Insert many candidates, returning how many were new
    async fn add_candidates(&self, identities: &[ProxyIdentity]) -> Result<usize> {
        let mut inserted = 0;
        for identity in identities {
            if self.upsert_new(identity).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get(&self, identity: &ProxyIdentity) -> Result<Option<ProxyRecord>>;

    async fn find(&self, query: &ProxyQuery) -> Result<Vec<ProxyRecord>>;

    /// Number of records matching the query filters; sort and limit are ignored
    async fn count(&self, query: &ProxyQuery) -> Result<u64> {
        let mut unbounded = query.clone();
        unbounded.sort_by = None;
        unbounded.limit = None;
        Ok(self.find(&unbounded).await?.len() as u64)
    }

    /// Fold a check outcome into the record's counters
    async fn apply_outcome(&self, identity: &ProxyIdentity, outcome: &CheckOutcome) -> Result<()>;
}
