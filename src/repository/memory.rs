//! In-process proxy store
//!
//! Keeps every record in a map behind a lock. Used when no database is
//! configured and as the store in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::ProxyStore;
use crate::error::{PoolError, Result};
use crate::models::{CheckOutcome, ProxyIdentity, ProxyQuery, ProxyRecord};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<ProxyIdentity, ProxyRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a full record
    pub fn insert(&self, record: ProxyRecord) {
        self.records.write().insert(record.identity(), record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ProxyStore for MemoryStore {
    async fn upsert_new(&self, identity: &ProxyIdentity) -> Result<bool> {
        let mut records = self.records.write();
        if records.contains_key(identity) {
            return Ok(false);
        }
        records.insert(identity.clone(), ProxyRecord::new(identity));
        Ok(true)
    }

    async fn get(&self, identity: &ProxyIdentity) -> Result<Option<ProxyRecord>> {
        Ok(self.records.read().get(identity).cloned())
    }

    async fn find(&self, query: &ProxyQuery) -> Result<Vec<ProxyRecord>> {
        Ok(query.run(self.records.read().values()))
    }

    async fn count(&self, query: &ProxyQuery) -> Result<u64> {
        let records = self.records.read();
        Ok(records.values().filter(|r| query.matches(r)).count() as u64)
    }

    async fn apply_outcome(&self, identity: &ProxyIdentity, outcome: &CheckOutcome) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(identity)
            .ok_or_else(|| PoolError::NotFound(format!("proxy {}", identity)))?;
        record.apply_outcome(outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProtocolResult, ProtocolTag, SortKey};
    use chrono::Utc;

    fn id(ip: &str) -> ProxyIdentity {
        ProxyIdentity::new(ip, 3128)
    }

    fn success() -> CheckOutcome {
        CheckOutcome::from_results(
            vec![ProtocolResult {
                protocol: ProtocolTag::Http,
                ping: 0.25,
                tunnel: false,
                geo: None,
            }],
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_upsert_new_is_idempotent() {
        let store = MemoryStore::new();
        assert!(store.upsert_new(&id("10.0.0.1")).await.unwrap());
        assert!(!store.upsert_new(&id("10.0.0.1")).await.unwrap());
        assert_eq!(store.len(), 1);

        let added = store
            .add_candidates(&[id("10.0.0.1"), id("10.0.0.2"), id("10.0.0.3")])
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_upsert_keeps_existing_state() {
        let store = MemoryStore::new();
        store.upsert_new(&id("10.0.0.1")).await.unwrap();
        store.apply_outcome(&id("10.0.0.1"), &success()).await.unwrap();

        store.upsert_new(&id("10.0.0.1")).await.unwrap();
        let record = store.get(&id("10.0.0.1")).await.unwrap().unwrap();
        assert_eq!(record.total_checks, 1);
        assert!(record.is_active());
    }

    #[tokio::test]
    async fn test_apply_outcome_to_missing_record() {
        let store = MemoryStore::new();
        let err = store
            .apply_outcome(&id("10.0.0.9"), &success())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_outcomes_are_not_lost() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store.upsert_new(&id("10.0.0.1")).await.unwrap();

        let failure = CheckOutcome::from_results(Vec::new(), Utc::now());
        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let store = store.clone();
                let outcome = if i % 2 == 0 { success() } else { failure.clone() };
                tokio::spawn(async move {
                    store.apply_outcome(&id("10.0.0.1"), &outcome).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let record = store.get(&id("10.0.0.1")).await.unwrap().unwrap();
        assert_eq!(record.total_checks, 50);
        assert_eq!(record.positive_checks, 25);
        assert_eq!(record.negative_checks, 25);
    }

    #[tokio::test]
    async fn test_find_and_count() {
        let store = MemoryStore::new();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            store.upsert_new(&id(ip)).await.unwrap();
        }
        store.apply_outcome(&id("10.0.0.2"), &success()).await.unwrap();

        let active = store
            .find(&ProxyQuery::new().active(true).sort_by(SortKey::Ping))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].ip, "10.0.0.2");

        let unchecked = ProxyQuery::new().never_checked().limit(1);
        assert_eq!(store.find(&unchecked).await.unwrap().len(), 1);
        assert_eq!(store.count(&unchecked).await.unwrap(), 2);
    }
}
