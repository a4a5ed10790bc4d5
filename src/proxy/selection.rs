//! Which records to re-check in a cycle
//!
//! Three tiers, in priority order:
//! 1. active proxies, stalest first
//! 2. never-checked candidates
//! 3. dead proxies still under the failure-streak limit, least-checked first
//!
//! Every tier has its own cap and all tiers share the total cap.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::models::{ProxyIdentity, ProxyQuery, SortKey};
use crate::repository::ProxyStore;

/// Per-tier selection caps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionLimits {
    pub total_max: usize,
    pub active_max: usize,
    pub new_max: usize,
    /// `None` disables the stale-dead tier
    pub stale_max: Option<usize>,
    pub max_negative_streak: i64,
}

/// Records chosen for one cycle, split by tier
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub active: Vec<ProxyIdentity>,
    pub new: Vec<ProxyIdentity>,
    pub stale: Vec<ProxyIdentity>,
}

impl Selection {
    pub fn len(&self) -> usize {
        self.active.len() + self.new.len() + self.stale.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tiers concatenated in priority order
    pub fn into_ordered(self) -> Vec<ProxyIdentity> {
        let mut ordered = self.active;
        ordered.extend(self.new);
        ordered.extend(self.stale);
        ordered
    }
}

pub struct SelectionPolicy {
    store: Arc<dyn ProxyStore>,
    limits: SelectionLimits,
}

impl SelectionPolicy {
    pub fn new(store: Arc<dyn ProxyStore>, limits: SelectionLimits) -> Self {
        Self { store, limits }
    }

    /// Pick this cycle's records. No identity appears twice.
    pub async fn select(&self) -> Result<Selection> {
        let limits = &self.limits;
        let mut seen = HashSet::new();
        let mut selection = Selection::default();

        let active_cap = limits.active_max.min(limits.total_max);
        if active_cap > 0 {
            let query = ProxyQuery::new()
                .active(true)
                .sort_by(SortKey::LastCheckAt)
                .limit(active_cap);
            selection.active = self.take(&query, active_cap, &mut seen).await?;
        }

        let new_cap = limits.new_max.min(limits.total_max.saturating_sub(selection.len()));
        if new_cap > 0 {
            let query = ProxyQuery::new().never_checked().limit(new_cap);
            selection.new = self.take(&query, new_cap, &mut seen).await?;
        }

        if let Some(stale_max) = limits.stale_max {
            let stale_cap = stale_max.min(limits.total_max.saturating_sub(selection.len()));
            if stale_cap > 0 {
                let query = ProxyQuery::new()
                    .active(false)
                    .max_negative_streak(limits.max_negative_streak)
                    .sort_by(SortKey::TotalChecks)
                    .limit(stale_cap);
                selection.stale = self.take(&query, stale_cap, &mut seen).await?;
            }
        }

        debug!(
            active = selection.active.len(),
            new = selection.new.len(),
            stale = selection.stale.len(),
            "Selected proxies for checking"
        );

        Ok(selection)
    }

    async fn take(
        &self,
        query: &ProxyQuery,
        cap: usize,
        seen: &mut HashSet<ProxyIdentity>,
    ) -> Result<Vec<ProxyIdentity>> {
        let records = self.store.find(query).await?;
        Ok(records
            .into_iter()
            .map(|record| record.identity())
            .filter(|identity| seen.insert(identity.clone()))
            .take(cap)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyRecord;
    use crate::repository::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn limits() -> SelectionLimits {
        SelectionLimits {
            total_max: 100,
            active_max: 100,
            new_max: 100,
            stale_max: Some(100),
            max_negative_streak: 3,
        }
    }

    fn active(ip: &str, checked_at_secs: i64) -> ProxyRecord {
        let mut record = ProxyRecord::new(&ProxyIdentity::new(ip, 80));
        record.active = Some(true);
        record.last_check_at = Some(Utc.timestamp_opt(checked_at_secs, 0).unwrap());
        record.total_checks = 1;
        record.positive_checks = 1;
        record
    }

    fn fresh(ip: &str) -> ProxyRecord {
        ProxyRecord::new(&ProxyIdentity::new(ip, 80))
    }

    fn dead(ip: &str, total_checks: i64, streak: i64) -> ProxyRecord {
        let mut record = ProxyRecord::new(&ProxyIdentity::new(ip, 80));
        record.active = Some(false);
        record.last_check_at = Some(Utc::now());
        record.total_checks = total_checks;
        record.negative_checks = total_checks;
        record.negative_checks_in_a_row = streak;
        record
    }

    fn policy(records: Vec<ProxyRecord>, limits: SelectionLimits) -> SelectionPolicy {
        let store = MemoryStore::new();
        for record in records {
            store.insert(record);
        }
        SelectionPolicy::new(Arc::new(store), limits)
    }

    fn ips(ids: &[ProxyIdentity]) -> Vec<&str> {
        ids.iter().map(|id| id.ip.as_str()).collect()
    }

    #[tokio::test]
    async fn test_oldest_active_first() {
        let policy = policy(
            vec![active("10.0.0.1", 10), active("10.0.0.2", 5)],
            SelectionLimits {
                active_max: 1,
                ..limits()
            },
        );

        let selection = policy.select().await.unwrap();
        assert_eq!(ips(&selection.active), vec!["10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_tiers_in_priority_order() {
        let policy = policy(
            vec![
                dead("10.0.0.1", 4, 1),
                fresh("10.0.0.2"),
                active("10.0.0.3", 50),
                active("10.0.0.4", 20),
                dead("10.0.0.5", 2, 2),
            ],
            limits(),
        );

        let ordered = policy.select().await.unwrap().into_ordered();
        assert_eq!(
            ips(&ordered),
            vec!["10.0.0.4", "10.0.0.3", "10.0.0.2", "10.0.0.5", "10.0.0.1"]
        );
    }

    #[tokio::test]
    async fn test_total_cap_shared_across_tiers() {
        let records = (0..5)
            .map(|i| active(&format!("10.0.1.{}", i), i))
            .chain((0..5).map(|i| fresh(&format!("10.0.2.{}", i))))
            .chain((0..5).map(|i| dead(&format!("10.0.3.{}", i), i, 0)))
            .collect();
        let policy = policy(
            records,
            SelectionLimits {
                total_max: 7,
                active_max: 4,
                new_max: 2,
                stale_max: Some(5),
                max_negative_streak: 3,
            },
        );

        let selection = policy.select().await.unwrap();
        assert_eq!(selection.active.len(), 4);
        assert_eq!(selection.new.len(), 2);
        assert_eq!(selection.stale.len(), 1);
        assert_eq!(selection.len(), 7);
    }

    #[tokio::test]
    async fn test_active_cap_bounded_by_total() {
        let records = (0..10).map(|i| active(&format!("10.0.0.{}", i), i)).collect();
        let policy = policy(
            records,
            SelectionLimits {
                total_max: 3,
                active_max: 8,
                ..limits()
            },
        );

        let selection = policy.select().await.unwrap();
        assert_eq!(selection.len(), 3);
        assert!(selection.new.is_empty());
    }

    #[tokio::test]
    async fn test_streak_limit_retires_dead_proxies() {
        let policy = policy(
            vec![dead("10.0.0.1", 10, 3), dead("10.0.0.2", 10, 2)],
            limits(),
        );

        let selection = policy.select().await.unwrap();
        assert_eq!(ips(&selection.stale), vec!["10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_stale_tier_can_be_disabled() {
        let policy = policy(
            vec![dead("10.0.0.1", 1, 0), fresh("10.0.0.2")],
            SelectionLimits {
                stale_max: None,
                ..limits()
            },
        );

        let selection = policy.select().await.unwrap();
        assert!(selection.stale.is_empty());
        assert_eq!(ips(&selection.new), vec!["10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_empty_store() {
        let selection = policy(Vec::new(), limits()).select().await.unwrap();
        assert!(selection.is_empty());
    }
}
