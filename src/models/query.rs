use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use super::{ProtocolTag, ProxyRecord};
use crate::error::{PoolError, Result};

/// Record property a query can be ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Ping,
    LastCheckAt,
    Ratio,
    TotalChecks,
}

impl SortKey {
    pub const ALLOWED: [&'static str; 4] = ["ping", "last_check_at", "ratio", "total_checks"];

    /// Unknown keys are a configuration error, never a silent fallback
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "ping" => Ok(SortKey::Ping),
            "last_check_at" => Ok(SortKey::LastCheckAt),
            "ratio" => Ok(SortKey::Ratio),
            "total_checks" => Ok(SortKey::TotalChecks),
            other => Err(PoolError::InvalidConfig(format!(
                "sort_by must be one of {:?}, got '{}'",
                Self::ALLOWED,
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Ping => "ping",
            SortKey::LastCheckAt => "last_check_at",
            SortKey::Ratio => "ratio",
            SortKey::TotalChecks => "total_checks",
        }
    }

    /// Sort value of a record, `None` when the property is unset
    pub fn value(&self, record: &ProxyRecord) -> Option<f64> {
        match self {
            SortKey::Ping => record.ping,
            SortKey::LastCheckAt => record
                .last_check_at
                .map(|t| t.timestamp_micros() as f64),
            SortKey::Ratio => record.ratio(),
            SortKey::TotalChecks => Some(record.total_checks as f64),
        }
    }
}

/// Filter, sort and limit over the proxy store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyQuery {
    pub active: Option<bool>,
    /// Seconds
    pub max_ping: Option<f64>,
    /// Matches records supporting any of these
    pub protocols: Vec<ProtocolTag>,
    /// Last check must be at or after this instant
    pub checked_since: Option<DateTime<Utc>>,
    pub min_ratio: Option<f64>,
    /// Country name or code, case-insensitive
    pub country: Option<String>,
    /// Only records that were never checked
    pub never_checked: bool,
    /// Only records whose failure streak is below this
    pub max_negative_streak: Option<i64>,
    pub sort_by: Option<SortKey>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl ProxyQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn max_ping(mut self, max_ping: f64) -> Self {
        self.max_ping = Some(max_ping);
        self
    }

    pub fn protocols(mut self, protocols: Vec<ProtocolTag>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Fails when `now - window` falls outside the representable time range
    pub fn checked_within(mut self, now: DateTime<Utc>, window: chrono::Duration) -> Result<Self> {
        let since = now.checked_sub_signed(window).ok_or_else(|| {
            PoolError::InvalidRequest(format!(
                "checked_within of {}s is out of range",
                window.num_seconds()
            ))
        })?;
        self.checked_since = Some(since);
        Ok(self)
    }

    pub fn min_ratio(mut self, ratio: f64) -> Self {
        self.min_ratio = Some(ratio);
        self
    }

    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn never_checked(mut self) -> Self {
        self.never_checked = true;
        self
    }

    pub fn max_negative_streak(mut self, streak: i64) -> Self {
        self.max_negative_streak = Some(streak);
        self
    }

    pub fn sort_by(mut self, key: SortKey) -> Self {
        self.sort_by = Some(key);
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check a record against every filter
    pub fn matches(&self, record: &ProxyRecord) -> bool {
        if let Some(active) = self.active {
            if record.active != Some(active) {
                return false;
            }
        }

        if let Some(max_ping) = self.max_ping {
            match record.ping {
                Some(ping) if ping <= max_ping => {}
                _ => return false,
            }
        }

        if !self.protocols.is_empty()
            && !self
                .protocols
                .iter()
                .any(|p| record.supported_protocols.contains(p))
        {
            return false;
        }

        if let Some(since) = self.checked_since {
            match record.last_check_at {
                Some(checked) if checked >= since => {}
                _ => return false,
            }
        }

        if let Some(min_ratio) = self.min_ratio {
            match record.ratio() {
                Some(ratio) if ratio >= min_ratio => {}
                _ => return false,
            }
        }

        if let Some(ref country) = self.country {
            let wanted = country.to_lowercase();
            let name = record.country.as_deref().map(str::to_lowercase);
            let code = record.country_code.as_deref().map(str::to_lowercase);
            if name.as_deref() != Some(wanted.as_str()) && code.as_deref() != Some(wanted.as_str())
            {
                return false;
            }
        }

        if self.never_checked && record.last_check_at.is_some() {
            return false;
        }

        if let Some(streak) = self.max_negative_streak {
            if record.negative_checks_in_a_row >= streak {
                return false;
            }
        }

        true
    }

    /// Apply filter, sort and limit to an in-memory record set.
    ///
    /// Records without a value for the sort key are dropped. The sort is stable, so
    /// ties keep the input order.
    pub fn run<'a, I>(&self, records: I) -> Vec<ProxyRecord>
    where
        I: IntoIterator<Item = &'a ProxyRecord>,
    {
        let mut matched: Vec<&ProxyRecord> = records
            .into_iter()
            .filter(|record| self.matches(record))
            .collect();

        if let Some(key) = self.sort_by {
            let mut keyed: Vec<(f64, &ProxyRecord)> = matched
                .into_iter()
                .filter_map(|record| key.value(record).map(|v| (v, record)))
                .collect();
            keyed.sort_by(|a, b| {
                let ord = a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal);
                if self.reverse {
                    ord.reverse()
                } else {
                    ord
                }
            });
            matched = keyed.into_iter().map(|(_, record)| record).collect();
        }

        let limit = self.limit.unwrap_or(usize::MAX);
        matched.into_iter().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyIdentity;

    fn record(ip: &str) -> ProxyRecord {
        ProxyRecord::new(&ProxyIdentity::new(ip, 80))
    }

    fn with_ratio(ip: &str, positive: i64, total: i64) -> ProxyRecord {
        let mut r = record(ip);
        r.total_checks = total;
        r.positive_checks = positive;
        r.negative_checks = total - positive;
        r
    }

    #[test]
    fn test_sort_key_parsing() {
        assert_eq!(SortKey::from_str("ping").unwrap(), SortKey::Ping);
        assert_eq!(
            SortKey::from_str("last_check_at").unwrap(),
            SortKey::LastCheckAt
        );
        assert_eq!(SortKey::from_str("ratio").unwrap(), SortKey::Ratio);
        assert_eq!(
            SortKey::from_str("total_checks").unwrap(),
            SortKey::TotalChecks
        );
        assert_eq!(SortKey::TotalChecks.as_str(), "total_checks");
    }

    #[test]
    fn test_unknown_sort_key_is_config_error() {
        let err = SortKey::from_str("country").unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }

    #[test]
    fn test_checked_within_out_of_range() {
        let window = chrono::Duration::try_days(365 * 300_000).unwrap();
        let err = ProxyQuery::new()
            .checked_within(Utc::now(), window)
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidRequest(_)));
    }

    #[test]
    fn test_sort_by_ratio_drops_nulls() {
        let records = vec![
            with_ratio("10.0.0.1", 1, 10),
            with_ratio("10.0.0.2", 2, 10),
            record("10.0.0.3"),
        ];

        let asc = ProxyQuery::new().sort_by(SortKey::Ratio).run(&records);
        let ips: Vec<_> = asc.iter().map(|r| r.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);

        let desc = ProxyQuery::new()
            .sort_by(SortKey::Ratio)
            .reverse(true)
            .run(&records);
        let ips: Vec<_> = desc.iter().map(|r| r.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.2", "10.0.0.1"]);
    }

    #[test]
    fn test_filters() {
        let mut fast = with_ratio("10.0.0.1", 9, 10);
        fast.active = Some(true);
        fast.ping = Some(0.3);
        fast.supported_protocols.insert(ProtocolTag::Socks5);
        fast.country = Some("Germany".to_string());
        fast.country_code = Some("DE".to_string());
        fast.last_check_at = Some(Utc::now());

        let mut slow = with_ratio("10.0.0.2", 1, 10);
        slow.active = Some(false);
        slow.negative_checks_in_a_row = 5;
        slow.last_check_at = Some(Utc::now() - chrono::Duration::hours(2));

        let fresh = record("10.0.0.3");
        let records = vec![fast, slow, fresh];

        let run = |q: ProxyQuery| -> Vec<String> { q.run(&records).into_iter().map(|r| r.ip).collect() };

        assert_eq!(run(ProxyQuery::new().active(true)), vec!["10.0.0.1"]);
        assert_eq!(run(ProxyQuery::new().active(false)), vec!["10.0.0.2"]);
        assert_eq!(run(ProxyQuery::new().max_ping(0.5)), vec!["10.0.0.1"]);
        assert!(run(ProxyQuery::new().max_ping(0.1)).is_empty());
        assert_eq!(
            run(ProxyQuery::new().protocols(vec![ProtocolTag::Http, ProtocolTag::Socks5])),
            vec!["10.0.0.1"]
        );
        assert_eq!(run(ProxyQuery::new().country("de")), vec!["10.0.0.1"]);
        assert_eq!(run(ProxyQuery::new().country("GERMANY")), vec!["10.0.0.1"]);
        assert_eq!(run(ProxyQuery::new().min_ratio(0.5)), vec!["10.0.0.1"]);
        assert_eq!(
            run(ProxyQuery::new()
                .checked_within(Utc::now(), chrono::Duration::minutes(10))
                .unwrap()),
            vec!["10.0.0.1"]
        );
        assert_eq!(run(ProxyQuery::new().never_checked()), vec!["10.0.0.3"]);
        assert_eq!(
            run(ProxyQuery::new().max_negative_streak(5)),
            vec!["10.0.0.1", "10.0.0.3"]
        );
        assert_eq!(run(ProxyQuery::new().limit(1)).len(), 1);
    }
}
