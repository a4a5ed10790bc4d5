use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ProtocolTag;

/// Location details reported by an IP lookup service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub external_ip: Option<String>,
}

/// Result of probing one proxy with one protocol
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success {
        ping: Duration,
        geo: Option<GeoInfo>,
    },
    Failure {
        last_error: String,
    },
}

impl ProbeOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        ProbeOutcome::Failure {
            last_error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success { .. })
    }
}

/// One protocol that answered during a check
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolResult {
    pub protocol: ProtocolTag,
    /// Seconds
    pub ping: f64,
    pub tunnel: bool,
    pub geo: Option<GeoInfo>,
}

/// Folded result of checking every configured protocol of one proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub active: bool,
    pub supported_protocols: BTreeSet<ProtocolTag>,
    pub tunnel_support: BTreeSet<ProtocolTag>,
    pub ping: Option<f64>,
    pub checked_at: DateTime<Utc>,
    pub country: Option<String>,
    pub country_code: Option<String>,
}

impl CheckOutcome {
    /// Build an outcome from the protocols that succeeded.
    ///
    /// An empty list is the ordinary "dead proxy" outcome.
    pub fn from_results(results: Vec<ProtocolResult>, checked_at: DateTime<Utc>) -> Self {
        let mut supported_protocols = BTreeSet::new();
        let mut tunnel_support = BTreeSet::new();
        let mut country = None;
        let mut country_code = None;
        let mut ping_sum = 0.0;

        for result in &results {
            supported_protocols.insert(result.protocol);
            if result.tunnel {
                tunnel_support.insert(result.protocol);
            }
            ping_sum += result.ping;

            if let Some(geo) = &result.geo {
                if country.is_none() {
                    country = geo.country.clone();
                }
                if country_code.is_none() {
                    country_code = geo.country_code.clone();
                }
            }
        }

        let ping = if results.is_empty() {
            None
        } else {
            Some(ping_sum / results.len() as f64)
        };

        Self {
            active: !supported_protocols.is_empty(),
            supported_protocols,
            tunnel_support,
            ping,
            checked_at,
            country,
            country_code,
        }
    }

    pub fn is_tunnel_capable(&self) -> bool {
        !self.tunnel_support.is_empty()
    }
}
