use std::collections::BTreeSet;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CheckOutcome;
use crate::error::{PoolError, Result};

/// Relay protocol a proxy can be reached with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolTag {
    Http,
    Socks4,
    Socks5,
}

impl ProtocolTag {
    pub const ALL: [ProtocolTag; 3] = [ProtocolTag::Http, ProtocolTag::Socks4, ProtocolTag::Socks5];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolTag::Http => "http",
            ProtocolTag::Socks4 => "socks4",
            ProtocolTag::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "http" => Some(ProtocolTag::Http),
            "socks4" => Some(ProtocolTag::Socks4),
            "socks5" => Some(ProtocolTag::Socks5),
            _ => None,
        }
    }

    /// Parse a comma-separated protocol list, keeping the given order
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        let mut protocols = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let protocol = Self::from_str(part)
                .ok_or_else(|| PoolError::UnsupportedProtocol(part.to_string()))?;
            if !protocols.contains(&protocol) {
                protocols.push(protocol);
            }
        }
        Ok(protocols)
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ProtocolTag::Socks4 | ProtocolTag::Socks5)
    }
}

impl std::fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unique key of a proxy record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProxyIdentity {
    pub ip: String,
    pub port: u16,
}

impl ProxyIdentity {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Socket address used to dial the proxy itself
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|_| PoolError::InvalidProxyAddress(self.to_string()))
    }

    /// Proxy URL for a given protocol, e.g. `socks5://1.2.3.4:1080`
    pub fn url(&self, protocol: ProtocolTag) -> String {
        format!("{}://{}:{}", protocol, self.ip, self.port)
    }
}

impl std::fmt::Display for ProxyIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Persisted reputation state of one proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub ip: String,
    pub port: u16,
    /// `None` until the first check completes
    pub active: Option<bool>,
    pub supported_protocols: BTreeSet<ProtocolTag>,
    pub tunnel_support: BTreeSet<ProtocolTag>,
    /// Mean round-trip time in seconds over the protocols that answered
    pub ping: Option<f64>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub total_checks: i64,
    pub positive_checks: i64,
    pub negative_checks: i64,
    pub negative_checks_in_a_row: i64,
    pub country: Option<String>,
    pub country_code: Option<String>,
}

impl ProxyRecord {
    /// Fresh, never-checked record
    pub fn new(identity: &ProxyIdentity) -> Self {
        Self {
            ip: identity.ip.clone(),
            port: identity.port,
            active: None,
            supported_protocols: BTreeSet::new(),
            tunnel_support: BTreeSet::new(),
            ping: None,
            last_check_at: None,
            total_checks: 0,
            positive_checks: 0,
            negative_checks: 0,
            negative_checks_in_a_row: 0,
            country: None,
            country_code: None,
        }
    }

    pub fn identity(&self) -> ProxyIdentity {
        ProxyIdentity::new(self.ip.clone(), self.port)
    }

    /// Share of positive checks, `None` before the first check
    pub fn ratio(&self) -> Option<f64> {
        if self.total_checks > 0 {
            Some(self.positive_checks as f64 / self.total_checks as f64)
        } else {
            None
        }
    }

    pub fn is_active(&self) -> bool {
        self.active == Some(true)
    }

    /// Fold a check outcome into the counters.
    ///
    /// Mirrors the single-statement update of the Postgres store; callers must hold
    /// exclusive access to the record for the duration of the call.
    pub fn apply_outcome(&mut self, outcome: &CheckOutcome) {
        self.total_checks += 1;
        self.last_check_at = Some(outcome.checked_at);

        if outcome.active {
            self.positive_checks += 1;
            self.negative_checks_in_a_row = 0;
            self.active = Some(true);
            self.supported_protocols = outcome.supported_protocols.clone();
            self.tunnel_support = outcome.tunnel_support.clone();
            self.ping = outcome.ping;
            if outcome.country.is_some() {
                self.country = outcome.country.clone();
            }
            if outcome.country_code.is_some() {
                self.country_code = outcome.country_code.clone();
            }
        } else {
            self.negative_checks += 1;
            self.negative_checks_in_a_row += 1;
            self.active = Some(false);
            self.supported_protocols.clear();
            self.tunnel_support.clear();
            self.ping = None;
        }
    }

    /// Public view for the serving API; only active plain-HTTP proxies are served
    pub fn served(&self) -> Option<ServedProxy> {
        if !self.is_active() || !self.supported_protocols.contains(&ProtocolTag::Http) {
            return None;
        }

        Some(ServedProxy {
            ip: self.ip.clone(),
            port: self.port,
            last_check_at: self.last_check_at,
            supported_protocols: self.supported_protocols.clone(),
            tunnel_support: self.tunnel_support.clone(),
            ping: self.ping,
        })
    }
}

/// Record with its derived ratio, as returned by the query API
#[derive(Debug, Clone, Serialize)]
pub struct ProxyWithRatio {
    #[serde(flatten)]
    pub record: ProxyRecord,
    pub ratio: Option<f64>,
}

impl From<ProxyRecord> for ProxyWithRatio {
    fn from(record: ProxyRecord) -> Self {
        let ratio = record.ratio();
        ProxyWithRatio { record, ratio }
    }
}

/// Served-data shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServedProxy {
    pub ip: String,
    pub port: u16,
    pub last_check_at: Option<DateTime<Utc>>,
    pub supported_protocols: BTreeSet<ProtocolTag>,
    pub tunnel_support: BTreeSet<ProtocolTag>,
    pub ping: Option<f64>,
}
