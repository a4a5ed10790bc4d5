//! Proxy list handlers

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::server::AppState;
use crate::error::{PoolError, Result};
use crate::models::{ProtocolTag, ProxyQuery, ProxyWithRatio, ServedProxy, SortKey};

/// Query parameters of `GET /api/proxies`
#[derive(Debug, Deserialize, Default)]
pub struct ListProxiesQuery {
    pub active: Option<bool>,
    /// Seconds
    pub max_ping: Option<f64>,
    /// Comma-separated, matches any
    pub protocols: Option<String>,
    /// Seconds since the last check
    pub checked_within: Option<i64>,
    pub min_ratio: Option<f64>,
    pub country: Option<String>,
    pub sort_by: Option<String>,
    pub reverse: Option<bool>,
    pub limit: Option<usize>,
}

impl ListProxiesQuery {
    pub fn into_query(self, now: DateTime<Utc>) -> Result<ProxyQuery> {
        let mut query = ProxyQuery::new().reverse(self.reverse.unwrap_or(false));

        if let Some(active) = self.active {
            query = query.active(active);
        }
        if let Some(max_ping) = self.max_ping {
            query = query.max_ping(max_ping);
        }
        if let Some(ref raw) = self.protocols {
            let protocols = ProtocolTag::parse_list(raw)
                .map_err(|e| PoolError::InvalidRequest(format!("protocols: {}", e)))?;
            query = query.protocols(protocols);
        }
        if let Some(secs) = self.checked_within {
            if secs < 0 {
                return Err(PoolError::InvalidRequest(
                    "checked_within must not be negative".into(),
                ));
            }
            let window = chrono::Duration::try_seconds(secs).ok_or_else(|| {
                PoolError::InvalidRequest(format!("checked_within of {}s is out of range", secs))
            })?;
            query = query.checked_within(now, window)?;
        }
        if let Some(min_ratio) = self.min_ratio {
            query = query.min_ratio(min_ratio);
        }
        if let Some(country) = self.country.filter(|c| !c.trim().is_empty()) {
            query = query.country(country.trim());
        }
        if let Some(ref key) = self.sort_by {
            query = query.sort_by(SortKey::from_str(key)?);
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }

        Ok(query)
    }
}

/// The served list: active proxies that relay plain HTTP
pub async fn served_proxies(State(state): State<AppState>) -> Result<Json<Vec<ServedProxy>>> {
    let query = ProxyQuery::new()
        .active(true)
        .protocols(vec![ProtocolTag::Http]);

    let served = state
        .store
        .find(&query)
        .await?
        .iter()
        .filter_map(|record| record.served())
        .collect();

    Ok(Json(served))
}

/// Full store query, each record with its ratio
pub async fn list_proxies(
    State(state): State<AppState>,
    Query(params): Query<ListProxiesQuery>,
) -> Result<impl IntoResponse> {
    let query = params.into_query(Utc::now())?;
    let records: Vec<ProxyWithRatio> = state
        .store
        .find(&query)
        .await?
        .into_iter()
        .map(ProxyWithRatio::from)
        .collect();

    Ok(Json(records))
}
