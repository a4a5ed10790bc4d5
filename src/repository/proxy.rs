use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};

use super::ProxyStore;
use crate::error::{PoolError, Result};
use crate::models::{CheckOutcome, ProtocolTag, ProxyIdentity, ProxyQuery, ProxyRecord, SortKey};

const SELECT_COLUMNS: &str = r#"
    SELECT ip, port, active, protocols, tunnel_support, ping, last_check_at,
           total_checks, positive_checks, negative_checks, negative_checks_in_a_row,
           country, country_code
    FROM proxies
    WHERE 1=1"#;

/// Repository for proxy database operations
#[derive(Clone)]
pub struct ProxyRepository {
    pool: PgPool,
}

impl ProxyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct ProxyRow {
    ip: String,
    port: i32,
    active: Option<bool>,
    protocols: Vec<String>,
    tunnel_support: Vec<String>,
    ping: Option<f64>,
    last_check_at: Option<DateTime<Utc>>,
    total_checks: i64,
    positive_checks: i64,
    negative_checks: i64,
    negative_checks_in_a_row: i64,
    country: Option<String>,
    country_code: Option<String>,
}

impl ProxyRow {
    fn into_record(self) -> Result<ProxyRecord> {
        let port = u16::try_from(self.port)
            .map_err(|_| PoolError::Internal(format!("stored port out of range: {}", self.port)))?;

        Ok(ProxyRecord {
            ip: self.ip,
            port,
            active: self.active,
            supported_protocols: protocol_set(&self.protocols),
            tunnel_support: protocol_set(&self.tunnel_support),
            ping: self.ping,
            last_check_at: self.last_check_at,
            total_checks: self.total_checks,
            positive_checks: self.positive_checks,
            negative_checks: self.negative_checks,
            negative_checks_in_a_row: self.negative_checks_in_a_row,
            country: self.country,
            country_code: self.country_code,
        })
    }
}

fn protocol_set(tags: &[String]) -> BTreeSet<ProtocolTag> {
    tags.iter()
        .filter_map(|tag| {
            let parsed = ProtocolTag::from_str(tag);
            if parsed.is_none() {
                warn!(tag = %tag, "Ignoring unknown stored protocol tag");
            }
            parsed
        })
        .collect()
}

fn protocol_names(tags: &BTreeSet<ProtocolTag>) -> Vec<String> {
    tags.iter().map(|t| t.as_str().to_string()).collect()
}

/// SQL expression for a sort key; only these fixed strings reach the query text
fn sort_expression(key: SortKey) -> &'static str {
    match key {
        SortKey::Ping => "ping",
        SortKey::LastCheckAt => "last_check_at",
        SortKey::Ratio => "(positive_checks::float8 / NULLIF(total_checks, 0))",
        SortKey::TotalChecks => "total_checks",
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &ProxyQuery) {
    if let Some(active) = query.active {
        builder.push(" AND active = ").push_bind(active);
    }
    if let Some(max_ping) = query.max_ping {
        builder.push(" AND ping <= ").push_bind(max_ping);
    }
    if !query.protocols.is_empty() {
        let names: Vec<String> = query.protocols.iter().map(|p| p.as_str().to_string()).collect();
        builder
            .push(" AND protocols && ")
            .push_bind(names)
            .push("::text[]");
    }
    if let Some(since) = query.checked_since {
        builder.push(" AND last_check_at >= ").push_bind(since);
    }
    if let Some(min_ratio) = query.min_ratio {
        builder
            .push(" AND total_checks > 0 AND positive_checks::float8 / total_checks >= ")
            .push_bind(min_ratio);
    }
    if let Some(ref country) = query.country {
        builder
            .push(" AND (lower(country) = lower(")
            .push_bind(country.clone())
            .push(") OR lower(country_code) = lower(")
            .push_bind(country.clone())
            .push("))");
    }
    if query.never_checked {
        builder.push(" AND last_check_at IS NULL");
    }
    if let Some(streak) = query.max_negative_streak {
        builder
            .push(" AND negative_checks_in_a_row < ")
            .push_bind(streak);
    }
}

fn build_find_query(query: &ProxyQuery) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
    push_filters(&mut builder, query);

    if let Some(key) = query.sort_by {
        let expr = sort_expression(key);
        let direction = if query.reverse { "DESC" } else { "ASC" };
        builder
            .push(" AND ")
            .push(expr)
            .push(" IS NOT NULL ORDER BY ")
            .push(expr)
            .push(" ")
            .push(direction)
            .push(", ip, port");
    } else {
        builder.push(" ORDER BY ip, port");
    }

    if let Some(limit) = query.limit {
        builder
            .push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }

    builder
}

#[async_trait]
impl ProxyStore for ProxyRepository {
    async fn upsert_new(&self, identity: &ProxyIdentity) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO proxies (ip, port)
            VALUES ($1, $2)
            ON CONFLICT (ip, port) DO NOTHING
            "#,
        )
        .bind(&identity.ip)
        .bind(i32::from(identity.port))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// One round trip for the whole batch
    async fn add_candidates(&self, identities: &[ProxyIdentity]) -> Result<usize> {
        if identities.is_empty() {
            return Ok(0);
        }

        let ips: Vec<&str> = identities.iter().map(|i| i.ip.as_str()).collect();
        let ports: Vec<i32> = identities.iter().map(|i| i32::from(i.port)).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO proxies (ip, port)
            SELECT * FROM UNNEST($1::text[], $2::int[])
            ON CONFLICT (ip, port) DO NOTHING
            "#,
        )
        .bind(&ips)
        .bind(&ports)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() as usize;
        debug!(candidates = identities.len(), inserted, "Stored proxy candidates");
        Ok(inserted)
    }

    async fn get(&self, identity: &ProxyIdentity) -> Result<Option<ProxyRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        builder
            .push(" AND ip = ")
            .push_bind(identity.ip.clone())
            .push(" AND port = ")
            .push_bind(i32::from(identity.port));

        let row = builder
            .build_query_as::<ProxyRow>()
            .fetch_optional(&self.pool)
            .await?;

        row.map(ProxyRow::into_record).transpose()
    }

    async fn find(&self, query: &ProxyQuery) -> Result<Vec<ProxyRecord>> {
        let rows = build_find_query(query)
            .build_query_as::<ProxyRow>()
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ProxyRow::into_record).collect()
    }

    async fn count(&self, query: &ProxyQuery) -> Result<u64> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM proxies WHERE 1=1");
        push_filters(&mut builder, query);

        let total: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(total.max(0) as u64)
    }

    /// Single UPDATE; counters are incremented in SQL, never read back first
    async fn apply_outcome(&self, identity: &ProxyIdentity, outcome: &CheckOutcome) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE proxies
            SET
                total_checks = total_checks + 1,
                positive_checks = positive_checks + CASE WHEN $3 THEN 1 ELSE 0 END,
                negative_checks = negative_checks + CASE WHEN $3 THEN 0 ELSE 1 END,
                negative_checks_in_a_row = CASE
                    WHEN $3 THEN 0
                    ELSE negative_checks_in_a_row + 1
                END,
                active = $3,
                protocols = $4,
                tunnel_support = $5,
                ping = $6,
                last_check_at = $7,
                country = CASE WHEN $3 THEN COALESCE($8, country) ELSE country END,
                country_code = CASE WHEN $3 THEN COALESCE($9, country_code) ELSE country_code END
            WHERE ip = $1 AND port = $2
            "#,
        )
        .bind(&identity.ip)
        .bind(i32::from(identity.port))
        .bind(outcome.active)
        .bind(protocol_names(&outcome.supported_protocols))
        .bind(protocol_names(&outcome.tunnel_support))
        .bind(outcome.ping)
        .bind(outcome.checked_at)
        .bind(outcome.country.as_deref())
        .bind(outcome.country_code.as_deref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PoolError::NotFound(format!("proxy {}", identity)));
        }

        Ok(())
    }
}
