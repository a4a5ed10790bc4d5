use crate::error::Result;
use sqlx::{Executor, PgPool};
use tracing::info;

/// Run all database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    create_migrations_table(pool).await?;

    for (version, name, sql) in get_migrations() {
        if !is_migration_applied(pool, version).await? {
            info!(version = version, name = name, "Applying migration");

            // Simple-query protocol, so one migration may hold several statements
            pool.execute(sql).await?;

            record_migration(pool, version, name).await?;

            info!(version = version, name = name, "Migration applied successfully");
        }
    }

    Ok(())
}

/// Create the migrations tracking table
async fn create_migrations_table(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Check if a migration has been applied
async fn is_migration_applied(pool: &PgPool, version: i32) -> Result<bool> {
    let result = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM schema_migrations WHERE version = $1",
    )
    .bind(version)
    .fetch_one(pool)
    .await?;

    Ok(result > 0)
}

/// Record a migration as applied
async fn record_migration(pool: &PgPool, version: i32, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
        .bind(version)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

/// Get all migrations in order
fn get_migrations() -> Vec<(i32, &'static str, &'static str)> {
    vec![
        (
            1,
            "create_proxies_table",
            r#"
CREATE TABLE IF NOT EXISTS proxies (
    ip TEXT NOT NULL,
    port INTEGER NOT NULL CHECK (port > 0 AND port < 65536),
    active BOOLEAN,
    protocols TEXT[] NOT NULL DEFAULT '{}',
    tunnel_support TEXT[] NOT NULL DEFAULT '{}',
    ping DOUBLE PRECISION,
    last_check_at TIMESTAMPTZ,
    total_checks BIGINT NOT NULL DEFAULT 0,
    positive_checks BIGINT NOT NULL DEFAULT 0,
    negative_checks BIGINT NOT NULL DEFAULT 0,
    negative_checks_in_a_row BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (ip, port),
    CHECK (total_checks = positive_checks + negative_checks)
);

CREATE INDEX IF NOT EXISTS idx_proxies_active_last_check ON proxies(active, last_check_at);
CREATE INDEX IF NOT EXISTS idx_proxies_never_checked ON proxies(created_at) WHERE last_check_at IS NULL;
"#,
        ),
        (
            2,
            "add_proxy_geolocation",
            r#"
ALTER TABLE proxies ADD COLUMN IF NOT EXISTS country TEXT;
ALTER TABLE proxies ADD COLUMN IF NOT EXISTS country_code TEXT;

CREATE INDEX IF NOT EXISTS idx_proxies_country_code ON proxies(lower(country_code));
"#,
        ),
    ]
}
