use crate::quota::store::QuotaStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Postgres-backed quota counters, shared by every process pointed at the same database.
#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await
            .context("connecting to quota database")?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    pub async fn init(&self) -> Result<()> {
        // One row per UTC day; a new day simply has no row yet
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_usage (
                day TEXT PRIMARY KEY,
                used BIGINT NOT NULL CHECK (used >= 0),
                updated_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database tables initialized (Postgres): quota_usage");
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for Database {
    async fn reserve_if_available(&self, day: &str, amount: u64, budget: u64) -> Result<bool> {
        let start = std::time::Instant::now();
        let amount = i64::try_from(amount).context("reservation amount out of range")?;
        let budget = i64::try_from(budget).context("daily budget out of range")?;

        // Check and commit in one statement: the conflict branch only fires when the
        // post-increment value still fits, and the row lock serializes concurrent callers.
        let res = sqlx::query(
            r#"
            INSERT INTO quota_usage (day, used)
            SELECT $1, $2 WHERE $2 <= $3
            ON CONFLICT (day) DO UPDATE SET
                used = quota_usage.used + EXCLUDED.used,
                updated_at = CURRENT_TIMESTAMP
            WHERE quota_usage.used + EXCLUDED.used <= $3
            RETURNING used
            "#,
        )
        .bind(day)
        .bind(amount)
        .bind(budget)
        .fetch_optional(&self.pool)
        .await;

        match &res {
            Ok(_) => {
                metrics::counter!("database_queries_total", "table" => "quota_usage", "op" => "reserve", "status" => "success").increment(1);
            }
            Err(_) => {
                metrics::counter!("database_queries_total", "table" => "quota_usage", "op" => "reserve", "status" => "error").increment(1);
            }
        }
        metrics::histogram!("database_query_duration_seconds", "table" => "quota_usage", "op" => "reserve").record(start.elapsed().as_secs_f64());

        Ok(res?.is_some())
    }

    async fn usage(&self, day: &str) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT used FROM quota_usage WHERE day = $1
            "#,
        )
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        let used: i64 = match row {
            Some(r) => r.get("used"),
            None => 0,
        };
        Ok(u64::try_from(used).unwrap_or(0))
    }
}
