use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;

/// Bounded retry budget for a transactional unit of work.
pub const MAX_TRANSIENT_RETRIES: u32 = 5;
const RETRY_BASE_DELAY_MS: u64 = 200;

pub fn connect_lazy(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .with_context(|| format!("Failed to create lazy database pool for {database_url}"))
}

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS statistics_meta (
        id BIGSERIAL PRIMARY KEY,
        series_id TEXT NOT NULL UNIQUE,
        source TEXT NOT NULL,
        unit TEXT,
        has_mean BOOLEAN NOT NULL DEFAULT FALSE,
        has_sum BOOLEAN NOT NULL DEFAULT FALSE,
        display_name TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS statistics (
        id BIGSERIAL PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        metadata_id BIGINT NOT NULL REFERENCES statistics_meta(id) ON DELETE CASCADE,
        start TIMESTAMPTZ NOT NULL,
        mean DOUBLE PRECISION,
        min DOUBLE PRECISION,
        max DOUBLE PRECISION,
        last_reset TIMESTAMPTZ,
        state DOUBLE PRECISION,
        sum DOUBLE PRECISION
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_statistics_metadata_id_start
        ON statistics (metadata_id, start)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS statistics_short_term (
        id BIGSERIAL PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        metadata_id BIGINT NOT NULL REFERENCES statistics_meta(id) ON DELETE CASCADE,
        start TIMESTAMPTZ NOT NULL,
        mean DOUBLE PRECISION,
        min DOUBLE PRECISION,
        max DOUBLE PRECISION,
        last_reset TIMESTAMPTZ,
        state DOUBLE PRECISION,
        sum DOUBLE PRECISION
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_statistics_short_term_metadata_id_start
        ON statistics_short_term (metadata_id, start)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS statistics_runs (
        start TIMESTAMPTZ PRIMARY KEY
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS samples (
        id BIGSERIAL PRIMARY KEY,
        series_id TEXT NOT NULL,
        ts TIMESTAMPTZ NOT NULL,
        value DOUBLE PRECISION NOT NULL,
        kind TEXT NOT NULL DEFAULT 'measurement',
        unit TEXT,
        display_name TEXT
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_samples_series_id_ts
        ON samples (series_id, ts)
    "#,
];

/// Create the recorder tables when they do not exist yet. Every statement is
/// idempotent, so concurrent starts against the same database are safe.
pub async fn ensure_schema(db: &PgPool) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement)
            .execute(db)
            .await
            .context("failed to ensure recorder schema")?;
    }
    Ok(())
}

/// Return true when the error is a transient store failure worth retrying:
/// pool/socket trouble, lock conflicts, serialization failures, statement
/// timeouts. Integrity violations are deliberately not transient.
pub fn is_transient_db_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        let Some(db_err) = cause.downcast_ref::<sqlx::Error>() else {
            continue;
        };
        match db_err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => return true,
            sqlx::Error::Database(db) => {
                if matches!(
                    db.code().as_deref(),
                    Some("40001") | Some("40P01") | Some("55P03") | Some("57014")
                ) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

/// Run a transactional unit of work, retrying the whole closure on transient
/// store failures with backoff. Non-transient errors propagate immediately;
/// exhausting the budget surfaces the last error.
pub async fn retry_transient<T, F, Fut>(label: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient_db_error(&err) && attempt < MAX_TRANSIENT_RETRIES => {
                attempt += 1;
                let delay = Duration::from_millis(RETRY_BASE_DELAY_MS * u64::from(attempt));
                tracing::warn!(
                    job = label,
                    attempt,
                    error = %err,
                    "transient database error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return Err(err.context(format!("{label} failed after {attempt} retries")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn io_and_pool_errors_are_transient() {
        let err = anyhow::Error::new(sqlx::Error::PoolTimedOut);
        assert!(is_transient_db_error(&err));

        let err = anyhow::Error::new(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(is_transient_db_error(&err));
    }

    #[test]
    fn plain_errors_are_not_transient() {
        let err = anyhow::anyhow!("validation failed");
        assert!(!is_transient_db_error(&err));

        let err = anyhow::Error::new(sqlx::Error::RowNotFound);
        assert!(!is_transient_db_error(&err));
    }

    #[tokio::test]
    async fn retry_stops_on_non_transient_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("permanent"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = retry_transient("test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(anyhow::Error::new(sqlx::Error::PoolTimedOut))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
