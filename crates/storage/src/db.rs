use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use tallybook_core::{ModelError, RuleId};
use thiserror::Error;

pub type DbPool = Pool<Sqlite>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("Keyword encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Invalid rule: {0}")]
    InvalidRule(#[from] ModelError),
    #[error("Rule not found: {0}")]
    RuleNotFound(RuleId),
    #[error("Transaction not found: {0}")]
    TransactionNotFound(i64),
}

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    // `keywords` holds a JSON array of strings; rows that fail to decode are
    // skipped at load time rather than rejected here.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 100,
            keywords TEXT,
            main_category TEXT NOT NULL,
            sub_category TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            frequency INTEGER NOT NULL DEFAULT 0,
            confidence REAL NOT NULL DEFAULT 0.95,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_rules_active_priority ON rules (is_active, priority, id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            raw_hash TEXT NOT NULL UNIQUE,
            posted_at TEXT NOT NULL,
            account TEXT,
            description_raw TEXT NOT NULL,
            normalized_desc TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL DEFAULT 'INR',
            vendor_text TEXT,
            main_category TEXT,
            sub_category TEXT,
            confidence REAL NOT NULL DEFAULT 0,
            source TEXT,
            rule_hit TEXT,
            reviewed_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transactions_learning ON transactions (reviewed_at, confidence)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Accepts RFC 3339 as written by this crate, and SQLite's `datetime('now')`
/// format for rows written by hand.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

pub(crate) fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

#[cfg(test)]
pub(crate) async fn test_db() -> (tempfile::TempDir, DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = create_db(&dir.path().join("test.db")).await.unwrap();
    (dir, pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_tables() {
        let (_dir, pool) = test_db().await;
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<String> = tables.into_iter().map(|t| t.0).collect();
        for expected in ["rules", "transactions"] {
            assert!(names.contains(&expected.to_string()), "missing table: {expected}");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (_dir, pool) = test_db().await;
        run_migrations(&pool).await.unwrap();
    }

    #[test]
    fn parses_both_timestamp_formats() {
        let rfc = parse_timestamp("2025-05-01T10:30:00+00:00").unwrap();
        let sqlite = parse_timestamp("2025-05-01 10:30:00").unwrap();
        assert_eq!(rfc, sqlite);
        assert!(parse_timestamp("yesterday").is_none());
    }
}
