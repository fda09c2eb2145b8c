use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row};
use tallybook_core::{KeywordSet, Provenance, Rule, RuleDraft, RuleId};
use tracing::warn;

use crate::db::{parse_timestamp, timestamp, DbPool, StorageError};

type RuleRow = (
    i64,
    String,
    i64,
    Option<String>,
    String,
    String,
    i64,
    i64,
    f64,
    String,
    String,
    String,
);

const RULE_COLUMNS: &str = "id, name, priority, keywords, main_category, sub_category, \
     is_active, frequency, confidence, created_by, created_at, updated_at";

// SQLite columns are loosely typed, so each field is checked on its own and a
// row holding the wrong storage class is skipped instead of failing the query.
fn decode_columns(row: &SqliteRow) -> Result<RuleRow, sqlx::Error> {
    Ok((
        row.try_get("id")?,
        row.try_get("name")?,
        row.try_get("priority")?,
        row.try_get("keywords")?,
        row.try_get("main_category")?,
        row.try_get("sub_category")?,
        row.try_get("is_active")?,
        row.try_get("frequency")?,
        row.try_get("confidence")?,
        row.try_get("created_by")?,
        row.try_get("created_at")?,
        row.try_get("updated_at")?,
    ))
}

fn rule_from_row(row: SqliteRow) -> Option<Rule> {
    let columns = match decode_columns(&row) {
        Ok(columns) => columns,
        Err(e) => {
            let id = row.try_get::<i64, _>("id").ok();
            warn!(rule_id = ?id, error = %e, "skipping rule with undecodable columns");
            return None;
        }
    };
    let (
        id,
        name,
        priority,
        keywords,
        main_category,
        sub_category,
        is_active,
        frequency,
        confidence,
        created_by,
        created_at,
        updated_at,
    ) = columns;

    let keywords = match keywords
        .as_deref()
        .map(serde_json::from_str::<KeywordSet>)
    {
        Some(Ok(set)) if !set.is_empty() => set,
        Some(Err(e)) => {
            warn!(rule_id = id, error = %e, "skipping rule with malformed keywords");
            return None;
        }
        _ => {
            warn!(rule_id = id, "skipping rule without keywords");
            return None;
        }
    };
    let created_by = match created_by.parse::<Provenance>() {
        Ok(p) => p,
        Err(e) => {
            warn!(rule_id = id, error = %e, "skipping rule with unknown provenance");
            return None;
        }
    };
    let (Ok(priority), Ok(frequency)) = (i32::try_from(priority), u32::try_from(frequency)) else {
        warn!(rule_id = id, "skipping rule with out-of-range priority or frequency");
        return None;
    };
    let created_at = parse_timestamp(&created_at).unwrap_or_else(Utc::now);
    let updated_at = parse_timestamp(&updated_at).unwrap_or(created_at);

    Some(Rule {
        id: RuleId(id),
        name,
        priority,
        keywords,
        main_category,
        sub_category,
        is_active: is_active != 0,
        frequency,
        confidence,
        created_by,
        created_at,
        updated_at,
    })
}

/// Active rules in precedence order. Rows that cannot be decoded are
/// logged and left out.
pub async fn load_active_rules(pool: &DbPool) -> Result<Vec<Rule>, StorageError> {
    let rows = sqlx::query(&format!(
        "SELECT {RULE_COLUMNS} FROM rules WHERE is_active = 1 ORDER BY priority ASC, id ASC"
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().filter_map(rule_from_row).collect())
}

/// Every decodable rule, inactive ones included.
pub async fn get_all_rules(pool: &DbPool) -> Result<Vec<Rule>, StorageError> {
    let rows = sqlx::query(&format!(
        "SELECT {RULE_COLUMNS} FROM rules ORDER BY priority ASC, id ASC"
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().filter_map(rule_from_row).collect())
}

pub async fn get_rule(pool: &DbPool, id: RuleId) -> Result<Option<Rule>, StorageError> {
    let row = sqlx::query(&format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?"))
        .bind(id.0)
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(rule_from_row))
}

async fn insert_one<'e, E>(executor: E, draft: &RuleDraft) -> Result<Rule, StorageError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    draft.validate()?;
    let keywords = serde_json::to_string(&draft.keywords)?;
    let now = Utc::now();
    let ts = timestamp(now);

    let id: i64 = sqlx::query_scalar(
        "INSERT INTO rules (name, priority, keywords, main_category, sub_category, is_active, \
         frequency, confidence, created_by, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&draft.name)
    .bind(draft.priority)
    .bind(&keywords)
    .bind(&draft.main_category)
    .bind(&draft.sub_category)
    .bind(i64::from(draft.frequency))
    .bind(draft.confidence)
    .bind(draft.created_by.as_str())
    .bind(&ts)
    .bind(&ts)
    .fetch_one(executor)
    .await?;

    Ok(draft.clone().into_rule(RuleId(id), now))
}

pub async fn insert_rule(pool: &DbPool, draft: &RuleDraft) -> Result<Rule, StorageError> {
    insert_one(pool, draft).await
}

/// Inserts all drafts in one database transaction: either every rule is
/// appended or none is.
pub async fn insert_rules(pool: &DbPool, drafts: &[RuleDraft]) -> Result<Vec<Rule>, StorageError> {
    for draft in drafts {
        draft.validate()?;
    }
    let mut tx = pool.begin().await?;
    let mut out = Vec::with_capacity(drafts.len());
    for draft in drafts {
        out.push(insert_one(&mut *tx, draft).await?);
    }
    tx.commit().await?;
    Ok(out)
}

/// Clears the active flag. Rules are never deleted.
pub async fn deactivate_rule(pool: &DbPool, id: RuleId) -> Result<(), StorageError> {
    let result = sqlx::query("UPDATE rules SET is_active = 0, updated_at = ? WHERE id = ?")
        .bind(timestamp(Utc::now()))
        .bind(id.0)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::RuleNotFound(id));
    }
    Ok(())
}

/// Seeds script rules on a fresh database. Returns how many were inserted;
/// zero when active script rules already exist.
pub async fn seed_script_rules(pool: &DbPool, drafts: &[RuleDraft]) -> Result<usize, StorageError> {
    let (existing,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM rules WHERE created_by = ? AND is_active = 1",
    )
    .bind(Provenance::Script.as_str())
    .fetch_one(pool)
    .await?;
    if existing > 0 {
        return Ok(0);
    }
    Ok(insert_rules(pool, drafts).await?.len())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleCounts {
    pub active_rules: i64,
    pub inactive_rules: i64,
    /// Active rules per provenance.
    pub by_provenance: BTreeMap<String, i64>,
}

pub async fn rule_counts(pool: &DbPool) -> Result<RuleCounts, StorageError> {
    let rows: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT created_by, \
         COALESCE(SUM(CASE WHEN is_active = 1 THEN 1 ELSE 0 END), 0), \
         COALESCE(SUM(CASE WHEN is_active = 0 THEN 1 ELSE 0 END), 0) \
         FROM rules GROUP BY created_by",
    )
    .fetch_all(pool)
    .await?;

    let mut counts = RuleCounts::default();
    for p in Provenance::ALL {
        counts.by_provenance.insert(p.as_str().to_string(), 0);
    }
    for (created_by, active, inactive) in rows {
        counts.active_rules += active;
        counts.inactive_rules += inactive;
        *counts.by_provenance.entry(created_by).or_insert(0) += active;
    }
    Ok(counts)
}
