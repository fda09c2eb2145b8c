use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tallybook_core::{ClassificationSource, CorpusTransaction};

use crate::db::{parse_timestamp, timestamp, DbPool, StorageError};

/// Transactions above this confidence count as high-confidence in stats.
pub const HIGH_CONFIDENCE: f64 = 0.8;
const TOP_CATEGORIES: i64 = 10;

/// Stable identity of a bank line, used to make ingestion idempotent.
pub fn transaction_hash(
    account: &str,
    posted_at: NaiveDate,
    amount_cents: i64,
    normalized_description: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{account}|{posted_at}|{amount_cents}|{normalized_description}"));
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub posted_at: NaiveDate,
    pub account: Option<String>,
    pub description_raw: String,
    pub normalized_description: String,
    pub amount_cents: i64,
    pub currency: String,
    pub vendor_text: Option<String>,
    pub main_category: Option<String>,
    pub sub_category: Option<String>,
    pub confidence: f64,
    pub source: Option<ClassificationSource>,
    pub rule_hit: Option<String>,
}

impl NewTransaction {
    pub fn raw_hash(&self) -> String {
        transaction_hash(
            self.account.as_deref().unwrap_or_default(),
            self.posted_at,
            self.amount_cents,
            &self.normalized_description,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredTransaction {
    pub id: i64,
    pub raw_hash: String,
    pub posted_at: String,
    pub account: Option<String>,
    pub description_raw: String,
    pub normalized_description: String,
    pub amount_cents: i64,
    pub currency: String,
    pub vendor_text: Option<String>,
    pub main_category: Option<String>,
    pub sub_category: Option<String>,
    pub confidence: f64,
    pub source: Option<String>,
    pub rule_hit: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

type TransactionRow = (
    i64,
    String,
    String,
    Option<String>,
    String,
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    f64,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

impl From<TransactionRow> for StoredTransaction {
    fn from(r: TransactionRow) -> Self {
        Self {
            id: r.0,
            raw_hash: r.1,
            posted_at: r.2,
            account: r.3,
            description_raw: r.4,
            normalized_description: r.5,
            amount_cents: r.6,
            currency: r.7,
            vendor_text: r.8,
            main_category: r.9,
            sub_category: r.10,
            confidence: r.11,
            source: r.12,
            rule_hit: r.13,
            reviewed_at: r.14.as_deref().and_then(parse_timestamp),
            created_at: parse_timestamp(&r.15),
        }
    }
}

/// Inserts a transaction unless one with the same hash exists. Returns the
/// new id, or `None` for a duplicate.
pub async fn insert_transaction(
    pool: &DbPool,
    tx: &NewTransaction,
) -> Result<Option<i64>, StorageError> {
    let now = timestamp(Utc::now());
    let id: Option<i64> = sqlx::query_scalar(
        "INSERT OR IGNORE INTO transactions (raw_hash, posted_at, account, description_raw, \
         normalized_desc, amount_cents, currency, vendor_text, main_category, sub_category, \
         confidence, source, rule_hit, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(tx.raw_hash())
    .bind(tx.posted_at.to_string())
    .bind(&tx.account)
    .bind(&tx.description_raw)
    .bind(&tx.normalized_description)
    .bind(tx.amount_cents)
    .bind(&tx.currency)
    .bind(&tx.vendor_text)
    .bind(&tx.main_category)
    .bind(&tx.sub_category)
    .bind(tx.confidence)
    .bind(tx.source.map(ClassificationSource::as_str))
    .bind(&tx.rule_hit)
    .bind(&now)
    .bind(&now)
    .fetch_optional(pool)
    .await?;

    Ok(id)
}

pub async fn find_transaction_by_hash(
    pool: &DbPool,
    raw_hash: &str,
) -> Result<Option<StoredTransaction>, StorageError> {
    let row = sqlx::query_as::<_, TransactionRow>(
        "SELECT id, raw_hash, posted_at, account, description_raw, normalized_desc, amount_cents, \
         currency, vendor_text, main_category, sub_category, confidence, source, rule_hit, \
         reviewed_at, created_at FROM transactions WHERE raw_hash = ?",
    )
    .bind(raw_hash)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(StoredTransaction::from))
}

pub async fn get_transaction(
    pool: &DbPool,
    id: i64,
) -> Result<Option<StoredTransaction>, StorageError> {
    let row = sqlx::query_as::<_, TransactionRow>(
        "SELECT id, raw_hash, posted_at, account, description_raw, normalized_desc, amount_cents, \
         currency, vendor_text, main_category, sub_category, confidence, source, rule_hit, \
         reviewed_at, created_at FROM transactions WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(StoredTransaction::from))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewOutcome {
    /// Main category before the review, if any.
    pub previous_main: Option<String>,
    pub transaction: StoredTransaction,
}

/// Records a human decision. The reviewed categories are taken as certain,
/// so confidence becomes 1.0.
pub async fn review_transaction(
    pool: &DbPool,
    id: i64,
    main_category: &str,
    sub_category: &str,
) -> Result<ReviewOutcome, StorageError> {
    let mut db_tx = pool.begin().await?;

    let previous: Option<(Option<String>,)> =
        sqlx::query_as("SELECT main_category FROM transactions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *db_tx)
            .await?;
    let Some((previous_main,)) = previous else {
        return Err(StorageError::TransactionNotFound(id));
    };

    let now = timestamp(Utc::now());
    sqlx::query(
        "UPDATE transactions SET main_category = ?, sub_category = ?, confidence = 1.0, \
         reviewed_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(main_category)
    .bind(sub_category)
    .bind(&now)
    .bind(&now)
    .bind(id)
    .execute(&mut *db_tx)
    .await?;

    db_tx.commit().await?;

    let transaction = get_transaction(pool, id)
        .await?
        .ok_or(StorageError::TransactionNotFound(id))?;
    Ok(ReviewOutcome { previous_main, transaction })
}

/// The learning corpus: categorized transactions strictly above
/// `min_confidence`, optionally restricted to reviewed ones, oldest first.
pub async fn fetch_corpus(
    pool: &DbPool,
    min_confidence: f64,
    reviewed_only: bool,
) -> Result<Vec<CorpusTransaction>, StorageError> {
    let rows: Vec<(i64, String, Option<String>, Option<String>, Option<String>, f64, Option<String>)> =
        sqlx::query_as(
            "SELECT id, normalized_desc, vendor_text, main_category, sub_category, confidence, \
             reviewed_at FROM transactions \
             WHERE confidence > ? AND main_category IS NOT NULL AND sub_category IS NOT NULL \
             AND (? = 0 OR reviewed_at IS NOT NULL) \
             ORDER BY id ASC",
        )
        .bind(min_confidence)
        .bind(reviewed_only)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(id, desc, vendor, main, sub, confidence, reviewed_at)| CorpusTransaction {
            id: Some(id),
            normalized_description: desc,
            vendor_text: vendor,
            main_category: main,
            sub_category: sub,
            confidence,
            reviewed_at: reviewed_at.as_deref().and_then(parse_timestamp),
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryCount {
    pub main_category: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorpusStats {
    pub total_transactions: i64,
    pub reviewed_transactions: i64,
    pub high_confidence_transactions: i64,
    /// Most frequent main categories among reviewed transactions.
    pub top_categories: Vec<CategoryCount>,
}

pub async fn corpus_stats(pool: &DbPool) -> Result<CorpusStats, StorageError> {
    let (total_transactions, reviewed_transactions, high_confidence_transactions): (i64, i64, i64) =
        sqlx::query_as(
            "SELECT COUNT(*), \
             COALESCE(SUM(CASE WHEN reviewed_at IS NOT NULL THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN confidence > ? THEN 1 ELSE 0 END), 0) \
             FROM transactions",
        )
        .bind(HIGH_CONFIDENCE)
        .fetch_one(pool)
        .await?;

    let top: Vec<(String, i64)> = sqlx::query_as(
        "SELECT main_category, COUNT(*) AS n FROM transactions \
         WHERE reviewed_at IS NOT NULL AND main_category IS NOT NULL \
         GROUP BY main_category ORDER BY n DESC, main_category ASC LIMIT ?",
    )
    .bind(TOP_CATEGORIES)
    .fetch_all(pool)
    .await?;

    Ok(CorpusStats {
        total_transactions,
        reviewed_transactions,
        high_confidence_transactions,
        top_categories: top
            .into_iter()
            .map(|(main_category, count)| CategoryCount { main_category, count })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn new_tx(desc: &str, amount_cents: i64, main: Option<&str>, confidence: f64) -> NewTransaction {
        NewTransaction {
            posted_at: NaiveDate::from_ymd_opt(2025, 4, 3).unwrap(),
            account: Some("HDFC-CA".to_string()),
            description_raw: desc.to_string(),
            normalized_description: desc.to_string(),
            amount_cents,
            currency: "INR".to_string(),
            vendor_text: None,
            main_category: main.map(str::to_string),
            sub_category: main.map(|_| "Sub".to_string()),
            confidence,
            source: main.map(|_| ClassificationSource::Rule),
            rule_hit: None,
        }
    }

    #[test]
    fn hash_is_stable_hex() {
        let date = NaiveDate::from_ymd_opt(2025, 4, 3).unwrap();
        let a = transaction_hash("HDFC-CA", date, -120000, "UPI-AIRTEL");
        let b = transaction_hash("HDFC-CA", date, -120000, "UPI-AIRTEL");
        let c = transaction_hash("HDFC-CA", date, -120001, "UPI-AIRTEL");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let (_dir, pool) = test_db().await;
        let tx = new_tx("UPI-AIRTEL", -49900, Some("Telephone & Internet"), 0.95);
        let id = insert_transaction(&pool, &tx).await.unwrap();
        assert!(id.is_some());
        assert_eq!(insert_transaction(&pool, &tx).await.unwrap(), None);

        let stored = find_transaction_by_hash(&pool, &tx.raw_hash()).await.unwrap().unwrap();
        assert_eq!(Some(stored.id), id);
        assert_eq!(stored.source.as_deref(), Some("rule"));
        assert_eq!(stored.posted_at, "2025-04-03");
    }

    #[tokio::test]
    async fn review_records_previous_main() {
        let (_dir, pool) = test_db().await;
        let id = insert_transaction(&pool, &new_tx("HOSTEL FEE", -500000, Some("Uncategorized"), 0.4))
            .await
            .unwrap()
            .unwrap();

        let outcome = review_transaction(&pool, id, "Employee Welfare", "Hostel").await.unwrap();
        assert_eq!(outcome.previous_main.as_deref(), Some("Uncategorized"));
        assert_eq!(outcome.transaction.main_category.as_deref(), Some("Employee Welfare"));
        assert_eq!(outcome.transaction.confidence, 1.0);
        assert!(outcome.transaction.reviewed_at.is_some());

        assert!(matches!(
            review_transaction(&pool, 999, "A", "B").await,
            Err(StorageError::TransactionNotFound(999))
        ));
    }

    #[tokio::test]
    async fn corpus_filters_confidence_and_review() {
        let (_dir, pool) = test_db().await;
        let a = insert_transaction(&pool, &new_tx("SWIGGY ONE", -100, Some("Office Overhead"), 0.9))
            .await
            .unwrap()
            .unwrap();
        insert_transaction(&pool, &new_tx("SWIGGY TWO", -200, Some("Office Overhead"), 0.8))
            .await
            .unwrap();
        insert_transaction(&pool, &new_tx("NO CATEGORY", -300, None, 0.99)).await.unwrap();
        review_transaction(&pool, a, "Office Overhead", "Swiggy").await.unwrap();

        let reviewed = fetch_corpus(&pool, 0.8, true).await.unwrap();
        assert_eq!(reviewed.len(), 1);
        assert_eq!(reviewed[0].sub_category.as_deref(), Some("Swiggy"));
        assert!(reviewed[0].is_reviewed());

        // 0.8 is not strictly above the threshold.
        let all = fetch_corpus(&pool, 0.8, false).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(fetch_corpus(&pool, 0.5, false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stats_count_reviewed_categories() {
        let (_dir, pool) = test_db().await;
        for (i, main) in ["Fuel", "Fuel", "Office Overhead"].iter().enumerate() {
            let id = insert_transaction(&pool, &new_tx(&format!("LINE {i}"), i as i64, Some(main), 0.5))
                .await
                .unwrap()
                .unwrap();
            review_transaction(&pool, id, main, "Sub").await.unwrap();
        }
        insert_transaction(&pool, &new_tx("PENDING", 99, Some("Fuel"), 0.5)).await.unwrap();

        let stats = corpus_stats(&pool).await.unwrap();
        assert_eq!(stats.total_transactions, 4);
        assert_eq!(stats.reviewed_transactions, 3);
        assert_eq!(stats.high_confidence_transactions, 3);
        assert_eq!(stats.top_categories[0].main_category, "Fuel");
        assert_eq!(stats.top_categories[0].count, 2);
        assert_eq!(stats.top_categories.len(), 2);
    }
}
