use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tallybook_core::{ClassificationSource, Rule, RuleDraft, RuleId, UNCATEGORIZED};
use tallybook_engine::{
    first_match, mine, normalize, synthesize, synthesize_correction, MineParams,
};
use tallybook_storage::{
    corpus_stats, fetch_corpus, insert_transaction, load_active_rules, review_transaction,
    rule_counts, CorpusStats, NewTransaction, RuleStore, StoreError, StoredTransaction,
};
use tracing::{debug, error, info, warn};

use crate::error::ApiError;
use crate::fallback::{MlClassifier, MlPrediction, SubcategoryGenerator, MISC_SUBCATEGORY};

/// Confidence reported for any rule hit.
pub const RULE_CONFIDENCE: f64 = 0.95;
const MAX_VENDOR_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub rule_hit: Option<Rule>,
    pub main_category: String,
    pub sub_category: String,
    pub confidence: f64,
    /// Stage that produced the subcategory.
    pub source: ClassificationSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearnParams {
    pub min_frequency: u32,
    pub min_confidence: f64,
    pub reviewed_only: bool,
    pub max_rules: usize,
    pub dry_run: bool,
}

impl LearnParams {
    fn mine_params(&self) -> MineParams {
        MineParams {
            min_frequency: self.min_frequency,
            min_confidence: self.min_confidence,
            reviewed_only: self.reviewed_only,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearnedRule {
    /// Set once the rule is committed.
    pub id: Option<RuleId>,
    #[serde(flatten)]
    pub draft: RuleDraft,
    pub avg_confidence: f64,
    pub sample_descriptions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearnReport {
    pub dry_run: bool,
    pub computed: usize,
    pub committed: usize,
    pub rules: Vec<LearnedRule>,
    /// Why nothing was committed, when a commit was attempted and failed.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub total_rules: i64,
    pub inactive_rules: i64,
    pub rules_by_provenance: std::collections::BTreeMap<String, i64>,
    pub corpus_stats: CorpusStats,
}

/// One bank line as submitted for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub date: NaiveDate,
    pub description: String,
    pub amount: f64,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub main_category: Option<String>,
    #[serde(default)]
    pub sub_category: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestedRow {
    /// `None` when an identical line was already stored.
    pub id: Option<i64>,
    pub duplicate: bool,
    pub raw_hash: String,
    pub main_category: Option<String>,
    pub sub_category: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewResult {
    pub transaction: StoredTransaction,
    pub learned_rule: Option<Rule>,
    pub learning_error: Option<String>,
}

/// First normalized token, capped at 40 characters.
pub fn vendor_from(normalized: &str) -> Option<String> {
    normalized
        .split(' ')
        .next()
        .filter(|t| !t.is_empty())
        .map(|t| t.chars().take(MAX_VENDOR_CHARS).collect())
}

fn is_uncategorized(main: Option<&str>) -> bool {
    main.map_or(true, |m| m.trim().is_empty() || m == UNCATEGORIZED)
}

/// Rule matching with ML and generator fallbacks, plus the learning loop.
pub struct Categorizer {
    store: Arc<RuleStore>,
    ml: Arc<dyn MlClassifier>,
    generator: Arc<dyn SubcategoryGenerator>,
    ml_threshold: f64,
}

impl Categorizer {
    pub fn new(
        store: Arc<RuleStore>,
        ml: Arc<dyn MlClassifier>,
        generator: Arc<dyn SubcategoryGenerator>,
        ml_threshold: f64,
    ) -> Self {
        Self { store, ml, generator, ml_threshold }
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    pub async fn classify_one(&self, description: &str) -> Classification {
        let normalized = normalize(description);

        match self.store.load().await {
            Ok(snapshot) => {
                if let Some(rule) = first_match(&normalized, &snapshot.rules) {
                    debug!(rule_id = %rule.id, rule = %rule.name, "rule hit");
                    return Classification {
                        rule_hit: Some(rule.clone()),
                        main_category: rule.main_category.clone(),
                        sub_category: rule.sub_category.clone(),
                        confidence: RULE_CONFIDENCE,
                        source: ClassificationSource::Rule,
                    };
                }
            }
            Err(e) => warn!(error = %e, "no rules available, falling back to ML"),
        }

        let prediction = self.ml.predict(&normalized).await.unwrap_or_else(|e| {
            warn!(error = %e, "ML prediction failed");
            MlPrediction::uncategorized()
        });

        if prediction.confidence >= self.ml_threshold {
            if let Some(sub) = prediction.sub_category.filter(|s| !s.trim().is_empty()) {
                return Classification {
                    rule_hit: None,
                    main_category: prediction.main_category,
                    sub_category: sub,
                    confidence: prediction.confidence,
                    source: ClassificationSource::Ml,
                };
            }
        }

        let main_category = if prediction.confidence >= self.ml_threshold {
            prediction.main_category
        } else {
            UNCATEGORIZED.to_string()
        };
        let sub_category = self
            .generator
            .generate(&normalized, &main_category)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "subcategory generation failed");
                MISC_SUBCATEGORY.to_string()
            });

        Classification {
            rule_hit: None,
            main_category,
            sub_category,
            confidence: prediction.confidence,
            source: ClassificationSource::Llm,
        }
    }

    /// Mines the corpus and synthesizes candidate rules; commits them unless
    /// `dry_run`.
    pub async fn learn(&self, params: LearnParams) -> Result<LearnReport, ApiError> {
        let pool = self.store.pool();

        if params.dry_run {
            let corpus =
                fetch_corpus(pool, params.min_confidence, params.reviewed_only).await?;
            let groups = mine(&corpus, &params.mine_params());
            // Same fresh view a commit would synthesize against.
            let existing = load_active_rules(pool).await?;
            let candidates = synthesize(&groups, &existing, params.max_rules);
            info!(groups = groups.len(), candidates = candidates.len(), "dry-run learning");
            return Ok(LearnReport {
                dry_run: true,
                computed: candidates.len(),
                committed: 0,
                rules: candidates.into_iter().map(|c| to_learned(c, None)).collect(),
                error: None,
            });
        }

        let writer = self.store.try_writer()?;
        let corpus = fetch_corpus(pool, params.min_confidence, params.reviewed_only).await?;
        let groups = mine(&corpus, &params.mine_params());
        let existing = writer.current_rules().await?;
        let candidates = synthesize(&groups, &existing, params.max_rules);
        let computed = candidates.len();

        let drafts: Vec<RuleDraft> = candidates.iter().map(|c| c.draft.clone()).collect();
        match writer.commit(&drafts).await {
            Ok(committed) => {
                info!(computed, committed = committed.len(), "learning run committed");
                let rules = candidates
                    .into_iter()
                    .zip(committed.iter().map(|r| Some(r.id)).chain(std::iter::repeat(None)))
                    .map(|(c, id)| to_learned(c, id))
                    .collect();
                Ok(LearnReport {
                    dry_run: false,
                    computed,
                    committed: committed.len(),
                    rules,
                    error: None,
                })
            }
            Err(e) => {
                error!(error = %e, computed, "learning commit failed, nothing persisted");
                Ok(LearnReport {
                    dry_run: false,
                    computed,
                    committed: 0,
                    rules: candidates.into_iter().map(|c| to_learned(c, None)).collect(),
                    error: Some(e.to_string()),
                })
            }
        }
    }

    pub async fn stats(&self) -> Result<Stats, ApiError> {
        let pool = self.store.pool();
        let counts = rule_counts(pool).await?;
        let corpus = corpus_stats(pool).await?;
        Ok(Stats {
            total_rules: counts.active_rules,
            inactive_rules: counts.inactive_rules,
            rules_by_provenance: counts.by_provenance,
            corpus_stats: corpus,
        })
    }

    /// Stores bank lines, classifying those that arrive without a category.
    pub async fn ingest(&self, rows: &[TransactionInput]) -> Result<Vec<IngestedRow>, ApiError> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if !row.amount.is_finite() {
                return Err(ApiError::Validation(format!("amount for '{}'", row.description)));
            }
            let normalized = normalize(&row.description);
            let vendor_text = row
                .vendor
                .clone()
                .filter(|v| !v.trim().is_empty())
                .or_else(|| vendor_from(&normalized));

            let supplied = row.main_category.as_deref().filter(|m| !m.trim().is_empty());
            let (main_category, sub_category, confidence, source, rule_hit) = match supplied {
                Some(main) => (
                    Some(main.to_string()),
                    row.sub_category.clone(),
                    row.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
                    None,
                    None,
                ),
                None => {
                    let c = self.classify_one(&row.description).await;
                    (
                        Some(c.main_category),
                        Some(c.sub_category),
                        c.confidence,
                        Some(c.source),
                        c.rule_hit.map(|r| r.name),
                    )
                }
            };

            let new_tx = NewTransaction {
                posted_at: row.date,
                account: row.account.clone(),
                description_raw: row.description.clone(),
                normalized_description: normalized,
                amount_cents: (row.amount * 100.0).round() as i64,
                currency: row.currency.clone().unwrap_or_else(|| "INR".to_string()),
                vendor_text,
                main_category,
                sub_category,
                confidence,
                source,
                rule_hit,
            };
            let id = insert_transaction(self.store.pool(), &new_tx).await?;
            out.push(IngestedRow {
                id,
                duplicate: id.is_none(),
                raw_hash: new_tx.raw_hash(),
                main_category: new_tx.main_category,
                sub_category: new_tx.sub_category,
                confidence: new_tx.confidence,
            });
        }
        info!(
            rows = rows.len(),
            inserted = out.iter().filter(|r| !r.duplicate).count(),
            "transactions ingested"
        );
        Ok(out)
    }

    /// Records a human review. Moving a transaction out of "Uncategorized"
    /// learns a manual rule from its description right away.
    pub async fn review(
        &self,
        id: i64,
        main_category: &str,
        sub_category: &str,
    ) -> Result<ReviewResult, ApiError> {
        if main_category.trim().is_empty() || sub_category.trim().is_empty() {
            return Err(ApiError::Validation("categories must not be blank".to_string()));
        }
        let outcome = review_transaction(self.store.pool(), id, main_category, sub_category).await?;

        let mut result = ReviewResult {
            transaction: outcome.transaction,
            learned_rule: None,
            learning_error: None,
        };
        if !is_uncategorized(outcome.previous_main.as_deref())
            || is_uncategorized(Some(main_category))
        {
            return Ok(result);
        }

        match self
            .learn_correction(&result.transaction.normalized_description, main_category, sub_category)
            .await
        {
            Ok(rule) => result.learned_rule = rule,
            Err(e) => {
                error!(transaction_id = id, error = %e, "manual-correction learning failed");
                result.learning_error = Some(e.to_string());
            }
        }
        Ok(result)
    }

    async fn learn_correction(
        &self,
        description: &str,
        main_category: &str,
        sub_category: &str,
    ) -> Result<Option<Rule>, StoreError> {
        let writer = self.store.writer().await;
        let existing = writer.current_rules().await?;
        let Some(draft) = synthesize_correction(description, main_category, sub_category, &existing)
        else {
            return Ok(None);
        };
        let rule = writer.commit(std::slice::from_ref(&draft)).await?.into_iter().next();
        if let Some(rule) = &rule {
            info!(rule_id = %rule.id, rule = %rule.name, "learned rule from correction");
        }
        Ok(rule)
    }
}

fn to_learned(candidate: tallybook_engine::Candidate, id: Option<RuleId>) -> LearnedRule {
    LearnedRule {
        id,
        draft: candidate.draft,
        avg_confidence: candidate.avg_confidence,
        sample_descriptions: candidate.sample_descriptions,
    }
}
