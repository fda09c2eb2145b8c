use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tallybook_core::{Rule, RuleDraft, RuleId};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::db::{DbPool, StorageError};
use crate::rules::{deactivate_rule, insert_rule, insert_rules, load_active_rules};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Rule storage unavailable and no cached rules: {0}")]
    ColdStart(StorageError),
    #[error("A rule commit is already in progress")]
    CommitInProgress,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One view of the active rules, already in precedence order.
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    pub rules: Arc<Vec<Rule>>,
    pub loaded_at: Instant,
    /// Set when a refresh failed and this older snapshot was served instead.
    pub refresh_error: Option<String>,
}

#[derive(Default)]
struct CacheState {
    snapshot: Option<(Arc<Vec<Rule>>, Instant)>,
    invalidated: bool,
    /// Bumped on every invalidation so a refresh that raced a commit stays stale.
    generation: u64,
}

/// Serves active rules from a time-bounded cache and funnels every rule
/// write through one writer.
pub struct RuleStore {
    pool: DbPool,
    ttl: Duration,
    cache: RwLock<CacheState>,
    refresh: Mutex<()>,
    writer: Mutex<()>,
}

impl RuleStore {
    pub fn new(pool: DbPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            cache: RwLock::new(CacheState::default()),
            refresh: Mutex::new(()),
            writer: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn load(&self) -> Result<RuleSnapshot, StoreError> {
        self.load_at(Instant::now()).await
    }

    fn fresh_snapshot(&self, now: Instant) -> Option<RuleSnapshot> {
        let state = self.cache.read().unwrap_or_else(|e| e.into_inner());
        if state.invalidated {
            return None;
        }
        let (rules, loaded_at) = state.snapshot.as_ref()?;
        (now.saturating_duration_since(*loaded_at) < self.ttl).then(|| RuleSnapshot {
            rules: Arc::clone(rules),
            loaded_at: *loaded_at,
            refresh_error: None,
        })
    }

    pub(crate) async fn load_at(&self, now: Instant) -> Result<RuleSnapshot, StoreError> {
        if let Some(snapshot) = self.fresh_snapshot(now) {
            return Ok(snapshot);
        }

        // Concurrent callers share one refresh.
        let _guard = self.refresh.lock().await;
        if let Some(snapshot) = self.fresh_snapshot(now) {
            return Ok(snapshot);
        }

        let generation = self.cache.read().unwrap_or_else(|e| e.into_inner()).generation;
        match load_active_rules(&self.pool).await {
            Ok(rules) => {
                let rules = Arc::new(rules);
                let mut state = self.cache.write().unwrap_or_else(|e| e.into_inner());
                state.snapshot = Some((Arc::clone(&rules), now));
                state.invalidated = state.generation != generation;
                debug!(count = rules.len(), "rule cache refreshed");
                Ok(RuleSnapshot { rules, loaded_at: now, refresh_error: None })
            }
            Err(e) => {
                let state = self.cache.read().unwrap_or_else(|e| e.into_inner());
                match state.snapshot.as_ref() {
                    Some((rules, loaded_at)) => {
                        warn!(error = %e, "rule refresh failed, serving cached rules");
                        Ok(RuleSnapshot {
                            rules: Arc::clone(rules),
                            loaded_at: *loaded_at,
                            refresh_error: Some(e.to_string()),
                        })
                    }
                    None => Err(StoreError::ColdStart(e)),
                }
            }
        }
    }

    /// Forces the next `load` to read from storage. Never fails.
    pub fn invalidate(&self) {
        let mut state = self.cache.write().unwrap_or_else(|e| e.into_inner());
        state.invalidated = true;
        state.generation = state.generation.wrapping_add(1);
        debug!("rule cache invalidated");
    }

    /// Waits for exclusive write access.
    pub async fn writer(&self) -> RuleWriter<'_> {
        RuleWriter { store: self, _guard: self.writer.lock().await }
    }

    /// Exclusive write access, or `CommitInProgress` if another writer holds it.
    pub fn try_writer(&self) -> Result<RuleWriter<'_>, StoreError> {
        let guard = self.writer.try_lock().map_err(|_| StoreError::CommitInProgress)?;
        Ok(RuleWriter { store: self, _guard: guard })
    }

    pub async fn append(&self, draft: &RuleDraft) -> Result<Rule, StoreError> {
        let writer = self.writer().await;
        let rule = insert_rule(&writer.store.pool, draft).await?;
        writer.store.invalidate();
        info!(rule_id = %rule.id, name = %rule.name, "rule appended");
        Ok(rule)
    }

    pub async fn deactivate(&self, id: RuleId) -> Result<(), StoreError> {
        let writer = self.writer().await;
        deactivate_rule(&writer.store.pool, id).await?;
        writer.store.invalidate();
        info!(rule_id = %id, "rule deactivated");
        Ok(())
    }
}

/// Held while a batch of rules is computed against current storage and
/// committed.
pub struct RuleWriter<'a> {
    store: &'a RuleStore,
    _guard: MutexGuard<'a, ()>,
}

impl RuleWriter<'_> {
    /// Active rules read straight from storage, bypassing the cache.
    pub async fn current_rules(&self) -> Result<Vec<Rule>, StoreError> {
        Ok(load_active_rules(&self.store.pool).await?)
    }

    /// Appends every draft in one database transaction, then invalidates the cache.
    pub async fn commit(&self, drafts: &[RuleDraft]) -> Result<Vec<Rule>, StoreError> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        let rules = insert_rules(&self.store.pool, drafts).await?;
        self.store.invalidate();
        info!(count = rules.len(), "rules committed");
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use tallybook_core::{KeywordSet, Provenance};

    fn draft(name: &str, priority: i32, keywords: &[&str]) -> RuleDraft {
        RuleDraft {
            name: name.to_string(),
            priority,
            keywords: KeywordSet::new(keywords).unwrap(),
            main_category: "Office Overhead".to_string(),
            sub_category: name.to_string(),
            frequency: 0,
            confidence: 0.95,
            created_by: Provenance::Script,
        }
    }

    #[tokio::test]
    async fn serves_cached_rules_within_ttl() {
        let (_dir, pool) = test_db().await;
        let store = RuleStore::new(pool.clone(), DEFAULT_TTL);
        insert_rule(&pool, &draft("Airtel", 10, &["AIRTEL"])).await.unwrap();

        let t0 = Instant::now();
        assert_eq!(store.load_at(t0).await.unwrap().rules.len(), 1);

        // Written behind the store's back: invisible until the TTL elapses.
        insert_rule(&pool, &draft("Swiggy", 10, &["SWIGGY"])).await.unwrap();
        let stale = store.load_at(t0 + Duration::from_secs(240)).await.unwrap();
        assert_eq!(stale.rules.len(), 1);
        assert_eq!(stale.loaded_at, t0);

        store.invalidate();
        let fresh = store.load_at(t0 + Duration::from_secs(241)).await.unwrap();
        assert_eq!(fresh.rules.len(), 2);
    }

    #[tokio::test]
    async fn refreshes_after_ttl() {
        let (_dir, pool) = test_db().await;
        let store = RuleStore::new(pool.clone(), DEFAULT_TTL);
        let t0 = Instant::now();
        assert!(store.load_at(t0).await.unwrap().rules.is_empty());

        insert_rule(&pool, &draft("Airtel", 10, &["AIRTEL"])).await.unwrap();
        let later = store.load_at(t0 + Duration::from_secs(360)).await.unwrap();
        assert_eq!(later.rules.len(), 1);
    }

    #[tokio::test]
    async fn serves_stale_snapshot_when_storage_fails() {
        let (_dir, pool) = test_db().await;
        insert_rule(&pool, &draft("Airtel", 10, &["AIRTEL"])).await.unwrap();
        let store = RuleStore::new(pool.clone(), DEFAULT_TTL);
        let t0 = Instant::now();
        store.load_at(t0).await.unwrap();

        pool.close().await;
        store.invalidate();
        let snapshot = store.load_at(t0 + Duration::from_secs(1)).await.unwrap();
        assert_eq!(snapshot.rules.len(), 1);
        assert!(snapshot.refresh_error.is_some());
    }

    #[tokio::test]
    async fn cold_start_failure_is_an_error() {
        let (_dir, pool) = test_db().await;
        let store = RuleStore::new(pool.clone(), DEFAULT_TTL);
        pool.close().await;
        assert!(matches!(store.load().await, Err(StoreError::ColdStart(_))));
    }

    #[tokio::test]
    async fn only_one_writer_at_a_time() {
        let (_dir, pool) = test_db().await;
        let store = RuleStore::new(pool, DEFAULT_TTL);
        let writer = store.try_writer().unwrap();
        assert!(matches!(store.try_writer(), Err(StoreError::CommitInProgress)));
        drop(writer);
        assert!(store.try_writer().is_ok());
    }

    #[tokio::test]
    async fn commit_is_visible_on_next_load() {
        let (_dir, pool) = test_db().await;
        let store = RuleStore::new(pool, DEFAULT_TTL);
        assert!(store.load().await.unwrap().rules.is_empty());

        let writer = store.writer().await;
        assert!(writer.current_rules().await.unwrap().is_empty());
        let committed = writer
            .commit(&[draft("B", 20, &["BRAVO"]), draft("A", 10, &["ALPHA"])])
            .await
            .unwrap();
        drop(writer);
        assert_eq!(committed.len(), 2);

        let names: Vec<String> =
            store.load().await.unwrap().rules.iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn deactivate_invalidates_cache() {
        let (_dir, pool) = test_db().await;
        let store = RuleStore::new(pool, DEFAULT_TTL);
        let rule = store.append(&draft("Airtel", 10, &["AIRTEL"])).await.unwrap();
        assert_eq!(store.load().await.unwrap().rules.len(), 1);

        store.deactivate(rule.id).await.unwrap();
        assert!(store.load().await.unwrap().rules.is_empty());
    }
}
