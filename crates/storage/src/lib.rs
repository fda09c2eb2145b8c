pub mod db;
pub mod rule_store;
pub mod rules;
pub mod transactions;

pub use db::{create_db, DbPool, StorageError};
pub use rule_store::{RuleSnapshot, RuleStore, RuleWriter, StoreError, DEFAULT_TTL};
pub use rules::{
    deactivate_rule, get_all_rules, get_rule, insert_rule, insert_rules, load_active_rules,
    rule_counts, seed_script_rules, RuleCounts,
};
pub use transactions::{
    corpus_stats, fetch_corpus, find_transaction_by_hash, get_transaction, insert_transaction,
    review_transaction, transaction_hash, CategoryCount, CorpusStats, NewTransaction,
    ReviewOutcome, StoredTransaction, HIGH_CONFIDENCE,
};
