pub mod keywords;
pub mod rule;
pub mod transaction;

pub use keywords::KeywordSet;
pub use rule::{
    ModelError, Provenance, Rule, RuleDraft, RuleId, AUTO_LEARNED_PRIORITY, MANUAL_PRIORITY,
    SALARY_PRIORITY,
};
pub use transaction::{ClassificationSource, CorpusTransaction, UNCATEGORIZED};
