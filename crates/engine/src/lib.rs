pub mod keywords;
pub mod matcher;
pub mod miner;
pub mod script;
pub mod synthesizer;

pub use keywords::{extract_keywords, keyword_union, normalize, ExtractOptions, STOPLIST};
pub use matcher::{first_match, rule_matches, sort_by_precedence};
pub use miner::{mine, MineParams, PatternGroup};
pub use script::{salary_rule, ScriptRule, ScriptRuleBook, ScriptRulesError};
pub use synthesizer::{priority_for, rule_name, synthesize, synthesize_correction, Candidate};
