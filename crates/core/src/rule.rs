use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::keywords::KeywordSet;

/// Salary rules generated from the employee roster outrank every other script rule.
pub const SALARY_PRIORITY: i32 = 5;
/// Rules learned from a single human correction.
pub const MANUAL_PRIORITY: i32 = 25;
/// Fallback tier for statistically learned rules with weak support.
pub const AUTO_LEARNED_PRIORITY: i32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub i64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Script,
    Manual,
    AutoLearned,
}

impl Provenance {
    pub const ALL: [Provenance; 3] = [Provenance::Script, Provenance::Manual, Provenance::AutoLearned];

    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::Script => "script",
            Provenance::Manual => "manual",
            Provenance::AutoLearned => "auto-learned",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provenance {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(Provenance::Script),
            "manual" => Ok(Provenance::Manual),
            "auto-learned" => Ok(Provenance::AutoLearned),
            other => Err(ModelError::UnknownProvenance(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("Keyword must not be blank")]
    BlankKeyword,
    #[error("Rule needs at least one keyword")]
    EmptyKeywordSet,
    #[error("Unknown rule provenance: '{0}'")]
    UnknownProvenance(String),
    #[error("Confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("Category must not be blank")]
    BlankCategory,
}

/// A persisted rule as served by the rule store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    /// Lower value is checked first.
    pub priority: i32,
    pub keywords: KeywordSet,
    pub main_category: String,
    pub sub_category: String,
    pub is_active: bool,
    /// Number of transactions the rule was learned from; 0 for hand-written rules.
    pub frequency: u32,
    pub confidence: f64,
    pub created_by: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A rule that has not been committed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    pub priority: i32,
    pub keywords: KeywordSet,
    pub main_category: String,
    pub sub_category: String,
    pub frequency: u32,
    pub confidence: f64,
    pub created_by: Provenance,
}

impl RuleDraft {
    /// Checks the invariants a rule must satisfy before it may be appended.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.keywords.is_empty() {
            return Err(ModelError::EmptyKeywordSet);
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ModelError::ConfidenceOutOfRange(self.confidence));
        }
        if self.main_category.trim().is_empty() || self.sub_category.trim().is_empty() {
            return Err(ModelError::BlankCategory);
        }
        Ok(())
    }

    pub fn into_rule(self, id: RuleId, now: DateTime<Utc>) -> Rule {
        Rule {
            id,
            name: self.name,
            priority: self.priority,
            keywords: self.keywords,
            main_category: self.main_category,
            sub_category: self.sub_category,
            is_active: true,
            frequency: self.frequency,
            confidence: self.confidence,
            created_by: self.created_by,
            created_at: now,
            updated_at: now,
        }
    }
}
