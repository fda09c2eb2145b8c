use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tallybook_core::{KeywordSet, ModelError, Provenance, RuleDraft, SALARY_PRIORITY};
use thiserror::Error;

pub const SALARY_MAIN_CATEGORY: &str = "Salaries & Wages";
/// Narration fragments that accompany salary transfers.
pub const SALARY_KEYWORDS: &[&str] = &["SALARY", "EXPENSES", "NEFT DR", "IMPS", "TPT"];
pub const SCRIPT_CONFIDENCE: f64 = 0.95;
const DEFAULT_SCRIPT_PRIORITY: i32 = 100;

#[derive(Debug, Error)]
pub enum ScriptRulesError {
    #[error("Failed to parse rule book: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid script rule '{name}': {source}")]
    InvalidRule { name: String, source: ModelError },
}

/// One hand-written rule as declared in the rule book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRule {
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub keywords: Vec<String>,
    pub main: String,
    pub sub: String,
}

fn default_priority() -> i32 {
    DEFAULT_SCRIPT_PRIORITY
}

/// Script-authored rules plus the employee roster, keyed by team.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptRuleBook {
    #[serde(default)]
    pub rules: Vec<ScriptRule>,
    #[serde(default)]
    pub salary: BTreeMap<String, Vec<String>>,
}

impl ScriptRuleBook {
    pub fn from_toml(toml_content: &str) -> Result<Self, ScriptRulesError> {
        let book: ScriptRuleBook = toml::from_str(toml_content)?;
        // Surface bad entries at load time rather than at seeding time.
        book.drafts()?;
        Ok(book)
    }

    /// All rules as drafts: salary rules first, then the declared rules.
    pub fn drafts(&self) -> Result<Vec<RuleDraft>, ScriptRulesError> {
        let mut out = Vec::new();
        for (team, names) in &self.salary {
            for name in names {
                out.push(salary_rule(name, team).map_err(|source| {
                    ScriptRulesError::InvalidRule { name: format!("Salary: {name}"), source }
                })?);
            }
        }
        for rule in &self.rules {
            let draft = script_draft(rule).map_err(|source| ScriptRulesError::InvalidRule {
                name: rule.name.clone(),
                source,
            })?;
            out.push(draft);
        }
        Ok(out)
    }
}

fn script_draft(rule: &ScriptRule) -> Result<RuleDraft, ModelError> {
    let draft = RuleDraft {
        name: rule.name.clone(),
        priority: rule.priority,
        keywords: KeywordSet::new(&rule.keywords)?,
        main_category: rule.main.clone(),
        sub_category: rule.sub.clone(),
        frequency: 0,
        confidence: SCRIPT_CONFIDENCE,
        created_by: Provenance::Script,
    };
    draft.validate()?;
    Ok(draft)
}

/// Expands one employee into an ordinary rule keyed on their name and the
/// usual salary narration fragments.
pub fn salary_rule(employee: &str, team: &str) -> Result<RuleDraft, ModelError> {
    let keywords =
        KeywordSet::new(std::iter::once(employee).chain(SALARY_KEYWORDS.iter().copied()))?;
    let draft = RuleDraft {
        name: format!("Salary: {}", employee.to_uppercase()),
        priority: SALARY_PRIORITY,
        keywords,
        main_category: SALARY_MAIN_CATEGORY.to_string(),
        sub_category: team.to_string(),
        frequency: 0,
        confidence: SCRIPT_CONFIDENCE,
        created_by: Provenance::Script,
    };
    draft.validate()?;
    Ok(draft)
}
