use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Main category assigned when neither a rule nor the model is confident.
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Which stage of the pipeline produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationSource {
    Rule,
    Ml,
    Llm,
}

impl ClassificationSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ClassificationSource::Rule => "rule",
            ClassificationSource::Ml => "ml",
            ClassificationSource::Llm => "llm",
        }
    }
}

impl fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A historical, categorized transaction as seen by the pattern miner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusTransaction {
    pub id: Option<i64>,
    pub normalized_description: String,
    pub vendor_text: Option<String>,
    pub main_category: Option<String>,
    pub sub_category: Option<String>,
    pub confidence: f64,
    /// `None` until a human confirms the category.
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl CorpusTransaction {
    pub fn is_reviewed(&self) -> bool {
        self.reviewed_at.is_some()
    }

    /// Both categories present and non-blank.
    pub fn categories(&self) -> Option<(&str, &str)> {
        let main = self.main_category.as_deref().filter(|s| !s.trim().is_empty())?;
        let sub = self.sub_category.as_deref().filter(|s| !s.trim().is_empty())?;
        Some((main, sub))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(main: Option<&str>, sub: Option<&str>) -> CorpusTransaction {
        CorpusTransaction {
            id: None,
            normalized_description: "UPI-SWIGGYINSTAMART-SWIGGYIN".to_string(),
            vendor_text: None,
            main_category: main.map(str::to_string),
            sub_category: sub.map(str::to_string),
            confidence: 0.9,
            reviewed_at: None,
        }
    }

    #[test]
    fn categories_requires_both() {
        assert_eq!(
            tx(Some("Office Overhead"), Some("Swiggy")).categories(),
            Some(("Office Overhead", "Swiggy"))
        );
        assert_eq!(tx(Some("Office Overhead"), None).categories(), None);
        assert_eq!(tx(Some(""), Some("Swiggy")).categories(), None);
    }

    #[test]
    fn unreviewed_by_default() {
        assert!(!tx(None, None).is_reviewed());
    }

    #[test]
    fn source_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ClassificationSource::Llm).unwrap(), "\"llm\"");
        assert_eq!(ClassificationSource::Rule.to_string(), "rule");
    }
}
