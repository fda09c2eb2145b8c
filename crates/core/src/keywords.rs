use serde::{Deserialize, Serialize};
use std::fmt;

use crate::rule::ModelError;

/// The uppercase keywords a rule fires on, in first-seen order.
///
/// Keywords are kept verbatim apart from case folding: stored rules rely on
/// leading or trailing spaces (`"EMI "`) to approximate word boundaries, so
/// nothing is trimmed. A blank keyword would be a substring of every
/// description and is rejected outright.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct KeywordSet(Vec<String>);

impl KeywordSet {
    pub fn new<I, S>(keywords: I) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for keyword in keywords {
            let raw = keyword.as_ref();
            if raw.trim().is_empty() {
                return Err(ModelError::BlankKeyword);
            }
            let upper = raw.to_uppercase();
            if !out.contains(&upper) {
                out.push(upper);
            }
        }
        Ok(Self(out))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Case-insensitive exact membership (not substring).
    pub fn contains(&self, token: &str) -> bool {
        let token = token.to_uppercase();
        self.0.iter().any(|k| *k == token)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl TryFrom<Vec<String>> for KeywordSet {
    type Error = ModelError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        KeywordSet::new(value)
    }
}

impl From<KeywordSet> for Vec<String> {
    fn from(set: KeywordSet) -> Self {
        set.0
    }
}

impl fmt::Display for KeywordSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(", "))
    }
}
