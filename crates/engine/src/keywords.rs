use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tallybook_core::Rule;

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

re!(re_disallowed, r"[^A-Za-z0-9 &:/._\-\s]");
re!(re_whitespace, r"\s+");

/// Generic banking and filler tokens that never identify a counterparty.
pub const STOPLIST: &[&str] = &[
    "THE", "AND", "FOR", "WITH", "FROM", "TO", "OF", "IN", "ON", "AT", "BY", "PAYMENT",
    "TRANSFER", "NEFT", "IMPS", "ACH", "UPI", "POS", "DR", "CR",
];

pub const DEFAULT_MIN_LENGTH: usize = 3;
pub const DEFAULT_MAX_KEYWORDS: usize = 3;

/// Canonical form of a bank narration: punctuation outside `& : / . _ -`
/// removed, whitespace collapsed, uppercase.
pub fn normalize(text: &str) -> String {
    let cleaned = re_disallowed().replace_all(text, "");
    re_whitespace()
        .replace_all(cleaned.trim(), " ")
        .to_uppercase()
}

#[derive(Debug, Clone)]
pub struct ExtractOptions<'a> {
    pub stoplist: &'a [&'a str],
    pub min_length: usize,
    pub max_keywords: usize,
}

impl Default for ExtractOptions<'static> {
    fn default() -> Self {
        Self {
            stoplist: STOPLIST,
            min_length: DEFAULT_MIN_LENGTH,
            max_keywords: DEFAULT_MAX_KEYWORDS,
        }
    }
}

/// Pulls candidate keywords out of a description.
///
/// Tokens are split on anything that is not ASCII alphanumeric. Short tokens,
/// pure numbers, stoplisted words and tokens already present in `existing`
/// are dropped. The survivors keep their first-seen order and are truncated
/// to `max_keywords`.
pub fn extract_keywords(
    text: &str,
    existing: &HashSet<String>,
    options: &ExtractOptions<'_>,
) -> Vec<String> {
    let normalized = normalize(text);
    let mut out: Vec<String> = Vec::new();

    for token in normalized.split(|c: char| !c.is_ascii_alphanumeric()) {
        if out.len() == options.max_keywords {
            break;
        }
        if token.chars().count() < options.min_length {
            continue;
        }
        if token.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if options.stoplist.iter().any(|s| s.eq_ignore_ascii_case(token)) {
            continue;
        }
        if existing.contains(token) {
            continue;
        }
        if out.iter().any(|t| t == token) {
            continue;
        }
        out.push(token.to_string());
    }

    out
}

/// Union of keywords across active rules, uppercase.
pub fn keyword_union<'a, I>(rules: I) -> HashSet<String>
where
    I: IntoIterator<Item = &'a Rule>,
{
    rules
        .into_iter()
        .filter(|r| r.is_active)
        .flat_map(|r| r.keywords.iter().map(str::to_uppercase))
        .collect()
}
