use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tallybook_core::CorpusTransaction;

const MAX_SAMPLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MineParams {
    pub min_frequency: u32,
    /// Transactions must be strictly above this confidence.
    pub min_confidence: f64,
    pub reviewed_only: bool,
}

impl Default for MineParams {
    fn default() -> Self {
        Self {
            min_frequency: 2,
            min_confidence: 0.8,
            reviewed_only: true,
        }
    }
}

/// Transactions that share a normalized identity and an agreed category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternGroup {
    /// Normalized description (or vendor text when the description is empty).
    pub identity: String,
    pub main_category: String,
    pub sub_category: String,
    pub frequency: u32,
    pub avg_confidence: f64,
    pub sample_descriptions: Vec<String>,
    pub vendor_texts: Vec<String>,
}

struct Accumulator {
    group: PatternGroup,
    confidence_sum: f64,
}

/// The grouping identity of a transaction, or `None` when it has neither a
/// description nor vendor text to learn from.
pub fn identity_of(tx: &CorpusTransaction) -> Option<String> {
    let desc = tx.normalized_description.trim();
    if !desc.is_empty() {
        return Some(desc.to_uppercase());
    }
    tx.vendor_text
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_uppercase)
}

/// Groups qualifying transactions and keeps the groups with enough support.
///
/// Groups come back in the order their first member was seen.
pub fn mine(corpus: &[CorpusTransaction], params: &MineParams) -> Vec<PatternGroup> {
    let mut index: HashMap<(String, String, String), usize> = HashMap::new();
    let mut groups: Vec<Accumulator> = Vec::new();

    for tx in corpus {
        if tx.confidence <= params.min_confidence {
            continue;
        }
        if params.reviewed_only && !tx.is_reviewed() {
            continue;
        }
        let Some((main, sub)) = tx.categories() else {
            continue;
        };
        let Some(identity) = identity_of(tx) else {
            continue;
        };

        let key = (identity.clone(), sub.to_string(), main.to_string());
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(Accumulator {
                group: PatternGroup {
                    identity,
                    main_category: main.to_string(),
                    sub_category: sub.to_string(),
                    frequency: 0,
                    avg_confidence: 0.0,
                    sample_descriptions: Vec::new(),
                    vendor_texts: Vec::new(),
                },
                confidence_sum: 0.0,
            });
            groups.len() - 1
        });

        let acc = &mut groups[slot];
        acc.group.frequency += 1;
        acc.confidence_sum += tx.confidence;

        let desc = &tx.normalized_description;
        if !desc.is_empty()
            && acc.group.sample_descriptions.len() < MAX_SAMPLES
            && !acc.group.sample_descriptions.contains(desc)
        {
            acc.group.sample_descriptions.push(desc.clone());
        }
        if let Some(vendor) = tx.vendor_text.as_deref().filter(|v| !v.trim().is_empty()) {
            if acc.group.vendor_texts.len() < MAX_SAMPLES
                && !acc.group.vendor_texts.iter().any(|v| v == vendor)
            {
                acc.group.vendor_texts.push(vendor.to_string());
            }
        }
    }

    groups
        .into_iter()
        .filter(|acc| acc.group.frequency >= params.min_frequency)
        .map(|acc| {
            let mut group = acc.group;
            group.avg_confidence = acc.confidence_sum / f64::from(group.frequency);
            group
        })
        .collect()
}
