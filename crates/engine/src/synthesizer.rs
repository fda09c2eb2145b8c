use serde::{Deserialize, Serialize};
use tallybook_core::{
    KeywordSet, Provenance, Rule, RuleDraft, AUTO_LEARNED_PRIORITY, MANUAL_PRIORITY,
};
use tracing::debug;

use crate::keywords::{extract_keywords, keyword_union, ExtractOptions};
use crate::miner::PatternGroup;

/// Confidence recorded on rules learned from one explicit human correction.
pub const MANUAL_CONFIDENCE: f64 = 0.95;

/// A synthesized rule plus the statistics that justified it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub draft: RuleDraft,
    pub frequency: u32,
    pub avg_confidence: f64,
    pub sample_descriptions: Vec<String>,
}

/// Priority tier for a learned rule. Lower numbers are checked first.
pub fn priority_for(frequency: u32, avg_confidence: f64) -> i32 {
    if frequency >= 10 && avg_confidence >= 0.9 {
        10
    } else if frequency >= 5 && avg_confidence >= 0.8 {
        20
    } else if frequency >= 3 && avg_confidence >= 0.7 {
        30
    } else {
        AUTO_LEARNED_PRIORITY
    }
}

/// `"<prefix>: FIRST"`, with `" +N"` when N more keywords follow.
pub fn rule_name(prefix: &str, keywords: &KeywordSet) -> String {
    let first = keywords.first().unwrap_or_default();
    let mut name = format!("{prefix}: {first}");
    if keywords.len() > 1 {
        name.push_str(&format!(" +{}", keywords.len() - 1));
    }
    name
}

/// Turns mined groups into candidate rules. Nothing is persisted here.
///
/// Groups are ranked by frequency, then average confidence, keeping input
/// order on ties. Keywords already used by an active rule, or by a candidate
/// ranked earlier in the same run, are never reused; a group left with no
/// keywords is skipped. At most `max_rules` candidates are returned.
pub fn synthesize(
    groups: &[PatternGroup],
    existing_rules: &[Rule],
    max_rules: usize,
) -> Vec<Candidate> {
    let mut ranked: Vec<&PatternGroup> = groups.iter().collect();
    ranked.sort_by(|a, b| {
        b.frequency
            .cmp(&a.frequency)
            .then(b.avg_confidence.total_cmp(&a.avg_confidence))
    });

    let mut exclusion = keyword_union(existing_rules);
    let options = ExtractOptions::default();
    let mut out = Vec::new();

    for group in ranked {
        if out.len() >= max_rules {
            break;
        }
        let extracted = extract_keywords(&group.identity, &exclusion, &options);
        if extracted.is_empty() {
            debug!(identity = %group.identity, "no new keywords, skipping group");
            continue;
        }
        let Ok(keywords) = KeywordSet::new(&extracted) else {
            continue;
        };
        exclusion.extend(extracted);

        let draft = RuleDraft {
            name: rule_name("Auto-learned", &keywords),
            priority: priority_for(group.frequency, group.avg_confidence),
            keywords,
            main_category: group.main_category.clone(),
            sub_category: group.sub_category.clone(),
            frequency: group.frequency,
            confidence: group.avg_confidence.clamp(0.0, 1.0),
            created_by: Provenance::AutoLearned,
        };
        out.push(Candidate {
            draft,
            frequency: group.frequency,
            avg_confidence: group.avg_confidence,
            sample_descriptions: group.sample_descriptions.clone(),
        });
    }

    out
}

/// A rule learned from one human correction out of "Uncategorized".
///
/// Returns `None` when the description contributes no keyword that existing
/// active rules do not already cover.
pub fn synthesize_correction(
    description: &str,
    main_category: &str,
    sub_category: &str,
    existing_rules: &[Rule],
) -> Option<RuleDraft> {
    let exclusion = keyword_union(existing_rules);
    let extracted = extract_keywords(description, &exclusion, &ExtractOptions::default());
    if extracted.is_empty() {
        debug!(description, "correction adds no new keywords");
        return None;
    }
    let keywords = KeywordSet::new(&extracted).ok()?;

    Some(RuleDraft {
        name: rule_name("Manual", &keywords),
        priority: MANUAL_PRIORITY,
        keywords,
        main_category: main_category.to_string(),
        sub_category: sub_category.to_string(),
        frequency: 1,
        confidence: MANUAL_CONFIDENCE,
        created_by: Provenance::Manual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tallybook_core::RuleId;

    fn group(identity: &str, sub: &str, frequency: u32, avg_confidence: f64) -> PatternGroup {
        PatternGroup {
            identity: identity.to_string(),
            main_category: "Office Overhead".to_string(),
            sub_category: sub.to_string(),
            frequency,
            avg_confidence,
            sample_descriptions: vec![identity.to_string()],
            vendor_texts: vec![],
        }
    }

    fn existing(id: i64, keywords: &[&str]) -> Rule {
        let now = Utc::now();
        Rule {
            id: RuleId(id),
            name: "existing".to_string(),
            priority: 10,
            keywords: KeywordSet::new(keywords).unwrap(),
            main_category: "Main".to_string(),
            sub_category: "Sub".to_string(),
            is_active: true,
            frequency: 0,
            confidence: 0.95,
            created_by: Provenance::Script,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn priority_tiers() {
        assert_eq!(priority_for(12, 0.93), 10);
        assert_eq!(priority_for(6, 0.82), 20);
        assert_eq!(priority_for(4, 0.75), 30);
        assert_eq!(priority_for(2, 0.6), 50);
        // High frequency alone does not earn a better tier.
        assert_eq!(priority_for(50, 0.65), 50);
        assert_eq!(priority_for(10, 0.85), 20);
    }

    #[test]
    fn swiggy_scenario() {
        let groups = vec![group("UPI-SWIGGYINSTAMART-SWIGGYIN", "Swiggy", 8, 0.95)];
        let out = synthesize(&groups, &[existing(1, &["AIRTEL"])], 50);

        assert_eq!(out.len(), 1);
        let draft = &out[0].draft;
        assert!(draft.name.starts_with("Auto-learned: SWIGGYINSTAMART"));
        assert_eq!(draft.name, "Auto-learned: SWIGGYINSTAMART +1");
        assert_eq!(draft.priority, 20);
        assert_eq!(draft.keywords.as_slice(), &["SWIGGYINSTAMART", "SWIGGYIN"]);
        assert_eq!(draft.main_category, "Office Overhead");
        assert_eq!(draft.sub_category, "Swiggy");
        assert_eq!(draft.created_by, Provenance::AutoLearned);
        assert_eq!(draft.frequency, 8);
    }

    #[test]
    fn skips_group_fully_covered_by_existing_rules() {
        let groups = vec![group("UPI-SWIGGY-ORDER", "Swiggy", 8, 0.95)];
        let out = synthesize(&groups, &[existing(1, &["SWIGGY", "ORDER"])], 50);
        assert!(out.is_empty());
    }

    #[test]
    fn candidate_keywords_never_overlap_existing_union() {
        let rules = vec![existing(1, &["FINANCE", "LTD"]), existing(2, &["TANKER"])];
        let groups = vec![
            group("ACH D-BAJAJ FINANCE LTD-P400PH", "Bajaj", 5, 0.9),
            group("KRUPAKAR WATER TANKER", "Water", 4, 0.9),
        ];
        for c in synthesize(&groups, &rules, 50) {
            for kw in c.draft.keywords.iter() {
                assert!(!["FINANCE", "LTD", "TANKER"].contains(&kw), "reused {kw}");
            }
        }
    }

    #[test]
    fn inactive_rule_keywords_may_be_relearned() {
        let mut retired = existing(1, &["SWIGGYINSTAMART"]);
        retired.is_active = false;
        let out = synthesize(&[group("SWIGGYINSTAMART", "Swiggy", 3, 0.9)], &[retired], 50);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn ranks_by_frequency_then_confidence_stably() {
        let groups = vec![
            group("ALPHA VENDOR", "A", 3, 0.9),
            group("BRAVO VENDOR", "B", 7, 0.85),
            group("CHARLIE SHOP", "C", 7, 0.95),
            group("DELTA SHOP", "D", 3, 0.9),
        ];
        let out = synthesize(&groups, &[], 50);
        let subs: Vec<&str> = out.iter().map(|c| c.draft.sub_category.as_str()).collect();
        assert_eq!(subs, vec!["C", "B", "A", "D"]);
    }

    #[test]
    fn later_groups_do_not_reuse_earlier_candidate_keywords() {
        let groups = vec![
            group("AMAZON PAY", "Amazon", 9, 0.9),
            group("AMAZON PAY", "Other", 2, 0.9),
        ];
        let out = synthesize(&groups, &[], 50);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].draft.sub_category, "Amazon");
    }

    #[test]
    fn caps_at_max_rules_keeping_highest_ranked() {
        let groups = vec![
            group("LOW ONE", "L", 2, 0.9),
            group("HIGH ONE", "H", 12, 0.95),
            group("MID ONE", "M", 5, 0.9),
        ];
        let out = synthesize(&groups, &[], 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].draft.sub_category, "H");
        assert_eq!(out[1].draft.sub_category, "M");
        assert_eq!(out[0].draft.priority, 10);
    }

    #[test]
    fn identical_inputs_give_identical_candidates() {
        let groups = vec![
            group("NUTAN MEDICAL STORE", "Nutan", 4, 0.8),
            group("ABK IMPORTS", "ABK", 4, 0.8),
        ];
        let rules = vec![existing(1, &["STORE"])];
        assert_eq!(synthesize(&groups, &rules, 10), synthesize(&groups, &rules, 10));
    }

    #[test]
    fn single_keyword_name_has_no_suffix() {
        let out = synthesize(&[group("UPI-HIMADIRECTOR", "Petty", 3, 0.9)], &[], 5);
        assert_eq!(out[0].draft.name, "Auto-learned: HIMADIRECTOR");
    }

    #[test]
    fn correction_builds_manual_rule() {
        let draft = synthesize_correction(
            "IMPS-512212180520-SRIPAL REDDY HOSTEL",
            "Employee Welfare",
            "Hostel Fee for Employees",
            &[existing(1, &["AIRTEL"])],
        )
        .unwrap();
        assert_eq!(draft.priority, 25);
        assert_eq!(draft.created_by, Provenance::Manual);
        assert_eq!(draft.frequency, 1);
        assert_eq!(draft.keywords.as_slice(), &["SRIPAL", "REDDY", "HOSTEL"]);
        assert_eq!(draft.name, "Manual: SRIPAL +2");
    }

    #[test]
    fn correction_skipped_when_nothing_new() {
        assert!(synthesize_correction(
            "UPI-AIRTEL-123",
            "Telephone & Internet",
            "Airtel",
            &[existing(1, &["AIRTEL"])],
        )
        .is_none());
    }
}
