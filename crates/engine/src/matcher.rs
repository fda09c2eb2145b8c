use tallybook_core::Rule;

/// Whether any of the rule's keywords occurs in the description.
///
/// Plain substring containment, case-insensitive. A short keyword such as
/// `"MIR"` will also fire inside unrelated words; rule authors are expected
/// to pick distinctive keywords. An empty keyword set never matches.
pub fn rule_matches(rule: &Rule, description: &str) -> bool {
    hits(rule, &description.to_uppercase())
}

/// `text` must already be uppercased.
fn hits(rule: &Rule, text: &str) -> bool {
    rule.keywords.iter().any(|k| text.contains(k))
}

/// First active rule, in the given order, whose keywords hit the description.
///
/// `rules` must already be sorted by ascending priority (ties by id). The
/// rule store hands out snapshots in that order.
pub fn first_match<'a>(description: &str, rules: &'a [Rule]) -> Option<&'a Rule> {
    let text = description.to_uppercase();
    rules
        .iter()
        .filter(|r| r.is_active)
        .find(|r| hits(r, &text))
}

/// Ascending priority, then ascending id (insertion order).
pub fn sort_by_precedence(rules: &mut [Rule]) {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tallybook_core::{KeywordSet, Provenance, RuleId};

    fn make_rule(id: i64, keywords: &[&str], sub: &str, priority: i32) -> Rule {
        let now = Utc::now();
        Rule {
            id: RuleId(id),
            name: sub.to_string(),
            priority,
            keywords: KeywordSet::new(keywords).unwrap(),
            main_category: "Main".to_string(),
            sub_category: sub.to_string(),
            is_active: true,
            frequency: 0,
            confidence: 0.95,
            created_by: Provenance::Script,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn any_keyword_matches() {
        let rule = make_rule(1, &["SWIGGY", "INSTAMART"], "Swiggy", 10);
        assert!(rule_matches(&rule, "UPI-INSTAMART-ORDER"));
        assert!(rule_matches(&rule, "upi-swiggy"));
        assert!(!rule_matches(&rule, "UPI-ZOMATO"));
    }

    #[test]
    fn empty_keyword_set_never_matches() {
        let rule = make_rule(1, &[], "Nothing", 1);
        assert!(!rule_matches(&rule, "ANYTHING AT ALL"));
        assert!(first_match("ANYTHING AT ALL", &[rule]).is_none());
    }

    fn sorted(mut rules: Vec<Rule>) -> Vec<Rule> {
        sort_by_precedence(&mut rules);
        rules
    }

    #[test]
    fn lowest_priority_number_wins() {
        let rules = sorted(vec![
            make_rule(1, &["SALARY"], "Generic", 30),
            make_rule(2, &["SALARY"], "Specific", 5),
        ]);
        let hit = first_match("NEFT DR-RAVI KUMAR-SALARY MAY", &rules).unwrap();
        assert_eq!(hit.sub_category, "Specific");
    }

    #[test]
    fn ties_broken_by_id() {
        let rules = sorted(vec![
            make_rule(9, &["AMAZON"], "Later", 20),
            make_rule(3, &["AMAZON"], "Earlier", 20),
        ]);
        assert_eq!(first_match("AMAZON PAY", &rules).unwrap().id, RuleId(3));
    }

    #[test]
    fn first_match_wins_over_longer_match() {
        let rules = vec![
            make_rule(1, &["GST"], "GST", 25),
            make_rule(2, &["GST PAYMENT ONLINE"], "Longer", 26),
        ];
        assert_eq!(first_match("GST PAYMENT ONLINE", &rules).unwrap().sub_category, "GST");
    }

    #[test]
    fn inactive_rules_are_never_considered() {
        let mut inactive = make_rule(1, &["AIRTEL"], "Inactive", 1);
        inactive.is_active = false;
        let active = make_rule(2, &["AIRTEL"], "Active", 50);

        assert_eq!(
            first_match("AIRTEL BILL", &[inactive.clone(), active]).unwrap().sub_category,
            "Active"
        );
        assert!(first_match("AIRTEL BILL", &[inactive]).is_none());
    }

    #[test]
    fn no_match_returns_none() {
        let rules = vec![make_rule(1, &["AIRTEL"], "Airtel", 10)];
        assert!(first_match("RANDOM VENDOR XYZ", &rules).is_none());
    }

    #[test]
    fn input_order_does_not_matter_once_sorted() {
        let rules = vec![
            make_rule(4, &["FUEL", "BPCL"], "Fuel", 30),
            make_rule(2, &["BPCL"], "Pump", 15),
            make_rule(7, &["PETROL"], "Petrol", 15),
            make_rule(1, &["BP"], "Short", 40),
        ];
        let forward = sorted(rules.clone());
        let backward = sorted(rules.into_iter().rev().collect());

        for desc in ["BPCL PETROL PUMP", "FUEL STATION", "BP LUBES", "NOTHING"] {
            assert_eq!(
                first_match(desc, &forward).map(|r| r.id),
                first_match(desc, &backward).map(|r| r.id),
                "mismatch for {desc}"
            );
        }
        assert_eq!(first_match("BPCL PETROL PUMP", &forward).unwrap().id, RuleId(2));
    }

    #[test]
    fn first_match_agrees_with_rule_matches() {
        let rules = vec![
            make_rule(1, &["EMI "], "Emi", 10),
            make_rule(2, &["swiggy"], "Swiggy", 20),
            make_rule(3, &[], "Empty", 30),
        ];
        for desc in ["hdfc emi chq", "HDFCEMI", "upi-Swiggy", "nothing", ""] {
            let expected = rules.iter().find(|r| rule_matches(r, desc)).map(|r| r.id);
            assert_eq!(first_match(desc, &rules).map(|r| r.id), expected, "{desc}");
        }
    }

    #[test]
    fn repeated_calls_are_deterministic() {
        let rules = vec![
            make_rule(1, &["MILK"], "Milk", 30),
            make_rule(2, &["GARBAGE"], "Garbage", 30),
        ];
        let first = first_match("DAILY MILK GARBAGE", &rules).map(|r| r.id);
        for _ in 0..10 {
            assert_eq!(first_match("DAILY MILK GARBAGE", &rules).map(|r| r.id), first);
        }
        assert_eq!(first, Some(RuleId(1)));
    }
}
