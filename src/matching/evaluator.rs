// src/matching/evaluator.rs
//
// Weighted rule evaluation over one candidate pair.

use log::trace;

use crate::matching::comparators;
use crate::models::{MatchRule, RawRecord};

/// Outcome of scoring one candidate pair against a rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Clamped weighted sum of fired rule weights, in [0, 1]
    pub score: f64,
    /// Names of the rules that fired, in declaration order
    pub matched_rule_names: Vec<String>,
}

impl Evaluation {
    pub fn empty() -> Self {
        Self {
            score: 0.0,
            matched_rule_names: Vec::new(),
        }
    }
}

/// Evaluate every enabled rule against the pair and accumulate the weights
/// of the ones that fire.
///
/// Rules are conjunctive: a rule fires only when every condition's
/// similarity meets its configured minimum. A field missing on either side
/// makes the rule not fire; it is not an error. Rules are independent and
/// evaluation order never changes the score, only the reported name order
/// (declaration order, for audit readability).
pub fn evaluate_pair(a: &RawRecord, b: &RawRecord, rules: &[MatchRule]) -> Evaluation {
    let mut accumulator = 0.0_f64;
    let mut matched_rule_names = Vec::new();

    for rule in rules.iter().filter(|r| r.enabled) {
        if rule_fires(a, b, rule) {
            accumulator += rule.weight;
            matched_rule_names.push(rule.name.clone());
        }
    }

    let score = accumulator.min(1.0);
    trace!(
        "Evaluated pair ({}, {}): score {:.4}, fired rules {:?}",
        a.id.0,
        b.id.0,
        score,
        matched_rule_names
    );

    Evaluation {
        score,
        matched_rule_names,
    }
}

fn rule_fires(a: &RawRecord, b: &RawRecord, rule: &MatchRule) -> bool {
    if rule.conditions.is_empty() {
        return false;
    }
    rule.conditions.iter().all(|cond| {
        match (a.field(&cond.field), b.field(&cond.field)) {
            (Some(va), Some(vb)) => comparators::compare(cond.comparator, va, vb) >= cond.min,
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use std::collections::BTreeMap;

    use crate::models::{
        ComparatorKind, EntityType, FieldValue, RecordId, RuleCondition, SourceId,
    };

    fn record(id: &str, fields: Vec<(&str, FieldValue)>) -> RawRecord {
        RawRecord {
            id: RecordId(id.to_string()),
            source_id: SourceId("test".to_string()),
            entity_type: EntityType::Person,
            ingested_at: Utc::now(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn rule(name: &str, weight: f64, conditions: Vec<RuleCondition>) -> MatchRule {
        MatchRule {
            name: name.to_string(),
            conditions,
            weight,
            enabled: true,
        }
    }

    fn eq_cond(field: &str) -> RuleCondition {
        RuleCondition {
            field: field.to_string(),
            comparator: ComparatorKind::Eq,
            min: 1.0,
        }
    }

    #[test]
    fn conjunctive_rule_requires_every_condition() {
        let a = record(
            "r1",
            vec![
                ("name", FieldValue::Text("Budi Santoso".into())),
                ("dob", FieldValue::Date(NaiveDate::from_ymd_opt(1985, 3, 12).unwrap())),
            ],
        );
        let b = record(
            "r2",
            vec![
                ("name", FieldValue::Text("Budi Santosa".into())),
                ("dob", FieldValue::Date(NaiveDate::from_ymd_opt(1990, 1, 1).unwrap())),
            ],
        );
        let rules = vec![rule(
            "name_dob_fuzzy",
            0.6,
            vec![
                RuleCondition {
                    field: "name".into(),
                    comparator: ComparatorKind::JaroWinkler,
                    min: 0.92,
                },
                eq_cond("dob"),
            ],
        )];
        // Name is similar enough but the dob condition fails
        let eval = evaluate_pair(&a, &b, &rules);
        assert_eq!(eval.score, 0.0);
        assert!(eval.matched_rule_names.is_empty());
    }

    #[test]
    fn missing_field_means_rule_does_not_fire() {
        let a = record("r1", vec![("name", FieldValue::Text("Budi".into()))]);
        let b = record("r2", vec![]);
        let rules = vec![rule("name_eq", 0.5, vec![eq_cond("name")])];
        let eval = evaluate_pair(&a, &b, &rules);
        assert_eq!(eval.score, 0.0);
        assert!(eval.matched_rule_names.is_empty());
    }

    #[test]
    fn score_is_clamped_to_one() {
        let a = record(
            "r1",
            vec![
                ("nik", FieldValue::Text("3173042503850001".into())),
                ("msisdn", FieldValue::Text("+628121234567".into())),
            ],
        );
        let b = a.clone();
        let rules = vec![
            rule("nik_exact", 1.0, vec![eq_cond("nik")]),
            rule("phone_exact", 0.7, vec![eq_cond("msisdn")]),
        ];
        let eval = evaluate_pair(&a, &b, &rules);
        assert_eq!(eval.score, 1.0);
        assert_eq!(eval.matched_rule_names, vec!["nik_exact", "phone_exact"]);
    }

    #[test]
    fn adding_a_firing_rule_never_decreases_the_score() {
        let a = record(
            "r1",
            vec![
                ("name", FieldValue::Text("PT Maju Jaya".into())),
                ("msisdn", FieldValue::Text("+62215550101".into())),
            ],
        );
        let b = a.clone();
        let mut rules = vec![rule("name_eq", 0.3, vec![eq_cond("name")])];
        let base = evaluate_pair(&a, &b, &rules).score;
        rules.push(rule("phone_exact", 0.4, vec![eq_cond("msisdn")]));
        let extended = evaluate_pair(&a, &b, &rules).score;
        assert!(extended >= base);
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let a = record("r1", vec![("name", FieldValue::Text("Budi".into()))]);
        let b = a.clone();
        let mut r = rule("name_eq", 0.9, vec![eq_cond("name")]);
        r.enabled = false;
        let eval = evaluate_pair(&a, &b, &[r]);
        assert_eq!(eval.score, 0.0);
    }

    #[test]
    fn matched_names_preserve_declaration_order() {
        let a = record(
            "r1",
            vec![
                ("name", FieldValue::Text("Budi Santoso".into())),
                ("dob", FieldValue::Date(NaiveDate::from_ymd_opt(1985, 3, 12).unwrap())),
                ("msisdn", FieldValue::Text("+628121234567".into())),
            ],
        );
        let b = a.clone();
        let rules = vec![
            rule(
                "name_dob_fuzzy",
                0.6,
                vec![
                    RuleCondition {
                        field: "name".into(),
                        comparator: ComparatorKind::JaroWinkler,
                        min: 0.92,
                    },
                    eq_cond("dob"),
                ],
            ),
            rule("phone_exact", 0.7, vec![eq_cond("msisdn")]),
        ];
        let eval = evaluate_pair(&a, &b, &rules);
        assert_eq!(eval.score, 1.0);
        assert_eq!(eval.matched_rule_names, vec!["name_dob_fuzzy", "phone_exact"]);
    }
}
