// src/config.rs
//
// Rule-set configuration: deserialization, activation validation, and the
// decision thresholds. A rule set is only usable by the engine once it has
// been activated against a field schema; every configuration error below is
// caught at activation, never per record.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{FieldSchema, MatchRule};
#[cfg(test)]
use crate::models::FieldKind;

/// Score thresholds driving the merge / review / reject decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub auto_merge: f64,
    pub queue_review: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto_merge: 0.85,
            queue_review: 0.70,
        }
    }
}

/// Rule configuration as exchanged with the configuration source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<MatchRule>,
    #[serde(default)]
    pub thresholds: Thresholds,
}

/// Errors detected while activating a rule set.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("rule '{rule}' declared more than once")]
    DuplicateRuleName { rule: String },

    #[error("rule '{rule}' has weight {weight}, expected a value in [0, 1]")]
    WeightOutOfRange { rule: String, weight: f64 },

    #[error("rule '{rule}' references unknown field '{field}'")]
    UnknownField { rule: String, field: String },

    #[error(
        "rule '{rule}' applies comparator '{comparator}' to field '{field}' of kind '{kind}'"
    )]
    IncomparableFieldKind {
        rule: String,
        field: String,
        kind: &'static str,
        comparator: &'static str,
    },

    #[error(
        "auto_merge threshold ({auto_merge}) must be greater than queue_review ({queue_review})"
    )]
    InvalidThresholds { auto_merge: f64, queue_review: f64 },

    #[error("failed to parse rule set: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A validated rule set the engine will accept.
///
/// Holds only enabled rules, in declaration order. Construction goes through
/// `RuleSet::activate`; there is no other way to obtain one.
#[derive(Debug, Clone)]
pub struct ActiveRuleSet {
    rules: Vec<MatchRule>,
    thresholds: Thresholds,
}

impl ActiveRuleSet {
    pub fn rules(&self) -> &[MatchRule] {
        &self.rules
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }
}

impl RuleSet {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validate this configuration against the field schema and produce an
    /// activated rule set, or refuse with the first error found.
    pub fn activate(self, schema: &FieldSchema) -> Result<ActiveRuleSet, ConfigError> {
        if self.thresholds.auto_merge <= self.thresholds.queue_review {
            return Err(ConfigError::InvalidThresholds {
                auto_merge: self.thresholds.auto_merge,
                queue_review: self.thresholds.queue_review,
            });
        }

        let mut seen_names: Vec<&str> = Vec::new();
        for rule in &self.rules {
            if seen_names.contains(&rule.name.as_str()) {
                return Err(ConfigError::DuplicateRuleName {
                    rule: rule.name.clone(),
                });
            }
            seen_names.push(&rule.name);

            if !(0.0..=1.0).contains(&rule.weight) {
                return Err(ConfigError::WeightOutOfRange {
                    rule: rule.name.clone(),
                    weight: rule.weight,
                });
            }

            for cond in &rule.conditions {
                let kind = schema.kind_of(&cond.field).ok_or_else(|| {
                    ConfigError::UnknownField {
                        rule: rule.name.clone(),
                        field: cond.field.clone(),
                    }
                })?;
                if !cond.comparator.supports(kind) {
                    return Err(ConfigError::IncomparableFieldKind {
                        rule: rule.name.clone(),
                        field: cond.field.clone(),
                        kind: kind.as_str(),
                        comparator: cond.comparator.as_str(),
                    });
                }
            }
        }

        let total = self.rules.len();
        let rules: Vec<MatchRule> = self.rules.into_iter().filter(|r| r.enabled).collect();
        debug!(
            "Activated rule set: {} enabled of {} configured rules",
            rules.len(),
            total
        );
        info!(
            "Rule set active with thresholds auto_merge={:.2}, queue_review={:.2}",
            self.thresholds.auto_merge, self.thresholds.queue_review
        );

        Ok(ActiveRuleSet {
            rules,
            thresholds: self.thresholds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BlockingStrategy, ComparatorKind, RuleCondition};

    fn schema() -> FieldSchema {
        FieldSchema::new()
            .with_field("name", FieldKind::Text, BlockingStrategy::NameTokens)
            .with_field("dob", FieldKind::Date, BlockingStrategy::None)
            .with_field("ids.nik", FieldKind::Text, BlockingStrategy::Exact)
    }

    fn rule(name: &str, field: &str, comparator: ComparatorKind, weight: f64) -> MatchRule {
        MatchRule {
            name: name.to_string(),
            conditions: vec![RuleCondition {
                field: field.to_string(),
                comparator,
                min: 1.0,
            }],
            weight,
            enabled: true,
        }
    }

    #[test]
    fn activation_rejects_incomparable_field_kind() {
        let rs = RuleSet {
            rules: vec![rule("dob_fuzzy", "dob", ComparatorKind::JaroWinkler, 0.5)],
            thresholds: Thresholds::default(),
        };
        match rs.activate(&schema()) {
            Err(ConfigError::IncomparableFieldKind { rule, field, .. }) => {
                assert_eq!(rule, "dob_fuzzy");
                assert_eq!(field, "dob");
            }
            other => panic!("expected IncomparableFieldKind, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn activation_rejects_inverted_thresholds() {
        let rs = RuleSet {
            rules: vec![],
            thresholds: Thresholds {
                auto_merge: 0.6,
                queue_review: 0.7,
            },
        };
        assert!(matches!(
            rs.activate(&schema()),
            Err(ConfigError::InvalidThresholds { .. })
        ));
    }

    #[test]
    fn activation_rejects_duplicate_names_and_bad_weights() {
        let rs = RuleSet {
            rules: vec![
                rule("nik_exact", "ids.nik", ComparatorKind::Eq, 1.0),
                rule("nik_exact", "ids.nik", ComparatorKind::Eq, 0.5),
            ],
            thresholds: Thresholds::default(),
        };
        assert!(matches!(
            rs.activate(&schema()),
            Err(ConfigError::DuplicateRuleName { .. })
        ));

        let rs = RuleSet {
            rules: vec![rule("nik_exact", "ids.nik", ComparatorKind::Eq, 1.5)],
            thresholds: Thresholds::default(),
        };
        assert!(matches!(
            rs.activate(&schema()),
            Err(ConfigError::WeightOutOfRange { .. })
        ));
    }

    #[test]
    fn activation_keeps_only_enabled_rules_in_order() {
        let mut disabled = rule("email_exact", "ids.nik", ComparatorKind::Eq, 0.5);
        disabled.enabled = false;
        let rs = RuleSet {
            rules: vec![
                rule("nik_exact", "ids.nik", ComparatorKind::Eq, 1.0),
                disabled,
                rule("name_fuzzy", "name", ComparatorKind::JaroWinkler, 0.4),
            ],
            thresholds: Thresholds::default(),
        };
        let active = rs.activate(&schema()).unwrap();
        let names: Vec<_> = active.rules().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["nik_exact", "name_fuzzy"]);
    }

    #[test]
    fn rule_set_parses_dashboard_payload_shape() {
        let json = r#"{
            "rules": [
                {
                    "name": "nik_exact",
                    "when": [{ "field": "ids.nik", "op": "eq" }],
                    "weight": 1.0,
                    "enabled": true
                },
                {
                    "name": "name_dob_fuzzy",
                    "when": [
                        { "field": "name", "op": "jaro_winkler", "min": 0.92 },
                        { "field": "dob", "op": "eq" }
                    ],
                    "weight": 0.6,
                    "enabled": true
                }
            ],
            "thresholds": { "auto_merge": 0.85, "queue_review": 0.7 }
        }"#;
        let rs = RuleSet::from_json(json).unwrap();
        assert_eq!(rs.rules.len(), 2);
        assert_eq!(rs.rules[1].conditions[0].min, 0.92);
        assert_eq!(rs.rules[1].conditions[1].min, 1.0);
        assert_eq!(rs.thresholds.auto_merge, 0.85);
    }
}
