//! Batch validation: required fields, numeric bounds, and duplicate ratio.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Deserialize;
use sportsync_core::{Record, RecordType};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Per-record-type adjustments read from configuration. `required` replaces
/// the default list; `bounds` entries replace or add individual fields.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleOverride {
    #[serde(default)]
    pub required: Option<Vec<String>>,
    #[serde(default)]
    pub bounds: BTreeMap<String, Bounds>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityRules {
    pub required: Vec<String>,
    pub bounds: BTreeMap<String, Bounds>,
}

impl QualityRules {
    pub fn defaults_for(record_type: RecordType) -> Self {
        let (required, bounds): (&[&str], &[(&str, Bounds)]) = match record_type {
            RecordType::Players => (
                &["player_id", "name", "season"],
                &[("age", Bounds::new(15.0, 50.0))],
            ),
            RecordType::Games => (
                &["game_id", "date", "home_team", "away_team"],
                &[
                    ("home_score", Bounds::new(0.0, 30.0)),
                    ("away_score", Bounds::new(0.0, 30.0)),
                ],
            ),
            RecordType::LiveGames => (
                &["game_id", "home_team", "away_team", "period"],
                &[
                    ("home_score", Bounds::new(0.0, 30.0)),
                    ("away_score", Bounds::new(0.0, 30.0)),
                    ("period", Bounds::new(1.0, 5.0)),
                ],
            ),
            RecordType::Stats => (
                &["player_id", "season"],
                &[
                    ("games_played", Bounds::new(0.0, 100.0)),
                    ("goals", Bounds::new(0.0, 100.0)),
                    ("assists", Bounds::new(0.0, 150.0)),
                    ("points", Bounds::new(0.0, 250.0)),
                    ("shots", Bounds::new(0.0, 500.0)),
                    ("plus_minus", Bounds::new(-100.0, 100.0)),
                    ("penalty_minutes", Bounds::new(0.0, 500.0)),
                ],
            ),
        };
        Self {
            required: required.iter().map(|f| f.to_string()).collect(),
            bounds: bounds
                .iter()
                .map(|(field, b)| (field.to_string(), *b))
                .collect(),
        }
    }

    pub fn apply_override(&mut self, rule_override: &RuleOverride) {
        if let Some(required) = &rule_override.required {
            self.required = required.clone();
        }
        for (field, bounds) in &rule_override.bounds {
            self.bounds.insert(field.clone(), *bounds);
        }
    }

    /// First reason the record fails these rules, if any.
    fn check(&self, record: &Record) -> Option<String> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|field| record.field(field).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Some(format!("missing required {}", missing.join(", ")));
        }
        if record.natural_key().is_none() {
            return Some("missing natural key".to_string());
        }

        self.bounds.iter().find_map(|(field, bounds)| {
            let value = record.field(field)?.as_number()?;
            (!bounds.contains(value)).then(|| {
                format!(
                    "{field} = {value} outside [{}, {}]",
                    bounds.min, bounds.max
                )
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub record: Record,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Accept,
    Partial,
    RejectAll,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityVerdict {
    pub accepted: Vec<Record>,
    pub rejected: Vec<Rejection>,
    pub issues: Vec<String>,
}

impl QualityVerdict {
    pub fn total(&self) -> usize {
        self.accepted.len() + self.rejected.len()
    }

    /// An empty batch is accepted: the source had nothing new.
    pub fn decision(&self) -> GateDecision {
        if self.total() == 0 {
            GateDecision::Accept
        } else if self.accepted.is_empty() {
            GateDecision::RejectAll
        } else if !self.rejected.is_empty() || !self.issues.is_empty() {
            GateDecision::Partial
        } else {
            GateDecision::Accept
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    rules: HashMap<RecordType, QualityRules>,
    duplicate_tolerance: f64,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl QualityGate {
    pub fn new(duplicate_tolerance: f64) -> Self {
        let rules = RecordType::ALL
            .into_iter()
            .map(|t| (t, QualityRules::defaults_for(t)))
            .collect();
        Self {
            rules,
            duplicate_tolerance,
        }
    }

    pub fn with_override(mut self, record_type: RecordType, rule_override: &RuleOverride) -> Self {
        self.rules
            .entry(record_type)
            .or_insert_with(|| QualityRules::defaults_for(record_type))
            .apply_override(rule_override);
        self
    }

    pub fn rules(&self, record_type: RecordType) -> Option<&QualityRules> {
        self.rules.get(&record_type)
    }

    pub fn validate(&self, record_type: RecordType, records: Vec<Record>) -> QualityVerdict {
        let total = records.len();
        let mut verdict = QualityVerdict::default();
        let mut seen = HashSet::new();
        let mut duplicates = 0usize;
        let fallback = QualityRules::defaults_for(record_type);
        let rules = self.rules.get(&record_type).unwrap_or(&fallback);

        for record in records {
            if let Some(key) = record.natural_key() {
                if !seen.insert(key) {
                    duplicates += 1;
                }
            }

            let reason = if record.record_type() != record_type {
                Some(format!("expected {record_type}, got {}", record.record_type()))
            } else {
                rules.check(&record)
            };
            match reason {
                Some(reason) => verdict.rejected.push(Rejection { record, reason }),
                None => verdict.accepted.push(record),
            }
        }

        if let Some(first) = verdict.rejected.first() {
            verdict.issues.push(format!(
                "{} of {total} records rejected (first: {})",
                verdict.rejected.len(),
                first.reason
            ));
        }

        if total > 0 {
            let ratio = duplicates as f64 / total as f64;
            if ratio > self.duplicate_tolerance {
                verdict.issues.push(format!(
                    "{duplicates} duplicate natural keys ({:.1}% of batch) exceed tolerance of {:.1}%",
                    ratio * 100.0,
                    self.duplicate_tolerance * 100.0
                ));
            }
        }

        verdict
    }
}
