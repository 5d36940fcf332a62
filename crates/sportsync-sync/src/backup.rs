//! Local estimates for metrics whose authoritative source is unavailable.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sportsync_core::{MetricValue, Record, RecordType, ValueOrigin};
use thiserror::Error;

/// League-average shooting percentage used to turn shots into expected goals.
pub const LEAGUE_SHOOTING_RATE: f64 = 0.095;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackupError {
    #[error("unknown metric `{0}`")]
    UnknownMetric(String),
    #[error("metric `{0}` has no backup estimator")]
    NoEstimator(String),
    #[error("metric `{metric}` needs input `{input}`")]
    MissingInput { metric: String, input: String },
    #[error("metric `{metric}` is undefined for these inputs")]
    Undefined { metric: String },
    #[error("metric `{metric}` applies to {expected}, not {found}")]
    WrongRecordType {
        metric: String,
        expected: RecordType,
        found: RecordType,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub value: f64,
    pub confidence: f64,
}

pub trait MetricEstimator: Send + Sync {
    fn metric(&self) -> &str;
    fn record_type(&self) -> RecordType;
    fn inputs(&self) -> &[&'static str];
    fn confidence(&self) -> f64;
    /// `None` when the inputs are present but the metric is undefined for them.
    fn compute(&self, inputs: &BTreeMap<String, f64>) -> Option<f64>;
}

/// Estimator backed by a closed-form expression over named inputs.
pub struct FormulaEstimator {
    metric: &'static str,
    record_type: RecordType,
    inputs: &'static [&'static str],
    confidence: f64,
    formula: fn(&[f64]) -> Option<f64>,
}

impl MetricEstimator for FormulaEstimator {
    fn metric(&self) -> &str {
        self.metric
    }

    fn record_type(&self) -> RecordType {
        self.record_type
    }

    fn inputs(&self) -> &[&'static str] {
        self.inputs
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn compute(&self, inputs: &BTreeMap<String, f64>) -> Option<f64> {
        let values: Option<Vec<f64>> = self.inputs.iter().map(|i| inputs.get(*i).copied()).collect();
        (self.formula)(&values?).filter(|v| v.is_finite())
    }
}

fn win_probability(lead: f64, period: f64) -> f64 {
    let weight = 0.6 * period.clamp(1.0, 5.0);
    1.0 / (1.0 + (-weight * lead).exp())
}

fn shipped_estimators() -> Vec<FormulaEstimator> {
    vec![
        FormulaEstimator {
            metric: "points",
            record_type: RecordType::Stats,
            inputs: &["goals", "assists"],
            confidence: 0.95,
            formula: |v| Some(v[0] + v[1]),
        },
        FormulaEstimator {
            metric: "points_per_game",
            record_type: RecordType::Stats,
            inputs: &["goals", "assists", "games_played"],
            confidence: 0.9,
            formula: |v| (v[2] > 0.0).then(|| (v[0] + v[1]) / v[2]),
        },
        FormulaEstimator {
            metric: "expected_goals",
            record_type: RecordType::Stats,
            inputs: &["shots"],
            confidence: 0.5,
            formula: |v| Some(v[0] * LEAGUE_SHOOTING_RATE),
        },
        FormulaEstimator {
            metric: "goal_differential",
            record_type: RecordType::Games,
            inputs: &["home_score", "away_score"],
            confidence: 0.99,
            formula: |v| Some(v[0] - v[1]),
        },
        FormulaEstimator {
            metric: "win_probability",
            record_type: RecordType::LiveGames,
            inputs: &["home_score", "away_score", "period"],
            confidence: 0.4,
            formula: |v| Some(win_probability(v[0] - v[1], v[2])),
        },
    ]
}

/// Metrics that are tracked but cannot be approximated from local data.
const WITHOUT_ESTIMATOR: &[(&str, RecordType)] = &[("corsi", RecordType::Stats)];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchEstimate {
    pub values: Vec<MetricValue>,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct BackupCalculator {
    estimators: BTreeMap<String, Arc<dyn MetricEstimator>>,
    declared: BTreeMap<String, RecordType>,
}

impl std::fmt::Debug for BackupCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupCalculator")
            .field("estimators", &self.estimators.keys().collect::<Vec<_>>())
            .field("declared", &self.declared)
            .finish()
    }
}

impl Default for BackupCalculator {
    fn default() -> Self {
        let mut calculator = Self {
            estimators: BTreeMap::new(),
            declared: WITHOUT_ESTIMATOR
                .iter()
                .map(|(metric, record_type)| (metric.to_string(), *record_type))
                .collect(),
        };
        for estimator in shipped_estimators() {
            calculator.register(Arc::new(estimator));
        }
        calculator
    }
}

impl BackupCalculator {
    pub fn register(&mut self, estimator: Arc<dyn MetricEstimator>) {
        let metric = estimator.metric().to_string();
        self.declared.insert(metric.clone(), estimator.record_type());
        self.estimators.insert(metric, estimator);
    }

    /// Record type a metric belongs to, whether or not it can be estimated.
    pub fn metric_record_type(&self, metric: &str) -> Option<RecordType> {
        self.declared.get(metric).copied()
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.declared.keys().map(String::as_str)
    }

    fn estimator(&self, metric: &str) -> Result<&Arc<dyn MetricEstimator>, BackupError> {
        match self.estimators.get(metric) {
            Some(estimator) => Ok(estimator),
            None if self.declared.contains_key(metric) => {
                Err(BackupError::NoEstimator(metric.to_string()))
            }
            None => Err(BackupError::UnknownMetric(metric.to_string())),
        }
    }

    pub fn estimate(
        &self,
        metric: &str,
        inputs: &BTreeMap<String, f64>,
    ) -> Result<Estimate, BackupError> {
        let estimator = self.estimator(metric)?;
        if let Some(missing) = estimator.inputs().iter().find(|i| !inputs.contains_key(**i)) {
            return Err(BackupError::MissingInput {
                metric: metric.to_string(),
                input: missing.to_string(),
            });
        }
        let value = estimator
            .compute(inputs)
            .ok_or_else(|| BackupError::Undefined {
                metric: metric.to_string(),
            })?;
        Ok(Estimate {
            value,
            confidence: estimator.confidence().clamp(0.0, 1.0),
        })
    }

    /// Estimate one metric for every keyed record. Records lacking inputs are
    /// counted as skipped; an unknown or unestimable metric fails the batch.
    pub fn estimate_records(
        &self,
        metric: &str,
        record_type: RecordType,
        source: &str,
        records: &[Record],
        computed_at: DateTime<Utc>,
    ) -> Result<BatchEstimate, BackupError> {
        let estimator = self.estimator(metric)?;
        if estimator.record_type() != record_type {
            return Err(BackupError::WrongRecordType {
                metric: metric.to_string(),
                expected: estimator.record_type(),
                found: record_type,
            });
        }

        let mut batch = BatchEstimate::default();
        for record in records {
            let Some(natural_key) = record.natural_key() else {
                batch.skipped += 1;
                continue;
            };
            match self.estimate(metric, &record.numeric_fields()) {
                Ok(estimate) => batch.values.push(MetricValue {
                    record_type,
                    natural_key,
                    metric: metric.to_string(),
                    value: estimate.value,
                    confidence: estimate.confidence,
                    origin: ValueOrigin::Estimated,
                    source: source.to_string(),
                    computed_at,
                }),
                Err(BackupError::MissingInput { .. } | BackupError::Undefined { .. }) => {
                    batch.skipped += 1;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sportsync_core::StatLine;

    fn inputs(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn shipped_metrics_estimate_with_declared_confidence() {
        let calc = BackupCalculator::default();

        let points = calc
            .estimate("points", &inputs(&[("goals", 20.0), ("assists", 31.0)]))
            .unwrap();
        assert_eq!(points, Estimate { value: 51.0, confidence: 0.95 });

        let xg = calc.estimate("expected_goals", &inputs(&[("shots", 200.0)])).unwrap();
        assert!((xg.value - 19.0).abs() < 1e-9);
        assert_eq!(xg.confidence, 0.5);

        let diff = calc
            .estimate("goal_differential", &inputs(&[("home_score", 2.0), ("away_score", 5.0)]))
            .unwrap();
        assert_eq!(diff.value, -3.0);
    }

    #[test]
    fn win_probability_favours_the_leader_more_late() {
        let calc = BackupCalculator::default();
        let early = calc
            .estimate(
                "win_probability",
                &inputs(&[("home_score", 1.0), ("away_score", 0.0), ("period", 1.0)]),
            )
            .unwrap();
        let late = calc
            .estimate(
                "win_probability",
                &inputs(&[("home_score", 1.0), ("away_score", 0.0), ("period", 3.0)]),
            )
            .unwrap();
        assert!(early.value > 0.5);
        assert!(late.value > early.value);
        assert!(late.value < 1.0);

        let tied = calc
            .estimate(
                "win_probability",
                &inputs(&[("home_score", 2.0), ("away_score", 2.0), ("period", 2.0)]),
            )
            .unwrap();
        assert_eq!(tied.value, 0.5);
    }

    #[test]
    fn failures_are_typed() {
        let calc = BackupCalculator::default();
        assert_eq!(
            calc.estimate("corsi", &BTreeMap::new()),
            Err(BackupError::NoEstimator("corsi".into()))
        );
        assert_eq!(
            calc.estimate("fenwick", &BTreeMap::new()),
            Err(BackupError::UnknownMetric("fenwick".into()))
        );
        assert_eq!(
            calc.estimate("points", &inputs(&[("goals", 1.0)])),
            Err(BackupError::MissingInput {
                metric: "points".into(),
                input: "assists".into()
            })
        );
        assert_eq!(
            calc.estimate(
                "points_per_game",
                &inputs(&[("goals", 1.0), ("assists", 1.0), ("games_played", 0.0)])
            ),
            Err(BackupError::Undefined {
                metric: "points_per_game".into()
            })
        );
    }

    #[test]
    fn record_batches_skip_records_without_inputs() {
        let calc = BackupCalculator::default();
        let records = vec![
            Record::Stat(StatLine {
                player_id: Some("p1".into()),
                season: Some("2025".into()),
                goals: Some(10),
                assists: Some(12),
                ..Default::default()
            }),
            Record::Stat(StatLine {
                player_id: Some("p2".into()),
                season: Some("2025".into()),
                goals: Some(4),
                ..Default::default()
            }),
        ];
        let batch = calc
            .estimate_records("points", RecordType::Stats, "feed", &records, Utc::now())
            .unwrap();

        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.values.len(), 1);
        let value = &batch.values[0];
        assert_eq!(value.natural_key, "p1:2025");
        assert_eq!(value.value, 22.0);
        assert_eq!(value.origin, ValueOrigin::Estimated);

        let err = calc
            .estimate_records("goal_differential", RecordType::Stats, "feed", &records, Utc::now())
            .unwrap_err();
        assert!(matches!(err, BackupError::WrongRecordType { .. }));
    }

    #[test]
    fn catalog_knows_record_types() {
        let calc = BackupCalculator::default();
        assert_eq!(calc.metric_record_type("corsi"), Some(RecordType::Stats));
        assert_eq!(calc.metric_record_type("win_probability"), Some(RecordType::LiveGames));
        assert_eq!(calc.metric_record_type("nope"), None);
        assert_eq!(calc.metrics().count(), 6);
    }
}
