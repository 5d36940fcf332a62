//! Executes one job end to end and always produces a [`CollectionResult`].

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use sportsync_adapters::{AdapterContext, AdapterRegistry};
use sportsync_core::{
    CollectionJob, CollectionResult, MetricValue, Record, RunStatus, ValueOrigin,
};
use sportsync_storage::ResultStore;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backup::BackupCalculator;
use crate::notify::NotificationChain;
use crate::quality::{GateDecision, QualityGate};

/// Summary key set when the run hit its timeout.
pub const TIMED_OUT: &str = "timed_out";

#[derive(Debug, Default)]
struct Outcome {
    status: Option<RunStatus>,
    records_collected: usize,
    errors: Vec<String>,
    summary: BTreeMap<String, u64>,
}

impl Outcome {
    fn count(&mut self, key: &str, n: usize) {
        *self.summary.entry(key.to_string()).or_default() += n as u64;
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.status = Some(RunStatus::Error);
        self.errors.push(message.into());
    }

    fn timed_out(limit: Duration) -> Self {
        let mut outcome = Self::default();
        outcome.fail(format!("run timed out after {}s", limit.as_secs_f64()));
        outcome.count(TIMED_OUT, 1);
        outcome
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[derive(Debug, Clone)]
pub struct CollectionRunner {
    adapters: AdapterRegistry,
    gate: QualityGate,
    backup: BackupCalculator,
    store: ResultStore,
    notifier: Arc<NotificationChain>,
    run_timeout: Duration,
}

impl CollectionRunner {
    pub fn new(
        adapters: AdapterRegistry,
        gate: QualityGate,
        backup: BackupCalculator,
        store: ResultStore,
        notifier: Arc<NotificationChain>,
        run_timeout: Duration,
    ) -> Self {
        Self {
            adapters,
            gate,
            backup,
            store,
            notifier,
            run_timeout,
        }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Run one job. Adapter errors, panics and timeouts become `status=error`;
    /// the result is appended to the store and announced before returning.
    ///
    /// The run timeout covers everything up to recording the result; a run cut
    /// off by it gets no backup estimates. Notification is bounded by each
    /// channel's own request timeout.
    pub async fn run(&self, job: &CollectionJob) -> CollectionResult {
        let run_id = Uuid::new_v4();
        let start_time = Utc::now();
        let span = info_span!(
            "collection_run",
            %run_id,
            job_id = %job.job_id,
            source = %job.source,
            record_type = %job.record_type
        );

        async {
            info!("run started");
            let execute = self.execute(run_id, job);
            let outcome = match tokio::time::timeout(self.run_timeout, execute).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(timeout = ?self.run_timeout, "run timed out");
                    Outcome::timed_out(self.run_timeout)
                }
            };
            let result = CollectionResult {
                run_id,
                job_id: job.job_id.clone(),
                start_time,
                end_time: Utc::now(),
                status: outcome.status.unwrap_or(RunStatus::Success),
                records_collected: outcome.records_collected,
                errors: outcome.errors,
                summary: outcome.summary,
            };

            if let Err(err) = self.store.append_result(&result).await {
                error!(error = %err, "failed to persist collection result");
            }
            self.notifier.notify_result(job, &result).await;
            info!(
                status = %result.status,
                records = result.records_collected,
                errors = result.errors.len(),
                elapsed_ms = result.elapsed().num_milliseconds(),
                "run finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, run_id: Uuid, job: &CollectionJob) -> Outcome {
        let mut outcome = Outcome::default();

        let Some(adapter) = self.adapters.get(&job.source) else {
            outcome.fail(format!("no adapter registered for source `{}`", job.source));
            self.fall_back(job, &mut outcome).await;
            return outcome;
        };

        let ctx = AdapterContext::new(run_id, job.params.clone());
        let collect = AssertUnwindSafe(adapter.collect(&ctx, job.record_type)).catch_unwind();
        let records = match collect.await {
            Ok(Ok(records)) => records,
            Ok(Err(err)) => {
                warn!(error = %err, "collection failed");
                outcome.fail(err.to_string());
                self.fall_back(job, &mut outcome).await;
                return outcome;
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = message, "adapter panicked");
                outcome.fail(format!("adapter panicked: {message}"));
                self.fall_back(job, &mut outcome).await;
                return outcome;
            }
        };

        outcome.count("fetched", records.len());
        let verdict = self.gate.validate(job.record_type, records);
        let decision = verdict.decision();
        outcome.count("accepted", verdict.accepted.len());
        outcome.count("rejected", verdict.rejected.len());
        outcome.errors.extend(verdict.issues);

        match decision {
            GateDecision::RejectAll => {
                outcome.status = Some(RunStatus::Error);
                return outcome;
            }
            GateDecision::Partial => outcome.status = Some(RunStatus::Partial),
            GateDecision::Accept => outcome.status = Some(RunStatus::Success),
        }

        let collected_at = Utc::now();
        match self
            .store
            .upsert_records(job.record_type, &job.source, run_id, collected_at, &verdict.accepted)
            .await
        {
            Ok(stored) => {
                outcome.count("stored", stored);
                outcome.records_collected = stored;
                if stored < verdict.accepted.len() {
                    let dropped = verdict.accepted.len() - stored;
                    warn!(dropped, "accepted records were not stored");
                    outcome.errors.push(format!(
                        "{dropped} of {} accepted records had no natural key and were not stored",
                        verdict.accepted.len()
                    ));
                }
            }
            Err(err) => {
                error!(error = %err, "persisting records failed");
                outcome.fail(format!("persisting records failed: {err}"));
                return outcome;
            }
        }

        let metrics = authoritative_metrics(job, &verdict.accepted, collected_at);
        let mut written = 0;
        for value in &metrics {
            match self.store.upsert_metric(value).await {
                Ok(_) => written += 1,
                Err(err) => {
                    warn!(error = %err, metric = %value.metric, "persisting metric failed");
                    outcome.errors.push(format!("persisting metric {} failed: {err}", value.metric));
                }
            }
        }
        if written > 0 {
            outcome.count("metrics", written);
        }
        if outcome.status == Some(RunStatus::Success) && !outcome.errors.is_empty() {
            outcome.status = Some(RunStatus::Partial);
        }
        outcome
    }

    /// Estimate the job's backup metrics from locally stored records. The run
    /// status stays `error`; estimates never replace authoritative values.
    async fn fall_back(&self, job: &CollectionJob, outcome: &mut Outcome) {
        if job.backup_metrics.is_empty() {
            return;
        }
        let stored = match self.store.load_records(job.record_type, Some(job.source.as_str())).await {
            Ok(stored) => stored,
            Err(err) => {
                outcome.errors.push(format!("loading local records for backup failed: {err}"));
                return;
            }
        };
        let records: Vec<Record> = stored.into_iter().map(|s| s.record).collect();
        let computed_at = Utc::now();

        for metric in &job.backup_metrics {
            let batch = match self.backup.estimate_records(
                metric,
                job.record_type,
                &job.source,
                &records,
                computed_at,
            ) {
                Ok(batch) => batch,
                Err(err) => {
                    outcome.errors.push(format!("backup: {err}"));
                    continue;
                }
            };
            outcome.count("estimate_skipped", batch.skipped);
            for value in &batch.values {
                match self.store.upsert_metric(value).await {
                    Ok(true) => outcome.count("estimated", 1),
                    Ok(false) => outcome.count("authoritative_kept", 1),
                    Err(err) => outcome
                        .errors
                        .push(format!("backup: persisting {metric} failed: {err}")),
                }
            }
        }
        info!(
            estimated = outcome.summary.get("estimated").copied().unwrap_or(0),
            "backup estimates written"
        );
    }
}

/// Metric values present verbatim in accepted records.
fn authoritative_metrics(
    job: &CollectionJob,
    records: &[Record],
    computed_at: chrono::DateTime<Utc>,
) -> Vec<MetricValue> {
    if job.backup_metrics.is_empty() {
        return Vec::new();
    }
    let mut values = Vec::new();
    for record in records {
        let Some(natural_key) = record.natural_key() else {
            continue;
        };
        let fields = record.numeric_fields();
        for metric in &job.backup_metrics {
            if let Some(value) = fields.get(metric) {
                values.push(MetricValue {
                    record_type: job.record_type,
                    natural_key: natural_key.clone(),
                    metric: metric.clone(),
                    value: *value,
                    confidence: 1.0,
                    origin: ValueOrigin::Authoritative,
                    source: job.source.clone(),
                    computed_at,
                });
            }
        }
    }
    values
}
