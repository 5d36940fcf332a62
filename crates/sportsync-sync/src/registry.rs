//! Owned, synchronized job table: due detection, run claims, completion.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use sportsync_core::{CollectionJob, CollectionResult};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown job `{0}`")]
    UnknownJob(String),
    #[error("job `{0}` is already registered")]
    DuplicateJob(String),
    #[error("job `{0}` is already running")]
    AlreadyRunning(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub job: CollectionJob,
    pub state: JobState,
}

#[derive(Debug)]
struct Entry {
    job: CollectionJob,
    state: JobState,
}

/// Jobs are never removed; disabling is the only lifecycle change.
#[derive(Debug, Default)]
pub struct JobRegistry {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl JobRegistry {
    pub fn new(jobs: impl IntoIterator<Item = CollectionJob>) -> Result<Self, RegistryError> {
        let registry = Self::default();
        for job in jobs {
            registry.register(job)?;
        }
        Ok(registry)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, job: CollectionJob) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        if entries.contains_key(&job.job_id) {
            return Err(RegistryError::DuplicateJob(job.job_id));
        }
        entries.insert(
            job.job_id.clone(),
            Entry {
                job,
                state: JobState::Idle,
            },
        );
        Ok(())
    }

    /// Carry persisted run state (timestamps and counters) onto configured jobs.
    /// `next_run` follows the configured cadence, which may have changed.
    pub fn merge_persisted(&self, persisted: &[CollectionJob]) -> usize {
        let mut entries = self.lock();
        let mut merged = 0;
        for stored in persisted {
            if let Some(entry) = entries.get_mut(&stored.job_id) {
                entry.job.last_run = stored.last_run;
                entry.job.next_run = match stored.last_run {
                    Some(last_run) => Some(entry.job.cadence.next_after(last_run)),
                    None => stored.next_run,
                };
                entry.job.success_count = stored.success_count;
                entry.job.error_count = stored.error_count;
                merged += 1;
            }
        }
        merged
    }

    pub fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<CollectionJob, RegistryError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::UnknownJob(job_id.to_string()))?;
        entry.job.enabled = enabled;
        Ok(entry.job.clone())
    }

    /// Atomically mark every idle, due job as running and return them.
    pub fn claim_due(&self, now: DateTime<Utc>) -> Vec<CollectionJob> {
        let mut entries = self.lock();
        entries
            .values_mut()
            .filter(|entry| entry.state == JobState::Idle && entry.job.is_due(now))
            .map(|entry| {
                entry.state = JobState::Running;
                entry.job.clone()
            })
            .collect()
    }

    /// Claim one job regardless of its schedule.
    pub fn try_claim(&self, job_id: &str) -> Result<CollectionJob, RegistryError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::UnknownJob(job_id.to_string()))?;
        if entry.state == JobState::Running {
            return Err(RegistryError::AlreadyRunning(job_id.to_string()));
        }
        entry.state = JobState::Running;
        Ok(entry.job.clone())
    }

    pub fn complete(
        &self,
        job_id: &str,
        result: &CollectionResult,
    ) -> Result<CollectionJob, RegistryError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(job_id)
            .ok_or_else(|| RegistryError::UnknownJob(job_id.to_string()))?;
        entry.job.record_completion(result.status, result.end_time);
        entry.state = JobState::Idle;
        Ok(entry.job.clone())
    }

    pub fn get(&self, job_id: &str) -> Option<JobSnapshot> {
        self.lock().get(job_id).map(|entry| JobSnapshot {
            job: entry.job.clone(),
            state: entry.state,
        })
    }

    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        self.lock()
            .values()
            .map(|entry| JobSnapshot {
                job: entry.job.clone(),
                state: entry.state,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, TimeZone};
    use sportsync_core::{Cadence, RecordType, RunStatus};
    use uuid::Uuid;

    use super::*;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 2, h, 0, 0).single().unwrap()
    }

    fn job(id: &str, cadence: Cadence) -> CollectionJob {
        CollectionJob::new(id, id, RecordType::Games, "feed", cadence)
    }

    fn finished(job_id: &str, status: RunStatus, end_time: DateTime<Utc>) -> CollectionResult {
        CollectionResult {
            run_id: Uuid::new_v4(),
            job_id: job_id.into(),
            start_time: end_time - Duration::seconds(30),
            end_time,
            status,
            records_collected: 0,
            errors: Vec::new(),
            summary: BTreeMap::new(),
        }
    }

    #[test]
    fn running_jobs_are_never_claimed_twice() {
        let registry = JobRegistry::new([job("a", Cadence::Hourly), job("b", Cadence::Daily)]).unwrap();

        let first = registry.claim_due(ts(1));
        assert_eq!(first.len(), 2);
        assert!(registry.claim_due(ts(2)).is_empty());
        assert_eq!(
            registry.try_claim("a"),
            Err(RegistryError::AlreadyRunning("a".into()))
        );

        registry.complete("a", &finished("a", RunStatus::Success, ts(1))).unwrap();
        assert!(registry.claim_due(ts(1)).is_empty());
        let again = registry.claim_due(ts(2));
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].job_id, "a");
    }

    #[test]
    fn completion_reschedules_from_end_time() {
        let registry = JobRegistry::new([job("daily", Cadence::Daily)]).unwrap();
        registry.try_claim("daily").unwrap();
        let end = ts(6) + Duration::seconds(17);
        let updated = registry
            .complete("daily", &finished("daily", RunStatus::Error, end))
            .unwrap();

        assert_eq!(updated.next_run, Some(end + Duration::hours(24)));
        assert_eq!(updated.error_count, 1);
        assert_eq!(registry.get("daily").unwrap().state, JobState::Idle);
    }

    #[test]
    fn disabled_jobs_are_not_due_but_stay_registered() {
        let registry = JobRegistry::new([job("a", Cadence::Hourly)]).unwrap();
        registry.set_enabled("a", false).unwrap();
        assert!(registry.claim_due(ts(3)).is_empty());
        assert_eq!(registry.snapshot().len(), 1);
        assert!(matches!(
            registry.set_enabled("zzz", true),
            Err(RegistryError::UnknownJob(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let registry = JobRegistry::new([job("a", Cadence::Hourly)]).unwrap();
        assert_eq!(
            registry.register(job("a", Cadence::Daily)),
            Err(RegistryError::DuplicateJob("a".into()))
        );
        registry.register(job("b", Cadence::Weekly)).unwrap();
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn persisted_state_is_merged_onto_configured_jobs() {
        let registry = JobRegistry::new([job("a", Cadence::Hourly)]).unwrap();
        let mut stored = job("a", Cadence::Hourly);
        stored.record_completion(RunStatus::Success, ts(4));
        stored.enabled = false;
        let orphan = job("gone", Cadence::Daily);

        assert_eq!(registry.merge_persisted(&[stored, orphan]), 1);
        let merged = registry.get("a").unwrap().job;
        assert_eq!(merged.next_run, Some(ts(5)));
        assert_eq!(merged.success_count, 1);
        assert!(merged.enabled);
        assert!(!registry.claim_due(ts(4)).iter().any(|j| j.job_id == "a"));
    }

    #[test]
    fn merge_recomputes_next_run_from_the_configured_cadence() {
        let registry = JobRegistry::new([job("a", Cadence::Hourly)]).unwrap();
        let mut stored = job("a", Cadence::Weekly);
        stored.record_completion(RunStatus::Success, ts(0));
        assert_eq!(stored.next_run, Some(ts(0) + Duration::weeks(1)));

        registry.merge_persisted(&[stored]);
        let merged = registry.get("a").unwrap().job;
        assert_eq!(merged.cadence, Cadence::Hourly);
        assert_eq!(merged.last_run, Some(ts(0)));
        assert_eq!(merged.next_run, Some(ts(0) + Duration::hours(1)));
    }
}
