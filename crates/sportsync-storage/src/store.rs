//! SQLite-backed result store: jobs, run history, collected records, and metric values.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sportsync_core::{
    Cadence, CollectionJob, CollectionResult, MetricValue, Record, RecordType, RunStatus,
    UnknownVariant, ValueOrigin,
};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("preparing database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
    #[error("record of type {found} cannot be stored as {expected}")]
    RecordTypeMismatch {
        expected: RecordType,
        found: RecordType,
    },
}

impl StoreError {
    fn corrupt(table: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            table,
            message: err.to_string(),
        }
    }
}

impl From<(&'static str, UnknownVariant)> for StoreError {
    fn from((table, err): (&'static str, UnknownVariant)) -> Self {
        Self::corrupt(table, err)
    }
}

/// A persisted [`CollectionResult`] with its store-assigned surrogate id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub id: i64,
    pub result: CollectionResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: i64,
    pub natural_key: String,
    pub source: String,
    pub collected_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub record: Record,
}

/// Durable store for run history and collected entities.
///
/// Writes go through a single async lock so concurrent runners never interleave
/// transactions; each record write is an upsert on its natural key.
#[derive(Debug, Clone)]
pub struct ResultStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl ResultStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Single-connection in-memory database; the connection is never recycled.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        MIGRATOR.run(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn save_job(&self, job: &CollectionJob) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO collection_jobs
                (job_id, name, record_type, source, cadence, enabled, last_run, next_run,
                 success_count, error_count, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(job_id) DO UPDATE SET
                name = excluded.name,
                record_type = excluded.record_type,
                source = excluded.source,
                cadence = excluded.cadence,
                enabled = excluded.enabled,
                last_run = excluded.last_run,
                next_run = excluded.next_run,
                success_count = excluded.success_count,
                error_count = excluded.error_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.name)
        .bind(job.record_type.as_str())
        .bind(&job.source)
        .bind(job.cadence.as_str())
        .bind(job.enabled)
        .bind(job.last_run)
        .bind(job.next_run)
        .bind(to_i64(job.success_count))
        .bind(to_i64(job.error_count))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persisted job state. `params` and `backup_metrics` live in configuration only.
    pub async fn load_jobs(&self) -> Result<Vec<CollectionJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, name, record_type, source, cadence, enabled, last_run, next_run,
                   success_count, error_count
            FROM collection_jobs
            ORDER BY job_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn append_result(&self, result: &CollectionResult) -> Result<i64, StoreError> {
        let errors = serde_json::to_string(&result.errors)?;
        let summary = serde_json::to_string(&result.summary)?;
        let _guard = self.write_lock.lock().await;
        let outcome = sqlx::query(
            r#"
            INSERT INTO collection_results
                (run_id, job_id, start_time, end_time, status, records_collected, errors, summary)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(result.run_id.to_string())
        .bind(&result.job_id)
        .bind(result.start_time)
        .bind(result.end_time)
        .bind(result.status.as_str())
        .bind(to_i64(result.records_collected as u64))
        .bind(errors)
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(outcome.last_insert_rowid())
    }

    pub async fn result_by_id(&self, id: i64) -> Result<Option<StoredResult>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, run_id, job_id, start_time, end_time, status, records_collected, errors, summary
            FROM collection_results
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(result_from_row).transpose()
    }

    /// Most recent results for a job, newest first.
    pub async fn recent_results(
        &self,
        job_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, job_id, start_time, end_time, status, records_collected, errors, summary
            FROM collection_results
            WHERE job_id = ?1
            ORDER BY start_time DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(job_id)
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }

    /// Upsert records by `(natural_key, source)`; records without a key are skipped.
    pub async fn upsert_records(
        &self,
        record_type: RecordType,
        source: &str,
        run_id: Uuid,
        collected_at: DateTime<Utc>,
        records: &[Record],
    ) -> Result<usize, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {table} (natural_key, source, collected_at, run_id, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(natural_key, source) DO UPDATE SET
                collected_at = excluded.collected_at,
                run_id = excluded.run_id,
                payload = excluded.payload
            "#,
            table = record_type.as_str()
        );

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for record in records {
            if record.record_type() != record_type {
                return Err(StoreError::RecordTypeMismatch {
                    expected: record_type,
                    found: record.record_type(),
                });
            }
            let Some(natural_key) = record.natural_key() else {
                continue;
            };
            sqlx::query(&sql)
                .bind(natural_key)
                .bind(source)
                .bind(collected_at)
                .bind(run_id.to_string())
                .bind(serde_json::to_string(record)?)
                .execute(&mut *tx)
                .await?;
            written += 1;
        }
        tx.commit().await?;
        debug!(%record_type, source, written, "upserted records");
        Ok(written)
    }

    pub async fn load_records(
        &self,
        record_type: RecordType,
        source: Option<&str>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT id, natural_key, source, collected_at, run_id, payload
            FROM {table}
            WHERE (?1 IS NULL OR source = ?1)
            ORDER BY natural_key, source
            "#,
            table = record_type.as_str()
        );
        let rows = sqlx::query(&sql)
            .bind(source)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| record_from_row(record_type, row))
            .collect()
    }

    /// Write a metric value. An estimated value never replaces an authoritative
    /// one; returns whether the row was written.
    pub async fn upsert_metric(&self, value: &MetricValue) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let outcome = sqlx::query(
            r#"
            INSERT INTO metric_values
                (record_type, natural_key, metric, value, confidence, origin, source, computed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(record_type, natural_key, metric) DO UPDATE SET
                value = excluded.value,
                confidence = excluded.confidence,
                origin = excluded.origin,
                source = excluded.source,
                computed_at = excluded.computed_at
            WHERE excluded.origin = 'authoritative' OR metric_values.origin = 'estimated'
            "#,
        )
        .bind(value.record_type.as_str())
        .bind(&value.natural_key)
        .bind(&value.metric)
        .bind(value.value)
        .bind(value.confidence.clamp(0.0, 1.0))
        .bind(value.origin.as_str())
        .bind(&value.source)
        .bind(value.computed_at)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    pub async fn metric_value(
        &self,
        record_type: RecordType,
        natural_key: &str,
        metric: &str,
    ) -> Result<Option<MetricValue>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT record_type, natural_key, metric, value, confidence, origin, source, computed_at
            FROM metric_values
            WHERE record_type = ?1 AND natural_key = ?2 AND metric = ?3
            "#,
        )
        .bind(record_type.as_str())
        .bind(natural_key)
        .bind(metric)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(metric_from_row).transpose()
    }

    /// Count of stored metric values per origin, for status output.
    pub async fn metric_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows = sqlx::query("SELECT origin, COUNT(*) AS n FROM metric_values GROUP BY origin")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let origin: String = row.try_get("origin")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(origin, n.max(0) as u64);
        }
        Ok(counts)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn parse_uuid(table: &'static str, raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::corrupt(table, e))
}

fn job_from_row(row: &SqliteRow) -> Result<CollectionJob, StoreError> {
    const TABLE: &str = "collection_jobs";
    let record_type: String = row.try_get("record_type")?;
    let cadence: String = row.try_get("cadence")?;
    let success_count: i64 = row.try_get("success_count")?;
    let error_count: i64 = row.try_get("error_count")?;
    Ok(CollectionJob {
        job_id: row.try_get("job_id")?,
        name: row.try_get("name")?,
        record_type: RecordType::from_str(&record_type).map_err(|e| (TABLE, e))?,
        source: row.try_get("source")?,
        cadence: Cadence::from_str(&cadence).map_err(|e| (TABLE, e))?,
        enabled: row.try_get("enabled")?,
        last_run: row.try_get("last_run")?,
        next_run: row.try_get("next_run")?,
        success_count: success_count.max(0) as u64,
        error_count: error_count.max(0) as u64,
        params: BTreeMap::new(),
        backup_metrics: Vec::new(),
    })
}

fn result_from_row(row: &SqliteRow) -> Result<StoredResult, StoreError> {
    const TABLE: &str = "collection_results";
    let run_id: String = row.try_get("run_id")?;
    let status: String = row.try_get("status")?;
    let records_collected: i64 = row.try_get("records_collected")?;
    let errors: String = row.try_get("errors")?;
    let summary: String = row.try_get("summary")?;
    Ok(StoredResult {
        id: row.try_get("id")?,
        result: CollectionResult {
            run_id: parse_uuid(TABLE, &run_id)?,
            job_id: row.try_get("job_id")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            status: RunStatus::from_str(&status).map_err(|e| (TABLE, e))?,
            records_collected: usize::try_from(records_collected)
                .map_err(|e| StoreError::corrupt(TABLE, e))?,
            errors: serde_json::from_str(&errors)?,
            summary: serde_json::from_str(&summary)?,
        },
    })
}

fn record_from_row(record_type: RecordType, row: &SqliteRow) -> Result<StoredRecord, StoreError> {
    let table = record_type.as_str();
    let run_id: String = row.try_get("run_id")?;
    let payload: String = row.try_get("payload")?;
    let record: Record = serde_json::from_str(&payload)?;
    if record.record_type() != record_type {
        return Err(StoreError::RecordTypeMismatch {
            expected: record_type,
            found: record.record_type(),
        });
    }
    Ok(StoredRecord {
        id: row.try_get("id")?,
        natural_key: row.try_get("natural_key")?,
        source: row.try_get("source")?,
        collected_at: row.try_get("collected_at")?,
        run_id: parse_uuid(table, &run_id)?,
        record,
    })
}

fn metric_from_row(row: &SqliteRow) -> Result<MetricValue, StoreError> {
    const TABLE: &str = "metric_values";
    let record_type: String = row.try_get("record_type")?;
    let origin: String = row.try_get("origin")?;
    Ok(MetricValue {
        record_type: RecordType::from_str(&record_type).map_err(|e| (TABLE, e))?,
        natural_key: row.try_get("natural_key")?,
        metric: row.try_get("metric")?,
        value: row.try_get("value")?,
        confidence: row.try_get("confidence")?,
        origin: ValueOrigin::from_str(&origin).map_err(|e| (TABLE, e))?,
        source: row.try_get("source")?,
        computed_at: row.try_get("computed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sportsync_core::{Game, StatLine};
    use tempfile::tempdir;

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, min, 0).single().unwrap()
    }

    fn stat(player: &str, goals: i64) -> Record {
        Record::Stat(StatLine {
            player_id: Some(player.to_string()),
            season: Some("2025".to_string()),
            goals: Some(goals),
            ..Default::default()
        })
    }

    fn metric(key: &str, value: f64, origin: ValueOrigin) -> MetricValue {
        MetricValue {
            record_type: RecordType::Stats,
            natural_key: key.to_string(),
            metric: "points".to_string(),
            value,
            confidence: if origin == ValueOrigin::Estimated { 0.5 } else { 1.0 },
            origin,
            source: "feed".to_string(),
            computed_at: ts(0),
        }
    }

    #[tokio::test]
    async fn collection_result_round_trips_field_for_field() {
        let dir = tempdir().expect("tempdir");
        let store = ResultStore::open(dir.path().join("db/sportsync.db"))
            .await
            .expect("open");

        let original = CollectionResult {
            run_id: Uuid::new_v4(),
            job_id: "liiga-stats".to_string(),
            start_time: Utc::now(),
            end_time: Utc::now() + chrono::Duration::milliseconds(1500),
            status: RunStatus::Partial,
            records_collected: 95,
            errors: vec!["5 of 100 records rejected".to_string()],
            summary: BTreeMap::from([("fetched".to_string(), 100), ("rejected".to_string(), 5)]),
        };
        let id = store.append_result(&original).await.expect("append");
        let stored = store.result_by_id(id).await.expect("read").expect("present");

        assert_eq!(stored.id, id);
        assert_eq!(stored.result, original);
    }

    #[tokio::test]
    async fn recent_results_are_newest_first() {
        let store = ResultStore::in_memory().await.expect("store");
        for (i, status) in [RunStatus::Success, RunStatus::Error, RunStatus::Success]
            .into_iter()
            .enumerate()
        {
            let result = CollectionResult {
                run_id: Uuid::new_v4(),
                job_id: "job".to_string(),
                start_time: ts(i as u32),
                end_time: ts(i as u32 + 1),
                status,
                records_collected: 0,
                errors: Vec::new(),
                summary: BTreeMap::new(),
            };
            store.append_result(&result).await.expect("append");
        }
        let recent = store.recent_results("job", 2).await.expect("recent");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].result.start_time, ts(2));
        assert_eq!(recent[1].result.status, RunStatus::Error);
    }

    #[tokio::test]
    async fn later_record_replaces_prior_row_for_same_key() {
        let store = ResultStore::in_memory().await.expect("store");
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        store
            .upsert_records(RecordType::Stats, "feed", first, ts(0), &[stat("p1", 3)])
            .await
            .expect("first");
        store
            .upsert_records(RecordType::Stats, "feed", second, ts(5), &[stat("p1", 4)])
            .await
            .expect("second");

        let rows = store.load_records(RecordType::Stats, None).await.expect("load");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].natural_key, "p1:2025");
        assert_eq!(rows[0].run_id, second);
        assert_eq!(rows[0].collected_at, ts(5));
        assert_eq!(rows[0].record, stat("p1", 4));
    }

    #[tokio::test]
    async fn same_key_from_two_sources_keeps_both_rows() {
        let store = ResultStore::in_memory().await.expect("store");
        store
            .upsert_records(RecordType::Stats, "nhl", Uuid::new_v4(), ts(0), &[stat("8478402", 30)])
            .await
            .expect("nhl");
        store
            .upsert_records(RecordType::Stats, "liiga", Uuid::new_v4(), ts(1), &[stat("8478402", 12)])
            .await
            .expect("liiga");

        let nhl = store.load_records(RecordType::Stats, Some("nhl")).await.expect("nhl rows");
        assert_eq!(nhl.len(), 1);
        assert_eq!(nhl[0].record, stat("8478402", 30));

        let all = store.load_records(RecordType::Stats, None).await.expect("all rows");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].source, "liiga");
        assert_eq!(all[1].source, "nhl");
    }

    #[tokio::test]
    async fn mismatched_record_type_is_refused() {
        let store = ResultStore::in_memory().await.expect("store");
        let game = Record::Game(Game {
            game_id: Some("g1".to_string()),
            ..Default::default()
        });
        let err = store
            .upsert_records(RecordType::Stats, "feed", Uuid::new_v4(), ts(0), &[game])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RecordTypeMismatch { .. }));
    }

    #[tokio::test]
    async fn estimates_never_overwrite_authoritative_metrics() {
        let store = ResultStore::in_memory().await.expect("store");

        assert!(store
            .upsert_metric(&metric("p1:2025", 40.0, ValueOrigin::Authoritative))
            .await
            .unwrap());
        assert!(!store
            .upsert_metric(&metric("p1:2025", 38.5, ValueOrigin::Estimated))
            .await
            .unwrap());
        let kept = store
            .metric_value(RecordType::Stats, "p1:2025", "points")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.value, 40.0);
        assert_eq!(kept.origin, ValueOrigin::Authoritative);

        assert!(store
            .upsert_metric(&metric("p2:2025", 10.0, ValueOrigin::Estimated))
            .await
            .unwrap());
        assert!(store
            .upsert_metric(&metric("p2:2025", 11.0, ValueOrigin::Estimated))
            .await
            .unwrap());
        assert!(store
            .upsert_metric(&metric("p2:2025", 12.0, ValueOrigin::Authoritative))
            .await
            .unwrap());
        let replaced = store
            .metric_value(RecordType::Stats, "p2:2025", "points")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replaced.value, 12.0);
        assert_eq!(replaced.origin, ValueOrigin::Authoritative);

        let counts = store.metric_counts().await.unwrap();
        assert_eq!(counts.get("authoritative"), Some(&2));
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_lose_unrelated_keys() {
        let dir = tempdir().expect("tempdir");
        let store = ResultStore::open(dir.path().join("sportsync.db"))
            .await
            .expect("open");

        let mut handles = Vec::new();
        for writer in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let records = (0..25)
                    .map(|i| stat(&format!("w{writer}-p{i}"), i))
                    .collect::<Vec<_>>();
                store
                    .upsert_records(RecordType::Stats, "feed", Uuid::new_v4(), Utc::now(), &records)
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 25);
        }
        let rows = store.load_records(RecordType::Stats, Some("feed")).await.unwrap();
        assert_eq!(rows.len(), 200);
    }

    #[tokio::test]
    async fn job_state_round_trips() {
        let store = ResultStore::in_memory().await.expect("store");
        let mut job = CollectionJob::new("j1", "Stats", RecordType::Stats, "feed", Cadence::Daily);
        job.record_completion(RunStatus::Success, ts(3));
        store.save_job(&job).await.unwrap();
        job.record_completion(RunStatus::Error, ts(9));
        store.save_job(&job).await.unwrap();

        let loaded = store.load_jobs().await.unwrap();
        assert_eq!(loaded, vec![job]);
    }
}
