//! YAML process configuration with load-time validation and env overrides.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sportsync_core::{Cadence, CollectionJob, RecordType};
use sportsync_storage::{BackoffPolicy, HttpClientConfig};
use thiserror::Error;

use crate::backup::BackupCalculator;
use crate::notify::{Channel, NotifyOn};
use crate::quality::RuleOverride;

pub const CONFIG_ENV: &str = "SPORTSYNC_CONFIG";
pub const DATABASE_ENV: &str = "SPORTSYNC_DATABASE";
pub const DEFAULT_CONFIG_PATH: &str = "sportsync.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Json,
    HtmlTable,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub source_id: String,
    pub base_url: String,
    pub format: SourceFormat,
    pub endpoints: BTreeMap<RecordType, String>,
    #[serde(default)]
    pub table_selector: Option<String>,
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub job_id: String,
    pub name: String,
    pub record_type: RecordType,
    pub source: String,
    pub cadence: Cadence,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub backup_metrics: Vec<String>,
}

impl JobConfig {
    pub fn to_job(&self) -> CollectionJob {
        let mut job = CollectionJob::new(
            &self.job_id,
            &self.name,
            self.record_type,
            &self.source,
            self.cadence,
        );
        job.enabled = self.enabled;
        job.params = self.params.clone();
        job.backup_metrics = self.backup_metrics.clone();
        job
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    #[serde(default)]
    pub notify_on: NotifyOn,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub tick_interval_seconds: u64,
    pub run_timeout_seconds: u64,
    pub duplicate_tolerance: f64,
    pub retry_max_attempts: usize,
    pub http_timeout_seconds: u64,
    pub max_concurrent_runs: usize,
    pub user_agent: String,
    pub default_rate_limit_seconds: f64,
    pub source_rate_limit_seconds: BTreeMap<String, f64>,
    pub sources: Vec<SourceConfig>,
    pub jobs: Vec<JobConfig>,
    pub notifications: NotificationConfig,
    pub quality: BTreeMap<RecordType, RuleOverride>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/sportsync.db"),
            tick_interval_seconds: 60,
            run_timeout_seconds: 300,
            duplicate_tolerance: 0.05,
            retry_max_attempts: 3,
            http_timeout_seconds: 30,
            max_concurrent_runs: 4,
            user_agent: "sportsync/0.1".to_string(),
            default_rate_limit_seconds: 1.0,
            source_rate_limit_seconds: BTreeMap::new(),
            sources: Vec::new(),
            jobs: Vec::new(),
            notifications: NotificationConfig::default(),
            quality: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text, path)
    }

    /// Config file from `--config`, else `SPORTSYNC_CONFIG`, else `sportsync.yaml`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(database) = std::env::var_os(DATABASE_ENV).filter(|v| !v.is_empty()) {
            self.database_path = PathBuf::from(database);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let catalog = BackupCalculator::default();

        if !(0.0..=1.0).contains(&self.duplicate_tolerance) {
            problems.push(format!(
                "duplicate_tolerance must be within [0, 1], got {}",
                self.duplicate_tolerance
            ));
        }
        for (name, value) in [
            ("tick_interval_seconds", self.tick_interval_seconds),
            ("run_timeout_seconds", self.run_timeout_seconds),
            ("http_timeout_seconds", self.http_timeout_seconds),
            ("retry_max_attempts", self.retry_max_attempts as u64),
            ("max_concurrent_runs", self.max_concurrent_runs as u64),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be at least 1"));
            }
        }
        if !is_interval(self.default_rate_limit_seconds) {
            problems.push(format!(
                "default_rate_limit_seconds must be a non-negative number, got {}",
                self.default_rate_limit_seconds
            ));
        }

        let mut sources: HashMap<&str, &SourceConfig> = HashMap::new();
        for source in &self.sources {
            if sources.insert(&source.source_id, source).is_some() {
                problems.push(format!("source `{}` is defined twice", source.source_id));
            }
            if source.base_url.trim().is_empty() {
                problems.push(format!("source `{}` has an empty base_url", source.source_id));
            }
            if source.endpoints.is_empty() {
                problems.push(format!("source `{}` declares no endpoints", source.source_id));
            }
            if source.format == SourceFormat::HtmlTable && source.table_selector.is_none() {
                problems.push(format!(
                    "source `{}` uses html_table but has no table_selector",
                    source.source_id
                ));
            }
        }

        for (source_id, seconds) in &self.source_rate_limit_seconds {
            if !sources.contains_key(source_id.as_str()) {
                problems.push(format!("rate limit given for unknown source `{source_id}`"));
            }
            if !is_interval(*seconds) {
                problems.push(format!(
                    "rate limit for `{source_id}` must be a non-negative number, got {seconds}"
                ));
            }
        }

        let mut job_ids = HashSet::new();
        for job in &self.jobs {
            if !job_ids.insert(job.job_id.as_str()) {
                problems.push(format!("job `{}` is defined twice", job.job_id));
            }
            match sources.get(job.source.as_str()) {
                None => problems.push(format!(
                    "job `{}` refers to unknown source `{}`",
                    job.job_id, job.source
                )),
                Some(source) if !source.endpoints.contains_key(&job.record_type) => {
                    problems.push(format!(
                        "job `{}`: source `{}` has no endpoint for {}",
                        job.job_id, job.source, job.record_type
                    ))
                }
                Some(_) => {}
            }
            for metric in &job.backup_metrics {
                match catalog.metric_record_type(metric) {
                    None => problems.push(format!(
                        "job `{}` lists unknown backup metric `{metric}`",
                        job.job_id
                    )),
                    Some(record_type) if record_type != job.record_type => problems.push(format!(
                        "job `{}`: metric `{metric}` applies to {record_type}, not {}",
                        job.job_id, job.record_type
                    )),
                    Some(_) => {}
                }
            }
        }

        for (record_type, rule_override) in &self.quality {
            let known = record_type.field_names();
            for field in rule_override.required.iter().flatten() {
                if !known.contains(&field.as_str()) {
                    problems.push(format!("quality.{record_type}: unknown required field `{field}`"));
                }
            }
            for (field, bounds) in &rule_override.bounds {
                if !record_type.is_numeric_field(field) {
                    problems.push(format!(
                        "quality.{record_type}: `{field}` is not a numeric field"
                    ));
                }
                if bounds.min > bounds.max {
                    problems.push(format!(
                        "quality.{record_type}: bounds for `{field}` have min > max"
                    ));
                }
            }
        }

        for channel in &self.notifications.channels {
            if let Channel::Slack { webhook_url } | Channel::Discord { webhook_url } = channel {
                if !webhook_url.starts_with("http://") && !webhook_url.starts_with("https://") {
                    problems.push(format!("{} webhook_url must be an http(s) url", channel.name()));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn collection_jobs(&self) -> Vec<CollectionJob> {
        self.jobs.iter().map(JobConfig::to_job).collect()
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_seconds),
            user_agent: Some(self.user_agent.clone()),
            default_min_interval: Duration::from_secs_f64(self.default_rate_limit_seconds),
            source_intervals: self
                .source_rate_limit_seconds
                .iter()
                .map(|(source, seconds)| (source.clone(), Duration::from_secs_f64(*seconds)))
                .collect(),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.retry_max_attempts,
            ..BackoffPolicy::default()
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }
}

fn is_interval(seconds: f64) -> bool {
    seconds.is_finite() && seconds >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
database_path: /var/lib/sportsync/data.db
tick_interval_seconds: 30
source_rate_limit_seconds:
  nhl: 1
  liiga: 3.5
sources:
  - source_id: nhl
    base_url: https://api.nhl.test/v1
    format: json
    endpoints:
      stats: seasons/{season}/skaters
      live_games: scores/now
  - source_id: liiga
    base_url: https://liiga.test
    format: html_table
    table_selector: table.players
    columns:
      Pelaaja: player_id
    endpoints:
      players: pelaajat
jobs:
  - job_id: nhl-stats
    name: NHL skater stats
    record_type: stats
    source: nhl
    cadence: daily
    params:
      season: "20252026"
    backup_metrics: [points, corsi]
  - job_id: liiga-players
    name: Liiga rosters
    record_type: players
    source: liiga
    cadence: weekly
    enabled: false
notifications:
  notify_on: failures
  channels:
    - kind: discord
      webhook_url: https://discord.test/hook
    - kind: log
quality:
  stats:
    bounds:
      goals: { min: 0, max: 120 }
"#;

    fn parse(text: &str) -> Result<AppConfig, ConfigError> {
        AppConfig::from_yaml_str(text, Path::new("test.yaml"))
    }

    #[test]
    fn sample_config_loads_with_defaults_filled_in() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.tick_interval(), Duration::from_secs(30));
        assert_eq!(config.run_timeout(), Duration::from_secs(300));
        assert_eq!(config.duplicate_tolerance, 0.05);
        assert_eq!(config.backoff().max_attempts, 3);
        assert_eq!(config.notifications.notify_on, NotifyOn::Failures);

        let jobs = config.collection_jobs();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].enabled);
        assert!(!jobs[1].enabled);
        assert_eq!(jobs[0].params["season"], "20252026");
        assert_eq!(jobs[0].cadence, Cadence::Daily);

        let http = config.http_client_config();
        assert_eq!(http.source_intervals["liiga"], Duration::from_millis(3500));
        assert_eq!(http.default_min_interval, Duration::from_secs(1));
        assert_eq!(config.source("liiga").unwrap().format, SourceFormat::HtmlTable);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse("tick_interval_seconds: 5\ntick_intervall: 6\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let err = parse(
            "jobs:\n  - job_id: a\n    name: A\n    record_type: stats\n    source: x\n    cadence: monthly\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn cross_references_are_validated() {
        let text = r#"
duplicate_tolerance: 1.5
retry_max_attempts: 0
source_rate_limit_seconds:
  ghost: 2
sources:
  - source_id: feed
    base_url: https://feed.test
    format: html_table
    endpoints:
      games: games
jobs:
  - job_id: a
    name: A
    record_type: stats
    source: feed
    cadence: hourly
    backup_metrics: [win_probability, fenwick]
  - job_id: a
    name: A again
    record_type: games
    source: nowhere
    cadence: hourly
quality:
  games:
    required: [game_id, venue]
    bounds:
      home_team: { min: 0, max: 1 }
"#;
        let ConfigError::Invalid(problems) = parse(text).unwrap_err() else {
            panic!("expected validation failure");
        };
        let joined = problems.join("\n");
        for needle in [
            "duplicate_tolerance",
            "retry_max_attempts must be at least 1",
            "no table_selector",
            "unknown source `ghost`",
            "job `a` is defined twice",
            "no endpoint for stats",
            "unknown source `nowhere`",
            "metric `win_probability` applies to live_games",
            "unknown backup metric `fenwick`",
            "unknown required field `venue`",
            "`home_team` is not a numeric field",
        ] {
            assert!(joined.contains(needle), "missing `{needle}` in:\n{joined}");
        }
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse("{}").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn explicit_path_wins() {
        let path = AppConfig::resolve_path(Some(Path::new("/etc/sportsync.yaml")));
        assert_eq!(path, PathBuf::from("/etc/sportsync.yaml"));
    }

    #[test]
    fn load_reads_from_disk_and_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sportsync.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.tick_interval_seconds, 30);

        let missing = dir.path().join("absent.yaml");
        match AppConfig::load(&missing) {
            Err(ConfigError::Read { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected read error, got {other:?}"),
        }
    }
}
