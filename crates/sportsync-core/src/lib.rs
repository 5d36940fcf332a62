//! Core domain model for sportsync: collection jobs, run results, and collected records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Players,
    Games,
    LiveGames,
    Stats,
}

impl RecordType {
    pub const ALL: [RecordType; 4] = [
        RecordType::Players,
        RecordType::Games,
        RecordType::LiveGames,
        RecordType::Stats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Players => "players",
            Self::Games => "games",
            Self::LiveGames => "live_games",
            Self::Stats => "stats",
        }
    }

    /// Field names a record of this type can expose to validation rules.
    pub fn field_names(&self) -> &'static [&'static str] {
        match self {
            Self::Players => &[
                "player_id",
                "name",
                "team",
                "position",
                "season",
                "age",
                "birth_year",
            ],
            Self::Games => &[
                "game_id",
                "season",
                "date",
                "home_team",
                "away_team",
                "home_score",
                "away_score",
                "status",
            ],
            Self::LiveGames => &[
                "game_id",
                "home_team",
                "away_team",
                "home_score",
                "away_score",
                "period",
                "clock",
            ],
            Self::Stats => &[
                "player_id",
                "season",
                "team",
                "games_played",
                "goals",
                "assists",
                "points",
                "shots",
                "plus_minus",
                "penalty_minutes",
                "expected_goals",
            ],
        }
    }

    pub fn is_numeric_field(&self, name: &str) -> bool {
        let numeric: &[&str] = match self {
            Self::Players => &["age", "birth_year"],
            Self::Games => &["home_score", "away_score"],
            Self::LiveGames => &["home_score", "away_score", "period"],
            Self::Stats => &[
                "games_played",
                "goals",
                "assists",
                "points",
                "shots",
                "plus_minus",
                "penalty_minutes",
                "expected_goals",
            ],
        };
        numeric.contains(&name)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("record type", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Hourly,
    Daily,
    Weekly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::weeks(1),
        }
    }

    pub fn next_after(&self, completed_at: DateTime<Utc>) -> DateTime<Utc> {
        completed_at + self.interval()
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => Err(UnknownVariant::new("cadence", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "error" => Ok(Self::Error),
            other => Err(UnknownVariant::new("run status", other)),
        }
    }
}

/// A named, scheduled collection of one record type from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionJob {
    pub job_id: String,
    pub name: String,
    pub record_type: RecordType,
    pub source: String,
    pub cadence: Cadence,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub backup_metrics: Vec<String>,
}

impl CollectionJob {
    pub fn new(
        job_id: impl Into<String>,
        name: impl Into<String>,
        record_type: RecordType,
        source: impl Into<String>,
        cadence: Cadence,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            name: name.into(),
            record_type,
            source: source.into(),
            cadence,
            enabled: true,
            last_run: None,
            next_run: None,
            success_count: 0,
            error_count: 0,
            params: BTreeMap::new(),
            backup_metrics: Vec::new(),
        }
    }

    /// A job with no `next_run` has never completed and is due immediately.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.map_or(true, |next| now >= next)
    }

    /// Fold a finished run into the job: counters, `last_run`, and a `next_run`
    /// measured from the actual completion time.
    pub fn record_completion(&mut self, status: RunStatus, completed_at: DateTime<Utc>) {
        self.last_run = Some(completed_at);
        self.next_run = Some(self.cadence.next_after(completed_at));
        if status.is_error() {
            self.error_count += 1;
        } else {
            self.success_count += 1;
        }
    }
}

/// Outcome of exactly one run of a [`CollectionJob`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionResult {
    pub run_id: Uuid,
    pub job_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: RunStatus,
    pub records_collected: usize,
    pub errors: Vec<String>,
    pub summary: BTreeMap<String, u64>,
}

impl CollectionResult {
    pub fn elapsed(&self) -> Duration {
        self.end_time - self.start_time
    }

    /// `partial` must carry collected records and at least one error.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            RunStatus::Partial => self.records_collected > 0 && !self.errors.is_empty(),
            RunStatus::Success | RunStatus::Error => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Number(f64),
}

impl FieldValue<'_> {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

fn text(value: &Option<String>) -> Option<FieldValue<'_>> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(FieldValue::Text)
}

fn int(value: Option<i64>) -> Option<FieldValue<'static>> {
    value.map(|v| FieldValue::Number(v as f64))
}

fn float(value: Option<f64>) -> Option<FieldValue<'static>> {
    value.filter(|v| v.is_finite()).map(FieldValue::Number)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Player {
    pub player_id: Option<String>,
    pub name: Option<String>,
    pub team: Option<String>,
    pub position: Option<String>,
    pub season: Option<String>,
    pub age: Option<i64>,
    pub birth_year: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Game {
    pub game_id: Option<String>,
    pub season: Option<String>,
    pub date: Option<String>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub home_score: Option<i64>,
    pub away_score: Option<i64>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveGame {
    pub game_id: Option<String>,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub home_score: Option<i64>,
    pub away_score: Option<i64>,
    pub period: Option<i64>,
    pub clock: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatLine {
    pub player_id: Option<String>,
    pub season: Option<String>,
    pub team: Option<String>,
    pub games_played: Option<i64>,
    pub goals: Option<i64>,
    pub assists: Option<i64>,
    pub points: Option<i64>,
    pub shots: Option<i64>,
    pub plus_minus: Option<i64>,
    pub penalty_minutes: Option<i64>,
    pub expected_goals: Option<f64>,
}

/// One collected entity. The variant always matches the job's [`RecordType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Record {
    Player(Player),
    Game(Game),
    LiveGame(LiveGame),
    Stat(StatLine),
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Player(_) => RecordType::Players,
            Self::Game(_) => RecordType::Games,
            Self::LiveGame(_) => RecordType::LiveGames,
            Self::Stat(_) => RecordType::Stats,
        }
    }

    /// Business identifier used for upserts: `player_id:season` or `game_id`.
    pub fn natural_key(&self) -> Option<String> {
        let part = |name: &str| match self.field(name) {
            Some(FieldValue::Text(s)) => Some(s.to_string()),
            _ => None,
        };
        match self {
            Self::Player(_) | Self::Stat(_) => {
                Some(format!("{}:{}", part("player_id")?, part("season")?))
            }
            Self::Game(_) | Self::LiveGame(_) => part("game_id"),
        }
    }

    /// Present, non-empty value of a named field.
    pub fn field(&self, name: &str) -> Option<FieldValue<'_>> {
        match self {
            Self::Player(p) => match name {
                "player_id" => text(&p.player_id),
                "name" => text(&p.name),
                "team" => text(&p.team),
                "position" => text(&p.position),
                "season" => text(&p.season),
                "age" => int(p.age),
                "birth_year" => int(p.birth_year),
                _ => None,
            },
            Self::Game(g) => match name {
                "game_id" => text(&g.game_id),
                "season" => text(&g.season),
                "date" => text(&g.date),
                "home_team" => text(&g.home_team),
                "away_team" => text(&g.away_team),
                "home_score" => int(g.home_score),
                "away_score" => int(g.away_score),
                "status" => text(&g.status),
                _ => None,
            },
            Self::LiveGame(g) => match name {
                "game_id" => text(&g.game_id),
                "home_team" => text(&g.home_team),
                "away_team" => text(&g.away_team),
                "home_score" => int(g.home_score),
                "away_score" => int(g.away_score),
                "period" => int(g.period),
                "clock" => text(&g.clock),
                _ => None,
            },
            Self::Stat(s) => match name {
                "player_id" => text(&s.player_id),
                "season" => text(&s.season),
                "team" => text(&s.team),
                "games_played" => int(s.games_played),
                "goals" => int(s.goals),
                "assists" => int(s.assists),
                "points" => int(s.points),
                "shots" => int(s.shots),
                "plus_minus" => int(s.plus_minus),
                "penalty_minutes" => int(s.penalty_minutes),
                "expected_goals" => float(s.expected_goals),
                _ => None,
            },
        }
    }

    pub fn numeric_fields(&self) -> BTreeMap<String, f64> {
        self.record_type()
            .field_names()
            .iter()
            .filter_map(|name| {
                self.field(name)
                    .and_then(|v| v.as_number())
                    .map(|n| (name.to_string(), n))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueOrigin {
    Authoritative,
    Estimated,
}

impl ValueOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authoritative => "authoritative",
            Self::Estimated => "estimated",
        }
    }
}

impl FromStr for ValueOrigin {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authoritative" => Ok(Self::Authoritative),
            "estimated" => Ok(Self::Estimated),
            other => Err(UnknownVariant::new("value origin", other)),
        }
    }
}

/// A single metric for one natural key, either read from a source or estimated locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub record_type: RecordType,
    pub natural_key: String,
    pub metric: String,
    pub value: f64,
    pub confidence: f64,
    pub origin: ValueOrigin,
    pub source: String,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().unwrap()
    }

    #[test]
    fn daily_next_run_is_measured_from_completion() {
        let mut job = CollectionJob::new("j", "J", RecordType::Games, "feed", Cadence::Daily);
        let completed = ts(7) + Duration::seconds(42);
        job.record_completion(RunStatus::Partial, completed);

        assert_eq!(job.last_run, Some(completed));
        assert_eq!(job.next_run.unwrap() - completed, Duration::hours(24));
        assert_eq!(job.success_count, 1);
        assert_eq!(job.error_count, 0);

        job.record_completion(RunStatus::Error, completed);
        assert_eq!(job.error_count, 1);
    }

    #[test]
    fn due_requires_enabled_and_elapsed_next_run() {
        let mut job = CollectionJob::new("j", "J", RecordType::Games, "feed", Cadence::Hourly);
        assert!(job.is_due(ts(0)));

        job.next_run = Some(ts(5));
        assert!(!job.is_due(ts(4)));
        assert!(job.is_due(ts(5)));

        job.enabled = false;
        assert!(!job.is_due(ts(6)));
    }

    #[test]
    fn natural_keys_follow_record_variant() {
        let stat = Record::Stat(StatLine {
            player_id: Some("p-9".into()),
            season: Some("2025".into()),
            ..Default::default()
        });
        assert_eq!(stat.natural_key().as_deref(), Some("p-9:2025"));

        let game = Record::Game(Game {
            game_id: Some("g-1".into()),
            ..Default::default()
        });
        assert_eq!(game.natural_key().as_deref(), Some("g-1"));

        let blank = Record::Player(Player {
            player_id: Some("  ".into()),
            season: Some("2025".into()),
            ..Default::default()
        });
        assert_eq!(blank.natural_key(), None);
    }

    #[test]
    fn numeric_fields_skip_text_and_missing_values() {
        let stat = Record::Stat(StatLine {
            player_id: Some("p".into()),
            goals: Some(10),
            assists: Some(5),
            expected_goals: Some(f64::NAN),
            ..Default::default()
        });
        let nums = stat.numeric_fields();
        assert_eq!(nums.len(), 2);
        assert_eq!(nums["goals"], 10.0);
        assert_eq!(nums["assists"], 5.0);
    }

    #[test]
    fn enums_parse_from_their_wire_names() {
        for t in RecordType::ALL {
            assert_eq!(t.as_str().parse::<RecordType>().unwrap(), t);
        }
        assert_eq!("weekly".parse::<Cadence>().unwrap(), Cadence::Weekly);
        assert_eq!("partial".parse::<RunStatus>().unwrap(), RunStatus::Partial);
        assert!("monthly".parse::<Cadence>().is_err());
        let json = serde_json::to_string(&RecordType::LiveGames).unwrap();
        assert_eq!(json, "\"live_games\"");
    }

    #[test]
    fn partial_results_need_records_and_errors() {
        let mut result = CollectionResult {
            run_id: Uuid::new_v4(),
            job_id: "j".into(),
            start_time: ts(1),
            end_time: ts(2),
            status: RunStatus::Partial,
            records_collected: 0,
            errors: vec!["x".into()],
            summary: BTreeMap::new(),
        };
        assert!(!result.is_consistent());
        result.records_collected = 3;
        assert!(result.is_consistent());
        assert_eq!(result.elapsed(), Duration::hours(1));
    }
}
