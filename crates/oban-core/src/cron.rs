//! Cron scheduling: expression parsing and the leader-only
//! plugin that fires jobs on schedule.

use crate::job::JobChangeset;
use crate::notifier::{Notification, Notifier};
use crate::store::{InsertOpts, JobStore};
use crate::uniqueness::{UniqueStates, UniquenessOpts};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// A parsed cron expression: one membership set per field. Evaluation is
/// then just a set lookup against the current `{minute, hour, day, month,
/// weekday}` — parsed once at configuration time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    pub minute: HashSet<u32>,
    pub hour: HashSet<u32>,
    pub day: HashSet<u32>,
    pub month: HashSet<u32>,
    pub weekday: HashSet<u32>,
    /// `@reboot` fires exactly once, at process start, never on a minute
    /// boundary match.
    pub reboot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronParseError {
    #[error("empty cron expression")]
    Empty,
    #[error("expected 5 fields, found {0}")]
    WrongFieldCount(usize),
    #[error("invalid value {value} for field {field} (expected {min}-{max})")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid range {0}-{1}: start must be <= end")]
    BackwardsRange(u32, u32),
    #[error("step must be >= 1, found {0}")]
    InvalidStep(u32),
    #[error("unrecognized token: {0}")]
    UnrecognizedToken(String),
    #[error("unknown alias: {0}")]
    UnknownAlias(String),
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY: FieldSpec = FieldSpec { name: "day", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const WEEKDAY: FieldSpec = FieldSpec { name: "weekday", min: 0, max: 6 };

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

fn resolve_name(token: &str, names: &[&str; 12]) -> Option<u32> {
    let lower = token.to_ascii_lowercase();
    names.iter().position(|n| *n == lower).map(|i| i as u32 + 1)
}

fn resolve_weekday_name(token: &str) -> Option<u32> {
    let lower = token.to_ascii_lowercase();
    WEEKDAY_NAMES.iter().position(|n| *n == lower).map(|i| i as u32)
}

fn parse_atom(token: &str, spec: &FieldSpec) -> Result<u32, CronParseError> {
    let value = if spec.name == "month" {
        if let Some(v) = resolve_name(token, &MONTH_NAMES) {
            v
        } else {
            token
                .parse::<u32>()
                .map_err(|_| CronParseError::UnrecognizedToken(token.to_string()))?
        }
    } else if spec.name == "weekday" {
        if let Some(v) = resolve_weekday_name(token) {
            v
        } else {
            token
                .parse::<u32>()
                .map_err(|_| CronParseError::UnrecognizedToken(token.to_string()))?
        }
    } else {
        token
            .parse::<u32>()
            .map_err(|_| CronParseError::UnrecognizedToken(token.to_string()))?
    };

    // Weekday 7 is a common alias for Sunday; normalize it.
    let value = if spec.name == "weekday" && value == 7 { 0 } else { value };

    if value < spec.min || value > spec.max {
        return Err(CronParseError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}

fn parse_field(raw: &str, spec: &FieldSpec) -> Result<HashSet<u32>, CronParseError> {
    let mut set = HashSet::new();
    for part in raw.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step: u32 = step_str
                    .parse()
                    .map_err(|_| CronParseError::UnrecognizedToken(step_str.to_string()))?;
                if step < 1 {
                    return Err(CronParseError::InvalidStep(step));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range_part == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let start = parse_atom(a, spec)?;
            let end = parse_atom(b, spec)?;
            if start > end {
                return Err(CronParseError::BackwardsRange(start, end));
            }
            (start, end)
        } else {
            let v = parse_atom(range_part, spec)?;
            (v, v)
        };

        let mut v = start;
        while v <= end {
            set.insert(v);
            v += step;
        }
    }
    Ok(set)
}

impl CronExpression {
    /// Parses a 5-field cron expression, or one of the named aliases
    /// (`@yearly @annually @monthly @weekly @daily @midnight @hourly
    /// @reboot`).
    pub fn parse(raw: &str) -> Result<Self, CronParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CronParseError::Empty);
        }
        if let Some(alias) = raw.strip_prefix('@') {
            return Self::parse_alias(alias);
        }

        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::WrongFieldCount(fields.len()));
        }

        Ok(CronExpression {
            minute: parse_field(fields[0], &MINUTE)?,
            hour: parse_field(fields[1], &HOUR)?,
            day: parse_field(fields[2], &DAY)?,
            month: parse_field(fields[3], &MONTH)?,
            weekday: parse_field(fields[4], &WEEKDAY)?,
            reboot: false,
        })
    }

    fn parse_alias(alias: &str) -> Result<Self, CronParseError> {
        let full = |minute, hour, day, month, weekday| CronExpression {
            minute: HashSet::from([minute]),
            hour: HashSet::from([hour]),
            day,
            month,
            weekday,
            reboot: false,
        };
        let all = |spec: &FieldSpec| (spec.min..=spec.max).collect::<HashSet<u32>>();

        match alias {
            "yearly" | "annually" => Ok(full(0, 0, HashSet::from([1]), HashSet::from([1]), all(&WEEKDAY))),
            "monthly" => Ok(full(0, 0, HashSet::from([1]), all(&MONTH), all(&WEEKDAY))),
            "weekly" => Ok(full(0, 0, all(&DAY), all(&MONTH), HashSet::from([0]))),
            "daily" | "midnight" => Ok(full(0, 0, all(&DAY), all(&MONTH), all(&WEEKDAY))),
            "hourly" => Ok(CronExpression {
                minute: HashSet::from([0]),
                hour: all(&HOUR),
                day: all(&DAY),
                month: all(&MONTH),
                weekday: all(&WEEKDAY),
                reboot: false,
            }),
            "reboot" => Ok(CronExpression {
                minute: HashSet::new(),
                hour: HashSet::new(),
                day: HashSet::new(),
                month: HashSet::new(),
                weekday: HashSet::new(),
                reboot: true,
            }),
            other => Err(CronParseError::UnknownAlias(other.to_string())),
        }
    }

    /// Whether this expression matches the given wall-clock instant.
    /// `@reboot` never matches here — it is fired once by the scheduler
    /// at startup instead.
    pub fn matches(&self, at: DateTime<Tz>) -> bool {
        if self.reboot {
            return false;
        }
        self.minute.contains(&at.minute())
            && self.hour.contains(&at.hour())
            && self.day.contains(&at.day())
            && self.month.contains(&at.month())
            && self.weekday.contains(&at.weekday().num_days_from_sunday())
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reboot {
            write!(f, "@reboot")
        } else {
            write!(f, "<cron expression>")
        }
    }
}

/// One schedule entry: `{expression, worker, options}`.
#[derive(Debug, Clone)]
pub struct CronEntry {
    pub expression: CronExpression,
    pub worker: String,
    pub queue: String,
    pub args: serde_json::Value,
    /// Overrides the scheduler-wide default timezone for this entry only.
    pub timezone: Option<Tz>,
}

impl CronEntry {
    pub fn new(expr: &str, worker: impl Into<String>) -> Result<Self, CronParseError> {
        Ok(Self {
            expression: CronExpression::parse(expr)?,
            worker: worker.into(),
            queue: "default".to_string(),
            args: serde_json::json!({}),
            timezone: None,
        })
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = Some(tz);
        self
    }

    pub fn changeset(&self) -> JobChangeset {
        JobChangeset::new(self.queue.clone(), self.worker.clone(), self.args.clone())
    }
}

/// Uniqueness window absorbing duplicate ticks across non-leader attempts:
/// `{period: 59s, states: all}`.
pub fn cron_uniqueness() -> UniquenessOpts {
    UniquenessOpts::new()
        .with_period(chrono::Duration::seconds(59))
        .with_states(UniqueStates::All)
}

/// The leader-only scheduler: evaluates every entry on each minute
/// boundary, in the configured (or per-entry) timezone.
pub struct CronScheduler {
    entries: Vec<CronEntry>,
    default_timezone: Tz,
    reboot_fired: bool,
}

impl CronScheduler {
    pub fn new(entries: Vec<CronEntry>, default_timezone: Tz) -> Self {
        Self {
            entries,
            default_timezone,
            reboot_fired: false,
        }
    }

    fn tz_for(&self, entry: &CronEntry) -> Tz {
        entry.timezone.unwrap_or(self.default_timezone)
    }

    /// Returns the changesets that should be inserted at `now`, given
    /// leader status. `is_leader = false` yields nothing. The `@reboot`
    /// entries fire exactly once, on the first call after construction,
    /// regardless of `now`.
    pub fn due(&mut self, now: DateTime<Utc>, is_leader: bool) -> Vec<(JobChangeset, UniquenessOpts)> {
        if !is_leader {
            return Vec::new();
        }

        let mut due = Vec::new();

        if !self.reboot_fired {
            self.reboot_fired = true;
            for entry in self.entries.iter().filter(|e| e.expression.reboot) {
                due.push((entry.changeset(), cron_uniqueness()));
            }
        }

        for entry in self.entries.iter().filter(|e| !e.expression.reboot) {
            let local = now.with_timezone(&self.tz_for(entry));
            if entry.expression.matches(local) {
                due.push((entry.changeset(), cron_uniqueness()));
            }
        }

        due
    }
}

/// Wraps a [`CronScheduler`] in the leader-gated background task that
/// actually inserts the jobs it decides are due. Kept
/// separate from `CronScheduler` itself so the scheduling decision stays
/// unit-testable without a store or notifier in the loop.
pub struct CronPlugin {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    leader: watch::Receiver<bool>,
    scheduler: Mutex<CronScheduler>,
}

impl CronPlugin {
    pub fn new(
        entries: Vec<CronEntry>,
        default_timezone: Tz,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        leader: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            notifier,
            leader,
            scheduler: Mutex::new(CronScheduler::new(entries, default_timezone)),
        }
    }

    async fn tick(&self) {
        let is_leader = *self.leader.borrow();
        let due = self.scheduler.lock().await.due(Utc::now(), is_leader);
        for (changeset, unique) in due {
            let queue = changeset.queue.clone();
            let opts = InsertOpts { unique: Some(unique), ..Default::default() };
            match self.store.insert_job(changeset, opts).await {
                Ok(inserted) if !inserted.conflict => {
                    self.notifier.publish(Notification::Insert { queue }).await;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(target: "oban::cron", error = %err, "failed to insert scheduled job");
                }
            }
        }
    }

    /// Runs an immediate tick (so `@reboot` entries fire at startup), then
    /// ticks again on every minute boundary.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.tick().await;
            loop {
                tokio::time::sleep(time_until_next_minute()).await;
                self.tick().await;
            }
        })
    }
}

fn time_until_next_minute() -> Duration {
    let now = Utc::now();
    let nanos_into_minute =
        (now.second() as u64) * 1_000_000_000 + now.timestamp_subsec_nanos() as u64;
    let nanos_per_minute = 60_000_000_000u64;
    let remaining = nanos_per_minute.saturating_sub(nanos_into_minute);
    Duration::from_nanos(remaining.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn utc_at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
        chrono_tz::UTC
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .unwrap()
    }

    #[test]
    fn every_five_minutes() {
        let expr = CronExpression::parse("*/5 * * * *").unwrap();
        assert!(expr.matches(utc_at(2026, 1, 1, 0, 0)));
        assert!(expr.matches(utc_at(2026, 1, 1, 0, 5)));
        assert!(!expr.matches(utc_at(2026, 1, 1, 0, 3)));
    }

    #[test]
    fn named_months_and_weekdays() {
        let expr = CronExpression::parse("0 9 * jan mon").unwrap();
        assert_eq!(expr.month, HashSet::from([1]));
        assert_eq!(expr.weekday, HashSet::from([1]));
    }

    #[test]
    fn list_union() {
        let expr = CronExpression::parse("0,30 * * * *").unwrap();
        assert_eq!(expr.minute, HashSet::from([0, 30]));
    }

    #[test]
    fn rejects_backwards_range() {
        let err = CronExpression::parse("0 10-5 * * *").unwrap_err();
        assert!(matches!(err, CronParseError::BackwardsRange(10, 5)));
    }

    #[test]
    fn rejects_step_zero() {
        let err = CronExpression::parse("*/0 * * * *").unwrap_err();
        assert!(matches!(err, CronParseError::InvalidStep(0)));
    }

    #[test]
    fn rejects_out_of_range_value() {
        let err = CronExpression::parse("60 * * * *").unwrap_err();
        assert!(matches!(err, CronParseError::OutOfRange { field: "minute", value: 60, .. }));
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = CronExpression::parse("* * *").unwrap_err();
        assert_eq!(err, CronParseError::WrongFieldCount(3));
    }

    #[test]
    fn aliases_resolve() {
        assert!(CronExpression::parse("@hourly").is_ok());
        assert!(CronExpression::parse("@daily").is_ok());
        assert!(CronExpression::parse("@weekly").is_ok());
        assert!(CronExpression::parse("@monthly").is_ok());
        assert!(CronExpression::parse("@yearly").is_ok());
        assert!(CronExpression::parse("@reboot").unwrap().reboot);
    }

    #[test]
    fn unknown_alias_errors() {
        assert!(matches!(
            CronExpression::parse("@never"),
            Err(CronParseError::UnknownAlias(_))
        ));
    }

    #[test]
    fn reboot_fires_once() {
        let entry = CronEntry::new("@reboot", "Boot").unwrap();
        let mut sched = CronScheduler::new(vec![entry], chrono_tz::UTC);
        let now = Utc::now();
        let first = sched.due(now, true);
        assert_eq!(first.len(), 1);
        let second = sched.due(now, true);
        assert_eq!(second.len(), 0);
    }

    #[test]
    fn non_leader_never_fires() {
        let entry = CronEntry::new("* * * * *", "Tick").unwrap();
        let mut sched = CronScheduler::new(vec![entry], chrono_tz::UTC);
        assert!(sched.due(Utc::now(), false).is_empty());
    }
}
