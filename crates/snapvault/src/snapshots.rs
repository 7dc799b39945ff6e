//! Snapshot records and nearest-snapshot selection for point-in-time restores.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MONTH_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: String,
}

impl Snapshot {
    /// The engine's short id, falling back to the first eight characters of the full id.
    pub fn short(&self) -> &str {
        if !self.short_id.is_empty() {
            return &self.short_id;
        }
        match self.id.char_indices().nth(8) {
            Some((i, _)) => &self.id[..i],
            None => &self.id,
        }
    }
}

pub fn resolve<'a>(snapshots: &'a [Snapshot], expression: &str) -> Result<&'a Snapshot> {
    resolve_at(snapshots, expression, Utc::now())
}

/// Pick the snapshot whose time is closest to `expression`, evaluated against `now`.
/// Ties keep the earliest-listed snapshot.
pub fn resolve_at<'a>(
    snapshots: &'a [Snapshot],
    expression: &str,
    now: DateTime<Utc>,
) -> Result<&'a Snapshot> {
    let target = parse_time_expression(expression, now)?;
    let mut best: Option<(&Snapshot, i64)> = None;
    for s in snapshots {
        let diff = (s.time - target).num_milliseconds().abs();
        match best {
            Some((_, d)) if diff >= d => {}
            _ => best = Some((s, diff)),
        }
    }
    best.map(|(s, _)| s)
        .ok_or_else(|| Error::NotFound("no snapshots found in the repository".into()))
}

fn relative_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(\d+)\s*(minute|min|hour|hr|day|week|month)s?\s+ago\s*$")
            .expect("valid relative time regex")
    })
}

/// Parse `<n> <unit> ago`, RFC 3339, `YYYY-MM-DD HH:MM[:SS]` (local time),
/// `YYYY-MM-DD` (UTC midnight), or `now`/`latest`.
pub fn parse_time_expression(expression: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let expr = expression.trim();
    if expr.eq_ignore_ascii_case("now") || expr.eq_ignore_ascii_case("latest") {
        return Ok(now);
    }

    if let Some(caps) = relative_re().captures(expr) {
        let n: i64 = caps[1]
            .parse()
            .map_err(|_| invalid_time(expression))?;
        let unit_secs = match caps[2].to_ascii_lowercase().as_str() {
            "minute" | "min" => 60,
            "hour" | "hr" => 60 * 60,
            "day" => 24 * 60 * 60,
            "week" => 7 * 24 * 60 * 60,
            _ => MONTH_SECS,
        };
        let secs = n.checked_mul(unit_secs).ok_or_else(|| invalid_time(expression))?;
        let delta = Duration::try_seconds(secs).ok_or_else(|| invalid_time(expression))?;
        return now
            .checked_sub_signed(delta)
            .ok_or_else(|| invalid_time(expression));
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(expr) {
        return Ok(t.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(expr, fmt) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| invalid_time(expression));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(expr, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| invalid_time(expression))?;
        return Ok(Utc.from_utc_datetime(&midnight));
    }

    Err(invalid_time(expression))
}

fn invalid_time(expression: &str) -> Error {
    Error::validation(format!(
        "invalid time expression '{}' (try '2 hours ago', '2024-06-01 14:30' or an RFC 3339 timestamp)",
        expression.trim()
    ))
}

/// Chronological order, oldest first.
pub fn sort_chronologically(snapshots: &mut [Snapshot]) {
    snapshots.sort_by(|a, b| a.time.cmp(&b.time));
}
