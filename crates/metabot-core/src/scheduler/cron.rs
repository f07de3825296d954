//! Cron expression validation and next-occurrence computation.
//!
//! The public contract is 5-field standard cron (minute hour day-of-month
//! month day-of-week) plus the `@daily`-style aliases. The `cron` crate
//! wants a seconds field, so 5-field input is normalized by prepending a
//! `0` before parsing. Occurrences are computed in the task's IANA
//! timezone.

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;

use super::SchedulerError;

const ALIASES: &[&str] = &["@daily", "@hourly", "@weekly", "@monthly", "@yearly"];

/// Validate a user-supplied cron expression.
pub fn validate(expr: &str) -> Result<(), SchedulerError> {
    normalize(expr).map(|_| ())
}

/// Validate an IANA timezone name.
pub fn validate_timezone(tz: &str) -> Result<(), SchedulerError> {
    parse_tz(tz).map(|_| ())
}

/// The next occurrence strictly after `after_ms` (unix ms), in `tz`.
pub fn next_occurrence_ms(expr: &str, tz: &str, after_ms: i64) -> Result<i64, SchedulerError> {
    let schedule = cron::Schedule::from_str(&normalize(expr)?)
        .map_err(|e| SchedulerError::InvalidCron(format!("{expr}: {e}")))?;
    let tz = parse_tz(tz)?;
    let after = Utc
        .timestamp_millis_opt(after_ms)
        .single()
        .ok_or_else(|| SchedulerError::InvalidCron(format!("bad reference time {after_ms}")))?
        .with_timezone(&tz);

    schedule
        .after(&after)
        .next()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| SchedulerError::InvalidCron(format!("{expr}: no upcoming occurrence")))
}

fn parse_tz(tz: &str) -> Result<Tz, SchedulerError> {
    Tz::from_str(tz).map_err(|_| SchedulerError::InvalidTimezone(tz.to_string()))
}

fn normalize(expr: &str) -> Result<String, SchedulerError> {
    let expr = expr.trim();
    if expr.starts_with('@') {
        if ALIASES.contains(&expr) {
            return Ok(expr.to_string());
        }
        return Err(SchedulerError::InvalidCron(format!("unknown alias {expr}")));
    }

    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(SchedulerError::InvalidCron(format!(
            "{expr}: expected 5 fields, got {}",
            fields.len()
        )));
    }
    let normalized = format!("0 {}", fields.join(" "));

    // Parse once up front so bad field values fail at schedule time, not
    // at fire time.
    cron::Schedule::from_str(&normalized)
        .map_err(|e| SchedulerError::InvalidCron(format!("{expr}: {e}")))?;
    Ok(normalized)
}
