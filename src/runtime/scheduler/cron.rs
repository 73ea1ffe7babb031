/// Cron expression handling
///
/// Expressions are 6-field (with seconds) or standard 5-field, which gets a
/// leading `0` seconds field. Timezones are `UTC`/`Z` or fixed offsets such as
/// `+05:30` or `UTC-08:00`.

use crate::error::FlowError;
use chrono::{DateTime, FixedOffset, Utc};
use croner::Cron;

/// Normalize to the 6-field form
pub fn normalize(expression: &str) -> Result<String, FlowError> {
    let trimmed = expression.trim();
    match trimmed.split_whitespace().count() {
        5 => Ok(format!("0 {trimmed}")),
        6 => Ok(trimmed.to_string()),
        n => Err(FlowError::InvalidSchedule(format!(
            "cron expression '{trimmed}' has {n} fields, expected 5 or 6"
        ))),
    }
}

/// Parse a timezone into a fixed UTC offset
pub fn parse_offset(timezone: &str) -> Result<FixedOffset, FlowError> {
    let invalid = || FlowError::InvalidSchedule(format!("unsupported timezone '{timezone}'"));

    let tz = timezone.trim();
    let rest = tz
        .strip_prefix("UTC")
        .or_else(|| tz.strip_prefix("GMT"))
        .unwrap_or(tz);
    if rest.is_empty() || rest == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, digits) = match rest.as_bytes()[0] {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return Err(invalid()),
    };
    if !digits.bytes().all(|b| b.is_ascii_digit() || b == b':') {
        return Err(invalid());
    }
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None if digits.len() == 4 => digits.split_at(2),
        None => (digits, "0"),
    };
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// First fire time strictly after `after`
pub fn next_fire(expression: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, FlowError> {
    let cron: Cron = normalize(expression)?
        .parse()
        .map_err(|e| FlowError::InvalidSchedule(format!("cron expression '{expression}': {e}")))?;
    let offset = parse_offset(timezone)?;

    cron.iter_after(after.with_timezone(&offset))
        .next()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| FlowError::InvalidSchedule(format!("cron expression '{expression}' never fires")))
}
