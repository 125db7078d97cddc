//! Field extraction from a reassembled PostgreSQL log buffer.
//!
//! A buffer looks like:
//!
//! ```text
//! 2021-01-11 15:25:36 EST [56193-3/9939-5706] postgres@walle_test LOG:  duration: 0.139 ms  bind <unnamed>: SELECT 1
//! ```
//!
//! Everything here is plain string search; nothing is SQL-aware.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{LogError, Result};
use crate::types::SlowQueryRecord;

const DURATION_MARKER: &str = "duration: ";
const DURATION_UNIT: &str = " ms";
const KIND_MARKER: &str = " ms  ";
const SEVERITY_MARKER: &str = " LOG:";
const PREFIX_END: &str = " [";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Extracts a [`SlowQueryRecord`] from one reassembled buffer.
///
/// # Errors
///
/// Returns [`LogError::InvalidRecord`] when the buffer has no
/// `duration: ... ms` marker pair.
pub fn extract(buffer: &str) -> Result<SlowQueryRecord> {
    let duration = parse_duration(buffer).ok_or(LogError::InvalidRecord)?;
    let (username, database) = parse_user_and_database(buffer);
    let (kind, statement_name, value) = parse_kind_and_value(buffer);

    Ok(SlowQueryRecord {
        timestamp: parse_timestamp(buffer),
        username,
        database,
        duration,
        kind,
        statement_name,
        value,
    })
}

/// Locates the duration markers and parses the text between them.
///
/// `None` means the markers are missing; unparseable numbers give zero.
fn parse_duration(buffer: &str) -> Option<Duration> {
    let start = buffer.find(DURATION_MARKER)? + DURATION_MARKER.len();
    let len = buffer[start..].find(DURATION_UNIT)?;
    Some(parse_millis(&buffer[start..start + len]).unwrap_or_default())
}

/// Parses decimal milliseconds such as `0.139` into an exact duration.
///
/// Digits past nanosecond precision are truncated.
fn parse_millis(text: &str) -> Option<Duration> {
    let text = text.trim();
    let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let millis: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut nanos: u64 = 0;
    for (i, digit) in fraction.bytes().take(6).enumerate() {
        nanos += u64::from(digit - b'0') * 10u64.pow(5 - i as u32);
    }

    Duration::from_millis(millis).checked_add(Duration::from_nanos(nanos))
}

/// Parses the `YYYY-MM-DD HH:MM:SS TZ` prefix before the first ` [`.
///
/// The zone abbreviation is accepted but not resolved, so the wall clock is
/// read as UTC.
fn parse_timestamp(buffer: &str) -> DateTime<Utc> {
    let head = buffer.split(PREFIX_END).next().unwrap_or_default();
    head.rsplit_once(' ')
        .filter(|(_, zone)| !zone.is_empty() && zone.bytes().all(|b| b.is_ascii_alphabetic()))
        .and_then(|(clock, _)| NaiveDateTime::parse_from_str(clock, TIMESTAMP_FORMAT).ok())
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |naive| naive.and_utc())
}

/// Reads `user@database` from the token right before ` LOG:`.
fn parse_user_and_database(buffer: &str) -> (String, String) {
    let Some(index) = buffer.find(SEVERITY_MARKER) else {
        return (String::new(), String::new());
    };
    let token = buffer[..index].rsplit(' ').next().unwrap_or_default();
    match token.split_once('@') {
        Some((user, database)) => (user.to_string(), database.to_string()),
        None => (token.to_string(), String::new()),
    }
}

/// Splits `kind [statement_name]: value` following the duration.
fn parse_kind_and_value(buffer: &str) -> (String, String, String) {
    let Some(index) = buffer.find(KIND_MARKER) else {
        return (String::new(), String::new(), String::new());
    };
    let rest = &buffer[index + KIND_MARKER.len()..];

    let (head, value) = match rest.split_once(':') {
        Some((head, tail)) => (head, tail.strip_prefix(' ').unwrap_or(tail)),
        None => (rest, ""),
    };
    let (kind, statement_name) = head.split_once(' ').unwrap_or((head, ""));

    (
        kind.to_string(),
        statement_name.to_string(),
        value.to_string(),
    )
}
