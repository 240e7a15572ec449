use chrono::{DateTime, NaiveDateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Parses an engine timestamp into epoch milliseconds. The engine emits both
/// offset-qualified ISO-8601 (`2026-08-24T12:00:00.123+00:00`) and naive UTC
/// (`2026-08-24T12:00:00.123456`) forms.
pub fn parse_event_timestamp(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Formats epoch milliseconds as a `HH:MM:SS` UTC clock reading for log lines.
pub fn format_clock_time(millis: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(at) => at.format("%H:%M:%S").to_string(),
        None => "--:--:--".to_string(),
    }
}

/// Sleeps in short steps so a stop request interrupts the wait promptly.
/// Returns false when the stop flag was raised during the sleep.
pub fn sleep_with_stop(total: Duration, stop: &AtomicBool) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(Duration::from_millis(25));
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_offset_and_naive_timestamps() {
        let offset = parse_event_timestamp("2026-08-24T12:00:00.500+00:00").expect("offset form");
        let naive = parse_event_timestamp("2026-08-24T12:00:00.500000").expect("naive form");
        assert_eq!(offset, naive);
        assert_eq!(offset % 1000, 500);
    }

    #[test]
    fn rejects_garbage_timestamps() {
        assert_eq!(parse_event_timestamp(""), None);
        assert_eq!(parse_event_timestamp("not-a-time"), None);
    }

    #[test]
    fn formats_clock_time_in_utc() {
        let millis = parse_event_timestamp("2026-08-24T09:15:42+00:00").expect("parse");
        assert_eq!(format_clock_time(millis), "09:15:42");
    }
}
