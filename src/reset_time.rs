/// Reset-time inference: turn limit messages into a concrete resume instant.
///
/// Parsing happens in two steps. `parse_hint` walks the pattern families in
/// priority order and returns the first one that matches as a `ResetHint`.
/// `resolve` then applies that family's rule against "now". When nothing
/// matches, a time-of-day dependent default wait is used, so a resume instant
/// is always produced.
use crate::config::WaitConfig;
use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Timelike, Utc};
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// What the output says about when the limit clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetHint {
    /// Wall-clock time of day, 24-hour.
    AbsoluteTime { hour: u32, minute: u32 },
    RelativeMinutes { minutes: i64 },
    RelativeHoursMinutes { hours: i64, minutes: i64 },
    AbsoluteTimestamp { instant: DateTime<Utc> },
    NoMatch,
}

impl ResetHint {
    /// Short label for logs.
    pub fn family(&self) -> &'static str {
        match self {
            ResetHint::AbsoluteTime { .. } => "absolute_time",
            ResetHint::RelativeMinutes { .. } => "relative_minutes",
            ResetHint::RelativeHoursMinutes { .. } => "relative_hours_minutes",
            ResetHint::AbsoluteTimestamp { .. } => "absolute_timestamp",
            ResetHint::NoMatch => "default_wait",
        }
    }
}

static ABSOLUTE_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:resets?|try\s+again|available(?:\s+again)?)\s+at\s+(\d{1,2})(?::(\d{2}))?(?:\s*([ap])\.?m\b\.?)?",
    )
    .unwrap()
});

static RELATIVE_MINUTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:resets?\s+in|retry\s+in|try\s+again\s+in|available\s+in|wait)\s+(\d+)\s*(?:minutes?|mins?)\b",
    )
    .unwrap()
});

static RELATIVE_HOURS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d+)\s*(?:hours?|hrs?)\b(?:\s*,?\s*(?:and\s+)?(\d+)\s*(?:minutes?|mins?)\b)?",
    )
    .unwrap()
});

static LOCALIZED_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(上午|下午|晚上|凌晨)?\s*(\d{1,2})[:：](\d{2})\s*(?:后)?\s*(?:重置|恢复|重试|再试|可用)")
        .unwrap()
});

static LOCALIZED_HOURS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s*个?\s*小时(?:\s*(?:零|又)?\s*(\d+)\s*分钟?)?").unwrap()
});

static LOCALIZED_MINUTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*分钟").unwrap());

static EPOCH_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)limit\s+reached\|(\d{9,11})\b").unwrap());

static ISO_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?)",
    )
    .unwrap()
});

/// Pattern families in priority order.
const FAMILIES: &[fn(&str) -> Option<ResetHint>] = &[
    absolute_time,
    relative_minutes,
    relative_hours,
    localized,
    timestamp,
];

/// Find the first family that matches anywhere in `text`.
pub fn parse_hint(text: &str) -> ResetHint {
    FAMILIES
        .iter()
        .find_map(|family| family(text))
        .unwrap_or(ResetHint::NoMatch)
}

/// Compute the resume instant for `hint` relative to `now`.
pub fn resolve<Tz: TimeZone>(
    hint: ResetHint,
    now: &DateTime<Tz>,
    wait: &WaitConfig,
) -> DateTime<Tz> {
    let resolved = match hint {
        ResetHint::AbsoluteTime { hour, minute } => next_wall_clock(now, hour, minute),
        ResetHint::RelativeMinutes { minutes } => add_minutes(now, 0, minutes),
        ResetHint::RelativeHoursMinutes { hours, minutes } => add_minutes(now, hours, minutes),
        ResetHint::AbsoluteTimestamp { instant } => Some(instant.with_timezone(&now.timezone())),
        ResetHint::NoMatch => None,
    };

    resolved.unwrap_or_else(|| default_wait(now, wait))
}

/// Parse the accumulated output and compute when to resume, along with the
/// hint that decided it.
pub fn extract_resume_instant<Tz: TimeZone>(
    output: &str,
    now: &DateTime<Tz>,
    wait: &WaitConfig,
) -> (DateTime<Tz>, ResetHint) {
    let hint = parse_hint(output);
    if hint == ResetHint::NoMatch {
        tracing::warn!("could not read a reset time from output, using default wait");
    } else {
        tracing::debug!(family = hint.family(), ?hint, "reset time hint parsed");
    }
    (resolve(hint, now, wait), hint)
}

/// Fallback instant: shorter during the day, longest overnight. Always in the future.
pub fn default_wait<Tz: TimeZone>(now: &DateTime<Tz>, wait: &WaitConfig) -> DateTime<Tz> {
    let minutes = wait.minutes_for_hour(now.hour()).max(1);
    now.clone() + Duration::minutes(minutes)
}

// --- Families ---

fn absolute_time(text: &str) -> Option<ResetHint> {
    ABSOLUTE_TIME.captures_iter(text).find_map(|caps| {
        let minute = caps.get(2).map(|m| m.as_str());
        let meridiem = caps.get(3).map(|m| m.as_str().to_ascii_lowercase());
        // A bare "at 5" is too ambiguous to be a clock time.
        if minute.is_none() && meridiem.is_none() {
            return None;
        }
        let hour = caps.get(1)?.as_str().parse().ok()?;
        let minute = parse_or_zero(minute);
        let meridiem = match meridiem.as_deref() {
            Some("p") => Meridiem::Pm,
            Some(_) => Meridiem::Am,
            None => Meridiem::None,
        };
        clock_time(hour, minute, meridiem)
    })
}

fn relative_minutes(text: &str) -> Option<ResetHint> {
    let caps = RELATIVE_MINUTES.captures(text)?;
    let minutes = caps.get(1)?.as_str().parse().ok()?;
    Some(ResetHint::RelativeMinutes { minutes })
}

fn relative_hours(text: &str) -> Option<ResetHint> {
    hours_minutes(&RELATIVE_HOURS.captures(text)?)
}

fn localized(text: &str) -> Option<ResetHint> {
    if let Some(caps) = LOCALIZED_TIME.captures(text) {
        let meridiem = match caps.get(1).map(|m| m.as_str()) {
            Some("下午") => Meridiem::Pm,
            Some("晚上") => Meridiem::Evening,
            Some(_) => Meridiem::Am,
            None => Meridiem::None,
        };
        let hour = caps.get(2)?.as_str().parse().ok()?;
        let minute = parse_or_zero(caps.get(3).map(|m| m.as_str()));
        if let Some(hint) = clock_time(hour, minute, meridiem) {
            return Some(hint);
        }
    }
    if let Some(caps) = LOCALIZED_HOURS.captures(text) {
        return hours_minutes(&caps);
    }
    let caps = LOCALIZED_MINUTES.captures(text)?;
    let minutes = caps.get(1)?.as_str().parse().ok()?;
    Some(ResetHint::RelativeMinutes { minutes })
}

fn timestamp(text: &str) -> Option<ResetHint> {
    if let Some(caps) = EPOCH_TIMESTAMP.captures(text) {
        let secs: i64 = caps.get(1)?.as_str().parse().ok()?;
        if let Some(instant) = Utc.timestamp_opt(secs, 0).single() {
            return Some(ResetHint::AbsoluteTimestamp { instant });
        }
    }
    let caps = ISO_TIMESTAMP.captures(text)?;
    let instant = parse_timestamp(caps.get(1)?.as_str());
    if instant.is_none() {
        tracing::debug!(token = &caps[1], "timestamp token did not parse");
    }
    instant.map(|instant| ResetHint::AbsoluteTimestamp { instant })
}

// --- Helpers ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Am,
    Pm,
    /// 晚上: afternoon hours, except 12 is midnight.
    Evening,
    None,
}

/// Normalize to 24-hour time, rejecting out-of-range values.
fn clock_time(hour: u32, minute: u32, meridiem: Meridiem) -> Option<ResetHint> {
    if minute > 59 {
        return None;
    }
    let hour = match meridiem {
        Meridiem::None if hour <= 23 => hour,
        Meridiem::None => return None,
        _ if !(1..=12).contains(&hour) => return None,
        Meridiem::Pm if hour == 12 => 12,
        Meridiem::Pm => hour + 12,
        Meridiem::Am | Meridiem::Evening if hour == 12 => 0,
        Meridiem::Evening => hour + 12,
        Meridiem::Am => hour,
    };
    Some(ResetHint::AbsoluteTime { hour, minute })
}

fn hours_minutes(caps: &Captures<'_>) -> Option<ResetHint> {
    let hours = caps.get(1)?.as_str().parse().ok()?;
    let minutes = parse_or_zero(caps.get(2).map(|m| m.as_str()));
    Some(ResetHint::RelativeHoursMinutes { hours, minutes })
}

/// Missing or unparsable minute groups count as zero.
fn parse_or_zero<T: std::str::FromStr + Default>(value: Option<&str>) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or_default()
}

fn parse_timestamp(token: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(token) {
        return Some(dt.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(token, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Today's occurrence of `hour:minute`, or tomorrow's if that is not after `now`.
fn next_wall_clock<Tz: TimeZone>(
    now: &DateTime<Tz>,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let today = now.date_naive().and_hms_opt(hour, minute, 0)?;
    let candidate = localize(&tz, today)?;
    if candidate > *now {
        return Some(candidate);
    }
    localize(&tz, today + Duration::days(1))
}

/// Map a wall-clock time onto `tz`, taking the earlier instant when ambiguous.
/// A time inside a DST gap becomes the first valid minute after the gap.
fn localize<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => (1..=MAX_GAP_MINUTES)
            .find_map(|m| tz.from_local_datetime(&(naive + Duration::minutes(m))).earliest()),
    }
}

const MAX_GAP_MINUTES: i64 = 24 * 60;

fn add_minutes<Tz: TimeZone>(
    now: &DateTime<Tz>,
    hours: i64,
    minutes: i64,
) -> Option<DateTime<Tz>> {
    let total = hours.checked_mul(60)?.checked_add(minutes)?;
    now.clone().checked_add_signed(Duration::try_minutes(total)?)
}
