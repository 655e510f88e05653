/// Human-readable status lines shown on the terminal.
use crate::reset_time::ResetHint;
use crate::scheduler::minutes_remaining;
use crate::state::PendingResume;
use chrono::{DateTime, Local, Utc};
use std::time::Duration;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `2h 15m`, or just `15m` under an hour.
pub fn format_wait(wait: Duration) -> String {
    let total_minutes = minutes_remaining(wait);
    let (hours, minutes) = (total_minutes / 60, total_minutes % 60);
    if hours == 0 {
        format!("{minutes}m")
    } else {
        format!("{hours}h {minutes}m")
    }
}

fn local(instant: DateTime<Utc>) -> String {
    instant.with_timezone(&Local).format(TIME_FORMAT).to_string()
}

pub fn limit_detected(resume_at: DateTime<Utc>, wait: Duration, hint: ResetHint) -> String {
    let source = match hint {
        ResetHint::NoMatch => " (no reset time in output, using default wait)",
        _ => "",
    };
    format!(
        "\nUsage limit detected.\n\
         Reset time: {}{source}\n\
         Waiting:    {}\n\
         The command will resume automatically. If this terminal closes, \
         run the wrapper again after the reset time to continue.\n",
        local(resume_at),
        format_wait(wait),
    )
}

pub fn still_waiting(resume_at: DateTime<Utc>, remaining: Duration) -> String {
    format!(
        "Still waiting for the usage limit to reset: {} minute(s) left.\nReset time: {}",
        minutes_remaining(remaining),
        local(resume_at),
    )
}

pub fn resuming(command: &[String]) -> String {
    format!("Limit reset reached, resuming: {}", command.join(" "))
}

pub fn retries_exhausted(max_retries: u32) -> String {
    format!(
        "Usage limit hit again after {max_retries} automatic resume(s); giving up. \
         Re-run the command manually."
    )
}

pub fn resume_failed() -> String {
    "Automatic resume failed; re-run the command manually. See the log file for details."
        .to_string()
}

/// The `--status` report.
pub fn status(record: &PendingResume, program: &str) -> String {
    match record.resume_at() {
        Some(resume_at) => format!(
            "Wrapper status: waiting\n\
             Reset time:       {}\n\
             Original command: {program} {}\n\
             Resume attempt:   {}/{}",
            local(resume_at),
            record.original_command.join(" "),
            record.retry_count,
            record.max_retries,
        ),
        None => "Wrapper status: idle".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_wait() {
        assert_eq!(format_wait(Duration::from_secs(15 * 60)), "15m");
        assert_eq!(format_wait(Duration::from_secs(135 * 60)), "2h 15m");
        assert_eq!(format_wait(Duration::from_secs(60 * 60)), "1h 0m");
        assert_eq!(format_wait(Duration::from_secs(30)), "1m");
    }

    #[test]
    fn test_limit_detected_mentions_default() {
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 17, 30, 0).unwrap();
        let msg = limit_detected(at, Duration::from_secs(3600), ResetHint::NoMatch);
        assert!(msg.contains("Usage limit detected"));
        assert!(msg.contains("1h 0m"));
        assert!(msg.contains("default wait"));

        let msg = limit_detected(
            at,
            Duration::from_secs(300),
            ResetHint::RelativeMinutes { minutes: 5 },
        );
        assert!(!msg.contains("default wait"));
    }

    #[test]
    fn test_still_waiting_rounds_up() {
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 17, 30, 0).unwrap();
        let msg = still_waiting(at, Duration::from_secs(61));
        assert!(msg.contains("2 minute(s) left"));
    }

    #[test]
    fn test_status_idle() {
        assert_eq!(
            status(&PendingResume::idle(), "claude"),
            "Wrapper status: idle"
        );
    }

    #[test]
    fn test_status_waiting() {
        let record = PendingResume {
            is_waiting: true,
            original_command: vec!["-p".to_string(), "fix tests".to_string()],
            reset_time: Some(Utc.with_ymd_and_hms(2026, 3, 10, 17, 30, 0).unwrap()),
            retry_count: 1,
            max_retries: 3,
        };
        let msg = status(&record, "claude");
        assert!(msg.contains("waiting"));
        assert!(msg.contains("claude -p fix tests"));
        assert!(msg.contains("1/3"));
    }

    #[test]
    fn test_resuming_shows_command() {
        assert_eq!(
            resuming(&["--continue".to_string()]),
            "Limit reset reached, resuming: --continue"
        );
    }
}
