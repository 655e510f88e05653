/// Resume scheduling: when to re-run a limited command.
///
/// Two paths lead to a resume. Within one process lifetime, `ResumeTimer`
/// sleeps until the resume instant. Across restarts, `cold_start` inspects
/// the persisted record and decides whether to resume now, keep waiting,
/// or run the fresh command. No timer state survives a restart.
use crate::state::PendingResume;
use chrono::{DateTime, Local, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A clock that only moves when told to.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Local>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap()
    }
}

/// Time left until `resume_at`, clamped to zero when it has already passed.
pub fn delay_until(now: DateTime<Utc>, resume_at: DateTime<Utc>) -> Duration {
    (resume_at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Single-shot timer for an in-process resume.
#[derive(Clone)]
pub struct ResumeTimer {
    clock: Arc<dyn Clock>,
}

impl ResumeTimer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Complete once `resume_at` is reached. Fires immediately for past instants.
    pub async fn arm(&self, resume_at: DateTime<Utc>) {
        let delay = delay_until(self.clock.now().with_timezone(&Utc), resume_at);
        tracing::info!(
            delay_secs = delay.as_secs(),
            resume_at = %resume_at,
            "resume timer armed"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        tracing::info!("resume timer fired");
    }
}

/// What a fresh process should do given the persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColdStart {
    /// Nothing pending: run the command given on this invocation.
    Fresh,
    /// The wait is over: re-run the stored command.
    Resume { record: PendingResume },
    /// Still waiting; report and leave the record alone.
    Wait {
        resume_at: DateTime<Utc>,
        remaining: Duration,
        record: PendingResume,
    },
}

pub fn cold_start(record: PendingResume, now: DateTime<Utc>) -> ColdStart {
    match record.resume_at() {
        None => ColdStart::Fresh,
        Some(resume_at) if now >= resume_at => ColdStart::Resume { record },
        Some(resume_at) => ColdStart::Wait {
            resume_at,
            remaining: delay_until(now, resume_at),
            record,
        },
    }
}

/// Whole minutes left, rounded up (never reports "0 minutes" while waiting).
pub fn minutes_remaining(remaining: Duration) -> u64 {
    remaining.as_secs().div_ceil(60)
}
