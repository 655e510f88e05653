use tracing::warn;

/// Decision taken when a run of the same command hits a limit again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Arm a resume; `attempt` is the retry count to persist (1-based).
    Arm { attempt: u32 },
    /// Ceiling reached: drop the pending resume.
    GiveUp,
}

/// Bounded resumption for a command that keeps hitting limits.
///
/// The first limit on a fresh command arms attempt 1. Every resumed run that
/// hits a limit again increments the count carried in the state file, and
/// once it would exceed `max_retries` the command is abandoned.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide given how many resumes have already been armed for this command.
    pub fn evaluate(&self, previous_attempts: u32) -> RetryDecision {
        let attempt = previous_attempts.saturating_add(1);
        if attempt <= self.max_retries {
            RetryDecision::Arm { attempt }
        } else {
            warn!(
                attempt,
                max_retries = self.max_retries,
                "resume retries exhausted, giving up"
            );
            RetryDecision::GiveUp
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_limit_arms_attempt_one() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.evaluate(0), RetryDecision::Arm { attempt: 1 });
    }

    #[test]
    fn test_arms_up_to_ceiling() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.evaluate(1), RetryDecision::Arm { attempt: 2 });
        assert_eq!(policy.evaluate(2), RetryDecision::Arm { attempt: 3 });
    }

    #[test]
    fn test_gives_up_past_ceiling() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.evaluate(3), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_max_retries_never_arms() {
        let policy = RetryPolicy::new(0);
        assert_eq!(policy.evaluate(0), RetryDecision::GiveUp);
    }

    #[test]
    fn test_saturates_on_corrupt_count() {
        let policy = RetryPolicy::new(u32::MAX);
        assert_eq!(
            policy.evaluate(u32::MAX),
            RetryDecision::Arm { attempt: u32::MAX }
        );
    }
}
