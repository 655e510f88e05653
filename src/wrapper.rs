/// Top-level run loop: cold-start decision, supervised execution, and
/// resumption after a usage limit.
///
/// A run starts by consulting the state file. With nothing pending the
/// given command runs. When a limit is detected the resume is persisted
/// first, then (unless detached) this process sleeps until the reset time
/// and runs the same command again, until it completes, fails, or the
/// retry ceiling is reached.
use crate::config::WrapperConfig;
use crate::report;
use crate::reset_time::ResetHint;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scheduler::{self, Clock, ColdStart, ResumeTimer};
use crate::session::{RunOutcome, SessionError, Supervisor};
use crate::state::StateStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// How a wrapper invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrapperOutcome {
    /// The wrapped command exited successfully.
    Completed,
    /// A resume is pending and its time has not come; nothing was run.
    Waiting { resume_at: DateTime<Utc> },
    /// A limit was hit and the resume persisted; this process does not wait.
    Armed { resume_at: DateTime<Utc> },
    /// The wrapped command failed without hitting a limit.
    Failed { exit_code: Option<i32> },
    /// The command kept hitting limits past the retry ceiling.
    RetriesExhausted,
    /// Stopped by SIGINT or SIGTERM.
    Interrupted,
}

impl WrapperOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            WrapperOutcome::Completed
            | WrapperOutcome::Waiting { .. }
            | WrapperOutcome::Armed { .. } => 0,
            WrapperOutcome::Failed {
                exit_code: Some(code),
            } if *code != 0 => *code,
            WrapperOutcome::Failed { .. } => 1,
            WrapperOutcome::RetriesExhausted => 2,
            WrapperOutcome::Interrupted => 130,
        }
    }
}

/// Errors that end a wrapper invocation.
#[derive(Debug)]
pub enum WrapperError {
    /// The command given on this invocation could not be run.
    Session(SessionError),
    /// A scheduled resume could not be run.
    Resume(SessionError),
}

impl std::fmt::Display for WrapperError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WrapperError::Session(e) => write!(f, "{e}"),
            WrapperError::Resume(e) => write!(f, "automatic resume failed: {e}"),
        }
    }
}

impl std::error::Error for WrapperError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WrapperError::Session(e) | WrapperError::Resume(e) => Some(e),
        }
    }
}

/// Options for a single invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// On a cold start with a pending wait, sleep until the reset time and resume.
    pub wait_for_reset: bool,
    /// After a limit, persist the resume and exit instead of waiting in-process.
    pub detach: bool,
}

pub struct Wrapper {
    supervisor: Supervisor,
    store: StateStore,
    timer: ResumeTimer,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Wrapper {
    pub fn new(config: &WrapperConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            supervisor: Supervisor::new(
                config.agent.clone(),
                config.wait.clone(),
                Duration::from_secs(config.shutdown.kill_grace_secs),
                clock.clone(),
            ),
            store: StateStore::new(config.state.state_file.clone()),
            timer: ResumeTimer::new(clock.clone()),
            retry: RetryPolicy::new(config.retry.max_retries),
            clock,
        }
    }

    #[cfg(test)]
    fn discard_output(mut self) -> Self {
        self.supervisor = self.supervisor.discard_output();
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now().with_timezone(&Utc)
    }

    /// Decide from the persisted record what this invocation does, then do it.
    pub async fn run(
        &self,
        args: &[String],
        options: RunOptions,
    ) -> Result<WrapperOutcome, WrapperError> {
        match scheduler::cold_start(self.store.load(), self.now()) {
            ColdStart::Fresh => {
                tracing::info!(args = ?args, "no pending resume, running command");
                self.execute(args.to_vec(), 0, false, options).await
            }
            ColdStart::Resume { record } => {
                tracing::info!(
                    command = ?record.original_command,
                    reset_time = ?record.reset_time,
                    "reset time reached, resuming pending command"
                );
                self.execute(record.original_command, record.retry_count, true, options)
                    .await
            }
            ColdStart::Wait {
                resume_at,
                remaining,
                record,
            } => {
                tracing::info!(
                    reset_time = %resume_at,
                    remaining_secs = remaining.as_secs(),
                    "resume still pending"
                );
                println!("{}", report::still_waiting(resume_at, remaining));
                if !options.wait_for_reset {
                    return Ok(WrapperOutcome::Waiting { resume_at });
                }
                self.timer.arm(resume_at).await;
                self.execute(record.original_command, record.retry_count, true, options)
                    .await
            }
        }
    }

    /// Run `command` until it completes, fails, or gives up on limits.
    ///
    /// `resumed` marks that this run re-executes a stored command, so the
    /// record is cleared right before it starts and a spawn failure is
    /// reported as a failed resume.
    async fn execute(
        &self,
        command: Vec<String>,
        mut retry_count: u32,
        mut resumed: bool,
        options: RunOptions,
    ) -> Result<WrapperOutcome, WrapperError> {
        loop {
            if resumed {
                println!("{}", report::resuming(&command));
                self.store.clear_logged();
            }

            // Decided and persisted before the child is terminated.
            let mut decision = None;
            let on_limit = |resume_at: DateTime<Utc>, _hint: ResetHint| {
                let d = self.retry.evaluate(retry_count);
                if let RetryDecision::Arm { attempt } = d {
                    self.persist(&command, resume_at, attempt);
                }
                decision = Some(d);
            };

            let result = match self.supervisor.run(&command, on_limit).await {
                Ok(result) => result,
                Err(e) if resumed => {
                    tracing::error!(error = %e, "automatic resume failed");
                    eprintln!("{}", report::resume_failed());
                    return Err(WrapperError::Resume(e));
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to run command");
                    return Err(WrapperError::Session(e));
                }
            };
            tracing::debug!(
                pid = result.pid,
                output_bytes = result.output_bytes,
                duration_secs = result.duration.as_secs(),
                retry_count,
                "run finished"
            );

            let (resume_at, hint) = match result.outcome {
                RunOutcome::Completed => {
                    self.store.clear_logged();
                    tracing::info!("command completed");
                    return Ok(WrapperOutcome::Completed);
                }
                RunOutcome::Failed { exit_code } => {
                    tracing::error!(exit_code = ?exit_code, "command failed");
                    match exit_code {
                        Some(code) => eprintln!("Command failed with exit code {code}."),
                        None => eprintln!("Command was terminated by a signal."),
                    }
                    return Ok(WrapperOutcome::Failed { exit_code });
                }
                RunOutcome::Interrupted => {
                    tracing::warn!("interrupted, exiting without resuming");
                    return Ok(WrapperOutcome::Interrupted);
                }
                RunOutcome::LimitDetected { resume_at, hint } => (resume_at, hint),
            };

            let attempt = match decision {
                Some(RetryDecision::Arm { attempt }) => attempt,
                Some(RetryDecision::GiveUp) | None => {
                    self.store.clear_logged();
                    eprintln!("{}", report::retries_exhausted(self.retry.max_retries()));
                    return Ok(WrapperOutcome::RetriesExhausted);
                }
            };

            let wait = scheduler::delay_until(self.now(), resume_at);
            println!("{}", report::limit_detected(resume_at, wait, hint));

            if options.detach {
                return Ok(WrapperOutcome::Armed { resume_at });
            }

            self.timer.arm(resume_at).await;
            retry_count = attempt;
            resumed = true;
        }
    }

    /// Save the pending resume. A failure only costs restart durability,
    /// so it is logged and the in-process wait goes ahead.
    fn persist(&self, command: &[String], resume_at: DateTime<Utc>, attempt: u32) {
        if let Err(e) = self
            .store
            .save(command, resume_at, attempt, self.retry.max_retries())
        {
            tracing::error!(
                error = %e,
                "failed to persist pending resume; it will not survive a restart"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::scheduler::ManualClock;
    use chrono::{Local, TimeZone};
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempdir().unwrap(),
                clock: Arc::new(ManualClock::new(
                    Local.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap(),
                )),
            }
        }

        fn config(&self, command: &str, max_retries: u32) -> WrapperConfig {
            let mut config = WrapperConfig {
                agent: AgentConfig {
                    command: command.to_string(),
                    args: vec!["-c".to_string()],
                },
                ..Default::default()
            };
            config.retry.max_retries = max_retries;
            config.shutdown.kill_grace_secs = 1;
            config.resolve_paths(self.dir.path());
            config
        }

        fn wrapper(&self, max_retries: u32) -> Wrapper {
            Wrapper::new(&self.config("sh", max_retries), self.clock.clone()).discard_output()
        }

        fn store(&self) -> StateStore {
            StateStore::new(self.config("sh", 0).state.state_file)
        }

        fn path(&self, name: &str) -> String {
            self.dir.path().join(name).display().to_string()
        }

        /// Hits a limit on the first run, succeeds afterwards. Every run
        /// appends a line to `runs`.
        fn limited_once(&self) -> Vec<String> {
            vec![format!(
                "echo run >> {runs}; \
                 if [ -f {marker} ]; then echo finished; exit 0; fi; \
                 touch {marker}; echo 'rate limit exceeded, reset in 5 minutes'; sleep 30",
                runs = self.path("runs"),
                marker = self.path("marker"),
            )]
        }

        fn runs(&self) -> usize {
            count_lines(&self.dir.path().join("runs"))
        }
    }

    fn count_lines(path: &Path) -> usize {
        std::fs::read_to_string(path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn detached() -> RunOptions {
        RunOptions {
            detach: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_completed_leaves_store_idle() {
        let fx = Fixture::new();
        let outcome = fx
            .wrapper(3)
            .run(&["echo hello".to_string()], RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, WrapperOutcome::Completed);
        assert_eq!(outcome.exit_code(), 0);
        assert!(!fx.store().load().is_waiting);
    }

    #[tokio::test]
    async fn test_failed_reports_exit_code_without_pending_resume() {
        let fx = Fixture::new();
        let outcome = fx
            .wrapper(3)
            .run(&["exit 3".to_string()], RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, WrapperOutcome::Failed { exit_code: Some(3) });
        assert_eq!(outcome.exit_code(), 3);
        assert!(!fx.store().load().is_waiting);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_session_error() {
        let fx = Fixture::new();
        let wrapper = Wrapper::new(&fx.config("nonexistent-binary-xyz", 3), fx.clock.clone())
            .discard_output();
        let err = wrapper
            .run(&[], RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WrapperError::Session(SessionError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_limit_then_cold_start_resume() {
        let fx = Fixture::new();
        let command = fx.limited_once();
        let resume_at = fx.clock.now().with_timezone(&Utc) + chrono::Duration::minutes(5);

        // First run hits the limit and persists the resume.
        let outcome = fx.wrapper(3).run(&command, detached()).await.unwrap();
        assert_eq!(outcome, WrapperOutcome::Armed { resume_at });
        assert_eq!(outcome.exit_code(), 0);

        let record = fx.store().load();
        assert!(record.is_waiting);
        assert_eq!(record.original_command, command);
        assert_eq!(record.reset_time, Some(resume_at));
        assert_eq!(record.retry_count, 1);
        assert_eq!(fx.runs(), 1);

        // Before the reset time a cold start only reports.
        let outcome = fx
            .wrapper(3)
            .run(&["echo other".to_string()], RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, WrapperOutcome::Waiting { resume_at });
        assert_eq!(fx.runs(), 1);

        // After it, the stored command runs exactly once and the store is cleared.
        fx.clock.advance(chrono::Duration::minutes(6));
        let outcome = fx
            .wrapper(3)
            .run(&["echo other".to_string()], RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, WrapperOutcome::Completed);
        assert_eq!(fx.runs(), 2);
        assert!(!fx.store().load().is_waiting);
        assert!(!fx.store().path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_process_timer_resumes() {
        let fx = Fixture::new();
        let outcome = fx
            .wrapper(3)
            .run(&fx.limited_once(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, WrapperOutcome::Completed);
        assert_eq!(fx.runs(), 2);
        assert!(!fx.store().load().is_waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_gives_up() {
        let fx = Fixture::new();
        let command = vec![format!(
            "echo run >> {}; echo 'usage limit reached'; sleep 30",
            fx.path("runs")
        )];

        let outcome = fx
            .wrapper(2)
            .run(&command, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, WrapperOutcome::RetriesExhausted);
        assert_eq!(outcome.exit_code(), 2);
        // First run plus two resumes.
        assert_eq!(fx.runs(), 3);
        assert!(!fx.store().load().is_waiting);
    }

    #[tokio::test]
    async fn test_resume_spawn_failure_is_resume_error() {
        let fx = Fixture::new();
        let past = fx.clock.now().with_timezone(&Utc) - chrono::Duration::minutes(1);
        fx.store().save(&["anything".to_string()], past, 1, 3).unwrap();

        let wrapper = Wrapper::new(&fx.config("nonexistent-binary-xyz", 3), fx.clock.clone())
            .discard_output();
        let err = wrapper
            .run(&[], RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WrapperError::Resume(_)));
        assert!(err.to_string().starts_with("automatic resume failed"));
        // The record was cleared before the resumed run started.
        assert!(!fx.store().load().is_waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_reset_sleeps_then_resumes() {
        let fx = Fixture::new();
        let future = fx.clock.now().with_timezone(&Utc) + chrono::Duration::minutes(20);
        fx.store()
            .save(
                &[format!("echo run >> {}", fx.path("runs"))],
                future,
                1,
                3,
            )
            .unwrap();

        let start = tokio::time::Instant::now();
        let outcome = fx
            .wrapper(3)
            .run(
                &[],
                RunOptions {
                    wait_for_reset: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, WrapperOutcome::Completed);
        assert!(start.elapsed() >= Duration::from_secs(20 * 60));
        assert_eq!(fx.runs(), 1);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(WrapperOutcome::Failed { exit_code: None }.exit_code(), 1);
        assert_eq!(WrapperOutcome::Interrupted.exit_code(), 130);
        assert_eq!(
            WrapperOutcome::Failed {
                exit_code: Some(0)
            }
            .exit_code(),
            1
        );
        assert_eq!(
            WrapperOutcome::Waiting {
                resume_at: Utc::now()
            }
            .exit_code(),
            0
        );
    }
}
