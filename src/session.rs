/// Single supervised execution: spawn the wrapped tool, mirror its output,
/// and stop it as soon as a usage limit shows up.
use crate::config::{AgentConfig, WaitConfig};
use crate::ratelimit::LimitLatch;
use crate::reset_time::{self, ResetHint};
use crate::scheduler::Clock;
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};

/// Bytes of earlier output re-scanned with each new fragment, so a phrase
/// split across reads is still seen.
const SCAN_OVERLAP: usize = 256;

const READ_CHUNK: usize = 8192;

/// Captured output kept for reset-time parsing. Older text is dropped.
const MAX_CAPTURED: usize = 256 * 1024;

/// How a supervised execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exited successfully before any limit was seen.
    Completed,
    /// A limit was seen and the process was terminated.
    LimitDetected {
        resume_at: DateTime<Utc>,
        hint: ResetHint,
    },
    /// Exited unsuccessfully without a limit (None if killed by a signal).
    Failed { exit_code: Option<i32> },
    /// The wrapper got SIGINT or SIGTERM; the child's group was terminated.
    Interrupted,
}

/// Result of a finished execution.
#[derive(Debug)]
pub struct SessionResult {
    pub outcome: RunOutcome,
    /// Total bytes read from stdout and stderr.
    pub output_bytes: u64,
    pub duration: Duration,
    pub pid: u32,
}

/// Errors that can occur during session execution.
#[derive(Debug)]
pub enum SessionError {
    /// Failed to spawn the wrapped tool.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Failed to read child output or mirror it.
    Io { source: std::io::Error },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Spawn { command, source } => {
                write!(f, "failed to spawn {command}: {source}")
            }
            SessionError::Io { source } => {
                write!(f, "I/O error during session: {source}")
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Spawn { source, .. } => Some(source),
            SessionError::Io { source } => Some(source),
        }
    }
}

/// Build the full argument list: configured prefix args, then the user's command.
fn build_args(agent_config: &AgentConfig, command: &[String]) -> Vec<String> {
    agent_config
        .args
        .iter()
        .chain(command.iter())
        .cloned()
        .collect()
}

/// Runs the wrapped tool one execution at a time.
#[derive(Clone)]
pub struct Supervisor {
    agent: AgentConfig,
    wait: WaitConfig,
    kill_grace: Duration,
    clock: Arc<dyn Clock>,
    mirror_output: bool,
}

impl Supervisor {
    pub fn new(
        agent: AgentConfig,
        wait: WaitConfig,
        kill_grace: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            agent,
            wait,
            kill_grace,
            clock,
            mirror_output: true,
        }
    }

    /// Drop child output instead of writing it to the terminal.
    #[cfg(test)]
    pub fn discard_output(mut self) -> Self {
        self.mirror_output = false;
        self
    }

    /// Run `command`, mirroring to this process's stdout and stderr.
    pub async fn run<F>(&self, command: &[String], on_limit: F) -> Result<SessionResult, SessionError>
    where
        F: FnOnce(DateTime<Utc>, ResetHint),
    {
        if !self.mirror_output {
            let (mut out, mut err) = (tokio::io::sink(), tokio::io::sink());
            return self
                .run_mirrored(command, &mut out, &mut err, on_limit)
                .await;
        }
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        self.run_mirrored(command, &mut stdout, &mut stderr, on_limit)
            .await
    }

    /// Run `command`, mirroring its streams into `out` and `err` as they arrive.
    ///
    /// `on_limit` is called with the resume instant once a limit is seen,
    /// before the child is terminated. The child gets its own process group
    /// so termination reaches anything it spawned, and SIGINT or SIGTERM to
    /// this process is forwarded to that group.
    pub async fn run_mirrored<O, E, F>(
        &self,
        command: &[String],
        out: &mut O,
        err: &mut E,
        on_limit: F,
    ) -> Result<SessionResult, SessionError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
        F: FnOnce(DateTime<Utc>, ResetHint),
    {
        self.supervise(command, out, err, on_limit, shutdown_signal())
            .await
    }

    /// `run_mirrored` with the interrupt source supplied by the caller.
    async fn supervise<O, E, F, I>(
        &self,
        command: &[String],
        out: &mut O,
        err: &mut E,
        on_limit: F,
        interrupt: I,
    ) -> Result<SessionResult, SessionError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
        F: FnOnce(DateTime<Utc>, ResetHint),
        I: Future<Output = ()>,
    {
        let args = build_args(&self.agent, command);
        tracing::info!(command = %self.agent.command, args = ?args, "spawning wrapped command");

        let start = Instant::now();
        let mut child = Command::new(&self.agent.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Spawn {
                command: self.agent.command.clone(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, "wrapped command started");

        let missing_pipe = || SessionError::Io {
            source: std::io::Error::other("child pipe was not captured"),
        };
        let mut child_out = child.stdout.take().ok_or_else(missing_pipe)?;
        let mut child_err = child.stderr.take().ok_or_else(missing_pipe)?;

        let mut out_buf = [0u8; READ_CHUNK];
        let mut err_buf = [0u8; READ_CHUNK];
        let mut out_open = true;
        let mut err_open = true;
        let mut out_text = Utf8Carry::default();
        let mut err_text = Utf8Carry::default();
        let mut captured = String::new();
        let mut latch = LimitLatch::new();
        let mut output_bytes = 0u64;
        let mut detected = None;
        let mut interrupted = false;
        tokio::pin!(interrupt);

        while (out_open || err_open) && detected.is_none() {
            let (read, from_stdout) = tokio::select! {
                r = child_out.read(&mut out_buf), if out_open => (r, true),
                r = child_err.read(&mut err_buf), if err_open => (r, false),
                _ = &mut interrupt => {
                    interrupted = true;
                    break;
                }
            };
            let n = read.map_err(|e| SessionError::Io { source: e })?;
            if n == 0 {
                if from_stdout {
                    out_open = false;
                } else {
                    err_open = false;
                }
                continue;
            }

            let bytes = if from_stdout {
                &out_buf[..n]
            } else {
                &err_buf[..n]
            };
            let mirror_result = if from_stdout {
                mirror(out, bytes).await
            } else {
                mirror(err, bytes).await
            };
            mirror_result.map_err(|e| SessionError::Io { source: e })?;
            output_bytes += n as u64;

            let fragment = if from_stdout {
                out_text.decode(bytes)
            } else {
                err_text.decode(bytes)
            };
            if !from_stdout {
                tracing::debug!(stderr = %fragment.trim_end(), "wrapped command stderr");
            }
            let window_start = scan_window_start(&captured, SCAN_OVERLAP);
            captured.push_str(&fragment);

            if latch.observe(&captured[window_start..]) {
                let now = self.clock.now();
                let (resume_at, hint) =
                    reset_time::extract_resume_instant(&captured, &now, &self.wait);
                tracing::warn!(
                    pid,
                    family = hint.family(),
                    resume_at = %resume_at,
                    "usage limit detected"
                );
                detected = Some((resume_at.with_timezone(&Utc), hint));
            } else {
                trim_front(&mut captured, MAX_CAPTURED);
            }
        }

        if interrupted {
            tracing::warn!(pid, "interrupted, stopping wrapped command");
            self.terminate(&mut child, pid).await;
        }

        let outcome = match detected {
            _ if interrupted => RunOutcome::Interrupted,
            Some((resume_at, hint)) => {
                on_limit(resume_at, hint);
                self.terminate(&mut child, pid).await;
                RunOutcome::LimitDetected { resume_at, hint }
            }
            None => {
                let status = child
                    .wait()
                    .await
                    .map_err(|e| SessionError::Io { source: e })?;
                if status.success() {
                    RunOutcome::Completed
                } else {
                    RunOutcome::Failed {
                        exit_code: status.code(),
                    }
                }
            }
        };

        let duration = start.elapsed();
        tracing::info!(
            outcome = ?outcome,
            output_bytes,
            duration_secs = duration.as_secs(),
            "wrapped command finished"
        );

        Ok(SessionResult {
            outcome,
            output_bytes,
            duration,
            pid,
        })
    }

    /// SIGTERM the process group, then SIGKILL if it outlives the grace period.
    async fn terminate(&self, child: &mut Child, pid: u32) {
        let pgid = Pid::from_raw(pid as i32);
        if pid != 0 {
            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM to process group failed");
            }
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid, status = %status, "wrapped command terminated");
            }
            Ok(Err(e)) => {
                tracing::warn!(pid, error = %e, "failed to reap wrapped command");
            }
            Err(_) => {
                tracing::warn!(
                    pid,
                    grace_secs = self.kill_grace.as_secs(),
                    "wrapped command ignored SIGTERM, killing"
                );
                if pid != 0 {
                    let _ = killpg(pgid, Signal::SIGKILL);
                }
                if let Err(e) = child.kill().await {
                    tracing::warn!(pid, error = %e, "failed to kill wrapped command");
                }
            }
        }
    }
}

async fn mirror<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Decodes one stream's chunks, holding back a multi-byte character that
/// was split across reads until the rest of it arrives.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut rest: &[u8] = &self.pending;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            rest = tail;
                            break;
                        }
                    }
                }
            }
        }
        let leftover = rest.to_vec();
        self.pending = leftover;
        text
    }
}

/// Completes on SIGINT or SIGTERM to this process.
async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = terminate => {}
        _ = ctrl_c => {}
    }
}

/// Drop the oldest text so `buf` holds at most `max` bytes.
fn trim_front(buf: &mut String, max: usize) {
    if buf.len() > max {
        let start = scan_window_start(buf, max);
        buf.drain(..start);
    }
}

/// Start of the last `overlap` bytes of `text`, moved forward to a char boundary.
fn scan_window_start(text: &str, overlap: usize) -> usize {
    let mut start = text.len().saturating_sub(overlap);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    start
}
