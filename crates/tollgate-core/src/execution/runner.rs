//! Check runners: the seam between the executor and whatever actually
//! validates the change.

use std::io::{ErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::execution::cancel::CancelToken;
use crate::gates::catalog::CheckSpec;
use crate::gates::guards::{
    truncate_output, CANCEL_POLL_INTERVAL, MAX_OUTPUT_BYTES, OUTPUT_DRAIN_GRACE,
};
use crate::models::{CheckOutcome, CheckResult, Criticality, RiskLevel};

/// Prefix of an output line through which a check reports observed risk.
pub const RISK_MARKER: &str = "TOLLGATE_RISK=";

/// Everything a runner needs besides the check itself.
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub level: String,
    /// Time left for this attempt.
    pub timeout: Duration,
    pub cancel: CancelToken,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Exited(i32),
    /// Terminated by a signal or otherwise without an exit code.
    Killed,
    TimedOut,
    Cancelled,
    SpawnFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutput {
    pub status: RunStatus,
    pub output: String,
    pub reported_risk: Option<RiskLevel>,
}

impl CheckOutput {
    pub fn exited(code: i32, output: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Exited(code),
            output: output.into(),
            reported_risk: None,
        }
    }

    pub fn status(status: RunStatus) -> Self {
        Self {
            status,
            output: String::new(),
            reported_risk: None,
        }
    }

    pub fn with_reported_risk(mut self, risk: RiskLevel) -> Self {
        self.reported_risk = Some(risk);
        self
    }
}

/// Runs one attempt of one check. Must return promptly once
/// `ctx.cancel` is set or `ctx.timeout` elapses.
pub trait CheckRunner: Send + Sync {
    fn run(&self, check: &CheckSpec, ctx: &CheckContext) -> CheckOutput;
}

impl<F> CheckRunner for F
where
    F: Fn(&CheckSpec, &CheckContext) -> CheckOutput + Send + Sync,
{
    fn run(&self, check: &CheckSpec, ctx: &CheckContext) -> CheckOutput {
        self(check, ctx)
    }
}

// ---------------------------------------------------------------------------
// Attempt loop
// ---------------------------------------------------------------------------

/// Run `check` with retries inside its own timeout window, waiting out the
/// check's backoff between attempts.
///
/// Returns `None` when cancelled; a cancelled check leaves no result.
pub fn run_with_retries(
    runner: &dyn CheckRunner,
    check: &CheckSpec,
    criticality: Criticality,
    level: &str,
    cancel: &CancelToken,
) -> Option<CheckResult> {
    let started = Instant::now();
    let deadline = started + check.timeout;
    let max_attempts = check.retries.saturating_add(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Some(finish(
                check,
                criticality,
                level,
                CheckOutcome::TimedOut,
                started,
                attempt - 1,
                String::new(),
                None,
            ));
        }
        let ctx = CheckContext {
            level: level.to_string(),
            timeout: remaining,
            cancel: cancel.clone(),
            attempt,
        };
        let out = runner.run(check, &ctx);
        if cancel.is_cancelled() {
            return None;
        }

        let outcome = match &out.status {
            RunStatus::Exited(code) if check.expected.accepts(*code) => CheckOutcome::Pass,
            RunStatus::Exited(_) | RunStatus::Killed => CheckOutcome::Fail,
            RunStatus::SpawnFailed(_) => CheckOutcome::Fail,
            RunStatus::TimedOut => CheckOutcome::TimedOut,
            RunStatus::Cancelled => return None,
        };

        let mut output = out.output;
        if let RunStatus::SpawnFailed(reason) = &out.status {
            output = format!("failed to start: {reason}");
        }

        if outcome == CheckOutcome::Fail && attempt < max_attempts {
            // Only retry when the backoff ends inside the timeout window.
            let delay = check.backoff.delay(attempt);
            if Instant::now() + delay < deadline {
                debug!(
                    check = %check.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "check failed, retrying"
                );
                if !cancel.sleep(delay, CANCEL_POLL_INTERVAL) {
                    return None;
                }
                continue;
            }
        }
        return Some(finish(
            check,
            criticality,
            level,
            outcome,
            started,
            attempt,
            output,
            out.reported_risk,
        ));
    }
}

#[allow(clippy::too_many_arguments)]
fn finish(
    check: &CheckSpec,
    criticality: Criticality,
    level: &str,
    outcome: CheckOutcome,
    started: Instant,
    attempts: u32,
    output: String,
    reported_risk: Option<RiskLevel>,
) -> CheckResult {
    CheckResult {
        name: check.name.clone(),
        level: level.to_string(),
        criticality,
        outcome,
        duration: started.elapsed(),
        output: truncate_output(&output),
        attempts,
        reported_risk,
        completed_at_ms: 0,
    }
}

// ---------------------------------------------------------------------------
// Process runner
// ---------------------------------------------------------------------------

/// Shells out to `check.command`, killing the process on timeout or cancel.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    poll_interval: Duration,
    drain_grace: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self {
            poll_interval: CANCEL_POLL_INTERVAL,
            drain_grace: OUTPUT_DRAIN_GRACE,
        }
    }
}

impl CommandRunner {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            ..Self::default()
        }
    }

    /// How long to wait for output pipes to close once the process is gone.
    /// Background grandchildren can hold them open indefinitely.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    fn spawn(check: &CheckSpec) -> std::io::Result<Child> {
        let (program, args) = check
            .command
            .split_first()
            .ok_or_else(|| std::io::Error::other("empty command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&check.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &check.working_dir {
            cmd.current_dir(dir);
        }
        cmd.spawn()
    }

    /// Collect both pipes, giving them `drain_grace` in total to reach EOF.
    fn gather(&self, stdout: Option<PipeReader>, stderr: Option<PipeReader>) -> String {
        let deadline = Instant::now() + self.drain_grace;
        let mut output = stdout.map(|r| r.collect(deadline)).unwrap_or_default();
        let err = stderr.map(|r| r.collect(deadline)).unwrap_or_default();
        if !err.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&err);
        }
        output
    }
}

/// Reads one child pipe on its own thread into a shared buffer, so the
/// caller can stop waiting without losing what was already read.
struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: thread::JoinHandle<()>,
}

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Self> {
        let mut pipe = pipe?;
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        // Keep reading past the cap so the writer never blocks.
                        let mut buf = sink.lock();
                        let room = (MAX_OUTPUT_BYTES + 1).saturating_sub(buf.len());
                        buf.extend_from_slice(&chunk[..n.min(room)]);
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        });
        Some(Self { buf, handle })
    }

    /// Wait for EOF until `deadline`, then take whatever has been read. A
    /// reader still blocked at the deadline is detached.
    fn collect(self, deadline: Instant) -> String {
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if !self.handle.is_finished() {
            debug!("output pipe still open, keeping partial output");
        }
        let bytes = std::mem::take(&mut *self.buf.lock());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn parse_reported_risk(output: &str) -> Option<RiskLevel> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix(RISK_MARKER))
        .filter_map(|value| {
            RiskLevel::ALL
                .into_iter()
                .find(|level| level.as_str().eq_ignore_ascii_case(value.trim()))
        })
        .max()
}

impl CheckRunner for CommandRunner {
    fn run(&self, check: &CheckSpec, ctx: &CheckContext) -> CheckOutput {
        let mut child = match Self::spawn(check) {
            Ok(child) => child,
            Err(e) => {
                warn!(check = %check.name, error = %e, "check failed to spawn");
                return CheckOutput::status(RunStatus::SpawnFailed(e.to_string()));
            }
        };
        let stdout = PipeReader::spawn(child.stdout.take());
        let stderr = PipeReader::spawn(child.stderr.take());

        let started = Instant::now();
        let deadline = started + ctx.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(exit)) => break exit.code().map_or(RunStatus::Killed, RunStatus::Exited),
                Ok(None) => {}
                Err(e) => break RunStatus::SpawnFailed(e.to_string()),
            }
            if ctx.cancel.is_cancelled() {
                break RunStatus::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                break RunStatus::TimedOut;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        };

        if matches!(status, RunStatus::Cancelled | RunStatus::TimedOut) {
            debug!(check = %check.name, ?status, "killing check process");
            let _ = child.kill();
            let _ = child.wait();
            let partial = self.gather(stdout, stderr);
            let mut output = format!("process killed after {} ms", started.elapsed().as_millis());
            if !partial.trim().is_empty() {
                output.push('\n');
                output.push_str(&partial);
            }
            return CheckOutput {
                status,
                output: truncate_output(&output),
                reported_risk: None,
            };
        }

        let output = self.gather(stdout, stderr);
        let reported_risk = parse_reported_risk(&output);
        CheckOutput {
            status,
            output,
            reported_risk,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
