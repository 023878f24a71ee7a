//! External command execution with deadlines and cancellation
//!
//! Every native tool invocation goes through a [`CommandRunner`]. The production
//! [`SystemRunner`] spawns the process with `tokio::process`, and races it against the
//! caller's [`OpContext`]; when the deadline passes or the token is cancelled the child is
//! killed and the call fails with [`Error::Cancelled`].
//!
//! Drivers never interpret raw exit codes themselves. Each backend supplies a
//! [`Classifier`] that maps captured output to an [`Outcome`], isolating the diagnostic
//! substring matching in one place per backend.

use crate::core::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Deadline and cancellation scope for one caller-level operation
///
/// Cloning shares the cancellation token, so cancelling any clone cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl OpContext {
    /// A context without deadline that is only cancelled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Attaches an externally owned token (e.g. cancelled on Ctrl-C).
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once cancelled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves with a reason once the context is cancelled or its deadline expires.
    pub async fn done(&self) -> &'static str {
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.cancel.cancelled() => "cancelled",
                () = tokio::time::sleep_until(deadline) => "deadline exceeded",
            },
            None => {
                self.cancel.cancelled().await;
                "cancelled"
            }
        }
    }
}

/// Captured result of one external invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            success: false,
        }
    }

    /// Stdout and stderr joined, trimmed; used for diagnostics.
    pub fn combined(&self) -> String {
        let out = self.stdout.trim();
        let err = self.stderr.trim();
        match (out.is_empty(), err.is_empty()) {
            (true, _) => err.to_string(),
            (false, true) => out.to_string(),
            (false, false) => format!("{err}\n{out}"),
        }
    }
}

/// How a backend interprets a finished invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Target state already present; treated as success by mutating callers
    AlreadyExists,
    /// Target absent; removals treat this as success after the listing confirmed the ID
    Missing,
    Failure,
}

/// Maps captured output to an [`Outcome`]
pub type Classifier = fn(&CommandOutput) -> Outcome;

/// Classifier for tools without special diagnostics.
pub fn exit_status(output: &CommandOutput) -> Outcome {
    if output.success {
        Outcome::Success
    } else {
        Outcome::Failure
    }
}

/// Spawns external processes on behalf of drivers
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` to completion, bounded by `ctx`.
    ///
    /// A non-zero exit is not an error at this level; it is reported in [`CommandOutput`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the context ends first and
    /// [`Error::ExternalTool`] if the process cannot be spawned.
    async fn run(&self, ctx: &OpContext, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs real processes via `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, ctx: &OpContext, program: &str, args: &[String]) -> Result<CommandOutput> {
        if ctx.is_done() {
            return Err(Error::Cancelled(format!("{program} not started")));
        }

        debug!("Running {program} {}", args.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ExternalTool {
                program: program.to_string(),
                message: format!("failed to spawn: {e}"),
                exit_code: None,
            })?;

        // Dropping the wait future drops the child, and kill_on_drop terminates it.
        let output = tokio::select! {
            result = child.wait_with_output() => result?,
            reason = ctx.done() => {
                warn!("{program} terminated: {reason}");
                return Err(Error::Cancelled(format!("{program}: {reason}")));
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            success: output.status.success(),
        })
    }
}

/// Converts a string-slice argument list into owned arguments.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
