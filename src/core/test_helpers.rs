//! Shared test utilities for driver and manager tests
//!
//! Provides a scripted [`CommandRunner`] so driver algorithms can be exercised without
//! spawning real processes. This module is only compiled in test mode.

use crate::core::error::Result;
use crate::core::exec::{CommandOutput, CommandRunner, OpContext};
use async_trait::async_trait;
use std::sync::Mutex;

type Script = Box<dyn Fn(&str, &[String]) -> CommandOutput + Send + Sync>;

/// A [`CommandRunner`] that answers through a closure and records every invocation.
///
/// Each recorded call is the program followed by its arguments, joined by spaces.
///
/// # Example
///
/// ```ignore
/// let runner = FakeRunner::new(|program, args| match args.first().map(String::as_str) {
///     Some("--query-port") => CommandOutput::ok("yes"),
///     _ => CommandOutput::ok(""),
/// });
/// ```
pub struct FakeRunner {
    script: Script,
    calls: Mutex<Vec<String>>,
}

impl Default for FakeRunner {
    /// Every command succeeds with empty output.
    fn default() -> Self {
        Self::new(|_, _| CommandOutput::ok(""))
    }
}

impl FakeRunner {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str, &[String]) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every invocation so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Invocations whose command line contains `needle`.
    pub fn calls_containing(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, _ctx: &OpContext, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.calls.lock().unwrap().push(line);
        Ok((self.script)(program, args))
    }
}
