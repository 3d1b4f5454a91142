//! Child process runner.
//!
//! Spawns one runtime process per scenario, drains stdout/stderr on
//! dedicated reader threads, polls for exit, and kills the child on timeout
//! or harness cancellation. Whatever the child wrote before it was killed is
//! kept in the [`RunResult`].

use std::collections::BTreeMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::driver::DriverPayload;
use crate::error::ProcessSpawnError;
use crate::scenario::Scenario;

pub const PAYLOAD_LEN_ENV: &str = "TIERPROBE_PAYLOAD_LEN";
pub const PAYLOAD_FLAG: &str = "--payload";

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How to start the runtime under test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCommand {
    pub program: String,
    /// Driver entry point arguments, placed after the scenario flags.
    #[serde(default)]
    pub driver_args: Vec<String>,
    /// Extra environment on top of the inherited one.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RuntimeCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Arguments after the program: scenario flags, driver entry, payload.
    pub fn args(&self, scenario: &Scenario, payload_json: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(scenario.flags().len() + self.driver_args.len() + 2);
        args.extend(scenario.flags().iter().cloned());
        args.extend(self.driver_args.iter().cloned());
        args.push(PAYLOAD_FLAG.to_string());
        args.push(payload_json.to_string());
        args
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// `None` when the child was terminated by a signal, including our own
    /// kill on timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub cancelled: bool,
    pub command_line: String,
}

impl RunResult {
    pub fn killed(&self) -> bool {
        self.timed_out || self.cancelled
    }

    pub fn combined_output(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len());
        combined.push_str(&self.stdout);
        combined.push_str(&self.stderr);
        combined
    }
}

/// Harness-wide cancellation: an explicit flag plus an optional deadline.
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(after: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + after),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Launches one scenario. Implementations must not share mutable state
/// between concurrent launches.
pub trait ScenarioLauncher: Sync {
    fn launch(
        &self,
        scenario: &Scenario,
        payload: &DriverPayload,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RunResult, ProcessSpawnError>;

    /// Shell-ready command line reproducing the launch by hand.
    fn replay_command(&self, scenario: &Scenario, payload: &DriverPayload) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildProcessRunner {
    command: RuntimeCommand,
}

impl ChildProcessRunner {
    pub fn new(command: RuntimeCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &RuntimeCommand {
        &self.command
    }
}

impl ScenarioLauncher for ChildProcessRunner {
    fn launch(
        &self,
        scenario: &Scenario,
        payload: &DriverPayload,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RunResult, ProcessSpawnError> {
        let payload_json = serde_json::to_string(payload)?;
        let args = self.command.args(scenario, &payload_json);
        let command_line = render_command_line(&self.command.program, &args);

        let mut command = Command::new(&self.command.program);
        command
            .args(&args)
            .envs(&self.command.env)
            .env(PAYLOAD_LEN_ENV, payload_json.len().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| ProcessSpawnError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let mut timed_out = false;
        let mut cancelled = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(source) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    join_output(stdout_reader);
                    join_output(stderr_reader);
                    return Err(ProcessSpawnError::Wait {
                        program: self.command.program.clone(),
                        source,
                    });
                }
            }
            if start.elapsed() >= timeout {
                timed_out = true;
                let _ = child.kill();
                break child.wait().ok();
            }
            if cancel.is_cancelled() {
                cancelled = true;
                let _ = child.kill();
                break child.wait().ok();
            }
            thread::sleep(POLL_INTERVAL);
        };

        let duration = start.elapsed();
        Ok(RunResult {
            exit_code: status.and_then(|status| status.code()),
            stdout: join_output(stdout_reader),
            stderr: join_output(stderr_reader),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            timed_out,
            cancelled,
            command_line,
        })
    }

    fn replay_command(&self, scenario: &Scenario, payload: &DriverPayload) -> String {
        let payload_json = serde_json::to_string(payload).unwrap_or_default();
        let args = self.command.args(scenario, &payload_json);
        let mut prefix = String::new();
        for (key, value) in &self.command.env {
            prefix.push_str(&format!("{key}={} ", shell_quote(value)));
        }
        prefix.push_str(&format!("{PAYLOAD_LEN_ENV}={} ", payload_json.len()));
        format!("{prefix}{}", render_command_line(&self.command.program, &args))
    }
}

fn spawn_reader<R>(mut stream: R) -> JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn join_output(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg.chars().all(|ch| {
            ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | ':' | '=' | '+' | ',')
        });
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub fn render_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{CompileLevel, ScenarioMatrix};
    use crate::test_spec::TestSpec;

    fn scenario() -> Arc<Scenario> {
        ScenarioMatrix::single(["-Xint"])
            .expand(&[])
            .expect("expand")
            .remove(0)
    }

    fn payload() -> DriverPayload {
        let spec = TestSpec::builder("t", "scalarized_sum").build().expect("spec");
        DriverPayload::new(&spec, &scenario())
    }

    #[test]
    fn shell_quoting_wraps_unsafe_arguments() {
        assert_eq!(shell_quote("-XX:TieredStopAtLevel=1"), "-XX:TieredStopAtLevel=1");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn args_place_payload_after_flags_and_driver_entry() {
        let mut command = RuntimeCommand::new("/opt/jdk/bin/java");
        command.driver_args = vec!["tierprobe.Driver".to_string()];
        let args = command.args(&scenario(), "{}");
        assert_eq!(args, ["-Xint", "tierprobe.Driver", "--payload", "{}"]);
    }

    #[test]
    fn replay_command_carries_payload_length() {
        let runner = ChildProcessRunner::new(RuntimeCommand::new("runtime"));
        let payload = payload();
        assert_eq!(payload.tier_ceiling, CompileLevel::Interpreted);
        let replay = runner.replay_command(&scenario(), &payload);
        let json = serde_json::to_string(&payload).expect("json");
        assert!(replay.starts_with(&format!("{PAYLOAD_LEN_ENV}={} runtime -Xint", json.len())));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let runner = ChildProcessRunner::new(RuntimeCommand::new("/nonexistent/tierprobe-runtime"));
        let err = runner
            .launch(
                &scenario(),
                &payload(),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .expect_err("spawn must fail");
        assert!(matches!(err, ProcessSpawnError::Spawn { .. }));
        assert_eq!(err.error_code(), "TP-SPAWN-0001");
    }

    #[test]
    fn cancellation_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(CancellationToken::with_deadline(Duration::ZERO).is_cancelled());
    }
}
