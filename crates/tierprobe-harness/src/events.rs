//! Structured run events and artifact writers.
//!
//! This module provides:
//! - deterministic run identifiers (trace/decision/policy ids),
//! - a mutex-guarded [`EventLog`] of schema-versioned event envelopes,
//! - the per-run artifact set (`run_manifest.json`, `events.jsonl`,
//!   `commands.txt`, `report.json`).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::HarnessError;
use crate::report::HarnessReport;

pub const HARNESS_SCHEMA_VERSION: &str = "tierprobe.harness.v1";
pub const EVENT_SCHEMA_VERSION: &str = "tierprobe.harness-event.v1";
pub const RUN_MANIFEST_SCHEMA_VERSION: &str = "tierprobe.run-manifest.v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub label: String,
    pub seed: u64,
    pub trace_id: String,
    pub decision_id: String,
    pub policy_id: String,
}

impl RunContext {
    pub fn new(label: impl Into<String>, seed: u64) -> Self {
        let label = label.into();
        let digest = hex::encode(Sha256::digest(format!("{label}|{seed}").as_bytes()));
        let short = &digest[..16];
        Self {
            trace_id: format!("trace-tierprobe-{short}"),
            decision_id: format!("decision-tierprobe-{short}"),
            policy_id: "policy-tierprobe-matrix-v1".to_string(),
            label,
            seed,
        }
    }

    pub fn run_id(&self) -> String {
        format!(
            "run-{}-{}",
            sanitize_label(&self.label),
            &self.trace_id["trace-tierprobe-".len()..]
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EventInput<'a> {
    pub component: &'a str,
    pub event: &'a str,
    pub outcome: &'a str,
    pub error_code: Option<&'a str>,
    pub test_id: Option<&'a str>,
    pub scenario_id: Option<&'a str>,
    pub timing_us: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessEvent {
    pub schema_version: String,
    pub trace_id: String,
    pub decision_id: String,
    pub policy_id: String,
    pub component: String,
    pub event: String,
    pub outcome: String,
    pub error_code: Option<String>,
    pub test_id: Option<String>,
    pub scenario_id: Option<String>,
    pub sequence: u64,
    pub timing_us: u64,
    pub timestamp: String,
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<HarnessEvent>,
    commands: Vec<String>,
}

/// Event sink shared by all workers of one run. Sequence numbers follow
/// the order in which events are appended.
#[derive(Debug)]
pub struct EventLog {
    context: RunContext,
    state: Mutex<LogState>,
}

impl EventLog {
    pub fn new(context: RunContext) -> Self {
        Self {
            context,
            state: Mutex::new(LogState::default()),
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn emit(&self, input: EventInput<'_>) {
        let mut state = self.state();
        let sequence = state.events.len() as u64;
        state.events.push(HarnessEvent {
            schema_version: EVENT_SCHEMA_VERSION.to_string(),
            trace_id: self.context.trace_id.clone(),
            decision_id: self.context.decision_id.clone(),
            policy_id: self.context.policy_id.clone(),
            component: input.component.to_string(),
            event: input.event.to_string(),
            outcome: input.outcome.to_string(),
            error_code: input.error_code.map(str::to_string),
            test_id: input.test_id.map(str::to_string),
            scenario_id: input.scenario_id.map(str::to_string),
            sequence,
            timing_us: input.timing_us,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
    }

    pub fn record_command(&self, command: String) {
        self.state().commands.push(command);
    }

    pub fn events(&self) -> Vec<HarnessEvent> {
        self.state().events.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: String,
    pub harness_schema_version: String,
    pub run_id: String,
    pub trace_id: String,
    pub decision_id: String,
    pub policy_id: String,
    pub seed: u64,
    pub started_at: String,
    pub finished_at: String,
    pub test_count: usize,
    pub verdict_count: usize,
    pub event_count: usize,
    pub command_count: usize,
    pub exit_code: i32,
    pub env_fingerprint: String,
    pub runner_command: String,
}

impl RunManifest {
    pub fn new(
        context: &RunContext,
        report: &HarnessReport,
        events: &[HarnessEvent],
        commands: &[String],
        started_at: String,
        runner_command: impl Into<String>,
    ) -> Self {
        let runner_command = runner_command.into();
        let env_material = format!(
            "{HARNESS_SCHEMA_VERSION}|{}|{}|{}|{}|{}",
            context.label,
            context.seed,
            std::env::consts::OS,
            std::env::consts::ARCH,
            runner_command
        );
        Self {
            schema_version: RUN_MANIFEST_SCHEMA_VERSION.to_string(),
            harness_schema_version: HARNESS_SCHEMA_VERSION.to_string(),
            run_id: report.run_id.clone(),
            trace_id: context.trace_id.clone(),
            decision_id: context.decision_id.clone(),
            policy_id: context.policy_id.clone(),
            seed: context.seed,
            started_at,
            finished_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            test_count: report.specs.len(),
            verdict_count: report.summary.total,
            event_count: events.len(),
            command_count: commands.len(),
            exit_code: report.exit_code(),
            env_fingerprint: hex::encode(Sha256::digest(env_material.as_bytes())),
            runner_command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifacts {
    pub run_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub events_path: PathBuf,
    pub commands_path: PathBuf,
    pub report_path: PathBuf,
}

pub fn write_artifacts(
    artifact_root: impl AsRef<Path>,
    manifest: &RunManifest,
    events: &[HarnessEvent],
    commands: &[String],
    report: &HarnessReport,
) -> Result<RunArtifacts, HarnessError> {
    let run_dir = artifact_root.as_ref().join(&manifest.run_id);
    fs::create_dir_all(&run_dir).map_err(|source| HarnessError::WriteFile {
        path: run_dir.display().to_string(),
        source,
    })?;

    let manifest_path = run_dir.join("run_manifest.json");
    let events_path = run_dir.join("events.jsonl");
    let commands_path = run_dir.join("commands.txt");
    let report_path = run_dir.join("report.json");

    write_atomic(&manifest_path, &serde_json::to_vec_pretty(manifest)?)?;

    let mut events_jsonl = String::new();
    for event in events {
        events_jsonl.push_str(&serde_json::to_string(event)?);
        events_jsonl.push('\n');
    }
    write_atomic(&events_path, events_jsonl.as_bytes())?;

    let mut commands_buf = String::new();
    for command in commands {
        commands_buf.push_str(command);
        commands_buf.push('\n');
    }
    write_atomic(&commands_path, commands_buf.as_bytes())?;

    write_atomic(&report_path, &serde_json::to_vec_pretty(report)?)?;

    Ok(RunArtifacts {
        run_dir,
        manifest_path,
        events_path,
        commands_path,
        report_path,
    })
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), HarnessError> {
    let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp_path, bytes).map_err(|source| HarnessError::WriteFile {
        path: tmp_path.display().to_string(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| HarnessError::WriteFile {
        path: path.display().to_string(),
        source,
    })
}

fn sanitize_label(label: &str) -> String {
    let sanitized: String = label
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    sanitized.trim_matches('-').to_lowercase()
}
