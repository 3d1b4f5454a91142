//! Scenario matrix executor.
//!
//! Expands every test spec into (spec, scenario) units, runs them on a
//! scoped worker pool, analyzes each run and applies the cross-tier result
//! check before settling each verdict. One unit's failure never stops its
//! siblings; nothing escapes as an error.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analyzer::{Violation, ViolationKind, analyze};
use crate::driver::DriverPayload;
use crate::error::{ConfigurationError, ErrorClass};
use crate::events::{EventInput, EventLog};
use crate::process_runner::{CancellationToken, ScenarioLauncher};
use crate::report::SpecReport;
use crate::scenario::{CompileLevel, Scenario};
use crate::test_spec::{TestSpec, TimeoutPolicy};
use crate::warmup::WarmupOutcome;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Pending,
    Running,
    Passed,
    Failed,
    TimedOut,
    ConfigError,
    WarmupFailed,
    SpawnError,
}

impl VerdictStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::ConfigError => "CONFIG_ERROR",
            Self::WarmupFailed => "WARMUP_FAILED",
            Self::SpawnError => "SPAWN_ERROR",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub const fn is_harness_error(self) -> bool {
        matches!(self, Self::ConfigError | Self::SpawnError)
    }

    pub const fn is_test_failure(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::WarmupFailed)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::ConfigError),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub const fn error_class(self) -> Option<ErrorClass> {
        match self {
            Self::Failed => Some(ErrorClass::ExpectationViolation),
            Self::TimedOut => Some(ErrorClass::Timeout),
            Self::ConfigError => Some(ErrorClass::Configuration),
            Self::WarmupFailed => Some(ErrorClass::WarmupNotConverged),
            Self::SpawnError => Some(ErrorClass::ProcessSpawn),
            Self::Pending | Self::Running | Self::Passed => None,
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal verdict transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: VerdictStatus,
    pub to: VerdictStatus,
}

/// Outcome for one test spec under one scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub test_id: String,
    /// `None` for a configuration error that precedes expansion.
    pub scenario_index: Option<usize>,
    pub scenario_id: Option<String>,
    pub flags: Vec<String>,
    pub status: VerdictStatus,
    pub violations: Vec<Violation>,
    pub skipped_expectations: Vec<String>,
    pub tier_ceiling: Option<CompileLevel>,
    pub observed_level: Option<CompileLevel>,
    pub warmup: Option<WarmupOutcome>,
    pub result_digest: Option<String>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub cancelled: bool,
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub replay_command: Option<String>,
}

impl Verdict {
    pub fn pending(test_id: &str, scenario: &Scenario) -> Self {
        Self {
            test_id: test_id.to_string(),
            scenario_index: Some(scenario.index()),
            scenario_id: Some(scenario.scenario_id().to_string()),
            flags: scenario.flags().to_vec(),
            tier_ceiling: Some(scenario.tier_ceiling()),
            ..Self::unscoped(test_id)
        }
    }

    fn unscoped(test_id: &str) -> Self {
        Self {
            test_id: test_id.to_string(),
            scenario_index: None,
            scenario_id: None,
            flags: Vec::new(),
            status: VerdictStatus::Pending,
            violations: Vec::new(),
            skipped_expectations: Vec::new(),
            tier_ceiling: None,
            observed_level: None,
            warmup: None,
            result_digest: None,
            exit_code: None,
            duration_ms: 0,
            timed_out: false,
            cancelled: false,
            error_code: None,
            message: None,
            replay_command: None,
        }
    }

    /// Single verdict standing in for a whole spec that failed to expand.
    pub fn config_error(test_id: &str, error: &ConfigurationError) -> Self {
        let mut verdict = Self::unscoped(test_id);
        verdict.message = Some(error.to_string());
        verdict.error_code = Some(error.error_code().to_string());
        verdict.status = VerdictStatus::ConfigError;
        verdict
    }

    pub fn transition(&mut self, next: VerdictStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.error_code = next
            .error_class()
            .map(|class| class.error_code().to_string())
            .or(self.error_code.take());
        Ok(())
    }

    pub fn passed(&self) -> bool {
        self.status == VerdictStatus::Passed
    }

    pub fn scenario_label(&self) -> String {
        match self.scenario_index {
            Some(index) => format!("#{index} [{}]", self.flags.join(" ")),
            None => "(matrix)".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub parallelism: usize,
    pub default_timeout: Duration,
    /// Prepended to every scenario's flags at expansion time.
    pub global_flags: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallelism: thread::available_parallelism().map_or(1, usize::from),
            default_timeout: DEFAULT_TIMEOUT,
            global_flags: Vec::new(),
        }
    }
}

struct Unit<'s> {
    slot: usize,
    spec: &'s TestSpec,
    scenario: Arc<Scenario>,
}

/// A unit's verdict still in `RUNNING`, with the status it will settle on
/// once the cross-tier check has run.
struct UnitOutcome {
    verdict: Verdict,
    resolved: VerdictStatus,
}

pub struct ScenarioMatrixExecutor<'a, L: ScenarioLauncher> {
    launcher: &'a L,
    config: ExecutorConfig,
    cancel: CancellationToken,
    events: Option<&'a EventLog>,
}

impl<'a, L: ScenarioLauncher> ScenarioMatrixExecutor<'a, L> {
    pub fn new(launcher: &'a L, config: ExecutorConfig) -> Self {
        Self {
            launcher,
            config,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: &'a EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Verdicts for one spec, ordered by scenario index.
    pub fn execute(&self, spec: &TestSpec) -> Vec<Verdict> {
        self.execute_all(std::slice::from_ref(spec))
            .pop()
            .map(|report| report.verdicts)
            .unwrap_or_default()
    }

    /// Runs all specs on one pool under the shared cancellation token.
    /// Reports keep the order of `specs`.
    pub fn execute_all(&self, specs: &[TestSpec]) -> Vec<SpecReport> {
        let mut reports: Vec<SpecReport> = specs.iter().map(SpecReport::empty).collect();
        let mut units = Vec::new();

        for (slot, spec) in specs.iter().enumerate() {
            match spec
                .validate()
                .and_then(|()| spec.scenarios(&self.config.global_flags))
            {
                Ok(scenarios) => units.extend(scenarios.into_iter().map(|scenario| Unit {
                    slot,
                    spec,
                    scenario,
                })),
                Err(error) => {
                    self.emit(EventInput {
                        component: "executor",
                        event: "spec_rejected",
                        outcome: VerdictStatus::ConfigError.as_str(),
                        error_code: Some(error.error_code()),
                        test_id: Some(&spec.test_id),
                        scenario_id: None,
                        timing_us: 0,
                    });
                    reports[slot]
                        .verdicts
                        .push(Verdict::config_error(&spec.test_id, &error));
                }
            }
        }

        let mut outcomes = self.run_pool(&units);
        outcomes.sort_by_key(|(position, _)| *position);

        let mut grouped: Vec<Vec<UnitOutcome>> = specs.iter().map(|_| Vec::new()).collect();
        for (position, outcome) in outcomes {
            grouped[units[position].slot].push(outcome);
        }

        for (slot, mut group) in grouped.into_iter().enumerate() {
            cross_check(&mut group);
            for outcome in group {
                let verdict = self.settle(outcome);
                reports[slot].verdicts.push(verdict);
            }
        }
        reports
    }

    fn run_pool(&self, units: &[Unit<'_>]) -> Vec<(usize, UnitOutcome)> {
        let next = AtomicUsize::new(0);
        let results = Mutex::new(Vec::with_capacity(units.len()));
        let workers = self.config.parallelism.max(1).min(units.len().max(1));

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let position = next.fetch_add(1, Ordering::SeqCst);
                        let Some(unit) = units.get(position) else {
                            break;
                        };
                        let outcome = self.run_unit(unit);
                        match results.lock() {
                            Ok(mut guard) => guard.push((position, outcome)),
                            Err(poisoned) => poisoned.into_inner().push((position, outcome)),
                        }
                    }
                });
            }
        });

        results
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_unit(&self, unit: &Unit<'_>) -> UnitOutcome {
        let spec = unit.spec;
        let scenario = unit.scenario.as_ref();
        let mut verdict = Verdict::pending(&spec.test_id, scenario);
        verdict.status = VerdictStatus::Running;

        let payload = DriverPayload::new(spec, scenario);
        let replay = self.launcher.replay_command(scenario, &payload);
        verdict.replay_command = Some(replay.clone());

        if self.cancel.is_cancelled() {
            verdict.cancelled = true;
            verdict.message = Some("harness deadline reached before the scenario started".to_string());
            return UnitOutcome {
                verdict,
                resolved: VerdictStatus::TimedOut,
            };
        }

        if let Some(events) = self.events {
            events.record_command(replay);
        }
        self.emit(EventInput {
            component: "executor",
            event: "scenario_started",
            outcome: VerdictStatus::Running.as_str(),
            error_code: None,
            test_id: Some(&spec.test_id),
            scenario_id: Some(scenario.scenario_id()),
            timing_us: 0,
        });

        let started = Instant::now();
        let timeout = spec.timeout().unwrap_or(self.config.default_timeout);
        let run = match self.launcher.launch(scenario, &payload, timeout, &self.cancel) {
            Ok(run) => run,
            Err(error) => {
                verdict.message = Some(error.to_string());
                verdict.duration_ms = elapsed_ms(started);
                return UnitOutcome {
                    verdict,
                    resolved: VerdictStatus::SpawnError,
                };
            }
        };

        let analysis = analyze(&run, spec, scenario);
        verdict.exit_code = run.exit_code;
        verdict.duration_ms = run.duration_ms;
        verdict.timed_out = run.timed_out;
        verdict.cancelled = run.cancelled;
        verdict.observed_level = analysis.observed_level;
        verdict.warmup = analysis.warmup.clone();
        verdict.result_digest = analysis.result_digest.clone();
        verdict.skipped_expectations = analysis.skipped_expectations.clone();

        let resolved = if run.cancelled
            || (run.timed_out && spec.timeout_policy == TimeoutPolicy::Fail)
        {
            verdict.message = Some(if run.cancelled {
                "cancelled by harness deadline".to_string()
            } else {
                format!("timed out after {} ms", timeout.as_millis())
            });
            VerdictStatus::TimedOut
        } else if analysis.warmup_failed() {
            VerdictStatus::WarmupFailed
        } else if analysis.violations.is_empty() {
            VerdictStatus::Passed
        } else {
            VerdictStatus::Failed
        };
        verdict.violations = analysis.violations;

        UnitOutcome { verdict, resolved }
    }

    fn settle(&self, outcome: UnitOutcome) -> Verdict {
        let UnitOutcome {
            mut verdict,
            resolved,
        } = outcome;
        if let Err(error) = verdict.transition(resolved) {
            verdict.message = Some(error.to_string());
        }
        self.emit(EventInput {
            component: "executor",
            event: "scenario_finished",
            outcome: verdict.status.as_str(),
            error_code: verdict.error_code.as_deref(),
            test_id: Some(&verdict.test_id),
            scenario_id: verdict.scenario_id.as_deref(),
            timing_us: verdict.duration_ms.saturating_mul(1_000),
        });
        verdict
    }

    fn emit(&self, input: EventInput<'_>) {
        if let Some(events) = self.events {
            events.emit(input);
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Every passing unit of one spec must report the same result digest as
/// the lowest-index passing unit; divergent ones fail.
fn cross_check(group: &mut [UnitOutcome]) {
    let reference = group.iter().find_map(|outcome| {
        if outcome.resolved != VerdictStatus::Passed {
            return None;
        }
        let digest = outcome.verdict.result_digest.clone()?;
        Some((digest, outcome.verdict.scenario_label()))
    });
    let Some((reference_digest, reference_label)) = reference else {
        return;
    };

    for outcome in group.iter_mut() {
        if outcome.resolved != VerdictStatus::Passed {
            continue;
        }
        let Some(digest) = outcome.verdict.result_digest.as_deref() else {
            continue;
        };
        if digest != reference_digest {
            let violation = Violation::new(
                ViolationKind::CrossTierMismatch,
                format!("result digest matches {reference_label}"),
                reference_digest.clone(),
                digest.to_string(),
            );
            outcome.verdict.violations.push(violation);
            outcome.resolved = VerdictStatus::Failed;
        }
    }
}
