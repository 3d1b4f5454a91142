//! Result aggregation, failure table rendering and exit-code policy.

use std::fmt::Write as _;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::{Verdict, VerdictStatus};
use crate::test_spec::TestSpec;

pub const HARNESS_REPORT_SCHEMA_VERSION: &str = "tierprobe.harness-report.v1";

pub const EXIT_PASSED: i32 = 0;
pub const EXIT_USAGE: i32 = 1;
pub const EXIT_TEST_FAILURES: i32 = 2;
pub const EXIT_HARNESS_ERROR: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecReport {
    pub test_id: String,
    pub method: String,
    pub verdicts: Vec<Verdict>,
}

impl SpecReport {
    pub fn empty(spec: &TestSpec) -> Self {
        Self {
            test_id: spec.test_id.clone(),
            method: spec.method.clone(),
            verdicts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub warmup_failed: usize,
    pub config_errors: usize,
    pub spawn_errors: usize,
    pub skipped_expectations: usize,
}

impl ReportSummary {
    fn tally(&mut self, verdict: &Verdict) {
        self.total += 1;
        self.skipped_expectations += verdict.skipped_expectations.len();
        match verdict.status {
            VerdictStatus::Passed => self.passed += 1,
            VerdictStatus::Failed => self.failed += 1,
            VerdictStatus::TimedOut => self.timed_out += 1,
            VerdictStatus::WarmupFailed => self.warmup_failed += 1,
            VerdictStatus::ConfigError => self.config_errors += 1,
            VerdictStatus::SpawnError => self.spawn_errors += 1,
            // Non-terminal verdicts never reach a report; count them as failures.
            VerdictStatus::Pending | VerdictStatus::Running => self.failed += 1,
        }
    }

    pub fn harness_errors(&self) -> usize {
        self.config_errors + self.spawn_errors
    }

    pub fn test_failures(&self) -> usize {
        self.failed + self.timed_out + self.warmup_failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessReport {
    pub schema_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub summary: ReportSummary,
    pub specs: Vec<SpecReport>,
}

impl HarnessReport {
    pub fn aggregate(run_id: impl Into<String>, specs: Vec<SpecReport>) -> Self {
        let mut summary = ReportSummary::default();
        for verdict in specs.iter().flat_map(|spec| &spec.verdicts) {
            summary.tally(verdict);
        }
        Self {
            schema_version: HARNESS_REPORT_SCHEMA_VERSION.to_string(),
            run_id: run_id.into(),
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            summary,
            specs,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.summary.passed == self.summary.total
    }

    /// Harness errors outrank test failures.
    pub fn exit_code(&self) -> i32 {
        if self.summary.harness_errors() > 0 {
            EXIT_HARNESS_ERROR
        } else if !self.all_passed() {
            EXIT_TEST_FAILURES
        } else {
            EXIT_PASSED
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &Verdict> {
        self.specs
            .iter()
            .flat_map(|spec| &spec.verdicts)
            .filter(|verdict| !verdict.passed())
    }

    pub fn summary_line(&self) -> String {
        let summary = &self.summary;
        format!(
            "{} verdicts: {} passed, {} failed, {} timed out, {} warmup failed, {} config errors, {} spawn errors",
            summary.total,
            summary.passed,
            summary.failed,
            summary.timed_out,
            summary.warmup_failed,
            summary.config_errors,
            summary.spawn_errors
        )
    }

    /// Human-readable table of failing (test, scenario, expectation)
    /// triples, each followed by its replay command.
    pub fn render_failure_table(&self) -> String {
        let mut rows: Vec<[String; 5]> = Vec::new();
        let mut replays = Vec::new();
        for verdict in self.failures() {
            let scenario = verdict.scenario_label();
            if verdict.violations.is_empty() {
                rows.push([
                    verdict.status.to_string(),
                    verdict.test_id.clone(),
                    scenario.clone(),
                    verdict.message.clone().unwrap_or_default(),
                    String::new(),
                ]);
            }
            for violation in &verdict.violations {
                rows.push([
                    verdict.status.to_string(),
                    verdict.test_id.clone(),
                    scenario.clone(),
                    violation.expectation.clone(),
                    violation.detail(),
                ]);
            }
            if let Some(replay) = &verdict.replay_command {
                replays.push(format!("{} {}: {replay}", verdict.test_id, scenario));
            }
        }
        if rows.is_empty() {
            return String::new();
        }

        let header = ["STATUS", "TEST", "SCENARIO", "EXPECTATION", "DETAIL"];
        let mut widths = header.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }

        let mut out = String::new();
        let mut push_row = |cells: [&str; 5]| {
            let line = cells
                .iter()
                .zip(widths)
                .map(|(cell, width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join("  ");
            let _ = writeln!(out, "{}", line.trim_end());
        };
        push_row(header);
        for row in &rows {
            push_row([
                row[0].as_str(),
                row[1].as_str(),
                row[2].as_str(),
                row[3].as_str(),
                row[4].as_str(),
            ]);
        }
        if !replays.is_empty() {
            let _ = writeln!(out, "\nreplay:");
            for replay in replays {
                let _ = writeln!(out, "  {replay}");
            }
        }
        out
    }
}

/// Collects spec reports from concurrent producers.
#[derive(Debug)]
pub struct ResultAggregator {
    run_id: String,
    specs: Mutex<Vec<SpecReport>>,
}

impl ResultAggregator {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            specs: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, report: SpecReport) {
        self.specs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(report);
    }

    pub fn record_all(&self, reports: impl IntoIterator<Item = SpecReport>) {
        for report in reports {
            self.record(report);
        }
    }

    pub fn finish(self) -> HarnessReport {
        let specs = self
            .specs
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        HarnessReport::aggregate(self.run_id, specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Violation, ViolationKind};
    use crate::error::ConfigurationError;
    use crate::scenario::ScenarioMatrix;

    fn verdict(status: VerdictStatus) -> Verdict {
        let scenario = ScenarioMatrix::single(["-Xint"])
            .expand(&[])
            .expect("expand")
            .remove(0);
        let mut verdict = Verdict::pending("t", &scenario);
        verdict.transition(VerdictStatus::Running).expect("running");
        verdict.transition(status).expect("terminal");
        verdict
    }

    fn report(verdicts: Vec<Verdict>) -> HarnessReport {
        let aggregator = ResultAggregator::new("run-test");
        aggregator.record(SpecReport {
            test_id: "t".to_string(),
            method: "m".to_string(),
            verdicts,
        });
        aggregator.finish()
    }

    #[test]
    fn all_passed_exits_zero() {
        let report = report(vec![verdict(VerdictStatus::Passed)]);
        assert!(report.all_passed());
        assert_eq!(report.exit_code(), EXIT_PASSED);
        assert!(report.render_failure_table().is_empty());
    }

    #[test]
    fn failures_and_timeouts_exit_two() {
        let report = report(vec![
            verdict(VerdictStatus::Passed),
            verdict(VerdictStatus::TimedOut),
            verdict(VerdictStatus::WarmupFailed),
        ]);
        assert_eq!(report.exit_code(), EXIT_TEST_FAILURES);
        assert_eq!(report.summary.test_failures(), 2);
    }

    #[test]
    fn harness_errors_take_precedence() {
        let config_error = Verdict::config_error(
            "t",
            &ConfigurationError::InvalidSpec("broken".to_string()),
        );
        let report = report(vec![verdict(VerdictStatus::Failed), config_error]);
        assert_eq!(report.exit_code(), EXIT_HARNESS_ERROR);
        assert_eq!(report.summary.config_errors, 1);
    }

    #[test]
    fn failure_table_lists_expected_and_observed_with_replay() {
        let mut failed = verdict(VerdictStatus::Failed);
        failed.violations.push(Violation::new(
            ViolationKind::IrCount,
            "ir[final] AllocateNode absent",
            "0",
            "1",
        ));
        failed.replay_command = Some("runtime -Xint --payload '{}'".to_string());
        let table = report(vec![failed]).render_failure_table();
        assert!(table.starts_with("STATUS"));
        assert!(table.contains("FAILED"));
        assert!(table.contains("#0 [-Xint]"));
        assert!(table.contains("expected: 0, observed: 1"));
        assert!(table.contains("runtime -Xint --payload '{}'"));
    }

    #[test]
    fn report_serializes_status_in_screaming_case() {
        let json = serde_json::to_string(&report(vec![verdict(VerdictStatus::TimedOut)]))
            .expect("json");
        assert!(json.contains("\"TIMED_OUT\""));
        assert!(json.contains(HARNESS_REPORT_SCHEMA_VERSION));
    }
}
