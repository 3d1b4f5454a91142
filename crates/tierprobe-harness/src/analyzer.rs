//! Output and IR analyzer.
//!
//! [`evaluate`] judges a captured run against declared expectations alone.
//! [`analyze`] adds the scenario-aware checks: expectation applicability by
//! tier ceiling, warmup convergence, and the compile-level constraint.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ir_dump::ParsedOutput;
use crate::process_runner::RunResult;
use crate::scenario::{CompileLevel, Scenario};
use crate::test_spec::{Expectation, IrExpectation, TestSpec};
use crate::warmup::{WarmupOutcome, WarmupStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    IrCount,
    MissingIrSection,
    MissingSubstring,
    UnexpectedSubstring,
    NonZeroExit,
    TierCeilingExceeded,
    CompileLevelNotReached,
    WarmupNotConverged,
    MissingWarmupReport,
    CrossTierMismatch,
}

impl ViolationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IrCount => "ir_count",
            Self::MissingIrSection => "missing_ir_section",
            Self::MissingSubstring => "missing_substring",
            Self::UnexpectedSubstring => "unexpected_substring",
            Self::NonZeroExit => "non_zero_exit",
            Self::TierCeilingExceeded => "tier_ceiling_exceeded",
            Self::CompileLevelNotReached => "compile_level_not_reached",
            Self::WarmupNotConverged => "warmup_not_converged",
            Self::MissingWarmupReport => "missing_warmup_report",
            Self::CrossTierMismatch => "cross_tier_mismatch",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Rendered expectation or check that failed.
    pub expectation: String,
    pub expected: String,
    pub observed: String,
}

impl Violation {
    pub fn new(
        kind: ViolationKind,
        expectation: impl Into<String>,
        expected: impl Into<String>,
        observed: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            expectation: expectation.into(),
            expected: expected.into(),
            observed: observed.into(),
        }
    }

    pub fn detail(&self) -> String {
        format!("expected: {}, observed: {}", self.expected, self.observed)
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.expectation, self.kind, self.detail())
    }
}

/// Judges `run` against `expectations` without any scenario knowledge:
/// every IR expectation is treated as applicable and sections are looked
/// up for any method.
pub fn evaluate(run: &RunResult, expectations: &[Expectation]) -> Vec<Violation> {
    let parsed = parse_run(run);
    let combined = run.combined_output();
    let mut violations = Vec::new();
    for expectation in expectations {
        check_expectation(expectation, None, &parsed, &combined, &mut violations);
    }
    check_exit(run, &mut violations);
    violations
}

/// stdout sections precede stderr sections; the two streams are not
/// interleaved by emission time.
fn parse_run(run: &RunResult) -> ParsedOutput {
    let mut parsed = ParsedOutput::parse(&run.stdout);
    parsed.merge(ParsedOutput::parse(&run.stderr));
    parsed
}

fn check_expectation(
    expectation: &Expectation,
    method: Option<&str>,
    parsed: &ParsedOutput,
    combined: &str,
    violations: &mut Vec<Violation>,
) {
    match expectation {
        Expectation::Ir(ir) => {
            if let Some(violation) = check_ir(ir, expectation, method, parsed) {
                violations.push(violation);
            }
        }
        Expectation::ShouldContain { text } => {
            if !combined.contains(text.as_str()) {
                violations.push(Violation::new(
                    ViolationKind::MissingSubstring,
                    expectation.to_string(),
                    "present",
                    "absent",
                ));
            }
        }
        Expectation::ShouldNotContain { text } => {
            let occurrences = combined.matches(text.as_str()).count();
            if occurrences > 0 {
                violations.push(Violation::new(
                    ViolationKind::UnexpectedSubstring,
                    expectation.to_string(),
                    "absent",
                    format!("present ({occurrences}x)"),
                ));
            }
        }
    }
}

fn check_ir(
    ir: &IrExpectation,
    expectation: &Expectation,
    method: Option<&str>,
    parsed: &ParsedOutput,
) -> Option<Violation> {
    let Some(section) = parsed.last_section(method, &ir.phase) else {
        return Some(Violation::new(
            ViolationKind::MissingIrSection,
            expectation.to_string(),
            ir.predicate.describe(),
            "missing",
        ));
    };
    let observed = section.count(&ir.node);
    if ir.predicate.holds(observed) {
        return None;
    }
    let observed = if section.truncated {
        format!("{observed} (truncated section)")
    } else {
        observed.to_string()
    };
    Some(Violation::new(
        ViolationKind::IrCount,
        expectation.to_string(),
        ir.predicate.describe(),
        observed,
    ))
}

fn check_exit(run: &RunResult, violations: &mut Vec<Violation>) {
    if run.killed() {
        return;
    }
    match run.exit_code {
        Some(0) => {}
        Some(code) => violations.push(Violation::new(
            ViolationKind::NonZeroExit,
            "exit code",
            "0",
            code.to_string(),
        )),
        None => violations.push(Violation::new(
            ViolationKind::NonZeroExit,
            "exit code",
            "0",
            "terminated by signal",
        )),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub violations: Vec<Violation>,
    /// Expectations not applicable under the scenario's tier ceiling.
    pub skipped_expectations: Vec<String>,
    pub observed_level: Option<CompileLevel>,
    pub warmup: Option<WarmupOutcome>,
    pub result_digest: Option<String>,
}

impl Analysis {
    pub fn warmup_failed(&self) -> bool {
        self.violations
            .iter()
            .any(|violation| violation.kind == ViolationKind::WarmupNotConverged)
    }
}

/// Full judgement of one (test, scenario) unit.
pub fn analyze(run: &RunResult, spec: &TestSpec, scenario: &Scenario) -> Analysis {
    let parsed = parse_run(run);
    let combined = run.combined_output();
    let method = Some(spec.method.as_str());
    let profile = scenario.profile();
    let mut analysis = Analysis::default();

    for expectation in &spec.expectations {
        if let Expectation::Ir(ir) = expectation
            && !ir.applies_to(profile)
        {
            analysis.skipped_expectations.push(expectation.to_string());
            continue;
        }
        check_expectation(
            expectation,
            method,
            &parsed,
            &combined,
            &mut analysis.violations,
        );
    }
    check_exit(run, &mut analysis.violations);

    analysis.warmup = parsed.last_warmup(method).cloned();
    analysis.observed_level = parsed
        .last_compile_level(method)
        .or_else(|| analysis.warmup.as_ref().map(|warmup| warmup.level));
    analysis.result_digest = parsed.last_result(method).map(str::to_string);

    match analysis.warmup.as_ref().map(|warmup| warmup.status) {
        Some(WarmupStatus::NotConverged) => {
            let observed = analysis
                .warmup
                .as_ref()
                .map(|warmup| format!("{} after {} iterations", warmup.level, warmup.iterations))
                .unwrap_or_default();
            analysis.violations.push(Violation::new(
                ViolationKind::WarmupNotConverged,
                "warmup",
                spec.compile_level.describe(profile),
                observed,
            ));
        }
        Some(WarmupStatus::Converged | WarmupStatus::Skipped) => {}
        None if run.killed() => {}
        None => analysis.violations.push(Violation::new(
            ViolationKind::MissingWarmupReport,
            "warmup",
            "warmup marker",
            "missing",
        )),
    }

    if let Some(level) = analysis.observed_level {
        if level > scenario.tier_ceiling() {
            analysis.violations.push(Violation::new(
                ViolationKind::TierCeilingExceeded,
                "tier ceiling",
                format!("<= {}", scenario.tier_ceiling()),
                level.to_string(),
            ));
        }
        let converged = analysis
            .warmup
            .as_ref()
            .is_some_and(|warmup| warmup.status != WarmupStatus::NotConverged);
        if converged && !spec.compile_level.satisfied_by(level, profile) {
            analysis.violations.push(Violation::new(
                ViolationKind::CompileLevelNotReached,
                "compile level",
                spec.compile_level.describe(profile),
                level.to_string(),
            ));
        }
    }

    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_dump::{Marker, render_section};
    use crate::scenario::ScenarioMatrix;
    use crate::test_spec::IrPredicate;
    use std::sync::Arc;

    fn run_with(stdout: Vec<String>, exit_code: Option<i32>) -> RunResult {
        RunResult {
            exit_code,
            stdout: stdout.join("\n"),
            ..RunResult::default()
        }
    }

    fn scenario(flags: &[&str]) -> Arc<Scenario> {
        ScenarioMatrix::single(flags.iter().copied())
            .expand(&[])
            .expect("expand")
            .remove(0)
    }

    fn markers(method: &str, status: WarmupStatus, level: CompileLevel) -> Vec<String> {
        vec![
            Marker::Warmup(WarmupOutcome {
                method: method.to_string(),
                status,
                level,
                iterations: 20_000,
            })
            .render(),
            Marker::CompileLevel {
                method: method.to_string(),
                level,
            }
            .render(),
        ]
    }

    #[test]
    fn absent_node_with_one_occurrence_reports_expected_zero_observed_one() {
        let run = run_with(
            render_section("m", "final", CompileLevel::C2, &["Parm", "AllocateNode", "Return"]),
            Some(0),
        );
        let expectations = [Expectation::Ir(IrExpectation::new(
            "final",
            "AllocateNode",
            IrPredicate::Absent,
        ))];
        let violations = evaluate(&run, &expectations);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::IrCount);
        assert_eq!(violations[0].detail(), "expected: 0, observed: 1");
    }

    #[test]
    fn exact_count_is_scoped_to_the_named_phase() {
        let mut stdout = render_section("m", "after_parsing", CompileLevel::C2, &["AllocateNode"; 3]);
        stdout.extend(render_section("m", "final", CompileLevel::C2, &["AllocateNode"]));
        let run = run_with(stdout, Some(0));
        let exact = |count| {
            [Expectation::Ir(IrExpectation::new(
                "final",
                "AllocateNode",
                IrPredicate::Exactly { count },
            ))]
        };
        assert!(evaluate(&run, &exact(1)).is_empty());
        assert_eq!(evaluate(&run, &exact(3)).len(), 1);
    }

    #[test]
    fn missing_section_is_a_violation() {
        let run = run_with(Vec::new(), Some(0));
        let violations = evaluate(
            &run,
            &[Expectation::Ir(IrExpectation::new("final", "AddI", IrPredicate::AtLeast { count: 1 }))],
        );
        assert_eq!(violations[0].kind, ViolationKind::MissingIrSection);
        assert_eq!(violations[0].observed, "missing");
    }

    #[test]
    fn should_not_contain_yields_exactly_one_violation() {
        let run = RunResult {
            exit_code: Some(0),
            stdout: "Uncommon trap occurred in m\n".to_string(),
            stderr: "Uncommon trap occurred in m\n".to_string(),
            ..RunResult::default()
        };
        let violations = evaluate(
            &run,
            &[Expectation::ShouldNotContain {
                text: "Uncommon trap occurred".to_string(),
            }],
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::UnexpectedSubstring);
    }

    #[test]
    fn substring_matching_is_case_sensitive_across_streams() {
        let run = RunResult {
            exit_code: Some(0),
            stdout: "alpha ".to_string(),
            stderr: "Beta".to_string(),
            ..RunResult::default()
        };
        let contains = |text: &str| {
            [Expectation::ShouldContain {
                text: text.to_string(),
            }]
        };
        assert!(evaluate(&run, &contains("alpha Beta")).is_empty());
        assert_eq!(evaluate(&run, &contains("beta")).len(), 1);
    }

    #[test]
    fn zero_expectations_are_judged_on_exit_code_alone() {
        assert!(evaluate(&run_with(Vec::new(), Some(0)), &[]).is_empty());
        let violations = evaluate(&run_with(Vec::new(), Some(7)), &[]);
        assert_eq!(violations[0].kind, ViolationKind::NonZeroExit);
        let killed = RunResult {
            timed_out: true,
            ..RunResult::default()
        };
        assert!(evaluate(&killed, &[]).is_empty());
    }

    #[test]
    fn analyze_skips_c2_expectations_under_interpreter_ceiling() {
        let spec = TestSpec::builder("t", "m")
            .expect_ir("final", "AllocateNode", IrPredicate::Absent)
            .build()
            .expect("spec");
        let run = run_with(markers("m", WarmupStatus::Skipped, CompileLevel::Interpreted), Some(0));
        let analysis = analyze(&run, &spec, &scenario(&["-Xint"]));
        assert!(analysis.violations.is_empty(), "{:?}", analysis.violations);
        assert_eq!(analysis.skipped_expectations.len(), 1);
        assert_eq!(analysis.observed_level, Some(CompileLevel::Interpreted));
    }

    #[test]
    fn analyze_reports_warmup_failure_distinctly() {
        let spec = TestSpec::builder("t", "m").build().expect("spec");
        let run = run_with(markers("m", WarmupStatus::NotConverged, CompileLevel::C1FullProfile), Some(3));
        let analysis = analyze(&run, &spec, &scenario(&[]));
        assert!(analysis.warmup_failed());
        assert!(
            !analysis
                .violations
                .iter()
                .any(|v| v.kind == ViolationKind::CompileLevelNotReached)
        );
    }

    #[test]
    fn analyze_flags_level_above_ceiling_and_unmet_constraint() {
        let spec = TestSpec::builder("t", "m").build().expect("spec");
        let run = run_with(markers("m", WarmupStatus::Converged, CompileLevel::C2), Some(0));
        let analysis = analyze(&run, &spec, &scenario(&["-XX:TieredStopAtLevel=1"]));
        assert!(
            analysis
                .violations
                .iter()
                .any(|v| v.kind == ViolationKind::TierCeilingExceeded)
        );

        let run = run_with(markers("m", WarmupStatus::Converged, CompileLevel::C1FullProfile), Some(0));
        let analysis = analyze(&run, &spec, &scenario(&[]));
        assert_eq!(analysis.violations.len(), 1);
        assert_eq!(analysis.violations[0].kind, ViolationKind::CompileLevelNotReached);
    }

    #[test]
    fn analyze_requires_a_warmup_report_from_a_completed_run() {
        let spec = TestSpec::builder("t", "m").build().expect("spec");
        let analysis = analyze(&run_with(Vec::new(), Some(0)), &spec, &scenario(&[]));
        assert!(!analysis.warmup_failed());
        assert_eq!(analysis.violations.len(), 1);
        assert_eq!(analysis.violations[0].kind, ViolationKind::MissingWarmupReport);
    }
}
