//! Test specifications and the builder-based registration table.
//!
//! A [`TestSpec`] names a target method, an ordered list of expectations,
//! warmup and compile-level requirements, argument generators and the
//! scenario matrix it runs under. Specs come either from the builder API or
//! from a TOML manifest (see `config`); both paths go through
//! [`TestSpec::validate`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::ir_dump::node_tokens;
use crate::scenario::{
    CompileLevel, Scenario, ScenarioMatrix, ScenarioSelection, ScenarioTemplate, TierProfile,
};
use crate::warmup::{ArgumentGenerator, WarmupPolicy};

pub const DEFAULT_MEASURE_ITERATIONS: u64 = 1_000;
pub const DEFAULT_SEED: u64 = 0x7143_5eed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IrPredicate {
    Exactly { count: usize },
    GreaterThan { count: usize },
    LessThan { count: usize },
    AtLeast { count: usize },
    AtMost { count: usize },
    Absent,
}

impl IrPredicate {
    pub fn holds(self, observed: usize) -> bool {
        match self {
            Self::Exactly { count } => observed == count,
            Self::GreaterThan { count } => observed > count,
            Self::LessThan { count } => observed < count,
            Self::AtLeast { count } => observed >= count,
            Self::AtMost { count } => observed <= count,
            Self::Absent => observed == 0,
        }
    }

    /// Expected side of a violation report.
    pub fn describe(self) -> String {
        match self {
            Self::Exactly { count } => count.to_string(),
            Self::GreaterThan { count } => format!("> {count}"),
            Self::LessThan { count } => format!("< {count}"),
            Self::AtLeast { count } => format!(">= {count}"),
            Self::AtMost { count } => format!("<= {count}"),
            Self::Absent => "0".to_string(),
        }
    }
}

fn default_applies_from() -> CompileLevel {
    CompileLevel::C2
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrExpectation {
    pub phase: String,
    pub node: String,
    pub predicate: IrPredicate,
    /// Compile level whose IR this expectation describes. Scenarios that
    /// cannot reach it record the expectation as skipped.
    #[serde(default = "default_applies_from")]
    pub applies_from: CompileLevel,
}

impl IrExpectation {
    pub fn new(phase: impl Into<String>, node: impl Into<String>, predicate: IrPredicate) -> Self {
        Self {
            phase: phase.into(),
            node: node.into(),
            predicate,
            applies_from: CompileLevel::C2,
        }
    }

    pub fn applies_to(&self, profile: &TierProfile) -> bool {
        profile.reaches(self.applies_from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expectation {
    Ir(IrExpectation),
    ShouldContain { text: String },
    ShouldNotContain { text: String },
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ir(ir) => write!(
                f,
                "ir[{}] {} {}",
                ir.phase,
                ir.node,
                match ir.predicate {
                    IrPredicate::Absent => "absent".to_string(),
                    IrPredicate::Exactly { count } => format!("== {count}"),
                    other => other.describe(),
                }
            ),
            Self::ShouldContain { text } => write!(f, "should_contain {text:?}"),
            Self::ShouldNotContain { text } => write!(f, "should_not_contain {text:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompileLevelConstraint {
    Any,
    AtLeast { level: CompileLevel },
    Exactly { level: CompileLevel },
}

impl Default for CompileLevelConstraint {
    fn default() -> Self {
        Self::AtLeast {
            level: CompileLevel::C2,
        }
    }
}

impl CompileLevelConstraint {
    /// Level the warmup driver must reach under `profile`. A request above
    /// the scenario's ceiling is clamped to the highest reachable level.
    pub fn warmup_target(self, profile: &TierProfile) -> CompileLevel {
        match self {
            Self::Any => CompileLevel::Interpreted,
            Self::AtLeast { level } | Self::Exactly { level } => profile.clamp(level),
        }
    }

    pub fn satisfied_by(self, observed: CompileLevel, profile: &TierProfile) -> bool {
        match self {
            Self::Any => true,
            Self::AtLeast { .. } => observed >= self.warmup_target(profile),
            Self::Exactly { .. } => observed == self.warmup_target(profile),
        }
    }

    pub fn describe(self, profile: &TierProfile) -> String {
        match self {
            Self::Any => "any".to_string(),
            Self::AtLeast { .. } => format!(">= {}", self.warmup_target(profile)),
            Self::Exactly { .. } => self.warmup_target(profile).to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// A killed child is reported as `TIMED_OUT`.
    #[default]
    Fail,
    /// A killed child is judged on whatever output it produced.
    Soak,
}

impl TimeoutPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Soak => "soak",
        }
    }
}

fn default_measure_iterations() -> u64 {
    DEFAULT_MEASURE_ITERATIONS
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    pub test_id: String,
    pub method: String,
    #[serde(default)]
    pub expectations: Vec<Expectation>,
    #[serde(default)]
    pub warmup: WarmupPolicy,
    #[serde(default)]
    pub compile_level: CompileLevelConstraint,
    #[serde(default)]
    pub arguments: Vec<ArgumentGenerator>,
    #[serde(default)]
    pub matrix: ScenarioMatrix,
    #[serde(default)]
    pub selection: ScenarioSelection,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
    #[serde(default = "default_measure_iterations")]
    pub measure_iterations: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl TestSpec {
    pub fn builder(test_id: impl Into<String>, method: impl Into<String>) -> TestSpecBuilder {
        TestSpecBuilder::new(test_id, method)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn ir_expectations(&self) -> impl Iterator<Item = &IrExpectation> {
        self.expectations.iter().filter_map(|expectation| match expectation {
            Expectation::Ir(ir) => Some(ir),
            _ => None,
        })
    }

    /// Expands the matrix under `global_flags` and applies the selection.
    pub fn scenarios(&self, global_flags: &[String]) -> Result<Vec<Arc<Scenario>>, ConfigurationError> {
        let expanded = self.matrix.expand(global_flags)?;
        self.selection.apply(&self.test_id, expanded)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |message: String| Err(ConfigurationError::InvalidSpec(message));

        if self.test_id.trim().is_empty() {
            return invalid("test_id must not be empty".to_string());
        }
        if !is_identifier(&self.method) {
            return invalid(format!(
                "test `{}`: method `{}` is not a plain identifier",
                self.test_id, self.method
            ));
        }
        self.warmup.validate()?;
        if self.measure_iterations == 0 {
            return invalid(format!(
                "test `{}`: measure_iterations must be greater than zero",
                self.test_id
            ));
        }
        if self.timeout_ms == Some(0) {
            return invalid(format!("test `{}`: timeout_ms must be greater than zero", self.test_id));
        }

        for expectation in &self.expectations {
            match expectation {
                Expectation::Ir(ir) => {
                    if !is_identifier(&ir.phase) {
                        return invalid(format!(
                            "test `{}`: IR phase `{}` is not a plain identifier",
                            self.test_id, ir.phase
                        ));
                    }
                    if !is_identifier(&ir.node) {
                        return invalid(format!(
                            "test `{}`: IR node kind `{}` is not a single token",
                            self.test_id, ir.node
                        ));
                    }
                }
                Expectation::ShouldContain { text } | Expectation::ShouldNotContain { text } => {
                    if text.is_empty() {
                        return invalid(format!(
                            "test `{}`: substring expectation must not be empty",
                            self.test_id
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn is_identifier(value: &str) -> bool {
    let mut tokens = node_tokens(value);
    tokens.next() == Some(value) && tokens.next().is_none()
}

/// Builds a [`TestSpec`] one expectation at a time. Expectations keep their
/// declaration order.
#[derive(Debug, Clone)]
pub struct TestSpecBuilder {
    spec: TestSpec,
}

impl TestSpecBuilder {
    pub fn new(test_id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            spec: TestSpec {
                test_id: test_id.into(),
                method: method.into(),
                expectations: Vec::new(),
                warmup: WarmupPolicy::default(),
                compile_level: CompileLevelConstraint::default(),
                arguments: Vec::new(),
                matrix: ScenarioMatrix::default(),
                selection: ScenarioSelection::All,
                timeout_ms: None,
                timeout_policy: TimeoutPolicy::Fail,
                measure_iterations: DEFAULT_MEASURE_ITERATIONS,
                seed: DEFAULT_SEED,
            },
        }
    }

    #[must_use]
    pub fn expect_ir(mut self, phase: &str, node: &str, predicate: IrPredicate) -> Self {
        self.spec
            .expectations
            .push(Expectation::Ir(IrExpectation::new(phase, node, predicate)));
        self
    }

    #[must_use]
    pub fn expect_ir_at(
        mut self,
        level: CompileLevel,
        phase: &str,
        node: &str,
        predicate: IrPredicate,
    ) -> Self {
        let mut expectation = IrExpectation::new(phase, node, predicate);
        expectation.applies_from = level;
        self.spec.expectations.push(Expectation::Ir(expectation));
        self
    }

    #[must_use]
    pub fn should_contain(mut self, text: impl Into<String>) -> Self {
        self.spec
            .expectations
            .push(Expectation::ShouldContain { text: text.into() });
        self
    }

    #[must_use]
    pub fn should_not_contain(mut self, text: impl Into<String>) -> Self {
        self.spec
            .expectations
            .push(Expectation::ShouldNotContain { text: text.into() });
        self
    }

    #[must_use]
    pub fn warmup(mut self, iterations: u64) -> Self {
        self.spec.warmup.iterations = iterations;
        self
    }

    #[must_use]
    pub fn warmup_policy(mut self, policy: WarmupPolicy) -> Self {
        self.spec.warmup = policy;
        self
    }

    #[must_use]
    pub fn compile_level(mut self, constraint: CompileLevelConstraint) -> Self {
        self.spec.compile_level = constraint;
        self
    }

    #[must_use]
    pub fn argument(mut self, generator: ArgumentGenerator) -> Self {
        self.spec.arguments.push(generator);
        self
    }

    #[must_use]
    pub fn base_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.matrix.base_flags = flags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn axis(mut self, choices: Vec<ScenarioTemplate>) -> Self {
        self.spec.matrix.axes.push(choices);
        self
    }

    #[must_use]
    pub fn scenario(mut self, template: ScenarioTemplate) -> Self {
        self.spec.matrix.scenarios.push(template);
        self
    }

    #[must_use]
    pub fn select(mut self, selection: ScenarioSelection) -> Self {
        self.spec.selection = selection;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.spec.timeout_policy = policy;
        self
    }

    #[must_use]
    pub fn measure_iterations(mut self, iterations: u64) -> Self {
        self.spec.measure_iterations = iterations;
        self
    }

    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.spec.seed = seed;
        self
    }

    pub fn build(self) -> Result<TestSpec, ConfigurationError> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

/// Ordered registration table of test specs with unique ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRegistry {
    specs: Vec<TestSpec>,
    ids: BTreeSet<String>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: TestSpec) -> Result<(), ConfigurationError> {
        spec.validate()?;
        self.admit(spec)
    }

    /// Registers without validating the spec body; only id uniqueness is
    /// enforced. An invalid spec then settles as a `CONFIG_ERROR` verdict at
    /// execution time instead of rejecting the whole registry.
    pub fn admit(&mut self, spec: TestSpec) -> Result<(), ConfigurationError> {
        if !self.ids.insert(spec.test_id.clone()) {
            return Err(ConfigurationError::InvalidSpec(format!(
                "duplicate test id `{}`",
                spec.test_id
            )));
        }
        self.specs.push(spec);
        Ok(())
    }

    pub fn specs(&self) -> &[TestSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Keeps specs whose id contains `filter`; an absent filter keeps all.
    pub fn filtered(&self, filter: Option<&str>) -> Vec<TestSpec> {
        self.specs
            .iter()
            .filter(|spec| filter.is_none_or(|needle| spec.test_id.contains(needle)))
            .cloned()
            .collect()
    }
}
