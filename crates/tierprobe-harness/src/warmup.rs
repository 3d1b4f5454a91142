//! Warmup driver executed inside the measured process.
//!
//! The driver invokes the target until the runtime reports the requested
//! compile level or the iteration ceiling is hit. It checks the level once
//! the nominal warmup count has run and then every `check_interval`
//! iterations; measurement calls after warmup are not re-verified.

use std::fmt;
use std::hint::black_box;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigurationError;
use crate::scenario::CompileLevel;

pub const DEFAULT_WARMUP_ITERATIONS: u64 = 20_000;
pub const DEFAULT_CEILING_MULTIPLIER: u64 = 4;
pub const DEFAULT_CHECK_INTERVAL: u64 = 1_000;

const MEASUREMENT_SEED_SALT: u64 = 0xA076_1D64_78BD_642F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupPolicy {
    pub iterations: u64,
    #[serde(default = "default_ceiling_multiplier")]
    pub ceiling_multiplier: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
}

fn default_ceiling_multiplier() -> u64 {
    DEFAULT_CEILING_MULTIPLIER
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL
}

impl Default for WarmupPolicy {
    fn default() -> Self {
        Self::with_iterations(DEFAULT_WARMUP_ITERATIONS)
    }
}

impl WarmupPolicy {
    pub fn with_iterations(iterations: u64) -> Self {
        Self {
            iterations,
            ceiling_multiplier: DEFAULT_CEILING_MULTIPLIER,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Hard upper bound on warmup invocations.
    pub fn ceiling(&self) -> u64 {
        self.iterations
            .saturating_mul(self.ceiling_multiplier.max(1))
            .max(self.iterations)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.iterations == 0 {
            return Err(ConfigurationError::InvalidSpec(
                "warmup iterations must be greater than zero".to_string(),
            ));
        }
        if self.check_interval == 0 {
            return Err(ConfigurationError::InvalidSpec(
                "warmup check_interval must be greater than zero".to_string(),
            ));
        }
        if self.ceiling_multiplier == 0 {
            return Err(ConfigurationError::InvalidSpec(
                "warmup ceiling_multiplier must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    I32(i32),
    I64(i64),
    Bool(bool),
    Null,
}

impl ArgValue {
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I32(value) => Some(i64::from(value)),
            Self::I64(value) => Some(value),
            Self::Bool(value) => Some(i64::from(value)),
            Self::Null => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    I32,
    I64,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArgumentGenerator {
    Fixed { value: ArgValue },
    Random { of: ArgKind },
}

impl ArgumentGenerator {
    pub fn generate(&self, rng: &mut DeterministicRng) -> ArgValue {
        match self {
            Self::Fixed { value } => *value,
            Self::Random { of: ArgKind::I32 } => ArgValue::I32(rng.next_u64() as i32),
            Self::Random { of: ArgKind::I64 } => ArgValue::I64(rng.next_u64() as i64),
            Self::Random { of: ArgKind::Bool } => ArgValue::Bool(rng.next_u64() & 1 == 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    pub fn seeded(seed: u64) -> Self {
        let state = if seed == 0 {
            0x9E37_79B9_7F4A_7C15
        } else {
            seed
        };
        Self { state }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

/// Per-run state handed to the warmup driver and argument generators.
/// Lives for exactly one child process.
#[derive(Debug, Clone)]
pub struct DriverContext {
    seed: u64,
    rng: DeterministicRng,
    invocations: u64,
    measured: Option<Vec<u8>>,
}

impl DriverContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: DeterministicRng::seeded(seed),
            invocations: 0,
            measured: None,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    pub fn fill_arguments(&mut self, generators: &[ArgumentGenerator], out: &mut Vec<ArgValue>) {
        out.clear();
        out.extend(generators.iter().map(|generator| generator.generate(&mut self.rng)));
        self.invocations += 1;
    }

    /// Re-seeds argument generation so that every scenario measures the
    /// same argument sequence no matter how long its warmup ran.
    pub fn begin_measurement(&mut self) {
        self.rng = DeterministicRng::seeded(self.seed ^ MEASUREMENT_SEED_SALT);
        self.measured = Some(Vec::new());
    }

    pub fn record(&mut self, result: u64) {
        if let Some(buffer) = self.measured.as_mut() {
            buffer.extend_from_slice(&result.to_le_bytes());
        }
    }

    pub fn finish_measurement(&mut self) -> Option<String> {
        self.measured
            .take()
            .map(|buffer| hex::encode(Sha256::digest(&buffer)))
    }
}

/// Runtime introspection seam: what compile level the runtime currently
/// holds for a method, and the highest level it can ever reach.
pub trait CompileLevelQuery {
    fn compile_level(&self, method: &str) -> CompileLevel;
    fn tier_ceiling(&self) -> CompileLevel;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupStatus {
    Converged,
    Skipped,
    NotConverged,
}

impl WarmupStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::Skipped => "skipped",
            Self::NotConverged => "not_converged",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "converged" => Some(Self::Converged),
            "skipped" => Some(Self::Skipped),
            "not_converged" => Some(Self::NotConverged),
            _ => None,
        }
    }
}

impl fmt::Display for WarmupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupOutcome {
    pub method: String,
    pub status: WarmupStatus,
    pub level: CompileLevel,
    pub iterations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupDriver {
    policy: WarmupPolicy,
    target: CompileLevel,
}

impl WarmupDriver {
    pub fn new(policy: WarmupPolicy, target: CompileLevel) -> Self {
        Self { policy, target }
    }

    pub fn policy(&self) -> &WarmupPolicy {
        &self.policy
    }

    pub fn target(&self) -> CompileLevel {
        self.target
    }

    pub fn run<Q, F>(
        &self,
        method: &str,
        context: &mut DriverContext,
        generators: &[ArgumentGenerator],
        query: &Q,
        mut invoke: F,
    ) -> WarmupOutcome
    where
        Q: CompileLevelQuery + ?Sized,
        F: FnMut(&[ArgValue]) -> u64,
    {
        let mut args = Vec::with_capacity(generators.len());
        let mut step = |context: &mut DriverContext, count: u64| {
            for _ in 0..count {
                context.fill_arguments(generators, &mut args);
                black_box(invoke(&args));
            }
        };

        let mut iterations = self.policy.iterations;
        step(context, iterations);

        let interpreter_only =
            self.target == CompileLevel::Interpreted || query.tier_ceiling() == CompileLevel::Interpreted;
        if interpreter_only {
            return WarmupOutcome {
                method: method.to_string(),
                status: WarmupStatus::Skipped,
                level: query.compile_level(method),
                iterations,
            };
        }

        let ceiling = self.policy.ceiling();
        let interval = self.policy.check_interval.max(1);
        loop {
            let level = query.compile_level(method);
            if level >= self.target {
                return WarmupOutcome {
                    method: method.to_string(),
                    status: WarmupStatus::Converged,
                    level,
                    iterations,
                };
            }
            if iterations >= ceiling {
                return WarmupOutcome {
                    method: method.to_string(),
                    status: WarmupStatus::NotConverged,
                    level,
                    iterations,
                };
            }
            let batch = interval.min(ceiling - iterations);
            step(context, batch);
            iterations += batch;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct ThresholdQuery {
        calls: Cell<u64>,
        threshold: u64,
        level: CompileLevel,
        ceiling: CompileLevel,
    }

    impl ThresholdQuery {
        fn new(threshold: u64, level: CompileLevel) -> Self {
            Self {
                calls: Cell::new(0),
                threshold,
                level,
                ceiling: CompileLevel::C2,
            }
        }

        fn bump(&self) -> u64 {
            self.calls.set(self.calls.get() + 1);
            self.calls.get()
        }
    }

    impl CompileLevelQuery for ThresholdQuery {
        fn compile_level(&self, _method: &str) -> CompileLevel {
            if self.calls.get() >= self.threshold {
                self.level
            } else {
                CompileLevel::Interpreted
            }
        }

        fn tier_ceiling(&self) -> CompileLevel {
            self.ceiling
        }
    }

    fn policy(iterations: u64) -> WarmupPolicy {
        WarmupPolicy {
            iterations,
            ceiling_multiplier: 4,
            check_interval: 1_000,
        }
    }

    #[test]
    fn converges_after_nominal_warmup_when_threshold_is_lower() {
        let query = ThresholdQuery::new(5_000, CompileLevel::C2);
        let mut context = DriverContext::new(7);
        let outcome = WarmupDriver::new(policy(20_000), CompileLevel::C2).run(
            "m",
            &mut context,
            &[],
            &query,
            |_| query.bump(),
        );
        assert_eq!(outcome.status, WarmupStatus::Converged);
        assert_eq!(outcome.level, CompileLevel::C2);
        assert_eq!(outcome.iterations, 20_000);
        assert_eq!(context.invocations(), 20_000);
    }

    #[test]
    fn keeps_going_in_check_intervals_until_level_is_reached() {
        let query = ThresholdQuery::new(25_500, CompileLevel::C2);
        let mut context = DriverContext::new(7);
        let outcome = WarmupDriver::new(policy(20_000), CompileLevel::C2).run(
            "m",
            &mut context,
            &[],
            &query,
            |_| query.bump(),
        );
        assert_eq!(outcome.status, WarmupStatus::Converged);
        assert_eq!(outcome.iterations, 26_000);
    }

    #[test]
    fn reports_not_converged_at_ceiling() {
        let query = ThresholdQuery::new(u64::MAX, CompileLevel::C2);
        let mut context = DriverContext::new(7);
        let outcome = WarmupDriver::new(policy(1_000), CompileLevel::C2).run(
            "m",
            &mut context,
            &[],
            &query,
            |_| query.bump(),
        );
        assert_eq!(outcome.status, WarmupStatus::NotConverged);
        assert_eq!(outcome.level, CompileLevel::Interpreted);
        assert_eq!(outcome.iterations, 4_000);
    }

    #[test]
    fn interpreter_only_runtime_skips_the_level_check() {
        let mut query = ThresholdQuery::new(1, CompileLevel::C2);
        query.ceiling = CompileLevel::Interpreted;
        query.level = CompileLevel::Interpreted;
        let mut context = DriverContext::new(7);
        let outcome = WarmupDriver::new(policy(100_000), CompileLevel::C2).run(
            "m",
            &mut context,
            &[],
            &query,
            |_| query.bump(),
        );
        assert_eq!(outcome.status, WarmupStatus::Skipped);
        assert_eq!(outcome.level, CompileLevel::Interpreted);
        assert_eq!(outcome.iterations, 100_000);
    }

    #[test]
    fn fixed_and_random_generators_feed_each_invocation() {
        let generators = [
            ArgumentGenerator::Fixed {
                value: ArgValue::I32(7),
            },
            ArgumentGenerator::Random { of: ArgKind::I64 },
        ];
        let query = ThresholdQuery::new(0, CompileLevel::C2);
        let mut context = DriverContext::new(11);
        let mut seen = Vec::new();
        WarmupDriver::new(policy(3), CompileLevel::C2).run(
            "m",
            &mut context,
            &generators,
            &query,
            |args| {
                seen.push(args.to_vec());
                0
            },
        );
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|args| args[0] == ArgValue::I32(7)));
        assert_ne!(seen[0][1], seen[1][1]);
    }

    #[test]
    fn measurement_sequence_is_independent_of_warmup_length() {
        let generators = [ArgumentGenerator::Random { of: ArgKind::I32 }];
        let mut short = DriverContext::new(3);
        let mut long = DriverContext::new(3);
        let mut scratch = Vec::new();
        for _ in 0..10 {
            short.fill_arguments(&generators, &mut scratch);
        }
        for _ in 0..1_000 {
            long.fill_arguments(&generators, &mut scratch);
        }

        let mut digests = Vec::new();
        for context in [&mut short, &mut long] {
            context.begin_measurement();
            for _ in 0..16 {
                context.fill_arguments(&generators, &mut scratch);
                let value = scratch[0].as_i64().unwrap_or_default();
                context.record(value as u64);
            }
            digests.push(context.finish_measurement().expect("digest"));
        }
        assert_eq!(digests[0], digests[1]);
    }

    #[test]
    fn policy_validation_rejects_zero_iterations() {
        assert!(WarmupPolicy::with_iterations(0).validate().is_err());
        assert!(WarmupPolicy::default().validate().is_ok());
        assert_eq!(WarmupPolicy::with_iterations(10).ceiling(), 40);
    }
}
