//! Simulated tiered runtime used by the driver binary.
//!
//! It is a test double for a real JIT: methods are promoted through compile
//! levels by invocation counters, honour the usual tiering flags, and print
//! v1 IR dumps for a handful of built-in probe methods whenever they are
//! (re)compiled. Nothing here optimizes anything.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigurationError;
use crate::ir_dump::render_section;
use crate::scenario::{CompileLevel, TierProfile, validate_flags};
use crate::warmup::{ArgValue, CompileLevelQuery};

pub const DEFAULT_TIER3_THRESHOLD: u64 = 200;
pub const DEFAULT_TIER4_THRESHOLD: u64 = 5_000;
pub const DEFAULT_COMPILE_THRESHOLD: u64 = 10_000;
pub const DEFAULT_STALL_MS: u64 = 30_000;
/// Number of C2 invocations before a simulated uncommon trap fires.
pub const DEOPT_AFTER_C2_CALLS: u64 = 64;

pub const PHASE_AFTER_PARSING: &str = "after_parsing";
pub const PHASE_FINAL: &str = "final";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProbeMethod {
    ScalarizedSum,
    EscapingBox,
    NullRestrictedLoad,
    FlatArrayCopy,
    C2WrongResult,
}

impl ProbeMethod {
    pub const ALL: [Self; 5] = [
        Self::ScalarizedSum,
        Self::EscapingBox,
        Self::NullRestrictedLoad,
        Self::FlatArrayCopy,
        Self::C2WrongResult,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ScalarizedSum => "scalarized_sum",
            Self::EscapingBox => "escaping_box",
            Self::NullRestrictedLoad => "null_restricted_load",
            Self::FlatArrayCopy => "flat_array_copy",
            Self::C2WrongResult => "c2_wrong_result",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.as_str() == name)
    }

    /// Result of one invocation. Only `c2_wrong_result` depends on the
    /// level it runs at.
    pub fn evaluate(self, args: &[ArgValue], level: CompileLevel) -> u64 {
        let a = args.first().and_then(|arg| arg.as_i64()).unwrap_or(0);
        let b = args.get(1).and_then(|arg| arg.as_i64()).unwrap_or(1);
        let value = match self {
            Self::ScalarizedSum => a.wrapping_add(b),
            Self::EscapingBox => a.wrapping_mul(31) ^ b,
            Self::NullRestrictedLoad => a.rotate_left(7).wrapping_sub(b),
            Self::FlatArrayCopy => (0..4_i64).fold(a, |acc, i| {
                acc.wrapping_mul(17).wrapping_add(b.wrapping_add(i))
            }),
            Self::C2WrongResult => {
                let base = a.wrapping_mul(2);
                if level == CompileLevel::C2 {
                    base.wrapping_add(1)
                } else {
                    base
                }
            }
        };
        value as u64
    }

    /// IR node kinds in emission order for `phase` at `level`.
    pub fn ir_nodes(self, phase: &str, level: CompileLevel) -> Vec<&'static str> {
        let optimized = level == CompileLevel::C2 && phase == PHASE_FINAL;
        match self {
            Self::ScalarizedSum if optimized => vec!["Parm", "Parm", "AddI", "Return"],
            Self::ScalarizedSum => vec![
                "Parm",
                "Parm",
                "AllocateNode",
                "StoreI",
                "StoreI",
                "LoadI",
                "LoadI",
                "AddI",
                "Return",
            ],
            Self::EscapingBox => vec![
                "Parm",
                "AllocateNode",
                "StoreI",
                "StoreP",
                "MemBarStoreStore",
                "Return",
            ],
            Self::NullRestrictedLoad if optimized => vec!["Parm", "LoadI", "Return"],
            Self::NullRestrictedLoad => {
                vec!["Parm", "CmpP", "If", "UncommonTrap", "LoadI", "Return"]
            }
            Self::FlatArrayCopy if optimized => vec![
                "Parm",
                "Parm",
                "AllocateArrayNode",
                "LoadI",
                "StoreI",
                "LoadI",
                "StoreI",
                "Return",
            ],
            Self::FlatArrayCopy => vec!["Parm", "Parm", "AllocateArrayNode", "ArrayCopy", "Return"],
            Self::C2WrongResult => vec!["Parm", "LShiftI", "AddI", "Return"],
        }
    }
}

/// Runtime settings resolved from the command-line flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    pub profile: TierProfile,
    pub tier3_threshold: u64,
    pub tier4_threshold: u64,
    pub compile_threshold: u64,
    pub simulate_stall: bool,
    pub stall: Duration,
    pub simulate_deopt: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            profile: TierProfile::default(),
            tier3_threshold: DEFAULT_TIER3_THRESHOLD,
            tier4_threshold: DEFAULT_TIER4_THRESHOLD,
            compile_threshold: DEFAULT_COMPILE_THRESHOLD,
            simulate_stall: false,
            stall: Duration::from_millis(DEFAULT_STALL_MS),
            simulate_deopt: false,
        }
    }
}

impl SimConfig {
    pub fn from_flags<S: AsRef<str>>(flags: &[S]) -> Result<Self, ConfigurationError> {
        validate_flags("runtime", flags, None)?;
        let mut config = Self {
            profile: TierProfile::derive(flags),
            ..Self::default()
        };

        for flag in flags {
            let flag: &str = flag.as_ref();
            let Some(option) = flag.strip_prefix("-XX:") else {
                continue;
            };
            match option {
                "+SimulateStall" => config.simulate_stall = true,
                "-SimulateStall" => config.simulate_stall = false,
                "+SimulateDeopt" => config.simulate_deopt = true,
                "-SimulateDeopt" => config.simulate_deopt = false,
                _ => {
                    let Some((name, raw)) = option.split_once('=') else {
                        continue;
                    };
                    let slot = match name {
                        "Tier3InvocationThreshold" => &mut config.tier3_threshold,
                        "Tier4InvocationThreshold" => &mut config.tier4_threshold,
                        "CompileThreshold" => &mut config.compile_threshold,
                        "SimulateStallMillis" => {
                            config.stall = Duration::from_millis(parse_count(flag, raw)?);
                            continue;
                        }
                        _ => continue,
                    };
                    *slot = parse_count(flag, raw)?.max(1);
                }
            }
        }
        Ok(config)
    }
}

fn parse_count(flag: &str, raw: &str) -> Result<u64, ConfigurationError> {
    raw.parse::<u64>().map_err(|_| ConfigurationError::InvalidFlag {
        flag: flag.to_string(),
        reason: "expected a non-negative integer".to_string(),
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct MethodState {
    invocations: u64,
    level: CompileLevel,
    c2_invocations: u64,
    deoptimized: bool,
}

/// Single-threaded runtime state. Interior mutability lets the warmup driver
/// hold the runtime as a [`CompileLevelQuery`] while the invoke closure
/// advances it.
#[derive(Debug)]
pub struct SimRuntime {
    config: SimConfig,
    methods: RefCell<BTreeMap<ProbeMethod, MethodState>>,
    output: RefCell<Vec<String>>,
}

impl SimRuntime {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            methods: RefCell::new(BTreeMap::new()),
            output: RefCell::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn invoke(&self, method: ProbeMethod, args: &[ArgValue]) -> u64 {
        let mut methods = self.methods.borrow_mut();
        let state = methods.entry(method).or_default();
        let result = method.evaluate(args, state.level);

        state.invocations += 1;
        if state.level == CompileLevel::C2 {
            state.c2_invocations += 1;
            if self.config.simulate_deopt
                && !state.deoptimized
                && state.c2_invocations >= DEOPT_AFTER_C2_CALLS
            {
                state.deoptimized = true;
                state.level = CompileLevel::Interpreted;
                state.invocations = 0;
                state.c2_invocations = 0;
                self.output.borrow_mut().push(format!(
                    "Uncommon trap occurred in {} reason=null_check action=reinterpret",
                    method.as_str()
                ));
                return result;
            }
        }

        let next = self.promotion(state);
        if next > state.level {
            state.level = next;
            self.emit_compilation(method, state.invocations, next);
        }
        result
    }

    fn promotion(&self, state: &MethodState) -> CompileLevel {
        let profile = &self.config.profile;
        if profile.ceiling == CompileLevel::Interpreted {
            return CompileLevel::Interpreted;
        }
        if profile.compile_on_first_call {
            return profile.clamp(CompileLevel::C2);
        }
        if !profile.tiered {
            return if state.invocations >= self.config.compile_threshold {
                CompileLevel::C2
            } else {
                state.level
            };
        }
        if state.invocations >= self.config.tier4_threshold && profile.reaches(CompileLevel::C2) {
            CompileLevel::C2
        } else if state.invocations >= self.config.tier3_threshold {
            profile.clamp(CompileLevel::C1FullProfile)
        } else {
            state.level
        }
    }

    fn emit_compilation(&self, method: ProbeMethod, invocations: u64, level: CompileLevel) {
        let mut output = self.output.borrow_mut();
        output.push(format!(
            "{invocations:>8} {:>4}       {} (compiled)",
            level.as_u8(),
            method.as_str()
        ));
        for phase in [PHASE_AFTER_PARSING, PHASE_FINAL] {
            let nodes = method.ir_nodes(phase, level);
            output.extend(render_section(method.as_str(), phase, level, &nodes));
        }
    }

    pub fn drain_output(&self) -> Vec<String> {
        std::mem::take(&mut *self.output.borrow_mut())
    }

    pub fn level_of(&self, method: ProbeMethod) -> CompileLevel {
        self.methods
            .borrow()
            .get(&method)
            .map(|state| state.level)
            .unwrap_or_default()
    }
}

impl CompileLevelQuery for SimRuntime {
    fn compile_level(&self, method: &str) -> CompileLevel {
        ProbeMethod::from_name(method)
            .map(|method| self.level_of(method))
            .unwrap_or_default()
    }

    fn tier_ceiling(&self) -> CompileLevel {
        self.config.profile.ceiling
    }
}
