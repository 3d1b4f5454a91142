//! Child-side driver: the process the harness spawns per scenario.
//!
//! Command line shape: `<runtime flags...> [entry] --payload <json>`. The
//! driver boots the simulated runtime with the runtime flags, warms the
//! probe method up, reports the warmup outcome and observed compile level as
//! marker lines, then runs the measurement loop and reports its digest.

use std::io::Write;
use std::thread;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::ir_dump::Marker;
use crate::process_runner::PAYLOAD_FLAG;
use crate::scenario::{ADD_EXPORTS_FLAG, CompileLevel, Scenario};
use crate::sim_runtime::{ProbeMethod, SimConfig, SimRuntime};
use crate::test_spec::TestSpec;
use crate::warmup::{
    ArgumentGenerator, CompileLevelQuery, DriverContext, WarmupDriver, WarmupPolicy, WarmupStatus,
};

pub const DRIVER_PAYLOAD_SCHEMA_VERSION: &str = "tierprobe.driver-payload.v1";

pub const EXIT_DRIVER_OK: i32 = 0;
pub const EXIT_DRIVER_USAGE: i32 = 1;
pub const EXIT_WARMUP_NOT_CONVERGED: i32 = 3;

/// Everything the child needs to know about one (test, scenario) unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverPayload {
    pub schema_version: String,
    pub test_id: String,
    pub scenario_id: String,
    pub method: String,
    pub warmup: WarmupPolicy,
    pub target_level: CompileLevel,
    pub tier_ceiling: CompileLevel,
    #[serde(default)]
    pub arguments: Vec<ArgumentGenerator>,
    pub measure_iterations: u64,
    pub seed: u64,
}

impl DriverPayload {
    pub fn new(spec: &TestSpec, scenario: &Scenario) -> Self {
        Self {
            schema_version: DRIVER_PAYLOAD_SCHEMA_VERSION.to_string(),
            test_id: spec.test_id.clone(),
            scenario_id: scenario.scenario_id().to_string(),
            method: spec.method.clone(),
            warmup: spec.warmup,
            target_level: spec.compile_level.warmup_target(scenario.profile()),
            tier_ceiling: scenario.tier_ceiling(),
            arguments: spec.arguments.clone(),
            measure_iterations: spec.measure_iterations,
            seed: spec.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInvocation {
    pub runtime_flags: Vec<String>,
    pub entry: Option<String>,
    pub payload: String,
}

pub fn parse_driver_args<I>(args: I) -> anyhow::Result<DriverInvocation>
where
    I: IntoIterator<Item = String>,
{
    let mut runtime_flags = Vec::new();
    let mut entry = None::<String>;
    let mut payload = None::<String>;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == PAYLOAD_FLAG {
            payload = Some(iter.next().context("missing value for --payload")?);
        } else if arg == ADD_EXPORTS_FLAG && entry.is_none() {
            let directive = iter.next().context("missing value for --add-exports")?;
            runtime_flags.push(arg);
            runtime_flags.push(directive);
        } else if arg.starts_with('-') && entry.is_none() {
            runtime_flags.push(arg);
        } else if entry.is_none() {
            entry = Some(arg);
        } else {
            bail!("unexpected argument after driver entry: {arg}");
        }
    }

    Ok(DriverInvocation {
        runtime_flags,
        entry,
        payload: payload.context("missing --payload")?,
    })
}

pub fn decode_payload(raw: &str, expected_len: Option<usize>) -> anyhow::Result<DriverPayload> {
    if let Some(expected) = expected_len
        && expected != raw.len()
    {
        bail!(
            "payload truncated: expected {expected} bytes, received {}",
            raw.len()
        );
    }
    let payload: DriverPayload = serde_json::from_str(raw).context("failed to decode payload")?;
    if payload.schema_version != DRIVER_PAYLOAD_SCHEMA_VERSION {
        bail!(
            "unsupported payload schema `{}` (expected `{DRIVER_PAYLOAD_SCHEMA_VERSION}`)",
            payload.schema_version
        );
    }
    Ok(payload)
}

/// Runs one probe to completion and returns the process exit code.
pub fn run_probe(
    invocation: &DriverInvocation,
    expected_len: Option<usize>,
    out: &mut dyn Write,
    diagnostics: &mut dyn Write,
) -> anyhow::Result<i32> {
    let payload = decode_payload(&invocation.payload, expected_len)?;
    let config = SimConfig::from_flags(&invocation.runtime_flags)?;
    let Some(method) = ProbeMethod::from_name(&payload.method) else {
        bail!("unknown probe method `{}`", payload.method);
    };

    let runtime = SimRuntime::new(config);
    let target = if payload.tier_ceiling == CompileLevel::Interpreted {
        CompileLevel::Interpreted
    } else {
        payload.target_level
    };
    let mut context = DriverContext::new(payload.seed);
    let outcome = WarmupDriver::new(payload.warmup, target).run(
        method.as_str(),
        &mut context,
        &payload.arguments,
        &runtime,
        |args| runtime.invoke(method, args),
    );

    write_lines(out, runtime.drain_output())?;
    writeln!(out, "{}", Marker::Warmup(outcome.clone()).render())?;
    writeln!(
        out,
        "{}",
        Marker::CompileLevel {
            method: method.as_str().to_string(),
            level: runtime.compile_level(method.as_str()),
        }
        .render()
    )?;
    out.flush()?;

    if outcome.status == WarmupStatus::NotConverged {
        writeln!(
            diagnostics,
            "warmup of {} did not reach {} within {} iterations (observed {})",
            method.as_str(),
            target,
            outcome.iterations,
            outcome.level
        )?;
        return Ok(EXIT_WARMUP_NOT_CONVERGED);
    }

    if runtime.config().simulate_stall {
        writeln!(diagnostics, "stalling for {:?}", runtime.config().stall)?;
        diagnostics.flush()?;
        thread::sleep(runtime.config().stall);
    }

    let mut args = Vec::with_capacity(payload.arguments.len());
    context.begin_measurement();
    for _ in 0..payload.measure_iterations {
        context.fill_arguments(&payload.arguments, &mut args);
        let result = runtime.invoke(method, &args);
        context.record(result);
    }
    write_lines(out, runtime.drain_output())?;
    if let Some(digest) = context.finish_measurement() {
        writeln!(
            out,
            "{}",
            Marker::Result {
                method: method.as_str().to_string(),
                digest,
            }
            .render()
        )?;
    }
    out.flush()?;
    Ok(EXIT_DRIVER_OK)
}

fn write_lines(out: &mut dyn Write, lines: Vec<String>) -> std::io::Result<()> {
    for line in lines {
        writeln!(out, "{line}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_dump::ParsedOutput;
    use crate::scenario::ScenarioMatrix;
    use crate::warmup::{ArgKind, ArgValue};

    fn invocation(flags: &[&str], spec: &TestSpec) -> DriverInvocation {
        let scenario = ScenarioMatrix::single(flags.iter().copied())
            .expand(&[])
            .expect("expand")
            .remove(0);
        DriverInvocation {
            runtime_flags: scenario.flags().to_vec(),
            entry: None,
            payload: serde_json::to_string(&DriverPayload::new(spec, &scenario)).expect("json"),
        }
    }

    fn run(invocation: &DriverInvocation) -> (i32, ParsedOutput, String) {
        let mut out = Vec::new();
        let mut diagnostics = Vec::new();
        let code = run_probe(invocation, None, &mut out, &mut diagnostics).expect("probe");
        let stdout = String::from_utf8(out).expect("utf8");
        (
            code,
            ParsedOutput::parse(&stdout),
            String::from_utf8(diagnostics).expect("utf8"),
        )
    }

    fn spec(method: &str, warmup: u64) -> TestSpec {
        TestSpec::builder("t", method)
            .warmup(warmup)
            .measure_iterations(32)
            .argument(ArgumentGenerator::Random { of: ArgKind::I32 })
            .argument(ArgumentGenerator::Fixed {
                value: ArgValue::I32(5),
            })
            .build()
            .expect("spec")
    }

    #[test]
    fn tiered_run_converges_and_reports_markers() {
        let (code, parsed, _) = run(&invocation(&[], &spec("scalarized_sum", 6_000)));
        assert_eq!(code, EXIT_DRIVER_OK);
        let warmup = parsed.last_warmup(Some("scalarized_sum")).expect("warmup");
        assert_eq!(warmup.status, WarmupStatus::Converged);
        assert_eq!(parsed.last_compile_level(None), Some(CompileLevel::C2));
        assert!(parsed.last_section(Some("scalarized_sum"), "final").is_some());
        assert!(parsed.last_result(Some("scalarized_sum")).is_some());
    }

    #[test]
    fn interpreter_only_run_skips_level_check() {
        let (code, parsed, _) = run(&invocation(&["-Xint"], &spec("scalarized_sum", 1_000)));
        assert_eq!(code, EXIT_DRIVER_OK);
        let warmup = parsed.last_warmup(None).expect("warmup");
        assert_eq!(warmup.status, WarmupStatus::Skipped);
        assert_eq!(warmup.level, CompileLevel::Interpreted);
        assert!(parsed.sections.is_empty());
    }

    #[test]
    fn unreachable_level_exits_with_warmup_failure() {
        let flags = ["-XX:Tier4InvocationThreshold=1000000"];
        let (code, parsed, diagnostics) = run(&invocation(&flags, &spec("escaping_box", 1_000)));
        assert_eq!(code, EXIT_WARMUP_NOT_CONVERGED);
        assert_eq!(
            parsed.last_warmup(None).map(|w| w.status),
            Some(WarmupStatus::NotConverged)
        );
        assert!(parsed.last_result(None).is_none());
        assert!(diagnostics.contains("did not reach"));
    }

    #[test]
    fn measurement_digest_is_identical_across_tiers() {
        let spec = spec("scalarized_sum", 6_000);
        let (_, interpreted, _) = run(&invocation(&["-Xint"], &spec));
        let (_, compiled, _) = run(&invocation(&["-XX:-TieredCompilation"], &spec));
        assert_eq!(interpreted.last_result(None), compiled.last_result(None));
    }

    #[test]
    fn args_split_flags_entry_and_payload() {
        let args = [
            "-Xint",
            "--add-exports",
            "java.base/jdk.internal.misc=ALL-UNNAMED",
            "tierprobe.Driver",
            "--payload",
            "{}",
        ]
        .map(String::from);
        let parsed = parse_driver_args(args).expect("parse");
        assert_eq!(parsed.runtime_flags.len(), 3);
        assert_eq!(parsed.entry.as_deref(), Some("tierprobe.Driver"));
        assert_eq!(parsed.payload, "{}");
        assert!(parse_driver_args(["-Xint".to_string()]).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let err = decode_payload("{\"schema", Some(64)).expect_err("truncated");
        assert!(err.to_string().contains("truncated"));
    }
}
