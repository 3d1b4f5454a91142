#![forbid(unsafe_code)]

//! `tierprobe_runner` expands every manifest test over its scenario matrix,
//! runs each scenario in a fresh child runtime and prints a JSON report.
//!
//! Exit codes: `0` all verdicts passed, `1` CLI/config errors, `2` test
//! failures, `3` harness errors (config or spawn errors in any verdict).

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use tierprobe_harness::config::{HarnessConfig, load_harness_config, load_test_manifest};
use tierprobe_harness::events::{
    EventInput, EventLog, RunContext, RunManifest, write_artifacts,
};
use tierprobe_harness::executor::ScenarioMatrixExecutor;
use tierprobe_harness::process_runner::{
    CancellationToken, ChildProcessRunner, RuntimeCommand, render_command_line,
};
use tierprobe_harness::report::{EXIT_USAGE, ResultAggregator};

const DEFAULT_RUN_LABEL: &str = "tierprobe";
const DRIVER_BIN_NAME: &str = "tierprobe_driver";

#[derive(Debug, Default)]
struct CliArgs {
    config_path: Option<PathBuf>,
    manifest_path: Option<PathBuf>,
    runtime: Option<String>,
    jobs: Option<usize>,
    timeout_ms: Option<u64>,
    deadline_ms: Option<u64>,
    filter: Option<String>,
    out_path: Option<PathBuf>,
    artifacts_dir: Option<PathBuf>,
    label: Option<String>,
    seed: Option<u64>,
    print_help: bool,
}

fn main() {
    match run() {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(error) => {
            eprintln!("tierprobe_runner: {error}");
            std::process::exit(EXIT_USAGE);
        }
    }
}

fn run() -> Result<i32, Box<dyn Error>> {
    let started_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(raw_args.iter().cloned())?;
    if args.print_help {
        return Ok(0);
    }

    let config = resolve_config(&args)?;
    let manifest_path = args
        .manifest_path
        .as_ref()
        .ok_or_else(|| "missing required --manifest".to_string())?;
    let registry = load_test_manifest(manifest_path)?.into_registry(&config)?;
    let specs = registry.filtered(args.filter.as_deref());
    if specs.is_empty() {
        return Err(match &args.filter {
            Some(filter) => format!("no tests match filter `{filter}`"),
            None => format!("manifest `{}` lists no tests", manifest_path.display()),
        }
        .into());
    }

    let context = RunContext::new(
        args.label.as_deref().unwrap_or(DEFAULT_RUN_LABEL),
        config.seed,
    );
    let log = EventLog::new(context.clone());
    log.emit(EventInput {
        component: "runner",
        event: "run_started",
        outcome: "ok",
        error_code: None,
        test_id: None,
        scenario_id: None,
        timing_us: 0,
    });
    eprintln!(
        "tierprobe_runner: {} tests, runtime `{}`, run {}",
        specs.len(),
        config.runtime.program,
        context.run_id()
    );

    let cancel = match config.deadline() {
        Some(deadline) => CancellationToken::with_deadline(deadline),
        None => CancellationToken::new(),
    };
    let launcher = ChildProcessRunner::new(config.runtime.clone());
    let executor = ScenarioMatrixExecutor::new(&launcher, config.executor_config())
        .with_cancellation(cancel)
        .with_events(&log);

    let clock = Instant::now();
    let aggregator = ResultAggregator::new(context.run_id());
    aggregator.record_all(executor.execute_all(&specs));
    let report = aggregator.finish();

    log.emit(EventInput {
        component: "runner",
        event: "run_finished",
        outcome: if report.all_passed() { "pass" } else { "fail" },
        error_code: None,
        test_id: None,
        scenario_id: None,
        timing_us: u64::try_from(clock.elapsed().as_micros()).unwrap_or(u64::MAX),
    });

    let json = serde_json::to_string_pretty(&report)?;
    if let Some(out_path) = &args.out_path {
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(out_path, json.as_bytes())?;
    }
    println!("{json}");

    let table = report.render_failure_table();
    if !table.is_empty() {
        eprint!("{table}");
    }
    eprintln!("tierprobe_runner: {}", report.summary_line());

    if let Some(artifacts_dir) = &config.artifacts_dir {
        let events = log.events();
        let commands = log.commands();
        let manifest = RunManifest::new(
            &context,
            &report,
            &events,
            &commands,
            started_at,
            render_command_line("tierprobe_runner", &raw_args),
        );
        let written = write_artifacts(artifacts_dir, &manifest, &events, &commands, &report)?;
        eprintln!(
            "tierprobe_runner: artifacts written to {}",
            written.run_dir.display()
        );
    }

    Ok(report.exit_code())
}

fn resolve_config(args: &CliArgs) -> Result<HarnessConfig, Box<dyn Error>> {
    let mut config = match &args.config_path {
        Some(path) => load_harness_config(path)?,
        None => HarnessConfig::new(RuntimeCommand::new(default_runtime_program()?)),
    };
    if let Some(runtime) = &args.runtime {
        config.runtime.program = runtime.clone();
    }
    if let Some(jobs) = args.jobs {
        config.parallelism = Some(jobs);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.default_timeout_ms = timeout_ms;
    }
    if let Some(deadline_ms) = args.deadline_ms {
        config.deadline_ms = Some(deadline_ms);
    }
    if let Some(artifacts_dir) = &args.artifacts_dir {
        config.artifacts_dir = Some(artifacts_dir.clone());
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.validate()?;
    Ok(config)
}

/// Without a config or `--runtime`, the simulated runtime shipped next to
/// this binary is used.
fn default_runtime_program() -> Result<String, Box<dyn Error>> {
    let current = std::env::current_exe()?;
    let driver = current.with_file_name(format!("{DRIVER_BIN_NAME}{}", std::env::consts::EXE_SUFFIX));
    if !driver.exists() {
        return Err(format!(
            "no runtime configured and `{}` does not exist; pass --config or --runtime",
            driver.display()
        )
        .into());
    }
    Ok(driver.display().to_string())
}

fn parse_args<I>(args: I) -> Result<CliArgs, Box<dyn Error>>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = CliArgs::default();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --config".to_string())?;
                cli.config_path = Some(PathBuf::from(value));
            }
            "--manifest" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --manifest".to_string())?;
                cli.manifest_path = Some(PathBuf::from(value));
            }
            "--runtime" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --runtime".to_string())?;
                cli.runtime = Some(value);
            }
            "--jobs" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --jobs".to_string())?;
                cli.jobs = Some(value.parse::<usize>()?);
            }
            "--timeout-ms" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --timeout-ms".to_string())?;
                cli.timeout_ms = Some(value.parse::<u64>()?);
            }
            "--deadline-ms" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --deadline-ms".to_string())?;
                cli.deadline_ms = Some(value.parse::<u64>()?);
            }
            "--filter" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --filter".to_string())?;
                cli.filter = Some(value);
            }
            "--out" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --out".to_string())?;
                cli.out_path = Some(PathBuf::from(value));
            }
            "--artifacts-dir" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --artifacts-dir".to_string())?;
                cli.artifacts_dir = Some(PathBuf::from(value));
            }
            "--label" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --label".to_string())?;
                cli.label = Some(value);
            }
            "--seed" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "missing value for --seed".to_string())?;
                cli.seed = Some(value.parse::<u64>()?);
            }
            "--help" | "-h" => {
                print_help();
                cli.print_help = true;
            }
            other => {
                return Err(format!("unknown argument `{other}`").into());
            }
        }
    }

    Ok(cli)
}

fn print_help() {
    println!(
        "tierprobe_runner --manifest <path> [--config <path>] [--runtime <program>] [--jobs <n>] [--timeout-ms <n>] [--deadline-ms <n>] [--filter <substring>] [--label <name>] [--seed <n>] [--out <path>] [--artifacts-dir <path>]"
    );
    println!(
        "Runs every manifest test across its scenario matrix and prints a JSON verdict report."
    );
    println!("Exit codes: 0 passed, 1 usage error, 2 test failures, 3 harness errors.");
}
