use std::process::{Command, Output};

use tierprobe_harness::driver::{DriverPayload, EXIT_WARMUP_NOT_CONVERGED};
use tierprobe_harness::ir_dump::ParsedOutput;
use tierprobe_harness::process_runner::PAYLOAD_LEN_ENV;
use tierprobe_harness::scenario::{CompileLevel, ScenarioMatrix};
use tierprobe_harness::test_spec::TestSpec;
use tierprobe_harness::warmup::WarmupStatus;

fn payload_for(method: &str, flags: &[&str], warmup: u64) -> String {
    let spec = TestSpec::builder("driver-cli", method)
        .warmup(warmup)
        .measure_iterations(64)
        .build()
        .expect("spec should build");
    let scenario = ScenarioMatrix::single(flags.iter().copied())
        .expand(&[])
        .expect("matrix should expand")
        .remove(0);
    serde_json::to_string(&DriverPayload::new(&spec, &scenario)).expect("payload should serialize")
}

fn run_driver(flags: &[&str], payload: &str) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tierprobe_driver"))
        .args(flags)
        .arg("--payload")
        .arg(payload)
        .env(PAYLOAD_LEN_ENV, payload.len().to_string())
        .output()
        .expect("driver should execute")
}

#[test]
fn interpreter_only_driver_stays_at_level_zero() {
    let flags = ["-Xint"];
    let output = run_driver(&flags, &payload_for("scalarized_sum", &flags, 100_000));
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    let parsed = ParsedOutput::parse(&stdout);
    assert!(parsed.sections.is_empty());
    assert_eq!(
        parsed.last_compile_level(Some("scalarized_sum")),
        Some(CompileLevel::Interpreted)
    );
    let warmup = parsed
        .last_warmup(Some("scalarized_sum"))
        .expect("warmup marker should be printed");
    assert_eq!(warmup.status, WarmupStatus::Skipped);
    assert!(parsed.last_result(Some("scalarized_sum")).is_some());
}

#[test]
fn non_tiered_driver_reaches_c2_and_dumps_final_ir() {
    let flags = ["-XX:TieredStopAtLevel=4", "-XX:-TieredCompilation"];
    let output = run_driver(&flags, &payload_for("escaping_box", &flags, 50_000));
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    let parsed = ParsedOutput::parse(&stdout);
    assert_eq!(
        parsed.last_compile_level(Some("escaping_box")),
        Some(CompileLevel::C2)
    );
    let final_ir = parsed
        .last_section(Some("escaping_box"), "final")
        .expect("final section should be dumped");
    assert_eq!(final_ir.level, CompileLevel::C2);
    assert_eq!(final_ir.count("AllocateNode"), 1);
    assert!(!final_ir.truncated);
}

#[test]
fn unreachable_compile_threshold_reports_warmup_not_converged() {
    let flags = ["-XX:-TieredCompilation", "-XX:CompileThreshold=1000000"];
    let output = run_driver(&flags, &payload_for("scalarized_sum", &flags, 1_000));
    assert_eq!(output.status.code(), Some(EXIT_WARMUP_NOT_CONVERGED));

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    let warmup = ParsedOutput::parse(&stdout)
        .last_warmup(None)
        .cloned()
        .expect("warmup marker should be printed before exiting");
    assert_eq!(warmup.status, WarmupStatus::NotConverged);
    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(stderr.contains("did not reach"));
}

#[test]
fn truncated_payload_is_rejected() {
    let flags = ["-Xint"];
    let payload = payload_for("scalarized_sum", &flags, 10);
    let output = Command::new(env!("CARGO_BIN_EXE_tierprobe_driver"))
        .args(flags)
        .arg("--payload")
        .arg(&payload[..payload.len() / 2])
        .env(PAYLOAD_LEN_ENV, payload.len().to_string())
        .output()
        .expect("driver should execute");
    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(stderr.contains("payload truncated"));
}

#[test]
fn unknown_method_is_a_usage_error() {
    let flags = ["-Xint"];
    let output = run_driver(&flags, &payload_for("no_such_method", &flags, 10));
    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(stderr.contains("unknown probe method"));
}

#[test]
fn missing_payload_is_a_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_tierprobe_driver"))
        .arg("-Xint")
        .output()
        .expect("driver should execute");
    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(stderr.contains("missing --payload"));
}
