#![forbid(unsafe_code)]

//! `tierprobe_driver` is the in-process half of a tier probe. It stands in
//! for a JIT runtime launched with scenario flags: it warms the target
//! method up, prints IR dumps and markers on stdout, then measures.

use std::io;

use anyhow::Context;
use tierprobe_harness::driver::{EXIT_DRIVER_USAGE, parse_driver_args, run_probe};
use tierprobe_harness::process_runner::PAYLOAD_LEN_ENV;

fn main() {
    match run() {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(error) => {
            eprintln!("tierprobe_driver: {error:#}");
            std::process::exit(EXIT_DRIVER_USAGE);
        }
    }
}

fn run() -> anyhow::Result<i32> {
    let invocation = parse_driver_args(std::env::args().skip(1))?;
    let expected_len = match std::env::var(PAYLOAD_LEN_ENV) {
        Ok(raw) => Some(
            raw.parse::<usize>()
                .with_context(|| format!("invalid {PAYLOAD_LEN_ENV} value `{raw}`"))?,
        ),
        Err(_) => None,
    };
    let stdout = io::stdout();
    let stderr = io::stderr();
    run_probe(
        &invocation,
        expected_len,
        &mut stdout.lock(),
        &mut stderr.lock(),
    )
}
