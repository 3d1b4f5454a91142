#![forbid(unsafe_code)]

pub mod analyzer;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod ir_dump;
pub mod process_runner;
pub mod report;
pub mod scenario;
pub mod sim_runtime;
pub mod test_spec;
pub mod warmup;
