use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad classification of everything that can go wrong for one
/// (test, scenario) unit. Each class carries a stable error code that is
/// written into events and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Configuration,
    ProcessSpawn,
    Timeout,
    ExpectationViolation,
    WarmupNotConverged,
}

impl ErrorClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration_error",
            Self::ProcessSpawn => "process_spawn_error",
            Self::Timeout => "timeout_error",
            Self::ExpectationViolation => "expectation_violation",
            Self::WarmupNotConverged => "warmup_not_converged",
        }
    }

    pub const fn error_code(self) -> &'static str {
        match self {
            Self::Configuration => "TP-CONFIG-0001",
            Self::ProcessSpawn => "TP-SPAWN-0001",
            Self::Timeout => "TP-TIMEOUT-0001",
            Self::ExpectationViolation => "TP-EXPECT-0001",
            Self::WarmupNotConverged => "TP-WARMUP-0001",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Malformed scenario, tier combination or test description. Always caught
/// before any child process is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("scenario `{scenario}`: tier restriction `{restriction}` conflicts with flag `{flag}`")]
    TierConflict {
        scenario: String,
        restriction: String,
        flag: String,
    },
    #[error("scenario `{scenario}`: flags `{first}` and `{second}` contradict each other")]
    ContradictoryFlags {
        scenario: String,
        first: String,
        second: String,
    },
    #[error("scenario `{scenario}`: more than one tier restriction (`{first}`, `{second}`)")]
    MultipleRestrictions {
        scenario: String,
        first: String,
        second: String,
    },
    #[error("invalid flag `{flag}`: {reason}")]
    InvalidFlag { flag: String, reason: String },
    #[error(
        "test `{test_id}`: scenario index {index} out of range (matrix has {available} scenarios)"
    )]
    ScenarioIndexOutOfRange {
        test_id: String,
        index: usize,
        available: usize,
    },
    #[error("test `{test_id}`: scenario selection matched no scenarios")]
    EmptySelection { test_id: String },
    #[error("invalid test spec: {0}")]
    InvalidSpec(String),
}

impl ConfigurationError {
    pub const fn error_code(&self) -> &'static str {
        ErrorClass::Configuration.error_code()
    }
}

#[derive(Debug, Error)]
pub enum ProcessSpawnError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("failed waiting for `{program}`: {source}")]
    Wait { program: String, source: io::Error },
    #[error("failed to encode driver payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ProcessSpawnError {
    pub const fn error_code(&self) -> &'static str {
        ErrorClass::ProcessSpawn.error_code()
    }
}

/// Errors raised while loading inputs or writing run artifacts. These abort
/// the harness invocation as a whole rather than a single unit.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to read `{path}`: {source}")]
    ReadFile { path: String, source: io::Error },
    #[error("failed to write `{path}`: {source}")]
    WriteFile { path: String, source: io::Error },
    #[error("failed to parse TOML `{path}`: {source}")]
    ParseToml {
        path: String,
        source: toml::de::Error,
    },
    #[error("unsupported schema in `{path}`: expected `{expected}`, got `{actual}`")]
    UnsupportedSchema {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("invalid harness config: {0}")]
    InvalidConfig(String),
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes_have_distinct_codes() {
        let classes = [
            ErrorClass::Configuration,
            ErrorClass::ProcessSpawn,
            ErrorClass::Timeout,
            ErrorClass::ExpectationViolation,
            ErrorClass::WarmupNotConverged,
        ];
        let codes: std::collections::BTreeSet<_> =
            classes.iter().map(|class| class.error_code()).collect();
        assert_eq!(codes.len(), classes.len());
    }

    #[test]
    fn tier_conflict_message_names_the_flag() {
        let err = ConfigurationError::TierConflict {
            scenario: "scn-1".to_string(),
            restriction: "interpreter_only".to_string(),
            flag: "-Xcomp".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("interpreter_only"));
        assert!(rendered.contains("-Xcomp"));
        assert_eq!(err.error_code(), "TP-CONFIG-0001");
    }
}
