//! TOML harness configuration and test manifests.
//!
//! ```toml
//! schema_version = "tierprobe.harness-config.v1"
//! global_flags = ["-XX:+UnlockDiagnosticVMOptions"]
//! parallelism = 4
//! default_timeout_ms = 120000
//!
//! [runtime]
//! program = "/opt/jdk/bin/java"
//! driver_args = ["tierprobe.Driver"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::executor::{DEFAULT_TIMEOUT, ExecutorConfig};
use crate::process_runner::RuntimeCommand;
use crate::scenario::{ScenarioMatrix, ScenarioSelection, validate_flags};
use crate::test_spec::{
    CompileLevelConstraint, DEFAULT_MEASURE_ITERATIONS, Expectation, TestRegistry, TestSpec,
    TimeoutPolicy,
};
use crate::warmup::{ArgumentGenerator, WarmupPolicy};

pub const HARNESS_CONFIG_SCHEMA_VERSION: &str = "tierprobe.harness-config.v1";
pub const TEST_MANIFEST_SCHEMA_VERSION: &str = "tierprobe.test-manifest.v1";

fn default_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_TIMEOUT.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    pub schema_version: String,
    pub runtime: RuntimeCommand,
    #[serde(default)]
    pub global_flags: Vec<String>,
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Overall harness deadline; in-flight scenarios are killed when it
    /// passes.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Warmup applied to manifest tests that do not set their own.
    #[serde(default)]
    pub warmup: WarmupPolicy,
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
    #[serde(default)]
    pub seed: u64,
}

impl HarnessConfig {
    pub fn new(runtime: RuntimeCommand) -> Self {
        Self {
            schema_version: HARNESS_CONFIG_SCHEMA_VERSION.to_string(),
            runtime,
            global_flags: Vec::new(),
            parallelism: None,
            default_timeout_ms: default_timeout_ms(),
            deadline_ms: None,
            warmup: WarmupPolicy::default(),
            artifacts_dir: None,
            seed: 0,
        }
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.runtime.program.trim().is_empty() {
            return Err(HarnessError::InvalidConfig(
                "runtime.program must not be empty".to_string(),
            ));
        }
        if self.parallelism == Some(0) {
            return Err(HarnessError::InvalidConfig(
                "parallelism must be greater than zero".to_string(),
            ));
        }
        if self.default_timeout_ms == 0 {
            return Err(HarnessError::InvalidConfig(
                "default_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.warmup.validate()?;
        validate_flags("global_flags", &self.global_flags, None)?;
        Ok(())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        let defaults = ExecutorConfig::default();
        ExecutorConfig {
            parallelism: self.parallelism.unwrap_or(defaults.parallelism),
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            global_flags: self.global_flags.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

/// One manifest entry. Unset fields fall back to harness defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestDescriptor {
    pub test_id: String,
    pub method: String,
    #[serde(default)]
    pub expectations: Vec<Expectation>,
    #[serde(default)]
    pub warmup: Option<WarmupPolicy>,
    #[serde(default)]
    pub warmup_iterations: Option<u64>,
    #[serde(default)]
    pub compile_level: Option<CompileLevelConstraint>,
    #[serde(default)]
    pub arguments: Vec<ArgumentGenerator>,
    #[serde(default)]
    pub matrix: ScenarioMatrix,
    #[serde(default)]
    pub selection: ScenarioSelection,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub timeout_policy: Option<TimeoutPolicy>,
    #[serde(default)]
    pub measure_iterations: Option<u64>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl TestDescriptor {
    pub fn into_spec(self, defaults: &HarnessConfig) -> TestSpec {
        let mut warmup = self.warmup.unwrap_or(defaults.warmup);
        if let Some(iterations) = self.warmup_iterations {
            warmup.iterations = iterations;
        }
        TestSpec {
            test_id: self.test_id,
            method: self.method,
            expectations: self.expectations,
            warmup,
            compile_level: self.compile_level.unwrap_or_default(),
            arguments: self.arguments,
            matrix: self.matrix,
            selection: self.selection,
            timeout_ms: self.timeout_ms,
            timeout_policy: self.timeout_policy.unwrap_or_default(),
            measure_iterations: self.measure_iterations.unwrap_or(DEFAULT_MEASURE_ITERATIONS),
            seed: self.seed.unwrap_or(defaults.seed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestManifest {
    pub schema_version: String,
    #[serde(default)]
    pub tests: Vec<TestDescriptor>,
}

impl TestManifest {
    /// Builds the registry. Duplicate ids are fatal here; any other invalid
    /// descriptor is kept and fails on its own as a `CONFIG_ERROR` verdict.
    pub fn into_registry(self, defaults: &HarnessConfig) -> Result<TestRegistry, HarnessError> {
        let mut registry = TestRegistry::new();
        for descriptor in self.tests {
            registry.admit(descriptor.into_spec(defaults))?;
        }
        Ok(registry)
    }
}

fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T, HarnessError> {
    let raw = fs::read_to_string(path).map_err(|source| HarnessError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| HarnessError::ParseToml {
        path: path.display().to_string(),
        source,
    })
}

fn check_schema(path: &Path, expected: &str, actual: &str) -> Result<(), HarnessError> {
    if actual == expected {
        return Ok(());
    }
    Err(HarnessError::UnsupportedSchema {
        path: path.display().to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    })
}

pub fn load_harness_config(path: impl AsRef<Path>) -> Result<HarnessConfig, HarnessError> {
    let path = path.as_ref();
    let config: HarnessConfig = read_toml(path)?;
    check_schema(path, HARNESS_CONFIG_SCHEMA_VERSION, &config.schema_version)?;
    config.validate()?;
    Ok(config)
}

pub fn load_test_manifest(path: impl AsRef<Path>) -> Result<TestManifest, HarnessError> {
    let path = path.as_ref();
    let manifest: TestManifest = read_toml(path)?;
    check_schema(path, TEST_MANIFEST_SCHEMA_VERSION, &manifest.schema_version)?;
    Ok(manifest)
}
