//! Flag/scenario model.
//!
//! A [`Scenario`] is one concrete runtime configuration: an ordered flag list
//! plus an optional tier restriction and module-export directives. Scenarios
//! are produced by expanding a [`ScenarioMatrix`] (base flags × axes of
//! alternative flag groups, plus explicitly listed scenarios), validated for
//! tier/flag conflicts before anything is spawned, and shared read-only
//! across worker threads behind an `Arc`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigurationError;

pub const ADD_EXPORTS_FLAG: &str = "--add-exports";

const TIERED_STOP_PREFIX: &str = "-XX:TieredStopAtLevel=";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CompileLevel {
    #[default]
    Interpreted,
    C1Simple,
    C1LimitedProfile,
    C1FullProfile,
    C2,
}

impl CompileLevel {
    pub const ALL: [Self; 5] = [
        Self::Interpreted,
        Self::C1Simple,
        Self::C1LimitedProfile,
        Self::C1FullProfile,
        Self::C2,
    ];

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Interpreted => 0,
            Self::C1Simple => 1,
            Self::C1LimitedProfile => 2,
            Self::C1FullProfile => 3,
            Self::C2 => 4,
        }
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Interpreted),
            1 => Some(Self::C1Simple),
            2 => Some(Self::C1LimitedProfile),
            3 => Some(Self::C1FullProfile),
            4 => Some(Self::C2),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interpreted => "interpreted",
            Self::C1Simple => "c1_simple",
            Self::C1LimitedProfile => "c1_limited_profile",
            Self::C1FullProfile => "c1_full_profile",
            Self::C2 => "c2",
        }
    }
}

impl fmt::Display for CompileLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_u8(), self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierRestriction {
    InterpreterOnly,
    Tier1Only,
    Tier2Only,
}

impl TierRestriction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InterpreterOnly => "interpreter_only",
            Self::Tier1Only => "tier1_only",
            Self::Tier2Only => "tier2_only",
        }
    }

    /// Runtime flag that enforces this restriction.
    pub const fn flag(self) -> &'static str {
        match self {
            Self::InterpreterOnly => "-Xint",
            Self::Tier1Only => "-XX:TieredStopAtLevel=1",
            Self::Tier2Only => "-XX:-TieredCompilation",
        }
    }

    pub fn admits(self, profile: &TierProfile) -> bool {
        match self {
            Self::InterpreterOnly => profile.ceiling == CompileLevel::Interpreted,
            Self::Tier1Only => {
                profile.tiered
                    && profile.ceiling >= CompileLevel::C1Simple
                    && profile.ceiling <= CompileLevel::C1FullProfile
            }
            Self::Tier2Only => profile.reaches(CompileLevel::C2),
        }
    }
}

impl fmt::Display for TierRestriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Compilation capability implied by a flag list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierProfile {
    /// Highest compile level reachable under the flags.
    pub ceiling: CompileLevel,
    /// Whether the intermediate C1 levels (1..=3) exist at all.
    pub tiered: bool,
    pub compile_on_first_call: bool,
}

impl Default for TierProfile {
    fn default() -> Self {
        Self {
            ceiling: CompileLevel::C2,
            tiered: true,
            compile_on_first_call: false,
        }
    }
}

impl TierProfile {
    /// Derives the profile from a rendered flag list. Later flags override
    /// earlier ones, matching how the runtime itself resolves them.
    pub fn derive<S: AsRef<str>>(flags: &[S]) -> Self {
        let mut interpreter_only = false;
        let mut compile_on_first_call = false;
        let mut tiered = true;
        let mut stop_at = None::<u8>;

        for flag in runtime_flags(flags) {
            match flag {
                "-Xint" => {
                    interpreter_only = true;
                    compile_on_first_call = false;
                }
                "-Xcomp" => {
                    compile_on_first_call = true;
                    interpreter_only = false;
                }
                "-Xmixed" => {
                    interpreter_only = false;
                    compile_on_first_call = false;
                }
                "-XX:+TieredCompilation" => tiered = true,
                "-XX:-TieredCompilation" => tiered = false,
                other => {
                    if let Some(raw) = other.strip_prefix(TIERED_STOP_PREFIX)
                        && let Ok(level) = raw.parse::<u8>()
                    {
                        stop_at = Some(level.min(CompileLevel::C2.as_u8()));
                    }
                }
            }
        }

        let ceiling = if interpreter_only {
            CompileLevel::Interpreted
        } else if !tiered {
            CompileLevel::C2
        } else {
            stop_at
                .and_then(CompileLevel::from_u8)
                .unwrap_or(CompileLevel::C2)
        };

        Self {
            ceiling,
            tiered,
            compile_on_first_call: compile_on_first_call && !interpreter_only,
        }
    }

    pub fn reaches(&self, level: CompileLevel) -> bool {
        if level > self.ceiling {
            return false;
        }
        self.tiered || matches!(level, CompileLevel::Interpreted | CompileLevel::C2)
    }

    /// Highest reachable level that does not exceed `target`.
    pub fn clamp(&self, target: CompileLevel) -> CompileLevel {
        (0..=target.as_u8())
            .rev()
            .filter_map(CompileLevel::from_u8)
            .find(|level| self.reaches(*level))
            .unwrap_or(CompileLevel::Interpreted)
    }
}

/// Flags relevant to tier derivation, with `--add-exports` directives and
/// their operands removed.
fn runtime_flags<S: AsRef<str>>(flags: &[S]) -> Vec<&str> {
    let mut out = Vec::with_capacity(flags.len());
    let mut iter = flags.iter().map(AsRef::as_ref);
    while let Some(flag) = iter.next() {
        if flag == ADD_EXPORTS_FLAG {
            iter.next();
            continue;
        }
        if flag.starts_with("--add-exports=") {
            continue;
        }
        out.push(flag);
    }
    out
}

/// Override key of a flag: flags sharing a key replace each other when
/// layers are merged. `None` for flags that only accumulate.
fn override_key(flag: &str) -> Option<&str> {
    match flag {
        "-Xint" | "-Xcomp" | "-Xmixed" => Some("-X<mode>"),
        _ => {
            let name = flag
                .strip_prefix("-XX:+")
                .or_else(|| flag.strip_prefix("-XX:-"))
                .or_else(|| flag.strip_prefix("-XX:"))?;
            Some(name.split_once('=').map_or(name, |(name, _)| name))
        }
    }
}

/// Merges flag layers in order (global, base, then each template). A later
/// layer's flag replaces any earlier flag with the same override key;
/// `--add-exports` directives always accumulate.
pub fn resolve_layers<S: AsRef<str>>(layers: &[&[S]]) -> Vec<String> {
    let mut resolved: Vec<String> = Vec::new();
    for layer in layers {
        let mut iter = layer.iter().map(AsRef::as_ref);
        while let Some(flag) = iter.next() {
            if flag == ADD_EXPORTS_FLAG {
                resolved.push(flag.to_string());
                if let Some(operand) = iter.next() {
                    resolved.push(operand.to_string());
                }
                continue;
            }
            if let Some(key) = override_key(flag) {
                let mut skip_operand = false;
                resolved.retain(|existing| {
                    if skip_operand {
                        skip_operand = false;
                        return true;
                    }
                    if existing == ADD_EXPORTS_FLAG {
                        skip_operand = true;
                        return true;
                    }
                    override_key(existing) != Some(key)
                });
            }
            resolved.push(flag.to_string());
        }
    }
    resolved
}

/// Rejects a flag group the runtime would either refuse or silently resolve
/// in a way that contradicts the requested tier restriction. Contradictions
/// are only meaningful within one group; across layers use
/// [`resolve_layers`] first.
pub fn validate_flags<S: AsRef<str>>(
    label: &str,
    flags: &[S],
    restriction: Option<TierRestriction>,
) -> Result<(), ConfigurationError> {
    let flags = runtime_flags(flags);

    for flag in &flags {
        if let Some(raw) = flag.strip_prefix(TIERED_STOP_PREFIX) {
            match raw.parse::<u8>() {
                Ok(level) if level <= CompileLevel::C2.as_u8() => {}
                _ => {
                    return Err(ConfigurationError::InvalidFlag {
                        flag: (*flag).to_string(),
                        reason: "TieredStopAtLevel must be an integer in 0..=4".to_string(),
                    });
                }
            }
        }
    }

    if flags.contains(&"-Xint") && flags.contains(&"-Xcomp") {
        return Err(ConfigurationError::ContradictoryFlags {
            scenario: label.to_string(),
            first: "-Xint".to_string(),
            second: "-Xcomp".to_string(),
        });
    }

    let mut enabled = BTreeSet::new();
    let mut disabled = BTreeSet::new();
    for flag in &flags {
        if let Some(name) = flag.strip_prefix("-XX:+") {
            if disabled.contains(name) {
                return Err(ConfigurationError::ContradictoryFlags {
                    scenario: label.to_string(),
                    first: format!("-XX:-{name}"),
                    second: (*flag).to_string(),
                });
            }
            enabled.insert(name);
        } else if let Some(name) = flag.strip_prefix("-XX:-") {
            if enabled.contains(name) {
                return Err(ConfigurationError::ContradictoryFlags {
                    scenario: label.to_string(),
                    first: format!("-XX:+{name}"),
                    second: (*flag).to_string(),
                });
            }
            disabled.insert(name);
        }
    }

    match restriction {
        Some(restriction) => check_restriction(label, restriction, &flags),
        None => Ok(()),
    }
}

fn check_restriction(
    label: &str,
    restriction: TierRestriction,
    flags: &[&str],
) -> Result<(), ConfigurationError> {
    let conflict = |flag: &str| ConfigurationError::TierConflict {
        scenario: label.to_string(),
        restriction: restriction.as_str().to_string(),
        flag: flag.to_string(),
    };

    for flag in flags {
        let stop_at = flag
            .strip_prefix(TIERED_STOP_PREFIX)
            .and_then(|raw| raw.parse::<u8>().ok());
        let conflicting = match restriction {
            TierRestriction::InterpreterOnly => {
                *flag == "-Xcomp" || stop_at.is_some_and(|level| level > 0)
            }
            TierRestriction::Tier1Only => {
                *flag == "-Xint"
                    || *flag == "-XX:-TieredCompilation"
                    || stop_at.is_some_and(|level| level != 1)
            }
            TierRestriction::Tier2Only => {
                *flag == "-Xint"
                    || *flag == "-XX:+TieredCompilation"
                    || stop_at.is_some_and(|level| level < CompileLevel::C2.as_u8())
            }
        };
        if conflicting {
            return Err(conflict(*flag));
        }
    }
    Ok(())
}

pub fn scenario_fingerprint<S: AsRef<str>>(flags: &[S]) -> String {
    let mut hasher = Sha256::new();
    for flag in flags {
        hasher.update(flag.as_ref().as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("scn-{}", &digest[..12])
}

/// One concrete runtime configuration. Immutable once built; identity is
/// the rendered flag list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scenario {
    index: usize,
    scenario_id: String,
    flags: Vec<String>,
    restriction: Option<TierRestriction>,
    module_exports: Vec<String>,
    profile: TierProfile,
}

impl Scenario {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    /// Fully rendered flags, including the restriction flag and
    /// `--add-exports` directives, in command-line order.
    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    pub fn restriction(&self) -> Option<TierRestriction> {
        self.restriction
    }

    pub fn module_exports(&self) -> &[String] {
        &self.module_exports
    }

    pub fn profile(&self) -> &TierProfile {
        &self.profile
    }

    pub fn tier_ceiling(&self) -> CompileLevel {
        self.profile.ceiling
    }

    pub fn label(&self) -> String {
        format!("#{} [{}]", self.index, self.flags.join(" "))
    }
}

/// One flag group: an axis choice or an explicitly listed scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioTemplate {
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub restriction: Option<TierRestriction>,
    #[serde(default)]
    pub module_exports: Vec<String>,
}

impl ScenarioTemplate {
    pub fn flags<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            flags: flags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn restricted(restriction: TierRestriction) -> Self {
        Self {
            restriction: Some(restriction),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_restriction(mut self, restriction: TierRestriction) -> Self {
        self.restriction = Some(restriction);
        self
    }

    #[must_use]
    pub fn with_export(mut self, directive: impl Into<String>) -> Self {
        self.module_exports.push(directive.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioMatrix {
    #[serde(default)]
    pub base_flags: Vec<String>,
    /// Each axis lists alternative flag groups; expansion takes one group
    /// from every axis. The first axis varies slowest.
    #[serde(default)]
    pub axes: Vec<Vec<ScenarioTemplate>>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioTemplate>,
}

impl ScenarioMatrix {
    pub fn single<I, S>(base_flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            base_flags: base_flags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn expand(&self, global_flags: &[String]) -> Result<Vec<Arc<Scenario>>, ConfigurationError> {
        let mut combos: Vec<Vec<&ScenarioTemplate>> = vec![Vec::new()];
        for axis in self.axes.iter().filter(|axis| !axis.is_empty()) {
            let mut next = Vec::with_capacity(combos.len() * axis.len());
            for combo in &combos {
                for choice in axis {
                    let mut extended = combo.clone();
                    extended.push(choice);
                    next.push(extended);
                }
            }
            combos = next;
        }

        let has_axes = self.axes.iter().any(|axis| !axis.is_empty());
        let mut candidates = Vec::new();
        if has_axes || self.scenarios.is_empty() {
            candidates.extend(combos);
        }
        candidates.extend(self.scenarios.iter().map(|template| vec![template]));

        let mut seen = BTreeSet::new();
        let mut scenarios = Vec::with_capacity(candidates.len());
        for (position, combo) in candidates.iter().enumerate() {
            let scenario = self.materialize(global_flags, combo, position)?;
            if seen.insert(scenario.flags.clone()) {
                scenarios.push(scenario);
            }
        }

        Ok(scenarios
            .into_iter()
            .enumerate()
            .map(|(index, mut scenario)| {
                scenario.index = index;
                Arc::new(scenario)
            })
            .collect())
    }

    fn materialize(
        &self,
        global_flags: &[String],
        combo: &[&ScenarioTemplate],
        position: usize,
    ) -> Result<Scenario, ConfigurationError> {
        let mut layers: Vec<&[String]> = vec![global_flags, self.base_flags.as_slice()];
        layers.extend(combo.iter().map(|template| template.flags.as_slice()));
        let mut restriction = None::<TierRestriction>;
        let mut module_exports = Vec::new();

        for (layer, group) in ["global_flags", "base_flags"].iter().zip(&layers) {
            validate_flags(&format!("#{position} {layer}"), *group, None)?;
        }
        for template in combo {
            validate_flags(
                &format!("#{position} [{}]", template.flags.join(" ")),
                &template.flags,
                None,
            )?;
            module_exports.extend(template.module_exports.iter().cloned());
            if let Some(requested) = template.restriction {
                match restriction {
                    Some(previous) if previous != requested => {
                        let resolved = resolve_layers(&layers);
                        return Err(ConfigurationError::MultipleRestrictions {
                            scenario: format!("#{position} [{}]", resolved.join(" ")),
                            first: previous.as_str().to_string(),
                            second: requested.as_str().to_string(),
                        });
                    }
                    _ => restriction = Some(requested),
                }
            }
        }

        let mut flags = resolve_layers(&layers);
        let label = format!("#{position} [{}]", flags.join(" "));
        validate_flags(&label, &flags, restriction)?;

        if let Some(restriction) = restriction {
            let flag = restriction.flag();
            if !flags.iter().any(|existing| existing == flag) {
                flags.push(flag.to_string());
            }
        }
        for directive in &module_exports {
            flags.push(ADD_EXPORTS_FLAG.to_string());
            flags.push(directive.clone());
        }

        let profile = TierProfile::derive(&flags);
        Ok(Scenario {
            index: position,
            scenario_id: scenario_fingerprint(&flags),
            flags,
            restriction,
            module_exports,
            profile,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioSelection {
    #[default]
    All,
    Indices {
        indices: Vec<usize>,
    },
    Tier {
        restriction: TierRestriction,
    },
}

impl ScenarioSelection {
    /// Narrows an expanded matrix. Scenario indices are preserved so that
    /// reports keep referring to the matrix position.
    pub fn apply(
        &self,
        test_id: &str,
        scenarios: Vec<Arc<Scenario>>,
    ) -> Result<Vec<Arc<Scenario>>, ConfigurationError> {
        let selected: Vec<Arc<Scenario>> = match self {
            Self::All => scenarios,
            Self::Indices { indices } => {
                let available = scenarios.len();
                if let Some(index) = indices.iter().find(|index| **index >= available) {
                    return Err(ConfigurationError::ScenarioIndexOutOfRange {
                        test_id: test_id.to_string(),
                        index: *index,
                        available,
                    });
                }
                let wanted: BTreeSet<usize> = indices.iter().copied().collect();
                scenarios
                    .into_iter()
                    .filter(|scenario| wanted.contains(&scenario.index))
                    .collect()
            }
            Self::Tier { restriction } => scenarios
                .into_iter()
                .filter(|scenario| restriction.admits(&scenario.profile))
                .collect(),
        };

        if selected.is_empty() {
            return Err(ConfigurationError::EmptySelection {
                test_id: test_id.to_string(),
            });
        }
        Ok(selected)
    }
}
