//! Versioned marker and IR dump line format exchanged between the child
//! driver and the harness.
//!
//! Every structured line starts with `[tierprobe] v1 `. IR dumps are
//! phase-delimited sections:
//!
//! ```text
//! [tierprobe] v1 ir-begin method=scalarized_sum phase=final level=4
//!     10  Parm  === _
//!     11  AddI  === 10 10
//! [tierprobe] v1 ir-end method=scalarized_sum phase=final
//! ```
//!
//! Marker lines with any other version are ignored, so a newer child can
//! never corrupt the counts of an older parser.
//!
//! Streams are parsed independently and stdout is ordered before stderr, so
//! "last section wins" is per stream order rather than emission order. A
//! runtime should dump IR to one stream only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::scenario::CompileLevel;
use crate::warmup::{WarmupOutcome, WarmupStatus};

pub const MARKER_PREFIX: &str = "[tierprobe]";
pub const DUMP_FORMAT_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    IrBegin {
        method: String,
        phase: String,
        level: CompileLevel,
    },
    IrEnd {
        method: String,
        phase: String,
    },
    Warmup(WarmupOutcome),
    CompileLevel {
        method: String,
        level: CompileLevel,
    },
    Result {
        method: String,
        digest: String,
    },
}

impl Marker {
    pub fn render(&self) -> String {
        let body = match self {
            Self::IrBegin {
                method,
                phase,
                level,
            } => format!("ir-begin method={method} phase={phase} level={}", level.as_u8()),
            Self::IrEnd { method, phase } => format!("ir-end method={method} phase={phase}"),
            Self::Warmup(outcome) => format!(
                "warmup method={} outcome={} level={} iterations={}",
                outcome.method,
                outcome.status.as_str(),
                outcome.level.as_u8(),
                outcome.iterations
            ),
            Self::CompileLevel { method, level } => {
                format!("compile-level method={method} level={}", level.as_u8())
            }
            Self::Result { method, digest } => format!("result method={method} digest={digest}"),
        };
        format!("{MARKER_PREFIX} {DUMP_FORMAT_VERSION} {body}")
    }

    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix(MARKER_PREFIX)?;
        let mut tokens = rest.split_whitespace();
        if tokens.next()? != DUMP_FORMAT_VERSION {
            return None;
        }
        let kind = tokens.next()?;
        let fields: BTreeMap<&str, &str> = tokens.filter_map(|token| token.split_once('=')).collect();
        let text = |key: &str| fields.get(key).map(|value| (*value).to_string());
        let level = |key: &str| {
            fields
                .get(key)
                .and_then(|value| value.parse::<u8>().ok())
                .and_then(CompileLevel::from_u8)
        };

        match kind {
            "ir-begin" => Some(Self::IrBegin {
                method: text("method")?,
                phase: text("phase")?,
                level: level("level")?,
            }),
            "ir-end" => Some(Self::IrEnd {
                method: text("method")?,
                phase: text("phase")?,
            }),
            "warmup" => Some(Self::Warmup(WarmupOutcome {
                method: text("method")?,
                status: WarmupStatus::parse(fields.get("outcome")?)?,
                level: level("level")?,
                iterations: fields.get("iterations")?.parse().ok()?,
            })),
            "compile-level" => Some(Self::CompileLevel {
                method: text("method")?,
                level: level("level")?,
            }),
            "result" => Some(Self::Result {
                method: text("method")?,
                digest: text("digest")?,
            }),
            _ => None,
        }
    }
}

/// Renders one IR node line. Inputs are node ids, `_` when absent.
pub fn render_node_line(id: usize, node: &str, inputs: &[usize]) -> String {
    let inputs = if inputs.is_empty() {
        "_".to_string()
    } else {
        inputs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    };
    format!("{id:>6}  {node}  === {inputs}")
}

/// Renders a complete, terminated section for `nodes`, numbering node ids
/// from 10 and wiring each node to its predecessor.
pub fn render_section(method: &str, phase: &str, level: CompileLevel, nodes: &[&str]) -> Vec<String> {
    let mut lines = Vec::with_capacity(nodes.len() + 2);
    lines.push(
        Marker::IrBegin {
            method: method.to_string(),
            phase: phase.to_string(),
            level,
        }
        .render(),
    );
    for (offset, node) in nodes.iter().enumerate() {
        let id = 10 + offset;
        let inputs: Vec<usize> = if offset == 0 { Vec::new() } else { vec![id - 1] };
        lines.push(render_node_line(id, node, &inputs));
    }
    lines.push(
        Marker::IrEnd {
            method: method.to_string(),
            phase: phase.to_string(),
        }
        .render(),
    );
    lines
}

/// Splits a dump line into identifier tokens (`[A-Za-z0-9_$]+`).
pub fn node_tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '$'))
        .filter(|token| !token.is_empty())
}

pub fn count_node_tokens<S: AsRef<str>>(lines: &[S], node: &str) -> usize {
    lines
        .iter()
        .map(|line| node_tokens(line.as_ref()).filter(|token| *token == node).count())
        .sum()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrSection {
    pub method: String,
    pub phase: String,
    pub level: CompileLevel,
    pub node_lines: Vec<String>,
    /// Set when the section was not closed by a matching `ir-end`, e.g. the
    /// child was killed mid-dump.
    pub truncated: bool,
}

impl IrSection {
    pub fn count(&self, node: &str) -> usize {
        count_node_tokens(&self.node_lines, node)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelObservation {
    pub method: String,
    pub level: CompileLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultDigest {
    pub method: String,
    pub digest: String,
}

/// Everything structured that could be recovered from one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedOutput {
    pub sections: Vec<IrSection>,
    pub warmups: Vec<WarmupOutcome>,
    pub compile_levels: Vec<LevelObservation>,
    pub results: Vec<ResultDigest>,
}

impl ParsedOutput {
    pub fn parse(text: &str) -> Self {
        let mut out = Self::default();
        let mut current = None::<IrSection>;

        for line in text.lines() {
            match Marker::parse(line) {
                Some(Marker::IrBegin {
                    method,
                    phase,
                    level,
                }) => {
                    if let Some(mut open) = current.take() {
                        open.truncated = true;
                        out.sections.push(open);
                    }
                    current = Some(IrSection {
                        method,
                        phase,
                        level,
                        node_lines: Vec::new(),
                        truncated: false,
                    });
                }
                Some(Marker::IrEnd { method, phase }) => {
                    // A mismatched end still closes the open section so that
                    // later output is not counted as IR.
                    if let Some(mut done) = current.take() {
                        done.truncated = done.method != method || done.phase != phase;
                        out.sections.push(done);
                    }
                }
                Some(Marker::Warmup(outcome)) => out.warmups.push(outcome),
                Some(Marker::CompileLevel { method, level }) => {
                    out.compile_levels.push(LevelObservation { method, level });
                }
                Some(Marker::Result { method, digest }) => {
                    out.results.push(ResultDigest { method, digest });
                }
                None => {
                    if line.trim_start().starts_with(MARKER_PREFIX) || line.trim().is_empty() {
                        continue;
                    }
                    if let Some(open) = current.as_mut() {
                        open.node_lines.push(line.to_string());
                    }
                }
            }
        }

        if let Some(mut open) = current.take() {
            open.truncated = true;
            out.sections.push(open);
        }
        out
    }

    pub fn merge(&mut self, other: Self) {
        self.sections.extend(other.sections);
        self.warmups.extend(other.warmups);
        self.compile_levels.extend(other.compile_levels);
        self.results.extend(other.results);
    }

    /// Last section for `phase`, restricted to `method` when given. The
    /// last one wins because a recompilation after deoptimization replaces
    /// the earlier code.
    pub fn last_section(&self, method: Option<&str>, phase: &str) -> Option<&IrSection> {
        self.sections
            .iter()
            .rev()
            .find(|section| section.phase == phase && method.is_none_or(|m| section.method == m))
    }

    pub fn last_warmup(&self, method: Option<&str>) -> Option<&WarmupOutcome> {
        self.warmups
            .iter()
            .rev()
            .find(|outcome| method.is_none_or(|m| outcome.method == m))
    }

    pub fn last_compile_level(&self, method: Option<&str>) -> Option<CompileLevel> {
        self.compile_levels
            .iter()
            .rev()
            .find(|observation| method.is_none_or(|m| observation.method == m))
            .map(|observation| observation.level)
    }

    pub fn last_result(&self, method: Option<&str>) -> Option<&str> {
        self.results
            .iter()
            .rev()
            .find(|result| method.is_none_or(|m| result.method == m))
            .map(|result| result.digest.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_render_and_parse_back() {
        let markers = [
            Marker::IrBegin {
                method: "m".to_string(),
                phase: "final".to_string(),
                level: CompileLevel::C2,
            },
            Marker::Warmup(WarmupOutcome {
                method: "m".to_string(),
                status: WarmupStatus::NotConverged,
                level: CompileLevel::C1FullProfile,
                iterations: 80_000,
            }),
            Marker::Result {
                method: "m".to_string(),
                digest: "00ff".to_string(),
            },
        ];
        for marker in markers {
            assert_eq!(Marker::parse(&marker.render()), Some(marker));
        }
    }

    #[test]
    fn unknown_version_and_malformed_markers_are_ignored() {
        assert_eq!(Marker::parse("[tierprobe] v2 compile-level method=m level=4"), None);
        assert_eq!(Marker::parse("[tierprobe] v1 compile-level method=m level=9"), None);
        assert_eq!(Marker::parse("plain output"), None);
    }

    #[test]
    fn whole_token_counting_does_not_match_longer_kinds() {
        let lines = [
            render_node_line(10, "AllocateArrayNode", &[]),
            render_node_line(11, "AllocateNode", &[10]),
            "    12  MyAllocateNodeX  === 11".to_string(),
        ];
        assert_eq!(count_node_tokens(&lines, "AllocateNode"), 1);
        assert_eq!(count_node_tokens(&lines, "AllocateArrayNode"), 1);
        assert_eq!(count_node_tokens(&lines, "Allocate"), 0);
    }

    #[test]
    fn sections_are_scoped_by_phase() {
        let mut text = render_section("m", "after_parsing", CompileLevel::C2, &["AllocateNode", "AllocateNode"]);
        text.extend(render_section("m", "final", CompileLevel::C2, &["AddI"]));
        let parsed = ParsedOutput::parse(&text.join("\n"));
        assert_eq!(parsed.sections.len(), 2);
        let final_section = parsed.last_section(Some("m"), "final").expect("final");
        assert_eq!(final_section.count("AllocateNode"), 0);
        let parse_section = parsed.last_section(Some("m"), "after_parsing").expect("parsing");
        assert_eq!(parse_section.count("AllocateNode"), 2);
        assert!(parsed.last_section(Some("other"), "final").is_none());
    }

    #[test]
    fn unterminated_section_is_closed_at_eof_and_flagged() {
        let text = format!(
            "{}\n{}\n",
            Marker::IrBegin {
                method: "m".to_string(),
                phase: "final".to_string(),
                level: CompileLevel::C2,
            }
            .render(),
            render_node_line(10, "AllocateNode", &[])
        );
        let parsed = ParsedOutput::parse(&text);
        let section = parsed.last_section(None, "final").expect("section");
        assert!(section.truncated);
        assert_eq!(section.count("AllocateNode"), 1);
    }

    #[test]
    fn mismatched_end_closes_section_as_truncated() {
        let lines = [
            Marker::IrBegin {
                method: "m".to_string(),
                phase: "final".to_string(),
                level: CompileLevel::C2,
            }
            .render(),
            render_node_line(10, "AllocateNode", &[]),
            Marker::IrEnd {
                method: "m".to_string(),
                phase: "after_parsing".to_string(),
            }
            .render(),
            render_node_line(11, "AllocateNode", &[]),
            "Uncommon trap occurred in m AllocateNode".to_string(),
        ];
        let parsed = ParsedOutput::parse(&lines.join("\n"));
        assert_eq!(parsed.sections.len(), 1);
        let section = parsed.last_section(Some("m"), "final").expect("section");
        assert!(section.truncated);
        assert_eq!(section.count("AllocateNode"), 1);
    }

    #[test]
    fn later_section_for_same_phase_wins() {
        let mut text = render_section("m", "final", CompileLevel::C2, &["AllocateNode"]);
        text.push("Uncommon trap occurred in m".to_string());
        text.extend(render_section("m", "final", CompileLevel::C2, &["AddI"]));
        let parsed = ParsedOutput::parse(&text.join("\n"));
        assert_eq!(parsed.sections.len(), 2);
        assert_eq!(parsed.last_section(Some("m"), "final").expect("s").count("AllocateNode"), 0);
    }
}
