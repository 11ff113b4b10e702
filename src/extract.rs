//! Tool-call extraction from a finished generation.
//!
//! Directive grammar: `[TOOL: name(argument)]` — an identifier name and one
//! free-text argument with no nested parentheses. Extraction is advisory:
//! malformed, unterminated, or nested directives are skipped, never errors.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::tools::RiskPolicy;

/// A candidate invocation parsed out of assistant text. The id is
/// deterministic within the batch: `name` plus ordinal position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub parameters: Vec<(String, String)>,
    pub requires_confirmation: bool,
}

fn directive_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\[TOOL:\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(([^()]*)\)\s*\]")
            .expect("directive pattern compiles")
    })
}

/// Extract candidate invocations left to right, order preserved.
pub fn extract_tool_calls(text: &str, risk: &RiskPolicy) -> Vec<ToolInvocation> {
    directive_pattern()
        .captures_iter(text)
        .enumerate()
        .map(|(index, captures)| {
            let name = captures[1].to_string();
            let argument = strip_quote_pair(captures[2].trim());
            let parameters = if argument.is_empty() {
                Vec::new()
            } else {
                vec![("input".to_string(), argument.to_string())]
            };
            ToolInvocation {
                id: format!("{}_{}", name, index),
                requires_confirmation: risk.requires_confirmation(&name),
                name,
                parameters,
            }
        })
        .collect()
}

/// Strip exactly one matched pair of surrounding quotes. Mismatched or
/// unpaired quotes are part of the argument.
fn strip_quote_pair(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &raw[1..raw.len() - 1];
        }
    }
    raw
}
