//! Tool manifest, risk classification, and the executor seam.
//!
//! Concrete tools live outside the core: the orchestrator only knows a tool's
//! name, its manifest description, and whether invoking it requires an
//! explicit confirmation. Execution goes through the [`ToolExecutor`] trait,
//! treated as a single request/response even if internally composite.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A configured tool: manifest entry plus risk classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// Safe tools auto-execute; everything else pauses for confirmation.
    #[serde(default)]
    pub safe: bool,
}

impl ToolSpec {
    pub fn safe(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            safe: true,
        }
    }

    pub fn unsafe_tool(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            safe: false,
        }
    }
}

/// Static name → requires-confirmation mapping, loaded once at startup.
///
/// Any name not explicitly marked safe requires confirmation.
#[derive(Debug, Clone, Default)]
pub struct RiskPolicy {
    safe: HashSet<String>,
}

impl RiskPolicy {
    pub fn from_specs(specs: &[ToolSpec]) -> Self {
        Self {
            safe: specs
                .iter()
                .filter(|spec| spec.safe)
                .map(|spec| spec.name.clone())
                .collect(),
        }
    }

    pub fn requires_confirmation(&self, tool_name: &str) -> bool {
        !self.safe.contains(tool_name)
    }
}

/// Render the tool manifest appended to the system preamble, including the
/// directive convention the extractor understands.
pub fn render_manifest(specs: &[ToolSpec]) -> String {
    if specs.is_empty() {
        return String::new();
    }

    let mut manifest = String::from("Available tools:\n");
    for spec in specs {
        manifest.push_str(&format!("- {}: {}\n", spec.name, spec.description));
    }
    manifest.push_str(
        "\nTo use a tool, respond with:\n\
         [TOOL: tool_name(argument)]\n\n\
         For example:\n\
         [TOOL: web_search(\"rust async channels\")]\n\
         [TOOL: read_file(\"notes.txt\")]\n",
    );
    manifest
}

/// External tool-execution collaborator.
///
/// Success carries the tool's textual result; failure carries a message that
/// becomes the invocation's terminal error payload.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, parameters: &[(String, String)]) -> Result<String>;
}

/// Executor used when no real tool backend is wired in. Every invocation
/// fails with an explanatory message rather than pretending to run.
pub struct UnavailableExecutor;

#[async_trait]
impl ToolExecutor for UnavailableExecutor {
    async fn execute(&self, name: &str, _parameters: &[(String, String)]) -> Result<String> {
        anyhow::bail!("no executor is configured for tool '{}'", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlisted_tools_require_confirmation() {
        let policy = RiskPolicy::from_specs(&[ToolSpec::safe("web_search", "search")]);
        assert!(!policy.requires_confirmation("web_search"));
        assert!(policy.requires_confirmation("delete_file"));
        assert!(policy.requires_confirmation("never_heard_of_it"));
    }

    #[test]
    fn manifest_lists_tools_and_directive_convention() {
        let manifest = render_manifest(&[
            ToolSpec::safe("web_search", "Search the web"),
            ToolSpec::unsafe_tool("delete_file", "Delete a file"),
        ]);
        assert!(manifest.contains("- web_search: Search the web"));
        assert!(manifest.contains("- delete_file: Delete a file"));
        assert!(manifest.contains("[TOOL: tool_name(argument)]"));
    }

    #[test]
    fn empty_manifest_renders_nothing() {
        assert!(render_manifest(&[]).is_empty());
    }

    #[tokio::test]
    async fn unavailable_executor_always_fails() {
        let executor = UnavailableExecutor;
        let result = executor.execute("web_search", &[]).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("web_search"));
    }
}
