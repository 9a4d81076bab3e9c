//! Tool descriptors: the schema shape shared by MCP backends, built-ins, and
//! workflows exposed as tools.
//!
//! The registry produces the same `{name, description, input_schema}` shape
//! regardless of backend, so `tools/list` can serve a uniform union.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a tool's implementation actually lives, for precedence resolution
/// (built-ins > workflows > MCP backends, in configuration order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ToolSource {
    Builtin,
    Workflow { workflow_name: String },
    McpBackend { backend_id: String },
}

/// A tool's schema, independent of where it is implemented.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub source: ToolSource,
}

impl ToolDescriptor {
    pub fn builtin(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            source: ToolSource::Builtin,
        }
    }

    pub fn from_workflow(workflow_name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        let workflow_name = workflow_name.into();
        Self {
            name: format!("workflow:{workflow_name}"),
            description: description.into(),
            input_schema,
            source: ToolSource::Workflow { workflow_name },
        }
    }

    pub fn from_mcp_backend(backend_id: impl Into<String>, name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            source: ToolSource::McpBackend {
                backend_id: backend_id.into(),
            },
        }
    }

    /// Precedence rank for registry resolution: lower sorts first and wins
    /// when two sources declare the same tool name.
    pub fn precedence_rank(&self) -> u8 {
        match self.source {
            ToolSource::Builtin => 0,
            ToolSource::Workflow { .. } => 1,
            ToolSource::McpBackend { .. } => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_outrank_workflows_and_backends() {
        let builtin = ToolDescriptor::builtin("config_get", "read a config key", Value::Null);
        let workflow = ToolDescriptor::from_workflow("deploy", "run the deploy workflow", Value::Null);
        let backend = ToolDescriptor::from_mcp_backend("github", "search_issues", "search issues", Value::Null);
        assert!(builtin.precedence_rank() < workflow.precedence_rank());
        assert!(workflow.precedence_rank() < backend.precedence_rank());
    }

    #[test]
    fn workflow_tool_name_is_prefixed() {
        let tool = ToolDescriptor::from_workflow("deploy", "run the deploy workflow", Value::Null);
        assert_eq!(tool.name, "workflow:deploy");
    }
}
