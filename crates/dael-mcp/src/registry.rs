//! Tool Registry: the union of built-in tools, workflows exposed as tools,
//! and MCP backend tool schemas, resolved with fixed precedence.
//!
//! Precedence rule: built-ins beat workflows beat MCP backends, evaluated in
//! configuration order. `refresh()` rebuilds the whole snapshot atomically —
//! a backend that fails to list tools is skipped for this refresh rather
//! than failing the whole registry.

use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use dael_engine::WorkflowRegistry;
use dael_types::{DaelError, ToolDescriptor};
use serde_json::json;
use tracing::warn;

use crate::client::McpClientManager;

/// Whether the server is accepting only setup/discovery tools
/// (`configuration`) or the full workflow-serving surface (`running`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Configuration,
    Running,
}

/// Configuration mode exposes only the self-config surface a setup agent
/// needs; running mode swaps that out for `python_exec`, the one built-in
/// that participates in workflow execution. The two sets never overlap.
fn builtin_tools(mode: ServerMode) -> Vec<ToolDescriptor> {
    match mode {
        ServerMode::Configuration => vec![
            ToolDescriptor::builtin(
                "config_get",
                "Read a configuration key",
                json!({"type": "object", "properties": {"key": {"type": "string"}}, "required": ["key"]}),
            ),
            ToolDescriptor::builtin(
                "config_set",
                "Set a configuration key",
                json!({"type": "object", "properties": {"key": {"type": "string"}, "value": {}}, "required": ["key", "value"]}),
            ),
            ToolDescriptor::builtin("config_validate", "Validate the current configuration document", json!({"type": "object", "properties": {}})),
            ToolDescriptor::builtin("config_done", "Mark configuration complete and switch to running mode", json!({"type": "object", "properties": {}})),
            ToolDescriptor::builtin("config_location", "Report the configuration file path in use", json!({"type": "object", "properties": {}})),
        ],
        ServerMode::Running => vec![ToolDescriptor::builtin(
            "python_exec",
            "Run a short Python fragment against an allowlisted package profile",
            json!({
                "type": "object",
                "properties": {
                    "code": {"type": "string"},
                    "profile": {"type": "string", "enum": ["minimal", "standard", "data_science"]},
                },
                "required": ["code"],
            }),
        )],
    }
}

pub struct ToolRegistry {
    mode: ServerMode,
    workflows: Arc<WorkflowRegistry>,
    client_manager: Arc<McpClientManager>,
    backend_order: Vec<String>,
    snapshot: StdRwLock<Vec<ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn new(mode: ServerMode, workflows: Arc<WorkflowRegistry>, client_manager: Arc<McpClientManager>, backend_order: Vec<String>) -> Self {
        Self {
            mode,
            workflows,
            client_manager,
            backend_order,
            snapshot: StdRwLock::new(Vec::new()),
        }
    }

    /// Rebuilds the tool snapshot: built-ins, then every workflow as
    /// `workflow:<name>`, then each backend's tools in configured order.
    /// Earlier entries win name collisions.
    pub async fn refresh(&self) -> Result<(), DaelError> {
        let mut merged: Vec<ToolDescriptor> = builtin_tools(self.mode);

        if self.mode == ServerMode::Running {
            for name in self.workflows.list() {
                if let Some(spec) = self.workflows.get(&name) {
                    let schema = workflow_input_schema(&spec);
                    merged.push(ToolDescriptor::from_workflow(name, spec.description.clone().unwrap_or_default(), schema));
                }
            }

            for backend_id in &self.backend_order {
                match self.client_manager.list_tools(backend_id).await {
                    Ok(tools) => {
                        for tool in tools {
                            let schema = serde_json::to_value(&tool.input_schema).unwrap_or(json!({}));
                            merged.push(ToolDescriptor::from_mcp_backend(backend_id.clone(), tool.name.to_string(), tool.description.clone().unwrap_or_default().to_string(), schema));
                        }
                    }
                    Err(error) => warn!(backend = backend_id, %error, "skipping backend during tool refresh"),
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        let deduped: Vec<ToolDescriptor> = merged.into_iter().filter(|tool| seen.insert(tool.name.clone())).collect();
        *self.snapshot.write().expect("tool registry lock poisoned") = deduped;
        Ok(())
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.snapshot.read().expect("tool registry lock poisoned").clone()
    }

    pub fn find(&self, name: &str) -> Option<ToolDescriptor> {
        self.snapshot.read().expect("tool registry lock poisoned").iter().find(|t| t.name == name).cloned()
    }
}

fn workflow_input_schema(spec: &dael_types::WorkflowSpec) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for named in &spec.inputs {
        properties.insert(
            named.name.clone(),
            json!({"description": named.spec.description.clone().unwrap_or_default()}),
        );
        if named.spec.is_required() {
            required.push(named.name.clone());
        }
    }
    json!({"type": "object", "properties": properties, "required": required})
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn configuration_mode_exposes_only_config_builtins() {
        let workflows = Arc::new(WorkflowRegistry::new());
        let client_manager = Arc::new(McpClientManager::new(HashMap::new()));
        let registry = ToolRegistry::new(ServerMode::Configuration, workflows, client_manager, Vec::new());
        registry.refresh().await.unwrap();
        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert!(names.contains(&"config_get".to_string()));
        assert!(!names.contains(&"python_exec".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("workflow:")));
    }

    #[tokio::test]
    async fn running_mode_exposes_workflows_as_tools() {
        let mut workflows_map = HashMap::new();
        workflows_map.insert(
            "deploy".to_string(),
            dael_types::WorkflowSpec {
                name: "deploy".into(),
                version: "1.0.0".into(),
                description: Some("deploy the service".into()),
                packages: None,
                defaults: None,
                inputs: vec![],
                steps: vec![dael_types::StepSpec {
                    id: "a".into(),
                    depends_on: vec![],
                    body: dael_types::StepBody::Tool {
                        tool: dael_types::ToolCall {
                            name: "noop".into(),
                            params: serde_json::Map::new(),
                        },
                    },
                    timeout: None,
                    on_error: None,
                    retry: None,
                }],
                output: None,
                outputs: None,
            },
        );
        let workflows = Arc::new(WorkflowRegistry::from_specs(workflows_map).unwrap());
        let client_manager = Arc::new(McpClientManager::new(HashMap::new()));
        let registry = ToolRegistry::new(ServerMode::Running, workflows, client_manager, Vec::new());
        registry.refresh().await.unwrap();
        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert!(names.contains(&"workflow:deploy".to_string()));
        assert!(names.contains(&"python_exec".to_string()));
        assert!(!names.contains(&"config_get".to_string()));
    }
}
