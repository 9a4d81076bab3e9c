//! MCP frontend: exposes the Tool Registry's snapshot over `tools/list` and
//! `tools/call`.
//!
//! The tool surface here is a runtime snapshot from [`ToolRegistry`] rather
//! than a fixed set of `#[tool]`-annotated methods, since this system's tool
//! set is config- and workflow-dependent — `ServerHandler::list_tools`/
//! `call_tool` are implemented directly instead of through `#[tool_router]`.

use std::future::Future;
use std::sync::Arc;

use dael_engine::ToolInvoker;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ErrorData as McpError, Implementation, ListToolsResult, PaginatedRequestParams,
    ProtocolVersion, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::RequestContext;
use rmcp::{RoleServer, ServerHandler};

use crate::registry::ToolRegistry;

#[derive(Clone)]
pub struct DaelMcpServer {
    registry: Arc<ToolRegistry>,
    invoker: Arc<dyn ToolInvoker>,
}

impl DaelMcpServer {
    pub fn new(registry: Arc<ToolRegistry>, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { registry, invoker }
    }
}

impl ServerHandler for DaelMcpServer {
    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .registry
            .list()
            .into_iter()
            .map(|descriptor| {
                let schema = descriptor.input_schema.as_object().cloned().unwrap_or_default();
                Tool::new(descriptor.name, descriptor.description, Arc::new(schema))
            })
            .collect();
        std::future::ready(Ok(ListToolsResult {
            tools,
            next_cursor: None,
            meta: None,
        }))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let invoker = Arc::clone(&self.invoker);
        let name = request.name.to_string();
        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Null);
        async move {
            match invoker.call(&name, params).await {
                Ok(value) => Ok(CallToolResult::structured(value)),
                Err(error) => Ok(CallToolResult {
                    content: vec![Content::text(error.to_string())],
                    structured_content: Some(serde_json::to_value(&error).unwrap_or(serde_json::Value::Null)),
                    is_error: Some(true),
                    meta: None,
                }),
            }
        }
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            protocol_version: ProtocolVersion::LATEST,
            server_info: Implementation {
                name: "dael".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("DAEL".to_string()),
                ..Default::default()
            },
            instructions: Some(
                "Call tools/list to discover the current tool surface, then tools/call to run one. \
                 Tool availability depends on the server's mode: configuration mode exposes only \
                 setup tools, running mode exposes workflows and MCP-backed tools."
                    .to_string(),
            ),
        }
    }
}
