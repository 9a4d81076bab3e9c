//! Lifecycle management for MCP backend connections.
//!
//! A transport-agnostic (stdio or streamable HTTP) backend map; each entry
//! wraps a real `rmcp` client service, started lazily and kept running for
//! `start`/`stop`/`restart_backend`/`backend_status`/`list_backends`.

use std::collections::HashMap;
use std::sync::Arc;

use dael_types::{DaelError, ErrorCode};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::model::{CallToolRequestParam, Tool};
use rmcp::service::{RunningService, ServiceExt};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::RoleClient;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::{McpBackend, Transport};

#[derive(Debug, Error)]
pub enum ClientManagerError {
    #[error("backend '{0}' is not known")]
    UnknownBackend(String),
    #[error("backend '{0}' failed to start: {1}")]
    StartFailed(String, String),
    #[error("backend '{0}' call failed: {1}")]
    CallFailed(String, String),
}

impl From<ClientManagerError> for DaelError {
    fn from(error: ClientManagerError) -> Self {
        match &error {
            ClientManagerError::UnknownBackend(_) => DaelError::new(ErrorCode::ToolUnavailable, error.to_string()),
            ClientManagerError::StartFailed(..) => DaelError::new(ErrorCode::McpConnectionFailed, error.to_string()),
            ClientManagerError::CallFailed(..) => DaelError::new(ErrorCode::ToolFailed, error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Stopped,
    Running,
    Failed,
}

struct BackendEntry {
    config: McpBackend,
    service: Option<RunningService<RoleClient, ()>>,
    status: BackendStatus,
}

/// Owns every configured backend's connection lifecycle. Backends are
/// started lazily on first use and kept running for the life of the
/// process; `stop`/`restart_backend` are exposed for `tools refresh`.
pub struct McpClientManager {
    backends: RwLock<HashMap<String, BackendEntry>>,
}

impl McpClientManager {
    pub fn new(configs: HashMap<String, McpBackend>) -> Self {
        let backends = configs
            .into_iter()
            .map(|(id, config)| {
                (
                    id,
                    BackendEntry {
                        config,
                        service: None,
                        status: BackendStatus::Stopped,
                    },
                )
            })
            .collect();
        Self {
            backends: RwLock::new(backends),
        }
    }

    pub async fn list_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn backend_status(&self, id: &str) -> Option<BackendStatus> {
        self.backends.read().await.get(id).map(|e| e.status)
    }

    /// Starts `id`'s connection if it is not already running.
    pub async fn start_backend(&self, id: &str) -> Result<(), DaelError> {
        let mut backends = self.backends.write().await;
        let entry = backends.get_mut(id).ok_or_else(|| ClientManagerError::UnknownBackend(id.to_string()))?;
        if entry.service.is_some() {
            return Ok(());
        }
        match connect(&entry.config).await {
            Ok(service) => {
                entry.service = Some(service);
                entry.status = BackendStatus::Running;
                debug!(backend = id, "started MCP backend");
                Ok(())
            }
            Err(e) => {
                entry.status = BackendStatus::Failed;
                warn!(backend = id, error = %e, "failed to start MCP backend");
                Err(ClientManagerError::StartFailed(id.to_string(), e).into())
            }
        }
    }

    pub async fn stop_backend(&self, id: &str) -> Result<(), DaelError> {
        let mut backends = self.backends.write().await;
        let entry = backends.get_mut(id).ok_or_else(|| ClientManagerError::UnknownBackend(id.to_string()))?;
        entry.service = None;
        entry.status = BackendStatus::Stopped;
        Ok(())
    }

    pub async fn restart_backend(&self, id: &str) -> Result<(), DaelError> {
        self.stop_backend(id).await?;
        self.start_backend(id).await
    }

    /// Lists the tool schemas `id` currently advertises, starting it first
    /// if needed.
    pub async fn list_tools(&self, id: &str) -> Result<Vec<Tool>, DaelError> {
        self.start_backend(id).await?;
        let backends = self.backends.read().await;
        let entry = backends.get(id).ok_or_else(|| ClientManagerError::UnknownBackend(id.to_string()))?;
        let service = entry.service.as_ref().ok_or_else(|| ClientManagerError::StartFailed(id.to_string(), "not running".to_string()))?;
        let result = service
            .list_tools(Default::default())
            .await
            .map_err(|e| ClientManagerError::CallFailed(id.to_string(), e.to_string()))?;
        Ok(result.tools)
    }

    /// Invokes `tool_name` on backend `id` with `params`, starting it first
    /// if needed.
    pub async fn call_tool(&self, id: &str, tool_name: &str, params: Value) -> Result<Value, DaelError> {
        self.start_backend(id).await?;
        let backends = self.backends.read().await;
        let entry = backends.get(id).ok_or_else(|| ClientManagerError::UnknownBackend(id.to_string()))?;
        let service = entry.service.as_ref().ok_or_else(|| ClientManagerError::StartFailed(id.to_string(), "not running".to_string()))?;

        let arguments = match params {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => return Err(DaelError::new(ErrorCode::ParamInvalid, format!("tool parameters must be a JSON object, found {other}"))),
        };

        let result = service
            .call_tool(CallToolRequestParam {
                meta: None,
                name: tool_name.to_string().into(),
                arguments,
                task: None,
            })
            .await
            .map_err(|e| ClientManagerError::CallFailed(id.to_string(), e.to_string()))?;

        serde_json::to_value(&result).map_err(|e| DaelError::new(ErrorCode::ToolFailed, format!("could not serialize tool result: {e}")))
    }
}

async fn connect(config: &McpBackend) -> Result<RunningService<RoleClient, ()>, String> {
    match &config.transport {
        Transport::Stdio { command, args, env } => {
            let mut cmd = Command::new(command);
            cmd.args(args);
            for (key, value) in env {
                cmd.env(key, value);
            }
            let transport = TokioChildProcess::new(cmd).map_err(|e| e.to_string())?;
            ().serve(transport).await.map_err(|e| e.to_string())
        }
        Transport::Http { url, headers } => {
            let http_client = build_http_client(headers).map_err(|e| e.to_string())?;
            let config = StreamableHttpClientTransportConfig::with_uri(url.as_str());
            let transport = StreamableHttpClientTransport::with_client(http_client, config);
            ().serve(transport).await.map_err(|e| e.to_string())
        }
    }
}

/// Builds the reqwest client a Streamable HTTP backend connection rides on,
/// injecting configured headers ahead of the MCP handshake.
fn build_http_client(headers: &HashMap<String, String>) -> Result<reqwest::Client, reqwest::Error> {
    let mut header_map = HeaderMap::new();
    for (key, value) in headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(key.as_str()), HeaderValue::try_from(value.as_str())) {
            header_map.insert(name, value);
        }
    }
    reqwest::Client::builder().default_headers(header_map).build()
}

/// Shared handle to a client manager, cheap to clone across the registry
/// and invoker.
pub type SharedClientManager = Arc<McpClientManager>;
