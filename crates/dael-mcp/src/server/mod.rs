//! MCP frontend: `tools/list`/`tools/call` over stdio.

mod core;

use std::sync::Arc;

use anyhow::{Context, Result};
use dael_engine::ToolInvoker;
use rmcp::ServiceExt;

pub use core::DaelMcpServer;

use crate::registry::ToolRegistry;

/// Serves `registry`/`invoker` over stdio until the client disconnects.
///
/// stdio fits the CLI-launched agent integration this system targets better
/// than a network-hosted transport would.
pub async fn serve_stdio(registry: Arc<ToolRegistry>, invoker: Arc<dyn ToolInvoker>) -> Result<()> {
    let server = DaelMcpServer::new(registry, invoker);
    let running = server.serve(rmcp::transport::stdio()).await.context("failed to start MCP stdio server")?;
    running.waiting().await.context("MCP stdio server exited with an error")?;
    Ok(())
}
