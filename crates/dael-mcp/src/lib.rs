//! MCP frontend, tool registry/invoker, and configuration layer for DAEL.
//!
//! Depends on `dael-engine` for the `Engine` and `ToolInvoker` contract;
//! `dael-engine` has no knowledge of this crate.

pub mod client;
pub mod config;
pub mod invoker;
pub mod registry;
pub mod server;

pub use client::{BackendStatus, McpClientManager, SharedClientManager};
pub use config::{load_config, DaelConfig};
pub use invoker::McpToolInvoker;
pub use registry::{ServerMode, ToolRegistry};
pub use server::{serve_stdio, DaelMcpServer};
