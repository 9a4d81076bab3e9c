//! Workflow execution engine: template evaluation, the code-step sandbox,
//! workflow load-time validation, and the step-execution loop.
//!
//! `dael-mcp` depends on this crate (for the [`ToolInvoker`] trait and the
//! [`Engine`] it drives); this crate has no knowledge of MCP itself.

pub mod context;
pub mod engine;
pub mod invoker;
pub mod sandbox;
pub mod template;
pub mod workflow_registry;

pub use context::RunContext;
pub use engine::Engine;
pub use invoker::{invoke_with_retry, ToolInvoker};
pub use sandbox::{Sandbox, SandboxLimits, ToolBridge};
pub use template::{render_string, render_tree, render_value, TemplateContext};
pub use workflow_registry::{parse_workflow_document, WorkflowRegistry};
