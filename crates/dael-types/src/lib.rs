//! Shared data model for the Deterministic Agent Execution Layer.
//!
//! This crate has no runtime behavior of its own: it defines the workflow
//! document shape, execution state, tool descriptors, and the canonical
//! error object that `dael-engine` and `dael-mcp` build on.

pub mod errors;
pub mod execution;
pub mod tool;
pub mod workflow;

pub use errors::{DaelError, ErrorCategory, ErrorCode};
pub use execution::{ExecutionContext, ExecutionResult, ExecutionStatus, StepOutput, StepStatus};
pub use tool::{ToolDescriptor, ToolSource};
pub use workflow::{
    InputSpec, InputType, NamedInput, OnError, OutputClause, OutputSpec, PackageProfile, PackagesSpec, RetrySpec,
    StepBody, StepSpec, ToolCall, WorkflowBundle, WorkflowDefaults, WorkflowSpec,
};
