//! Canonical error shape and the static registry of known error codes.
//!
//! Every failure surfaced by the engine, the sandbox, or the tool invoker
//! is a [`DaelError`]: a stable `code`, a `category`, a human `message`,
//! optional `detail`, a `suggestion`, and a `retryable` flag. The shape is
//! fixed; only the registry contents vary by code.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse grouping used for filtering and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Tool,
    Execution,
    Validation,
    Workflow,
    System,
}

/// Every error code DAEL can emit. The `ErrorRegistry` maps each of these to
/// its category, default message template, suggestion, and retryability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Tool
    ToolUnavailable,
    ToolTimeout,
    ToolRejected,
    ToolFailed,
    // Execution
    CodeSyntax,
    CodeRuntime,
    CodeTimeout,
    CodeSecurity,
    TemplateError,
    // Validation
    InputInvalid,
    ParamInvalid,
    ConfigPathInvalid,
    // Workflow
    WorkflowNotFound,
    StepNotFound,
    CircularDependency,
    WorkflowTimeout,
    // System
    InternalError,
    McpConnectionFailed,
    ConfigInvalid,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ToolUnavailable => "TOOL_UNAVAILABLE",
            ErrorCode::ToolTimeout => "TOOL_TIMEOUT",
            ErrorCode::ToolRejected => "TOOL_REJECTED",
            ErrorCode::ToolFailed => "TOOL_FAILED",
            ErrorCode::CodeSyntax => "CODE_SYNTAX",
            ErrorCode::CodeRuntime => "CODE_RUNTIME",
            ErrorCode::CodeTimeout => "CODE_TIMEOUT",
            ErrorCode::CodeSecurity => "CODE_SECURITY",
            ErrorCode::TemplateError => "TEMPLATE_ERROR",
            ErrorCode::InputInvalid => "INPUT_INVALID",
            ErrorCode::ParamInvalid => "PARAM_INVALID",
            ErrorCode::ConfigPathInvalid => "CONFIG_PATH_INVALID",
            ErrorCode::WorkflowNotFound => "WORKFLOW_NOT_FOUND",
            ErrorCode::StepNotFound => "STEP_NOT_FOUND",
            ErrorCode::CircularDependency => "CIRCULAR_DEPENDENCY",
            ErrorCode::WorkflowTimeout => "WORKFLOW_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::McpConnectionFailed => "MCP_CONNECTION_FAILED",
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::ToolUnavailable | ErrorCode::ToolTimeout | ErrorCode::ToolRejected | ErrorCode::ToolFailed => ErrorCategory::Tool,

            ErrorCode::CodeSyntax | ErrorCode::CodeRuntime | ErrorCode::CodeTimeout | ErrorCode::CodeSecurity | ErrorCode::TemplateError => {
                ErrorCategory::Execution
            }

            ErrorCode::InputInvalid | ErrorCode::ParamInvalid | ErrorCode::ConfigPathInvalid => ErrorCategory::Validation,

            ErrorCode::WorkflowNotFound | ErrorCode::StepNotFound | ErrorCode::CircularDependency | ErrorCode::WorkflowTimeout => {
                ErrorCategory::Workflow
            }

            ErrorCode::InternalError | ErrorCode::McpConnectionFailed | ErrorCode::ConfigInvalid => ErrorCategory::System,
        }
    }

    /// Whether an error of this code is retryable by the Tool Invoker's
    /// retry policy by default. Validation, workflow, and sandbox errors are
    /// never retryable: retrying does not change their outcome. `ToolFailed`
    /// depends on what the backend reported and is set per call site via
    /// [`DaelError::with_retryable`].
    pub fn retryable(self) -> bool {
        matches!(self, ErrorCode::ToolTimeout | ErrorCode::McpConnectionFailed | ErrorCode::WorkflowTimeout)
    }

    pub fn suggestion(self) -> &'static str {
        match self {
            ErrorCode::ToolUnavailable => "check the tool name against `tools list`",
            ErrorCode::ToolTimeout => "increase the step timeout or the backend's responsiveness",
            ErrorCode::ToolRejected => "this tool cannot be called from this context",
            ErrorCode::ToolFailed => "inspect the backend's error detail",
            ErrorCode::CodeSyntax => "fix the syntax error in the step's code",
            ErrorCode::CodeRuntime => "inspect the exception raised while evaluating the step's code",
            ErrorCode::CodeTimeout => "increase the step timeout or simplify the step's code",
            ErrorCode::CodeSecurity => "remove the disallowed construct from the step's code",
            ErrorCode::TemplateError => "check the template expression's path and filter arguments",
            ErrorCode::InputInvalid => "check the input against its declared type, enum, pattern, or bounds",
            ErrorCode::ParamInvalid => "check the tool's parameter schema",
            ErrorCode::ConfigPathInvalid => "check that the configuration file exists and is readable",
            ErrorCode::WorkflowNotFound => "check the workflow name against `workflows list`",
            ErrorCode::StepNotFound => "check the step id named in `depends_on`",
            ErrorCode::CircularDependency => "break the dependency cycle between steps",
            ErrorCode::WorkflowTimeout => "increase the workflow's overall timeout",
            ErrorCode::InternalError => "this indicates a defect; please report it",
            ErrorCode::McpConnectionFailed => "verify the MCP backend is reachable and retry",
            ErrorCode::ConfigInvalid => "check the configuration file's syntax and referenced environment variables",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical error object. `Serialize`s to the wire shape from `spec.md` §7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaelError {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    pub suggestion: String,
    pub retryable: bool,
}

impl DaelError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            category: code.category(),
            message: message.into(),
            detail: None,
            suggestion: code.suggestion().to_string(),
            retryable: code.retryable(),
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Overrides the default retryability, for errors whose retry behavior
    /// depends on the backend rather than the code alone (e.g. a tool
    /// invocation failure the backend explicitly flagged as transient).
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl fmt::Display for DaelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for DaelError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_error_is_never_retryable() {
        let error = DaelError::new(ErrorCode::TemplateError, "unknown path 'inputs.missing'");
        assert!(!error.retryable);
        assert_eq!(error.category, ErrorCategory::Execution);
    }

    #[test]
    fn tool_timeout_is_retryable_by_default() {
        let error = DaelError::new(ErrorCode::ToolTimeout, "tool 'http.get' exceeded its deadline");
        assert!(error.retryable);
    }

    #[test]
    fn retryable_override_takes_precedence() {
        let error = DaelError::new(ErrorCode::ToolFailed, "backend reported failure").with_retryable(true);
        assert!(error.retryable);
    }

    #[test]
    fn serializes_to_canonical_shape() {
        let error = DaelError::new(ErrorCode::InputInvalid, "missing input 'url'");
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["code"], "INPUT_INVALID");
        assert_eq!(value["category"], "VALIDATION");
        assert!(value.get("detail").is_none());
    }
}
