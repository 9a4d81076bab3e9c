//! Workflow definitions: the immutable shape parsed from workflow YAML.
//!
//! A step is either a tool invocation or a sandboxed code fragment, never
//! both, never neither.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{DaelError, ErrorCode};

/// Identifier pattern shared by workflow names and step ids.
const NAME_PATTERN: &str = r"^[A-Za-z][A-Za-z0-9-]*$";

/// A collection of named workflows parsed from a single document.
///
/// A workflow file may declare one workflow at its top level, or a
/// `workflows:` map of several.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowBundle {
    pub workflows: std::collections::HashMap<String, WorkflowSpec>,
}

/// Package import profile for code steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageProfile {
    Minimal,
    Standard,
    DataScience,
}

impl PackageProfile {
    /// The allowlisted import names granted by this profile, per `spec.md` §6.
    pub fn allowed_imports(self) -> &'static [&'static str] {
        match self {
            PackageProfile::Minimal => &["json", "re", "datetime", "math"],
            PackageProfile::Standard => &[
                "json",
                "re",
                "datetime",
                "math",
                "random",
                "typing",
                "collections",
                "itertools",
                "functools",
                "hashlib",
                "uuid",
                "base64",
                "urllib.parse",
            ],
            PackageProfile::DataScience => &[
                "json",
                "re",
                "datetime",
                "math",
                "random",
                "typing",
                "collections",
                "itertools",
                "functools",
                "hashlib",
                "uuid",
                "base64",
                "urllib.parse",
                "numpy",
                "pandas",
            ],
        }
    }
}

/// Declarative package/import configuration for a workflow's code steps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PackagesSpec {
    #[serde(default)]
    pub profile: Option<PackageProfile>,
    #[serde(default)]
    pub additional: Vec<String>,
}

impl PackagesSpec {
    pub fn effective_allowlist(&self) -> HashSet<String> {
        let mut set: HashSet<String> = self
            .profile
            .unwrap_or(PackageProfile::Minimal)
            .allowed_imports()
            .iter()
            .map(|s| s.to_string())
            .collect();
        set.extend(self.additional.iter().cloned());
        set
    }
}

/// On-error policy for a step, overridable per-step or via workflow defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Fail,
    Continue,
    Retry,
}

/// Retry policy: attempts and backoff schedule.
///
/// Effective delay for attempt `k` (1-indexed) is
/// `min(max_delay, initial_delay * backoff_multiplier^(k-1))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    30.0
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetrySpec {
    /// Delay in seconds before attempt `attempt` (1-indexed, attempt 1 has no prior delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> f64 {
        if attempt <= 1 {
            return 0.0;
        }
        let exponent = (attempt - 1) as i32 - 1;
        let scaled = self.initial_delay * self.backoff_multiplier.powi(exponent.max(0));
        let scaled = if attempt == 2 { self.initial_delay } else { scaled };
        scaled.min(self.max_delay)
    }

    pub fn validate(&self) -> Result<(), DaelError> {
        if self.max_attempts < 1 {
            return Err(DaelError::new(ErrorCode::InputInvalid, "retry.max_attempts must be >= 1"));
        }
        if self.initial_delay < 0.0 {
            return Err(DaelError::new(ErrorCode::InputInvalid, "retry.initial_delay must be >= 0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(DaelError::new(ErrorCode::InputInvalid, "retry.max_delay must be >= initial_delay"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(DaelError::new(ErrorCode::InputInvalid, "retry.backoff_multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

/// Workflow-level defaults, inherited by every step unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowDefaults {
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub on_error: Option<OnError>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

/// Supported input scalar/collection types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

/// Full input parameter specification.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InputSpec {
    #[serde(default)]
    pub r#type: InputType,
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default, rename = "enum")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl InputSpec {
    /// An input is required unless a default is present or `required: false` is explicit.
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(self.default.is_none())
    }

    pub fn validate(&self, name: &str) -> Result<(), DaelError> {
        if let (Some(enum_values), Some(default)) = (&self.enum_values, &self.default) {
            if !enum_values.iter().any(|v| v == default) {
                return Err(DaelError::new(
                    ErrorCode::InputInvalid,
                    format!("input '{name}' default value is not a member of its enum"),
                ));
            }
        }
        if self.pattern.is_some() && !matches!(self.r#type, InputType::String) {
            return Err(DaelError::new(
                ErrorCode::InputInvalid,
                format!("input '{name}' specifies 'pattern' but is not type 'string'"),
            ));
        }
        if (self.minimum.is_some() || self.maximum.is_some())
            && !matches!(self.r#type, InputType::Integer | InputType::Number)
        {
            return Err(DaelError::new(
                ErrorCode::InputInvalid,
                format!("input '{name}' specifies bounds but is not a numeric type"),
            ));
        }
        Ok(())
    }
}

/// A single tool invocation target: `name` plus a templated parameter map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Step body: exactly one of a tool call or a code fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepBody {
    Tool { tool: ToolCall },
    Code { code: String },
}

/// One workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub body: StepBody,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub on_error: Option<OnError>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

/// Named output with either a dotted context path or a template expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputSpec {
    FromPath {
        name: String,
        from_path: String,
        #[serde(default)]
        description: Option<String>,
    },
    Value {
        name: String,
        value: String,
        #[serde(default)]
        description: Option<String>,
    },
}

/// The workflow's output clause: either a single expression or named outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputClause {
    Single(String),
    Named(Vec<OutputSpec>),
}

/// Complete workflow definition, as parsed from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub packages: Option<PackagesSpec>,
    #[serde(default)]
    pub defaults: Option<WorkflowDefaults>,
    #[serde(default)]
    pub inputs: Vec<NamedInput>,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub outputs: Option<Vec<OutputSpec>>,
}

/// An input spec paired with its name, as it appears in the `inputs` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedInput {
    pub name: String,
    #[serde(flatten)]
    pub spec: InputSpec,
}

impl WorkflowSpec {
    /// Validates structural invariants from `spec.md` §3/§4.5.
    ///
    /// Does not validate template expressions or tool existence — those are
    /// checked at execution time against a live context and tool registry.
    pub fn validate(&self) -> Result<(), DaelError> {
        let name_re = Regex::new(NAME_PATTERN).expect("static pattern compiles");
        if !name_re.is_match(&self.name) {
            return Err(DaelError::new(
                ErrorCode::ConfigInvalid,
                format!("workflow name '{}' does not match {}", self.name, NAME_PATTERN),
            ));
        }
        if self.steps.is_empty() {
            return Err(DaelError::new(ErrorCode::ConfigInvalid, "workflow must declare at least one step"));
        }

        let mut seen_ids = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if !seen_ids.insert(step.id.clone()) {
                return Err(DaelError::new(
                    ErrorCode::ConfigInvalid,
                    format!("duplicate step id '{}'", step.id),
                ));
            }
            for dependency in &step.depends_on {
                let exists = self.steps.iter().any(|s| &s.id == dependency);
                if !exists {
                    return Err(DaelError::new(
                        ErrorCode::StepNotFound,
                        format!("step '{}' depends_on '{}' which does not exist", step.id, dependency),
                    ));
                }
                let earlier = self.steps[..index].iter().any(|s| &s.id == dependency);
                if !earlier {
                    return Err(DaelError::new(
                        ErrorCode::CircularDependency,
                        format!("step '{}' depends_on '{}' which is not an earlier step", step.id, dependency),
                    ));
                }
            }
            if let StepBody::Tool { tool: _ } = &step.body {
                // nothing further to validate structurally; tool existence is a runtime concern.
            }
            if let Some(retry) = &step.retry {
                retry.validate()?;
            }
        }

        if self.output.is_some() && self.outputs.is_some() {
            return Err(DaelError::new(
                ErrorCode::ConfigInvalid,
                "workflow may declare 'output' or 'outputs', not both",
            ));
        }

        for named_input in &self.inputs {
            named_input.spec.validate(&named_input.name)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_step(id: &str, depends_on: Vec<&str>) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            depends_on: depends_on.into_iter().map(str::to_string).collect(),
            body: StepBody::Tool {
                tool: ToolCall {
                    name: "noop".to_string(),
                    params: Map::new(),
                },
            },
            timeout: None,
            on_error: None,
            retry: None,
        }
    }

    #[test]
    fn rejects_empty_steps() {
        let spec = WorkflowSpec {
            name: "demo".into(),
            version: "1.0.0".into(),
            description: None,
            packages: None,
            defaults: None,
            inputs: vec![],
            steps: vec![],
            output: None,
            outputs: None,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_forward_dependency() {
        let spec = WorkflowSpec {
            name: "demo".into(),
            version: "1.0.0".into(),
            description: None,
            packages: None,
            defaults: None,
            inputs: vec![],
            steps: vec![tool_step("a", vec!["b"]), tool_step("b", vec![])],
            output: None,
            outputs: None,
        };
        let error = spec.validate().expect_err("forward dependency should fail");
        assert!(error.message.contains("not an earlier step"));
        assert_eq!(error.code, ErrorCode::CircularDependency);
    }

    #[test]
    fn rejects_dependency_on_nonexistent_step() {
        let spec = WorkflowSpec {
            name: "demo".into(),
            version: "1.0.0".into(),
            description: None,
            packages: None,
            defaults: None,
            inputs: vec![],
            steps: vec![tool_step("a", vec!["ghost"])],
            output: None,
            outputs: None,
        };
        let error = spec.validate().expect_err("missing dependency should fail");
        assert_eq!(error.code, ErrorCode::StepNotFound);
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let spec = WorkflowSpec {
            name: "demo".into(),
            version: "1.0.0".into(),
            description: None,
            packages: None,
            defaults: None,
            inputs: vec![],
            steps: vec![tool_step("a", vec![]), tool_step("a", vec![])],
            output: None,
            outputs: None,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_both_output_and_outputs() {
        let spec = WorkflowSpec {
            name: "demo".into(),
            version: "1.0.0".into(),
            description: None,
            packages: None,
            defaults: None,
            inputs: vec![],
            steps: vec![tool_step("a", vec![])],
            output: Some("${{ steps.a.output }}".into()),
            outputs: Some(vec![]),
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn package_profile_allowlists_are_additive() {
        let packages = PackagesSpec {
            profile: Some(PackageProfile::Standard),
            additional: vec!["numpy".into()],
        };
        let allowlist = packages.effective_allowlist();
        assert!(allowlist.contains("json"));
        assert!(allowlist.contains("random"));
        assert!(allowlist.contains("numpy"));
        assert!(!allowlist.contains("pandas"));
    }

    #[test]
    fn retry_delay_matches_backoff_formula() {
        let retry = RetrySpec {
            max_attempts: 3,
            initial_delay: 0.01,
            max_delay: 0.1,
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.delay_for_attempt(1), 0.0);
        assert!((retry.delay_for_attempt(2) - 0.01).abs() < 1e-9);
        assert!((retry.delay_for_attempt(3) - 0.02).abs() < 1e-9);
    }
}
