//! Runtime execution state: context, per-step outputs, and final results.
//!
//! A tool-call-budgeted, retry-aware execution model: every step appended to
//! an [`ExecutionContext`] carries its own status and output, keyed by id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DaelError;

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

/// The recorded result of one step's execution, appended to the context as
/// steps complete. Never mutated once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DaelError>,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl StepOutput {
    pub fn success(step_id: impl Into<String>, output: Value, attempts: u32, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Completed,
            output,
            success: true,
            error: None,
            attempts,
            duration_ms,
        }
    }

    pub fn failed(step_id: impl Into<String>, error: DaelError, attempts: u32, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: Value::Null,
            success: false,
            error: Some(error),
            attempts,
            duration_ms,
        }
    }

    /// A step that did not run because `on_error=continue` let a prior
    /// failure (or a failed dependency) pass through. `reason` is the
    /// causing step's own error, carried along for diagnostics; it is not
    /// this step's own failure.
    pub fn skipped(step_id: impl Into<String>, reason: Option<DaelError>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            output: Value::Null,
            success: false,
            error: reason,
            attempts: 0,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, StepStatus::Completed)
    }
}

/// Append-only per-execution state: resolved inputs plus the growing list of
/// step outputs, addressable by the Template Evaluator as `inputs.*` and
/// `steps.<id>.output.*`.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_name: String,
    pub inputs: Map<String, Value>,
    steps: Vec<StepOutput>,
    steps_by_id: HashMap<String, usize>,
    tool_calls_made: u32,
    pub tool_call_budget: u32,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>, workflow_name: impl Into<String>, inputs: Map<String, Value>, tool_call_budget: u32) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_name: workflow_name.into(),
            inputs,
            steps: Vec::new(),
            steps_by_id: HashMap::new(),
            tool_calls_made: 0,
            tool_call_budget,
        }
    }

    /// Appends a step result. Panics if `step_id` was already recorded: the
    /// engine guarantees each step id is appended at most once per execution.
    pub fn record_step(&mut self, result: StepOutput) {
        let index = self.steps.len();
        let previous = self.steps_by_id.insert(result.step_id.clone(), index);
        assert!(previous.is_none(), "step '{}' recorded twice in one execution", result.step_id);
        self.steps.push(result);
    }

    pub fn step(&self, step_id: &str) -> Option<&StepOutput> {
        self.steps_by_id.get(step_id).map(|&index| &self.steps[index])
    }

    pub fn steps(&self) -> &[StepOutput] {
        &self.steps
    }

    /// Records one tool call against the budget, returning `false` if the
    /// call would exceed it (caller must not perform the call).
    pub fn try_consume_tool_call(&mut self) -> bool {
        if self.tool_calls_made >= self.tool_call_budget {
            return false;
        }
        self.tool_calls_made += 1;
        true
    }

    pub fn tool_calls_made(&self) -> u32 {
        self.tool_calls_made
    }

    /// Builds the `steps.*` namespace consumed by the Template Evaluator.
    pub fn steps_namespace(&self) -> Value {
        let mut map = Map::new();
        for step in &self.steps {
            map.insert(
                step.step_id.clone(),
                serde_json::json!({
                    "status": step.status,
                    "output": step.output,
                }),
            );
        }
        Value::Object(map)
    }
}

/// Overall outcome of running a workflow to completion. Any number of
/// `Skipped` steps still yields `Completed`; `Failed` only when a
/// `fail`-policy step (or a step whose retry budget was exhausted under
/// `fail`) aborted the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

/// The final, reportable result of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub workflow_name: String,
    pub workflow_version: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub outputs: Value,
    pub steps: Vec<StepOutput>,
    pub steps_completed: u32,
    pub steps_failed: u32,
    pub steps_skipped: u32,
}

impl ExecutionResult {
    #[allow(clippy::too_many_arguments)]
    pub fn summarize(
        context: &ExecutionContext,
        workflow_version: impl Into<String>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        outputs: Value,
        duration_ms: u64,
    ) -> Self {
        let mut steps_completed = 0u32;
        let mut steps_failed = 0u32;
        let mut steps_skipped = 0u32;
        for step in context.steps() {
            match step.status {
                StepStatus::Completed => steps_completed += 1,
                StepStatus::Failed => steps_failed += 1,
                StepStatus::Skipped => steps_skipped += 1,
            }
        }
        let status = if steps_failed > 0 { ExecutionStatus::Failed } else { ExecutionStatus::Completed };
        Self {
            execution_id: context.execution_id.clone(),
            workflow_name: context.workflow_name.clone(),
            workflow_version: workflow_version.into(),
            status,
            started_at,
            completed_at,
            duration_ms,
            inputs: context.inputs.clone(),
            outputs,
            steps: context.steps().to_vec(),
            steps_completed,
            steps_failed,
            steps_skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCode;

    #[test]
    fn records_and_looks_up_steps_by_id() {
        let mut context = ExecutionContext::new("exec-1", "demo", Map::new(), 10);
        context.record_step(StepOutput::success("fetch", serde_json::json!({"a": 1}), 1, 5));
        let fetched = context.step("fetch").expect("step recorded");
        assert!(fetched.is_success());
        assert!(context.step("missing").is_none());
    }

    #[test]
    #[should_panic(expected = "recorded twice")]
    fn panics_on_duplicate_step_id() {
        let mut context = ExecutionContext::new("exec-1", "demo", Map::new(), 10);
        context.record_step(StepOutput::success("fetch", Value::Null, 1, 1));
        context.record_step(StepOutput::success("fetch", Value::Null, 1, 1));
    }

    #[test]
    fn tool_call_budget_is_enforced() {
        let mut context = ExecutionContext::new("exec-1", "demo", Map::new(), 2);
        assert!(context.try_consume_tool_call());
        assert!(context.try_consume_tool_call());
        assert!(!context.try_consume_tool_call());
        assert_eq!(context.tool_calls_made(), 2);
    }

    #[test]
    fn summarize_is_completed_despite_a_skipped_step() {
        let mut context = ExecutionContext::new("exec-1", "demo", Map::new(), 10);
        context.record_step(StepOutput::success("a", Value::Null, 1, 1));
        context.record_step(StepOutput::skipped("b", None));
        let now = Utc::now();
        let result = ExecutionResult::summarize(&context, "1.0.0", now, now, Value::Null, 2);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.steps_completed, 1);
        assert_eq!(result.steps_skipped, 1);
        assert_eq!(result.steps_failed, 0);
    }

    #[test]
    fn summarize_is_failed_when_a_step_failed() {
        let mut context = ExecutionContext::new("exec-1", "demo", Map::new(), 10);
        context.record_step(StepOutput::success("a", Value::Null, 1, 1));
        context.record_step(StepOutput::failed("b", DaelError::new(ErrorCode::ToolFailed, "boom"), 1, 1));
        let now = Utc::now();
        let result = ExecutionResult::summarize(&context, "1.0.0", now, now, Value::Null, 2);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.steps_completed, 1);
        assert_eq!(result.steps_failed, 1);
    }

    #[test]
    fn steps_namespace_exposes_status_and_output() {
        let mut context = ExecutionContext::new("exec-1", "demo", Map::new(), 10);
        context.record_step(StepOutput::success("fetch", serde_json::json!({"id": 7}), 1, 1));
        let namespace = context.steps_namespace();
        assert_eq!(namespace["fetch"]["output"]["id"], 7);
        assert_eq!(namespace["fetch"]["status"], "completed");
    }
}
