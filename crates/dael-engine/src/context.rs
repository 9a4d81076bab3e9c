//! Per-execution runtime state, bridging [`dael_types::ExecutionContext`] to
//! the Template Evaluator and the monotonic timers the Engine needs.
//!
//! Pairs inputs/step state with the accessors the evaluator and executor
//! read.

use std::time::Instant;

use chrono::{DateTime, Utc};
use dael_types::{ExecutionContext, StepOutput};
use serde_json::{Map, Value};
use uuid::Uuid;

pub struct RunContext {
    pub execution: ExecutionContext,
    started_at: Instant,
    started_at_wall: DateTime<Utc>,
}

impl RunContext {
    pub fn new(workflow_name: impl Into<String>, inputs: Map<String, Value>, tool_call_budget: u32) -> Self {
        let execution_id = Uuid::new_v4().to_string();
        Self {
            execution: ExecutionContext::new(execution_id, workflow_name, inputs, tool_call_budget),
            started_at: Instant::now(),
            started_at_wall: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at_wall
    }

    /// The `inputs` namespace, materialized fresh (inputs never change once
    /// the execution starts, but template evaluation wants an owned `Value`
    /// it can borrow from for the duration of one render call).
    pub fn inputs_value(&self) -> Value {
        Value::Object(self.execution.inputs.clone())
    }

    /// The `steps` namespace as of right now: every step appended so far,
    /// keyed by id, each carrying its `status` and `output`.
    pub fn steps_value(&self) -> Value {
        self.execution.steps_namespace()
    }

    pub fn record_step(&mut self, output: StepOutput) {
        self.execution.record_step(output);
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
