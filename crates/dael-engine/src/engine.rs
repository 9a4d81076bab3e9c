//! The Engine: the main `execute()` algorithm tying the workflow registry,
//! template evaluator, sandbox, and tool invoker together.
//!
//! The per-step loop runs dependency-block/skip checks and summarizes step
//! statuses into an overall result. Steps always run in the order they were
//! declared: `depends_on` is validated at load time
//! ([`crate::workflow_registry`]) but never reorders execution.

use std::sync::Arc;
use std::time::Duration;

use dael_types::{DaelError, ErrorCode, ExecutionResult, InputType, OnError, OutputSpec, StepBody, StepOutput, WorkflowSpec};
use regex::Regex;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use crate::context::RunContext;
use crate::invoker::{invoke_with_retry, ToolInvoker};
use crate::sandbox::{Sandbox, SandboxLimits, ToolBridge};
use crate::template::{self, TemplateContext};
use crate::workflow_registry::WorkflowRegistry;

/// Final fallback in the timeout precedence chain (step > workflow defaults
/// > system config > this) when nothing else names a timeout.
const DEFAULT_STEP_TIMEOUT_SECS: f64 = 30.0;

/// Adapts an async [`ToolInvoker`] to the sandbox's synchronous
/// [`ToolBridge`] by blocking the current (blocking-pool) thread on it.
///
/// Every call reaching this bridge originates from inside a code step, which
/// makes it the enforcement point for recursion prevention: a code step
/// cannot invoke `python_exec`, since that would let it run more code.
struct BlockingToolBridge<'a> {
    invoker: &'a dyn ToolInvoker,
    handle: tokio::runtime::Handle,
}

impl ToolBridge for BlockingToolBridge<'_> {
    fn call(&mut self, name: &str, params: Value) -> Result<Value, DaelError> {
        if name == "python_exec" {
            return Err(DaelError::new(
                ErrorCode::ToolRejected,
                "a code step cannot invoke python_exec: code steps cannot invoke other code, directly or indirectly",
            ));
        }
        self.handle.block_on(self.invoker.call(name, params))
    }
}

pub struct Engine {
    registry: Arc<WorkflowRegistry>,
    invoker: Arc<dyn ToolInvoker>,
    concurrency: Arc<Semaphore>,
    config: Value,
}

impl Engine {
    pub fn new(registry: Arc<WorkflowRegistry>, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self::with_max_concurrent(registry, invoker, 10)
    }

    /// `max_concurrent` bounds how many [`Engine::execute`] calls may run at
    /// once; callers beyond the limit wait on the admission semaphore rather
    /// than being rejected, since execution is the unit of concurrency
    /// control, not an individual tool call.
    pub fn with_max_concurrent(registry: Arc<WorkflowRegistry>, invoker: Arc<dyn ToolInvoker>, max_concurrent: usize) -> Self {
        Self {
            registry,
            invoker,
            concurrency: Arc::new(Semaphore::new(max_concurrent.max(1))),
            config: Value::Object(Map::new()),
        }
    }

    /// Attaches the loaded system configuration document, visible to code
    /// steps as `context.config` and consulted for `execution.default_timeout`
    /// when a step names no timeout of its own.
    pub fn with_runtime_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    fn resolve_timeout(&self, step: &dael_types::StepSpec, spec: &WorkflowSpec) -> Duration {
        let secs = step
            .timeout
            .or_else(|| spec.defaults.as_ref().and_then(|d| d.timeout))
            .or_else(|| self.config.get("execution").and_then(|e| e.get("default_timeout")).and_then(Value::as_f64))
            .unwrap_or(DEFAULT_STEP_TIMEOUT_SECS);
        Duration::from_secs_f64(secs)
    }

    pub async fn execute(&self, workflow_name: &str, provided_inputs: Map<String, Value>) -> Result<ExecutionResult, DaelError> {
        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| DaelError::new(ErrorCode::InternalError, "execution admission semaphore was closed"))?;

        let spec = self
            .registry
            .get(workflow_name)
            .ok_or_else(|| DaelError::new(ErrorCode::WorkflowNotFound, format!("no workflow named '{workflow_name}'")))?;

        let resolved_inputs = resolve_inputs(&spec, provided_inputs)?;
        let mut run = RunContext::new(spec.name.clone(), resolved_inputs, 1000);

        // `Some(cause)` once a `fail`-policy step (or a step whose retry
        // budget was exhausted, which is treated the same as `fail`) aborts
        // the run; every remaining step is then recorded as skipped, citing
        // the same cause.
        let mut aborted: Option<DaelError> = None;
        for step in &spec.steps {
            if let Some(cause) = &aborted {
                run.record_step(StepOutput::skipped(step.id.clone(), Some(cause.clone())));
                continue;
            }

            if let Some(blocking_dep) = step.depends_on.iter().find(|dep| !run.execution.step(dep).map(|s| s.is_success()).unwrap_or(false)) {
                let reason = run.execution.step(blocking_dep).and_then(|s| s.error.clone());
                run.record_step(StepOutput::skipped(step.id.clone(), reason));
                continue;
            }

            let on_error = step.on_error.or(spec.defaults.as_ref().and_then(|d| d.on_error)).unwrap_or_default();
            let timeout = self.resolve_timeout(step, &spec);

            let started = std::time::Instant::now();
            let (outcome, attempts) = self.run_step(&spec, step, &run, timeout).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(output) => run.record_step(StepOutput::success(step.id.clone(), output, attempts, duration_ms)),
                Err(error) => {
                    if matches!(on_error, OnError::Continue) {
                        // `on_error=continue`: the step is skipped, not
                        // failed, and the run proceeds.
                        run.record_step(StepOutput::skipped(step.id.clone(), Some(error)));
                    } else {
                        // `OnError::Fail`, or `OnError::Retry` whose budget
                        // `run_step` already exhausted: record the failure
                        // and abort the run.
                        run.record_step(StepOutput::failed(step.id.clone(), error.clone(), attempts, duration_ms));
                        aborted = Some(error);
                    }
                }
            }
        }

        let inputs_value = run.inputs_value();
        let steps_value = run.steps_value();
        let tpl_ctx = TemplateContext {
            inputs: &inputs_value,
            steps: &steps_value,
        };
        let outputs = render_output(&spec, &tpl_ctx)?;
        let duration_ms = run.elapsed_ms();
        let completed_at = chrono::Utc::now();
        Ok(ExecutionResult::summarize(&run.execution, spec.version.clone(), run.started_at(), completed_at, outputs, duration_ms))
    }

    async fn run_step(&self, spec: &WorkflowSpec, step: &dael_types::StepSpec, run: &RunContext, timeout: Duration) -> (Result<Value, DaelError>, u32) {
        let inputs_value = run.inputs_value();
        let steps_value = run.steps_value();
        let tpl_ctx = TemplateContext {
            inputs: &inputs_value,
            steps: &steps_value,
        };

        match &step.body {
            StepBody::Tool { tool } => {
                let rendered_params = match template::render_tree(&Value::Object(tool.params.clone()), &tpl_ctx) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) => return (Err(DaelError::new(ErrorCode::TemplateError, "rendered tool params were not an object")), 1),
                    Err(error) => return (Err(error), 1),
                };
                let retry = step.retry.clone().or_else(|| spec.defaults.as_ref().and_then(|d| d.retry.clone())).unwrap_or_default();
                invoke_with_retry(self.invoker.as_ref(), &tool.name, Value::Object(rendered_params), &retry, Some(timeout)).await
            }
            StepBody::Code { code } => {
                // Code steps see a single `context` variable carrying
                // `inputs`, `steps`, `config`, `execution_id`, and `tools`
                // (the sandbox's `context.tools.call(name, params)` bridge
                // ignores this last placeholder syntactically and dispatches
                // straight to the tool bridge).
                let mut context_map = Map::new();
                context_map.insert("inputs".to_string(), inputs_value.clone());
                context_map.insert("steps".to_string(), steps_value.clone());
                context_map.insert("config".to_string(), self.config.clone());
                context_map.insert("execution_id".to_string(), Value::String(run.execution.execution_id.clone()));
                context_map.insert("tools".to_string(), Value::Null);
                let mut variables = Map::new();
                variables.insert("context".to_string(), Value::Object(context_map));

                let invoker = self.invoker.clone();
                let code = code.clone();
                let limits = SandboxLimits { timeout, ..SandboxLimits::default() };
                let result = tokio::task::spawn_blocking(move || {
                    let handle = tokio::runtime::Handle::current();
                    let mut bridge = BlockingToolBridge { invoker: invoker.as_ref(), handle };
                    let mut sandbox = Sandbox::new(variables, &mut bridge, limits);
                    sandbox.run(&code)
                })
                .await
                .unwrap_or_else(|e| Err(DaelError::new(ErrorCode::InternalError, format!("sandbox task panicked: {e}"))));
                (result, 1)
            }
        }
    }
}

/// Validates `provided` against `spec.inputs`, applying defaults and
/// rejecting unresolvable/invalid input before any step runs.
fn resolve_inputs(spec: &WorkflowSpec, mut provided: Map<String, Value>) -> Result<Map<String, Value>, DaelError> {
    for named in &spec.inputs {
        let value = provided.get(&named.name).cloned();
        match value {
            Some(value) => {
                validate_input_value(&named.name, &named.spec, &value)?;
            }
            None => {
                if named.spec.is_required() {
                    return Err(DaelError::new(ErrorCode::InputInvalid, format!("missing required input '{}'", named.name)));
                }
                if let Some(default) = named.spec.default.clone() {
                    provided.insert(named.name.clone(), default);
                }
            }
        }
    }
    Ok(provided)
}

fn validate_input_value(name: &str, spec: &dael_types::InputSpec, value: &Value) -> Result<(), DaelError> {
    let type_ok = match spec.r#type {
        InputType::String => value.is_string(),
        InputType::Integer => value.as_i64().is_some() || matches!(value, Value::Number(n) if n.is_i64() || n.is_u64()),
        InputType::Number => value.is_number(),
        InputType::Boolean => value.is_boolean(),
        InputType::Array => value.is_array(),
        InputType::Object => value.is_object(),
    };
    if !type_ok {
        return Err(DaelError::new(ErrorCode::InputInvalid, format!("input '{name}' does not match its declared type")));
    }
    if let Some(enum_values) = &spec.enum_values {
        if !enum_values.contains(value) {
            return Err(DaelError::new(ErrorCode::InputInvalid, format!("input '{name}' is not one of its allowed values")));
        }
    }
    if let Some(pattern) = &spec.pattern {
        if let Value::String(s) = value {
            let re = Regex::new(pattern).map_err(|e| DaelError::new(ErrorCode::ConfigInvalid, format!("input '{name}' has an invalid pattern: {e}")))?;
            if !re.is_match(s) {
                return Err(DaelError::new(ErrorCode::InputInvalid, format!("input '{name}' does not match pattern '{pattern}'")));
            }
        }
    }
    if let Some(minimum) = spec.minimum {
        if value.as_f64().map(|n| n < minimum).unwrap_or(false) {
            return Err(DaelError::new(ErrorCode::InputInvalid, format!("input '{name}' is below its minimum of {minimum}")));
        }
    }
    if let Some(maximum) = spec.maximum {
        if value.as_f64().map(|n| n > maximum).unwrap_or(false) {
            return Err(DaelError::new(ErrorCode::InputInvalid, format!("input '{name}' is above its maximum of {maximum}")));
        }
    }
    Ok(())
}

fn render_output(spec: &WorkflowSpec, tpl_ctx: &TemplateContext<'_>) -> Result<Value, DaelError> {
    match (&spec.output, &spec.outputs) {
        (Some(expr), None) => template::render_value(expr, tpl_ctx),
        (None, Some(outputs)) => {
            let mut map = Map::new();
            for output in outputs {
                match output {
                    OutputSpec::FromPath { name, from_path, .. } => {
                        let wrapped = format!("{{{{ {from_path} }}}}");
                        map.insert(name.clone(), template::render_value(&wrapped, tpl_ctx)?);
                    }
                    OutputSpec::Value { name, value, .. } => {
                        map.insert(name.clone(), template::render_value(value, tpl_ctx)?);
                    }
                }
            }
            Ok(Value::Object(map))
        }
        _ => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dael_types::{ExecutionStatus, InputSpec, NamedInput, StepSpec, StepStatus, ToolCall, WorkflowDefaults};

    struct StubInvoker;

    #[async_trait]
    impl ToolInvoker for StubInvoker {
        async fn call(&self, name: &str, params: Value) -> Result<Value, DaelError> {
            match name {
                "fail_once" => Err(DaelError::new(ErrorCode::ToolFailed, "boom")),
                _ => Ok(serde_json::json!({"name": name, "params": params})),
            }
        }
    }

    fn tool_step(id: &str, tool_name: &str, depends_on: Vec<&str>) -> StepSpec {
        StepSpec {
            id: id.to_string(),
            depends_on: depends_on.into_iter().map(str::to_string).collect(),
            body: StepBody::Tool {
                tool: ToolCall {
                    name: tool_name.to_string(),
                    params: Map::new(),
                },
            },
            timeout: None,
            on_error: None,
            retry: None,
        }
    }

    fn engine_with(spec: WorkflowSpec) -> Engine {
        let mut workflows = std::collections::HashMap::new();
        workflows.insert(spec.name.clone(), spec);
        let registry = Arc::new(WorkflowRegistry::from_specs(workflows).unwrap());
        Engine::new(registry, Arc::new(StubInvoker))
    }

    #[tokio::test]
    async fn executes_steps_in_declaration_order_and_renders_output() {
        let spec = WorkflowSpec {
            name: "demo".into(),
            version: "1.0.0".into(),
            description: None,
            packages: None,
            defaults: None,
            inputs: vec![],
            steps: vec![tool_step("a", "echo", vec![])],
            output: Some("{{ steps.a.output.name }}".into()),
            outputs: None,
        };
        let engine = engine_with(spec);
        let result = engine.execute("demo", Map::new()).await.unwrap();
        assert_eq!(result.outputs, Value::String("echo".into()));
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn on_error_continue_skips_the_failed_step_and_its_dependents() {
        let spec = WorkflowSpec {
            name: "demo".into(),
            version: "1.0.0".into(),
            description: None,
            packages: None,
            defaults: Some(WorkflowDefaults {
                on_error: Some(OnError::Continue),
                ..WorkflowDefaults::default()
            }),
            inputs: vec![],
            steps: vec![tool_step("a", "fail_once", vec![]), tool_step("b", "echo", vec!["a"])],
            output: None,
            outputs: None,
        };
        let engine = engine_with(spec);
        let result = engine.execute("demo", Map::new()).await.unwrap();
        assert_eq!(result.steps[0].status, StepStatus::Skipped);
        assert_eq!(result.steps[0].output, Value::Null);
        assert_eq!(result.steps[1].status, StepStatus::Skipped);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.steps_completed, 0);
        assert_eq!(result.steps_skipped, 2);
        assert_eq!(result.steps_failed, 0);
    }

    #[tokio::test]
    async fn fail_policy_aborts_remaining_steps() {
        let spec = WorkflowSpec {
            name: "demo".into(),
            version: "1.0.0".into(),
            description: None,
            packages: None,
            defaults: None,
            inputs: vec![],
            steps: vec![tool_step("a", "fail_once", vec![]), tool_step("b", "echo", vec![])],
            output: None,
            outputs: None,
        };
        let engine = engine_with(spec);
        let result = engine.execute("demo", Map::new()).await.unwrap();
        assert_eq!(result.steps[0].status, StepStatus::Failed);
        assert_eq!(result.steps[1].status, StepStatus::Skipped);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.steps_failed, 1);
        assert_eq!(result.steps_skipped, 1);
    }

    #[tokio::test]
    async fn missing_required_input_is_rejected_before_any_step_runs() {
        let spec = WorkflowSpec {
            name: "demo".into(),
            version: "1.0.0".into(),
            description: None,
            packages: None,
            defaults: None,
            inputs: vec![NamedInput {
                name: "url".into(),
                spec: InputSpec {
                    required: Some(true),
                    ..InputSpec::default()
                },
            }],
            steps: vec![tool_step("a", "echo", vec![])],
            output: None,
            outputs: None,
        };
        let engine = engine_with(spec);
        let error = engine.execute("demo", Map::new()).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::InputInvalid);
    }

    #[tokio::test]
    async fn unknown_workflow_is_reported() {
        let registry = Arc::new(WorkflowRegistry::new());
        let engine = Engine::new(registry, Arc::new(StubInvoker));
        let error = engine.execute("missing", Map::new()).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::WorkflowNotFound);
    }
}
