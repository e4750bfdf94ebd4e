//! Step execution.
//!
//! [`StepRunner`] executes a single step attempt: agent and tool steps
//! go through a [`CapabilityInvoker`], condition steps evaluate their
//! rule set against the execution context, and loop steps iterate their
//! body over a context collection. The scheduler owns dispatch, retry,
//! timeout, and cancellation; the runner owns one attempt.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use weave_types::instance::{StepErrorKind, StepFailure};
use weave_types::workflow::{RuleEffect, StepDefinition, StepKind};

use crate::expr::ConditionEvaluator;
use crate::path::{self, MappingError};

/// Default iteration cap for loop steps without `max_iterations`.
const DEFAULT_MAX_ITERATIONS: u64 = 100;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure reported by a capability backend.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct InvokeError {
    pub message: String,
    /// Whether the engine may schedule another attempt.
    pub retryable: bool,
}

impl InvokeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// A failed step attempt, classified for retry and audit.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl StepError {
    pub fn timeout(step_id: &str, limit: Duration) -> Self {
        Self {
            kind: StepErrorKind::Timeout,
            message: format!("step '{step_id}' timed out after {limit:?}"),
            retryable: true,
        }
    }

    pub fn cancelled(step_id: &str) -> Self {
        Self {
            kind: StepErrorKind::Cancelled,
            message: format!("step '{step_id}' was cancelled"),
            retryable: false,
        }
    }

    pub fn unavailable(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: StepErrorKind::CapabilityUnavailable,
            message: message.into(),
            retryable,
        }
    }

    pub fn mapping(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::InvalidMapping,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn condition(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::ConditionViolation,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn to_failure(&self) -> StepFailure {
        StepFailure {
            kind: self.kind,
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}

impl From<MappingError> for StepError {
    fn from(err: MappingError) -> Self {
        StepError::mapping(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Capability seam
// ---------------------------------------------------------------------------

/// Backend that executes agent or tool capabilities.
///
/// The engine is agnostic to what a capability actually is; it hands
/// over the reference from the definition, the step's static config,
/// and the mapped input document, and gets a JSON output back.
pub trait CapabilityInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        capability_ref: &'a str,
        config: &'a Value,
        input: Value,
    ) -> BoxFuture<'a, Result<Value, InvokeError>>;
}

/// Placeholder invoker that echoes its input merged with the static
/// config. Useful for dry runs and definition debugging when no
/// capability backend is wired.
pub struct EchoInvoker;

impl CapabilityInvoker for EchoInvoker {
    fn invoke<'a>(
        &'a self,
        capability_ref: &'a str,
        config: &'a Value,
        input: Value,
    ) -> BoxFuture<'a, Result<Value, InvokeError>> {
        let output = json!({
            "capability": capability_ref,
            "config": config,
            "input": input,
        });
        Box::pin(async move { Ok(output) })
    }
}

// ---------------------------------------------------------------------------
// Step output
// ---------------------------------------------------------------------------

/// Result of one successful step attempt.
#[derive(Debug, Clone)]
pub enum StepOutput {
    /// Raw capability output.
    Value(Value),
    /// Condition step: the branch target of the first matched rule.
    Branch { matched: Option<String> },
    /// Loop step: per-iteration outputs in order.
    Loop { results: Vec<Value> },
}

impl StepOutput {
    /// Project into the JSON recorded at `steps.<id>.output`.
    pub fn into_value(self) -> Value {
        match self {
            StepOutput::Value(v) => v,
            StepOutput::Branch { matched } => json!({"matched": matched}),
            StepOutput::Loop { results } => {
                json!({"iterations": results.len(), "results": results})
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes single step attempts against capability backends.
pub struct StepRunner {
    agents: Arc<dyn CapabilityInvoker>,
    tools: Arc<dyn CapabilityInvoker>,
    evaluator: ConditionEvaluator,
}

impl StepRunner {
    pub fn new(agents: Arc<dyn CapabilityInvoker>, tools: Arc<dyn CapabilityInvoker>) -> Self {
        Self {
            agents,
            tools,
            evaluator: ConditionEvaluator::new(),
        }
    }

    /// Run one attempt of `step`. `ctx` is the instance's execution
    /// context document; `input` is the already-mapped input for this
    /// step. Timeout and cancellation are enforced by the caller.
    pub async fn run(
        &self,
        step: &StepDefinition,
        ctx: &Value,
        input: Value,
    ) -> Result<StepOutput, StepError> {
        match step.kind {
            StepKind::Agent => self.invoke_capability(&self.agents, step, input).await,
            StepKind::Tool => self.invoke_capability(&self.tools, step, input).await,
            StepKind::Condition => self.run_condition(step, ctx),
            StepKind::Loop => self.run_loop(step, ctx).await,
        }
    }

    async fn invoke_capability(
        &self,
        invoker: &Arc<dyn CapabilityInvoker>,
        step: &StepDefinition,
        input: Value,
    ) -> Result<StepOutput, StepError> {
        let Some(capability_ref) = step.capability_ref.as_deref() else {
            return Err(StepError::unavailable(
                format!("step '{}' has no capability reference", step.id),
                false,
            ));
        };
        invoker
            .invoke(capability_ref, &step.config, input)
            .await
            .map(StepOutput::Value)
            .map_err(|e| StepError::unavailable(e.message, e.retryable))
    }

    /// Condition steps complete immediately with the first matched
    /// branch recorded. Routing on the matched rule happens in the
    /// scheduler, which evaluates the same rule set.
    fn run_condition(&self, step: &StepDefinition, ctx: &Value) -> Result<StepOutput, StepError> {
        for rule in &step.conditions.success {
            match self.evaluator.evaluate_bool(&rule.condition, ctx) {
                Ok(true) => {
                    let matched = match rule.effect() {
                        Some(RuleEffect::Goto(target)) => Some(target),
                        _ => None,
                    };
                    return Ok(StepOutput::Branch { matched });
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        step_id = %step.id,
                        condition = %rule.condition,
                        error = %e,
                        "condition rule failed to evaluate, treating as no match"
                    );
                }
            }
        }
        Ok(StepOutput::Branch { matched: None })
    }

    /// Iterate the loop body over the collection at `items_path`,
    /// bounded by `max_iterations`. Body steps run sequentially inside
    /// an iteration-scoped context carrying `loop.item` / `loop.index`;
    /// the output of the last body step becomes the iteration result.
    async fn run_loop(&self, step: &StepDefinition, ctx: &Value) -> Result<StepOutput, StepError> {
        let items_path = step
            .config
            .get("items_path")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StepError::condition(format!("loop step '{}' has no items_path", step.id))
            })?;
        let max_iterations = step
            .config
            .get("max_iterations")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_ITERATIONS) as usize;

        let items: Vec<Value> = match path::resolve(ctx, items_path)? {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(StepError::condition(format!(
                    "loop step '{}': items_path '{items_path}' resolved to {other} instead of an array",
                    step.id
                )));
            }
            None => Vec::new(),
        };

        let mut results = Vec::new();
        for (index, item) in items.into_iter().take(max_iterations).enumerate() {
            let mut iter_ctx = ctx.clone();
            path::write(&mut iter_ctx, "loop.item", item)?;
            path::write(&mut iter_ctx, "loop.index", json!(index))?;

            let mut last_output = Value::Null;
            for body_step in &step.body {
                let output = self.run_body_step(body_step, &iter_ctx).await?;
                path::write(
                    &mut iter_ctx,
                    &format!("steps.{}.output", body_step.id),
                    output.clone(),
                )?;
                for mapping in &body_step.output_mapping {
                    let scoped = json!({
                        "agent": {"output": output},
                        "tool": {"output": output},
                        "step": {"output": output},
                    });
                    if let Some(found) = path::resolve(&scoped, &mapping.source_path)?
                        .or(path::resolve(&iter_ctx, &mapping.source_path)?)
                    {
                        let mut value = found.clone();
                        if let Some(transform) = &mapping.transform {
                            value = path::apply_transform(transform, value)?;
                        }
                        path::write(&mut iter_ctx, &mapping.target_path, value)?;
                    }
                }
                last_output = output;
            }
            results.push(last_output);
        }

        Ok(StepOutput::Loop { results })
    }

    async fn run_body_step(
        &self,
        body_step: &StepDefinition,
        iter_ctx: &Value,
    ) -> Result<Value, StepError> {
        // Nested loops are rejected at publish time.
        if body_step.kind == StepKind::Loop {
            return Err(StepError::condition(format!(
                "nested loop step '{}'",
                body_step.id
            )));
        }

        let mut input_doc = json!({});
        path::apply_mappings(&body_step.input_mapping, iter_ctx, &mut input_doc)?;
        let input = extract_step_input(&input_doc, body_step.kind);

        let attempt = async {
            match body_step.kind {
                StepKind::Agent => {
                    self.invoke_capability(&self.agents, body_step, input)
                        .await
                        .map(StepOutput::into_value)
                }
                StepKind::Tool => {
                    self.invoke_capability(&self.tools, body_step, input)
                        .await
                        .map(StepOutput::into_value)
                }
                StepKind::Condition => self
                    .run_condition(body_step, iter_ctx)
                    .map(StepOutput::into_value),
                StepKind::Loop => unreachable!("rejected above"),
            }
        };

        match body_step.timeout_secs {
            Some(secs) => {
                let limit = Duration::from_secs(secs);
                tokio::time::timeout(limit, attempt)
                    .await
                    .map_err(|_| StepError::timeout(&body_step.id, limit))?
            }
            None => attempt.await,
        }
    }
}

/// Pull the mapped input subtree out of the mapping target document.
/// Input mappings address `agent.input.*` or `tool.input.*`; when a
/// step has no such subtree the whole document is the input.
pub fn extract_step_input(input_doc: &Value, kind: StepKind) -> Value {
    let namespace = match kind {
        StepKind::Agent => "agent.input",
        StepKind::Tool => "tool.input",
        StepKind::Condition | StepKind::Loop => "step.input",
    };
    match path::resolve(input_doc, namespace) {
        Ok(Some(found)) => found.clone(),
        _ => input_doc.clone(),
    }
}
