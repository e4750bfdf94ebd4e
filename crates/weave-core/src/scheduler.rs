//! Instance scheduler.
//!
//! One event loop per instance: step attempts run as independent tasks
//! bounded by `config.parallelism`, and every context or record
//! mutation is applied on the loop through a mutation channel, so the
//! instance state has a single writer and needs no locks. Each status
//! transition is checkpointed to the execution store before further
//! dispatch, which is what makes crash resume lose at most the
//! in-flight attempts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weave_types::error::StoreError;
use weave_types::instance::{
    ExecutionInstance, InstanceStatus, StepExecutionRecord, StepStatus,
};
use weave_types::workflow::{
    FailurePolicy, RetryPolicy, RuleEffect, StepDefinition, WorkflowDefinition,
};

use crate::expr::ConditionEvaluator;
use crate::graph::{CompiledGraph, GraphError};
use crate::path;
use crate::retry;
use crate::step::{StepError, StepOutput, StepRunner, extract_step_input};
use crate::store::ExecutionStore;

/// How long the loop waits for in-flight tasks to observe cancellation
/// before abandoning them.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("definition {0} not found")]
    DefinitionNotFound(Uuid),

    #[error("instance {0} is already terminal ({1:?})")]
    AlreadyTerminal(Uuid, InstanceStatus),
}

// ---------------------------------------------------------------------------
// Audit sink
// ---------------------------------------------------------------------------

/// Fire-and-forget execution events for external observers.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    InstanceStarted {
        instance_id: Uuid,
        workflow: String,
    },
    StepStarted {
        instance_id: Uuid,
        step_id: String,
        attempt: u32,
    },
    StepSucceeded {
        instance_id: Uuid,
        step_id: String,
    },
    StepFailed {
        instance_id: Uuid,
        step_id: String,
        will_retry: bool,
        message: String,
    },
    StepSkipped {
        instance_id: Uuid,
        step_id: String,
    },
    InstanceFinished {
        instance_id: Uuid,
        status: InstanceStatus,
    },
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Default sink: structured log lines.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn emit(&self, event: AuditEvent) {
        match event {
            AuditEvent::InstanceStarted {
                instance_id,
                workflow,
            } => tracing::info!(%instance_id, %workflow, "instance started"),
            AuditEvent::StepStarted {
                instance_id,
                step_id,
                attempt,
            } => tracing::info!(%instance_id, %step_id, attempt, "step started"),
            AuditEvent::StepSucceeded {
                instance_id,
                step_id,
            } => tracing::info!(%instance_id, %step_id, "step succeeded"),
            AuditEvent::StepFailed {
                instance_id,
                step_id,
                will_retry,
                message,
            } => tracing::warn!(%instance_id, %step_id, will_retry, %message, "step failed"),
            AuditEvent::StepSkipped {
                instance_id,
                step_id,
            } => tracing::debug!(%instance_id, %step_id, "step skipped"),
            AuditEvent::InstanceFinished {
                instance_id,
                status,
            } => tracing::info!(%instance_id, ?status, "instance finished"),
        }
    }
}

// ---------------------------------------------------------------------------
// Loop events
// ---------------------------------------------------------------------------

struct StepEvent {
    step_id: String,
    kind: StepEventKind,
}

enum StepEventKind {
    /// The task acquired a parallelism permit and is about to run.
    Started { attempt: u32 },
    /// The attempt finished.
    Settled {
        attempt: u32,
        result: Result<StepOutput, StepError>,
    },
}

/// How a step failure was resolved by its `conditions.failure` rules.
enum FailureRouting {
    /// A goto or complete_workflow rule consumed the failure.
    Routed,
    /// A retry rule matched; schedule another attempt.
    RetryGranted,
    /// No rule matched; the global policy decides.
    Unmatched,
}

/// Per-drive mutable flags, kept together so event application can be
/// factored out of the loop body.
struct DriveState {
    inflight: usize,
    force_ready: HashSet<String>,
    /// A `stop` policy or `fail` rule fired.
    stopping: bool,
    /// A `complete_workflow` rule fired.
    complete_early: bool,
    cancel_seen: bool,
    failure: Option<String>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Executes workflow instances against an execution store.
pub struct Scheduler<S: ExecutionStore> {
    store: Arc<S>,
    runner: Arc<StepRunner>,
    evaluator: Arc<ConditionEvaluator>,
    audit: Arc<dyn AuditSink>,
    cancellations: Arc<DashMap<Uuid, CancellationToken>>,
}

impl<S: ExecutionStore> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            runner: self.runner.clone(),
            evaluator: self.evaluator.clone(),
            audit: self.audit.clone(),
            cancellations: self.cancellations.clone(),
        }
    }
}

impl<S: ExecutionStore> Scheduler<S> {
    pub fn new(store: Arc<S>, runner: Arc<StepRunner>) -> Self {
        Self {
            store,
            runner,
            evaluator: Arc::new(ConditionEvaluator::new()),
            audit: Arc::new(TracingSink),
            cancellations: Arc::new(DashMap::new()),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create and persist an instance, then execute it in the
    /// background. Returns as soon as the instance record exists.
    pub async fn start(
        &self,
        definition: WorkflowDefinition,
        trigger_type: &str,
        payload: Value,
        event_id: Option<String>,
        overlay: Value,
    ) -> Result<Uuid, SchedulerError> {
        CompiledGraph::compile(&definition)?;
        let instance = build_instance(&definition, trigger_type, payload, event_id, overlay);
        self.store.create_instance(&instance).await?;
        let instance_id = instance.instance_id;

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.execute(definition, instance).await {
                tracing::error!(%instance_id, error = %e, "instance execution aborted");
            }
        });
        Ok(instance_id)
    }

    /// Create, persist, and execute an instance inline. Used by the
    /// CLI `run` command and tests.
    pub async fn run_to_completion(
        &self,
        definition: WorkflowDefinition,
        trigger_type: &str,
        payload: Value,
        event_id: Option<String>,
        overlay: Value,
    ) -> Result<ExecutionInstance, SchedulerError> {
        CompiledGraph::compile(&definition)?;
        let instance = build_instance(&definition, trigger_type, payload, event_id, overlay);
        self.store.create_instance(&instance).await?;
        self.execute(definition, instance).await
    }

    /// Resume a non-terminal instance after a crash. Steps that were
    /// mid-flight go back to `pending` (their attempt counts are kept);
    /// succeeded and skipped steps are not re-run.
    pub async fn resume(&self, instance_id: &Uuid) -> Result<ExecutionInstance, SchedulerError> {
        let Some(mut instance) = self.store.load_instance(instance_id).await? else {
            return Err(SchedulerError::InstanceNotFound(*instance_id));
        };
        if instance.status.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(*instance_id, instance.status));
        }
        let Some(definition) = self.store.get_definition(&instance.definition_id).await? else {
            return Err(SchedulerError::DefinitionNotFound(instance.definition_id));
        };

        for record in instance.step_records.values_mut() {
            if matches!(record.status, StepStatus::Running | StepStatus::Ready) {
                record.status = StepStatus::Pending;
                record.started_at = None;
            }
        }
        self.bump_and_save(&mut instance).await?;
        tracing::info!(%instance_id, "resuming instance");
        self.execute(definition, instance).await
    }

    /// Request cancellation. Live instances get their token cancelled;
    /// orphaned non-terminal instances (no running loop, e.g. found
    /// after a crash) are marked cancelled directly.
    pub async fn cancel(&self, instance_id: &Uuid) -> Result<(), SchedulerError> {
        if let Some(token) = self.cancellations.get(instance_id) {
            token.cancel();
            return Ok(());
        }
        let Some(mut instance) = self.store.load_instance(instance_id).await? else {
            return Err(SchedulerError::InstanceNotFound(*instance_id));
        };
        if instance.status.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal(*instance_id, instance.status));
        }
        instance.status = InstanceStatus::Cancelled;
        instance.ended_at = Some(Utc::now());
        self.bump_and_save(&mut instance).await?;
        self.audit.emit(AuditEvent::InstanceFinished {
            instance_id: *instance_id,
            status: InstanceStatus::Cancelled,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn execute(
        &self,
        definition: WorkflowDefinition,
        mut instance: ExecutionInstance,
    ) -> Result<ExecutionInstance, SchedulerError> {
        let graph = CompiledGraph::compile(&definition)?;
        let token = CancellationToken::new();
        self.cancellations.insert(instance.instance_id, token.clone());

        let outcome = match definition.config.timeout_secs {
            Some(secs) => {
                let limit = Duration::from_secs(secs);
                match tokio::time::timeout(
                    limit,
                    self.drive(&definition, &graph, &mut instance, &token),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        token.cancel();
                        self.fail_timed_out(&mut instance, secs).await
                    }
                }
            }
            None => self.drive(&definition, &graph, &mut instance, &token).await,
        };

        self.cancellations.remove(&instance.instance_id);
        outcome?;
        Ok(instance)
    }

    /// Mark a workflow-level timeout: running steps become failed with
    /// a timeout error, everything pending is skipped.
    async fn fail_timed_out(
        &self,
        instance: &mut ExecutionInstance,
        secs: u64,
    ) -> Result<(), SchedulerError> {
        let now = Utc::now();
        for (step_id, record) in instance.step_records.iter_mut() {
            match record.status {
                StepStatus::Running | StepStatus::Ready => {
                    record.status = StepStatus::Failed;
                    record.ended_at = Some(now);
                    record.last_error =
                        Some(StepError::timeout(step_id, Duration::from_secs(secs)).to_failure());
                }
                StepStatus::Pending => record.status = StepStatus::Skipped,
                _ => {}
            }
        }
        instance.status = InstanceStatus::Failed;
        instance.error = Some(format!("workflow timed out after {secs}s"));
        instance.ended_at = Some(now);
        self.bump_and_save(instance).await?;
        self.audit.emit(AuditEvent::InstanceFinished {
            instance_id: instance.instance_id,
            status: InstanceStatus::Failed,
        });
        Ok(())
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        graph: &CompiledGraph,
        instance: &mut ExecutionInstance,
        token: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        // Make sure every step has a record; resume keeps existing ones.
        for step_id in graph.order() {
            instance
                .step_records
                .entry(step_id.clone())
                .or_insert_with(StepExecutionRecord::default);
        }

        if instance.status == InstanceStatus::Pending {
            instance.status = InstanceStatus::Running;
            self.bump_and_save(instance).await?;
            self.audit.emit(AuditEvent::InstanceStarted {
                instance_id: instance.instance_id,
                workflow: instance.workflow_name.clone(),
            });
        }

        let parallelism = definition
            .config
            .parallelism
            .unwrap_or(Semaphore::MAX_PERMITS)
            .min(Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let (tx, mut rx) = mpsc::unbounded_channel::<StepEvent>();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut st = DriveState {
            inflight: 0,
            force_ready: HashSet::new(),
            stopping: false,
            complete_early: false,
            cancel_seen: false,
            failure: None,
        };

        loop {
            if !st.stopping && !st.complete_early && !st.cancel_seen {
                let ready: Vec<String> = graph
                    .order()
                    .iter()
                    .filter(|id| self.is_ready(graph, instance, &st, id))
                    .cloned()
                    .collect();
                for step_id in ready {
                    self.dispatch(
                        graph,
                        instance,
                        &mut st,
                        &mut tasks,
                        &step_id,
                        Duration::ZERO,
                        &semaphore,
                        token,
                        &tx,
                    );
                }
            }

            if st.inflight == 0 {
                break;
            }

            if st.cancel_seen || st.stopping {
                // Drain in-flight settlements within the grace period.
                match tokio::time::timeout(CANCEL_GRACE, rx.recv()).await {
                    Ok(Some(event)) => {
                        self.apply_event(
                            definition, graph, instance, &mut st, &mut tasks, event,
                            &semaphore, token, &tx,
                        )
                        .await?;
                    }
                    _ => break,
                }
            } else {
                tokio::select! {
                    _ = token.cancelled() => {
                        st.cancel_seen = true;
                    }
                    event = rx.recv() => {
                        if let Some(event) = event {
                            self.apply_event(
                                definition, graph, instance, &mut st, &mut tasks, event,
                                &semaphore, token, &tx,
                            )
                            .await?;
                        }
                    }
                }
            }
        }
        tasks.abort_all();

        self.finalize(definition, instance, &st, token).await
    }

    fn is_ready(
        &self,
        graph: &CompiledGraph,
        instance: &ExecutionInstance,
        st: &DriveState,
        step_id: &str,
    ) -> bool {
        let Some(record) = instance.step_records.get(step_id) else {
            return false;
        };
        if record.status != StepStatus::Pending {
            return false;
        }
        if st.force_ready.contains(step_id) {
            return true;
        }
        if graph.is_rule_gated(step_id) {
            return false;
        }
        graph.dependencies_of(step_id).iter().all(|dep| {
            instance
                .step_records
                .get(dep)
                .map(|r| r.status == StepStatus::Succeeded)
                .unwrap_or(false)
        })
    }

    /// Move a step to `ready`, build its input from the context, and
    /// spawn the attempt task. An input mapping error settles the step
    /// immediately without spawning.
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        graph: &CompiledGraph,
        instance: &mut ExecutionInstance,
        st: &mut DriveState,
        tasks: &mut JoinSet<()>,
        step_id: &str,
        delay: Duration,
        semaphore: &Arc<Semaphore>,
        token: &CancellationToken,
        tx: &mpsc::UnboundedSender<StepEvent>,
    ) {
        st.force_ready.remove(step_id);
        let Some(step) = graph.step(step_id).cloned() else {
            return;
        };
        let attempt = instance
            .step_records
            .get(step_id)
            .map(|r| r.attempt_count + 1)
            .unwrap_or(1);

        let eval_ctx = instance.context.clone();
        let mut input_doc = json!({});
        let input = match path::apply_mappings(&step.input_mapping, &eval_ctx, &mut input_doc) {
            Ok(()) => extract_step_input(&input_doc, step.kind),
            Err(e) => {
                // Settle through the channel so failure handling stays
                // on one code path.
                st.inflight += 1;
                if let Some(record) = instance.step_records.get_mut(step_id) {
                    record.status = StepStatus::Ready;
                }
                let _ = tx.send(StepEvent {
                    step_id: step_id.to_string(),
                    kind: StepEventKind::Settled {
                        attempt,
                        result: Err(StepError::from(e)),
                    },
                });
                return;
            }
        };

        if let Some(record) = instance.step_records.get_mut(step_id) {
            record.status = StepStatus::Ready;
            record.input = Some(input.clone());
        }

        let runner = self.runner.clone();
        let semaphore = semaphore.clone();
        let token = token.clone();
        let tx = tx.clone();
        let step_timeout = step.timeout_secs.map(Duration::from_secs);
        st.inflight += 1;

        tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = tx.send(StepEvent {
                            step_id: step.id.clone(),
                            kind: StepEventKind::Settled {
                                attempt,
                                result: Err(StepError::cancelled(&step.id)),
                            },
                        });
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let permit = tokio::select! {
                _ = token.cancelled() => None,
                acquired = semaphore.acquire_owned() => acquired.ok(),
            };
            let Some(_permit) = permit else {
                let _ = tx.send(StepEvent {
                    step_id: step.id.clone(),
                    kind: StepEventKind::Settled {
                        attempt,
                        result: Err(StepError::cancelled(&step.id)),
                    },
                });
                return;
            };

            let _ = tx.send(StepEvent {
                step_id: step.id.clone(),
                kind: StepEventKind::Started { attempt },
            });

            let run = runner.run(&step, &eval_ctx, input);
            let result = tokio::select! {
                _ = token.cancelled() => Err(StepError::cancelled(&step.id)),
                settled = async {
                    match step_timeout {
                        Some(limit) => tokio::time::timeout(limit, run)
                            .await
                            .unwrap_or_else(|_| Err(StepError::timeout(&step.id, limit))),
                        None => run.await,
                    }
                } => settled,
            };

            let _ = tx.send(StepEvent {
                step_id: step.id.clone(),
                kind: StepEventKind::Settled { attempt, result },
            });
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_event(
        &self,
        definition: &WorkflowDefinition,
        graph: &CompiledGraph,
        instance: &mut ExecutionInstance,
        st: &mut DriveState,
        tasks: &mut JoinSet<()>,
        event: StepEvent,
        semaphore: &Arc<Semaphore>,
        token: &CancellationToken,
        tx: &mpsc::UnboundedSender<StepEvent>,
    ) -> Result<(), SchedulerError> {
        let StepEvent { step_id, kind } = event;
        match kind {
            StepEventKind::Started { attempt } => {
                if let Some(record) = instance.step_records.get_mut(&step_id) {
                    record.status = StepStatus::Running;
                    record.attempt_count = attempt;
                    record.started_at = Some(Utc::now());
                }
                self.bump_and_save(instance).await?;
                self.audit.emit(AuditEvent::StepStarted {
                    instance_id: instance.instance_id,
                    step_id,
                    attempt,
                });
            }
            StepEventKind::Settled { attempt, result } => {
                st.inflight -= 1;
                let failure = match result {
                    Ok(output) => {
                        self.apply_success(graph, instance, st, &step_id, attempt, output)
                            .await?
                    }
                    Err(error) => Some(error),
                };
                if let Some(error) = failure {
                    self.apply_failure(
                        definition, graph, instance, st, tasks, &step_id, attempt, error,
                        semaphore, token, tx,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Record a successful attempt: write the output into the context,
    /// apply output mappings, and evaluate success rules. A failed
    /// output projection turns the success into a step failure, which
    /// the caller feeds back through the failure path.
    async fn apply_success(
        &self,
        graph: &CompiledGraph,
        instance: &mut ExecutionInstance,
        st: &mut DriveState,
        step_id: &str,
        attempt: u32,
        output: StepOutput,
    ) -> Result<Option<StepError>, SchedulerError> {
        let raw = output.into_value();
        let Some(step) = graph.step(step_id).cloned() else {
            return Ok(None);
        };

        // Output mappings resolve against the context plus the step's
        // own output namespaces.
        let mut scoped = instance.context.clone();
        for ns in ["agent", "tool", "step"] {
            let _ = path::write(&mut scoped, &format!("{ns}.output"), raw.clone());
        }
        if let Err(e) = path::apply_mappings(&step.output_mapping, &scoped, &mut instance.context) {
            return Ok(Some(StepError::from(e)));
        }

        // Record the raw output and make it addressable in the context.
        if let Some(record) = instance.step_records.get_mut(step_id) {
            record.status = StepStatus::Succeeded;
            record.attempt_count = record.attempt_count.max(attempt);
            record.output = Some(raw.clone());
            record.ended_at = Some(Utc::now());
            record.last_error = None;
        }
        if let Err(e) = path::write(
            &mut instance.context,
            &format!("steps.{step_id}.output"),
            raw.clone(),
        ) {
            tracing::warn!(%step_id, error = %e, "could not record step output in context");
        }

        self.bump_and_save(instance).await?;
        self.audit.emit(AuditEvent::StepSucceeded {
            instance_id: instance.instance_id,
            step_id: step_id.to_string(),
        });

        // First matching success rule wins.
        for rule in &step.conditions.success {
            match self.evaluator.evaluate_bool(&rule.condition, &scoped) {
                Ok(true) => {
                    match rule.effect() {
                        Some(RuleEffect::Goto(target)) => {
                            self.force_ready(instance, st, &target);
                        }
                        Some(RuleEffect::CompleteWorkflow) => {
                            st.complete_early = true;
                        }
                        Some(RuleEffect::Fail) => {
                            st.stopping = true;
                            st.failure = Some(format!(
                                "step '{step_id}' matched a fail rule: {}",
                                rule.condition
                            ));
                        }
                        Some(RuleEffect::Retry) | None => {
                            tracing::warn!(%step_id, condition = %rule.condition,
                                "ignoring retry rule on a succeeded step");
                        }
                    }
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(%step_id, condition = %rule.condition, error = %e,
                        "success rule failed to evaluate, treating as no match");
                }
            }
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_failure(
        &self,
        definition: &WorkflowDefinition,
        graph: &CompiledGraph,
        instance: &mut ExecutionInstance,
        st: &mut DriveState,
        tasks: &mut JoinSet<()>,
        step_id: &str,
        attempt: u32,
        error: StepError,
        semaphore: &Arc<Semaphore>,
        token: &CancellationToken,
        tx: &mpsc::UnboundedSender<StepEvent>,
    ) -> Result<(), SchedulerError> {
        let Some(step) = graph.step(step_id).cloned() else {
            return Ok(());
        };
        let policy = step
            .retry_policy
            .clone()
            .or_else(|| definition.config.retry_policy.clone())
            .unwrap_or_default();

        if let Some(record) = instance.step_records.get_mut(step_id) {
            record.attempt_count = record.attempt_count.max(attempt);
            record.last_error = Some(error.to_failure());
        }

        let blocked = st.stopping || st.complete_early || st.cancel_seen;
        if !blocked && retry::should_retry(&policy, attempt, error.retryable) {
            // Keep the record in `ready` while the backoff timer runs.
            if let Some(record) = instance.step_records.get_mut(step_id) {
                record.status = StepStatus::Ready;
            }
            self.bump_and_save(instance).await?;
            let delay = retry::backoff_delay(&policy, attempt);
            self.audit.emit(AuditEvent::StepFailed {
                instance_id: instance.instance_id,
                step_id: step_id.to_string(),
                will_retry: true,
                message: error.message.clone(),
            });
            self.dispatch(graph, instance, st, tasks, step_id, delay, semaphore, token, tx);
            return Ok(());
        }

        if let Some(record) = instance.step_records.get_mut(step_id) {
            record.status = StepStatus::Failed;
            record.ended_at = Some(Utc::now());
        }
        self.bump_and_save(instance).await?;
        self.audit.emit(AuditEvent::StepFailed {
            instance_id: instance.instance_id,
            step_id: step_id.to_string(),
            will_retry: false,
            message: error.message.clone(),
        });

        // Cancellation is not a routable failure, and once the loop is
        // stopping no further routing happens.
        if blocked || error.kind == weave_types::instance::StepErrorKind::Cancelled {
            return Ok(());
        }

        let scoped = instance.context.clone();
        match self.apply_failure_rules(graph, instance, st, step_id, &scoped) {
            FailureRouting::Routed => return Ok(()),
            FailureRouting::RetryGranted => {
                // A matched `retry` rule grants another attempt beyond
                // the policy budget.
                if let Some(record) = instance.step_records.get_mut(step_id) {
                    record.status = StepStatus::Ready;
                }
                let delay = retry::backoff_delay(&policy, attempt);
                self.dispatch(graph, instance, st, tasks, step_id, delay, semaphore, token, tx);
                return Ok(());
            }
            FailureRouting::Unmatched => {}
        }

        match definition.config.error_handling.on_step_failure {
            FailurePolicy::Continue => {
                // Dependents can never become ready and are swept as
                // skipped at the end.
            }
            FailurePolicy::Stop => {
                st.stopping = true;
                st.failure = Some(format!("step '{step_id}' failed: {}", error.message));
                token.cancel();
            }
        }
        Ok(())
    }

    /// Evaluate `conditions.failure` in order; the first match wins.
    fn apply_failure_rules(
        &self,
        graph: &CompiledGraph,
        instance: &mut ExecutionInstance,
        st: &mut DriveState,
        step_id: &str,
        scoped: &Value,
    ) -> FailureRouting {
        let Some(step) = graph.step(step_id) else {
            return FailureRouting::Unmatched;
        };
        for rule in &step.conditions.failure {
            match self.evaluator.evaluate_bool(&rule.condition, scoped) {
                Ok(true) => {
                    return match rule.effect() {
                        Some(RuleEffect::Goto(target)) => {
                            self.force_ready(instance, st, &target);
                            FailureRouting::Routed
                        }
                        Some(RuleEffect::CompleteWorkflow) => {
                            st.complete_early = true;
                            FailureRouting::Routed
                        }
                        Some(RuleEffect::Retry) => FailureRouting::RetryGranted,
                        Some(RuleEffect::Fail) | None => FailureRouting::Unmatched,
                    };
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(%step_id, condition = %rule.condition, error = %e,
                        "failure rule failed to evaluate, treating as no match");
                }
            }
        }
        FailureRouting::Unmatched
    }

    /// Force-mark a rule target ready. A terminal target is re-armed
    /// (rule-driven loops may revisit earlier steps); a running target
    /// is left alone.
    fn force_ready(&self, instance: &mut ExecutionInstance, st: &mut DriveState, target: &str) {
        let Some(record) = instance.step_records.get_mut(target) else {
            return;
        };
        match record.status {
            StepStatus::Running | StepStatus::Ready => {
                tracing::warn!(%target, "ignoring branch override onto an active step");
            }
            _ => {
                record.status = StepStatus::Pending;
                record.ended_at = None;
                st.force_ready.insert(target.to_string());
            }
        }
    }

    async fn finalize(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut ExecutionInstance,
        st: &DriveState,
        token: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let now = Utc::now();

        // Anything still pending or ready was never selected or lost
        // its path; sweep it to skipped. A record stuck in running
        // means its task did not settle within the grace period.
        let mut skipped = Vec::new();
        for (step_id, record) in instance.step_records.iter_mut() {
            match record.status {
                StepStatus::Pending | StepStatus::Ready => {
                    record.status = StepStatus::Skipped;
                    skipped.push(step_id.clone());
                }
                StepStatus::Running => {
                    record.status = StepStatus::Failed;
                    record.ended_at = Some(now);
                    record.last_error = Some(StepError::cancelled(step_id).to_failure());
                }
                _ => {}
            }
        }
        for step_id in skipped {
            self.audit.emit(AuditEvent::StepSkipped {
                instance_id: instance.instance_id,
                step_id,
            });
        }

        let failed_steps: Vec<&String> = instance
            .step_records
            .iter()
            .filter(|(_, r)| r.status == StepStatus::Failed)
            .map(|(id, _)| id)
            .collect();

        let (status, error) = if st.stopping {
            (
                InstanceStatus::Failed,
                st.failure
                    .clone()
                    .or_else(|| Some("instance stopped on step failure".to_string())),
            )
        } else if st.cancel_seen || token.is_cancelled() {
            (InstanceStatus::Cancelled, None)
        } else if !failed_steps.is_empty() {
            // Tolerated failures under the `continue` policy still end
            // the instance completed, with the failures summarized.
            let summary = format!(
                "completed with {} failed step(s): {}",
                failed_steps.len(),
                failed_steps
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            if definition.config.error_handling.on_step_failure == FailurePolicy::Continue {
                (InstanceStatus::Completed, Some(summary))
            } else {
                (InstanceStatus::Failed, Some(summary))
            }
        } else {
            (InstanceStatus::Completed, None)
        };

        instance.status = status;
        instance.error = error;
        instance.ended_at = Some(now);
        self.bump_and_save(instance).await?;

        if let Some(tag) = &definition.config.error_handling.on_workflow_failure
            && status == InstanceStatus::Failed
        {
            tracing::warn!(instance_id = %instance.instance_id, tag = %tag, "workflow failure tag");
        }
        self.audit.emit(AuditEvent::InstanceFinished {
            instance_id: instance.instance_id,
            status,
        });
        Ok(())
    }

    async fn bump_and_save(&self, instance: &mut ExecutionInstance) -> Result<(), StoreError> {
        instance.revision += 1;
        self.store.save_transition(instance).await
    }
}

// ---------------------------------------------------------------------------
// Instance construction
// ---------------------------------------------------------------------------

/// Build a fresh instance with the namespaced execution context.
pub fn build_instance(
    definition: &WorkflowDefinition,
    trigger_type: &str,
    payload: Value,
    event_id: Option<String>,
    overlay: Value,
) -> ExecutionInstance {
    let instance_id = Uuid::now_v7();
    let mut context = json!({
        "workflow": {
            "name": definition.name,
            "instance_id": instance_id,
            "input": payload.clone(),
            "context": {},
            "output": {},
        },
        "steps": {},
        "trigger": payload,
    });
    path::deep_merge(&mut context, overlay);

    ExecutionInstance {
        instance_id,
        definition_id: definition.id,
        definition_version: definition.version,
        workflow_name: definition.name.clone(),
        status: InstanceStatus::Pending,
        trigger_type: trigger_type.to_string(),
        trigger_payload: payload_for_record(&context),
        event_id,
        context,
        step_records: Default::default(),
        error: None,
        started_at: Utc::now(),
        ended_at: None,
        revision: 0,
    }
}

fn payload_for_record(context: &Value) -> Option<Value> {
    context.get("trigger").cloned()
}
