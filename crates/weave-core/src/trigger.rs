//! Trigger dispatch.
//!
//! Maps inbound events (webhook deliveries, schedule ticks, platform
//! events, manual starts) onto registered workflow definitions and
//! starts instances through the scheduler. Trigger filters and payload
//! transformations run here, before an instance exists.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use uuid::Uuid;
use weave_types::error::StoreError;
use weave_types::workflow::{TriggerDefinition, TriggerKind, WorkflowDefinition};

use crate::cron::{CronError, CronService};
use crate::expr::ConditionEvaluator;
use crate::path;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::ExecutionStore;

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("no workflow named '{0}' is registered")]
    UnknownWorkflow(String),

    #[error("no webhook trigger is bound to path '{0}'")]
    UnknownRoute(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cron(#[from] CronError),
}

/// Webhook routes are keyed with a leading slash and no trailing slash
/// so `"orders"`, `"/orders"`, and `"/orders/"` land in the same slot.
fn normalize_route(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// One trigger of one registered definition.
#[derive(Clone)]
struct TriggerBinding {
    definition: Arc<WorkflowDefinition>,
    trigger: TriggerDefinition,
}

/// Routes inbound events to workflow starts.
pub struct TriggerDispatcher<S: ExecutionStore> {
    scheduler: Scheduler<S>,
    evaluator: Arc<ConditionEvaluator>,
    definitions: Arc<DashMap<Uuid, Arc<WorkflowDefinition>>>,
    by_name: Arc<DashMap<String, Uuid>>,
    webhooks: Arc<DashMap<String, Vec<TriggerBinding>>>,
    events: Arc<DashMap<String, Vec<TriggerBinding>>>,
}

impl<S: ExecutionStore> Clone for TriggerDispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            evaluator: self.evaluator.clone(),
            definitions: self.definitions.clone(),
            by_name: self.by_name.clone(),
            webhooks: self.webhooks.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S: ExecutionStore> TriggerDispatcher<S> {
    pub fn new(scheduler: Scheduler<S>) -> Self {
        Self {
            scheduler,
            evaluator: Arc::new(ConditionEvaluator::new()),
            definitions: Arc::new(DashMap::new()),
            by_name: Arc::new(DashMap::new()),
            webhooks: Arc::new(DashMap::new()),
            events: Arc::new(DashMap::new()),
        }
    }

    pub fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    /// Register a definition's triggers. Re-registering the same
    /// definition id replaces its previous bindings.
    pub fn register_definition(&self, definition: WorkflowDefinition) {
        self.unregister_definition(&definition.id);
        let definition = Arc::new(definition);
        for trigger in &definition.triggers {
            let binding = TriggerBinding {
                definition: definition.clone(),
                trigger: trigger.clone(),
            };
            match &trigger.kind {
                TriggerKind::Webhook { path, .. } => {
                    self.webhooks
                        .entry(normalize_route(path))
                        .or_default()
                        .push(binding);
                }
                TriggerKind::Event { event_class } => {
                    self.events
                        .entry(event_class.clone())
                        .or_default()
                        .push(binding);
                }
                TriggerKind::Manual {} | TriggerKind::Scheduled { .. } => {}
            }
        }
        self.by_name
            .insert(definition.name.clone(), definition.id);
        self.definitions.insert(definition.id, definition);
    }

    pub fn unregister_definition(&self, definition_id: &Uuid) {
        let Some((_, old)) = self.definitions.remove(definition_id) else {
            return;
        };
        self.by_name.remove(&old.name);
        for routes in [&self.webhooks, &self.events] {
            routes.retain(|_, bindings| {
                bindings.retain(|b| b.definition.id != *definition_id);
                !bindings.is_empty()
            });
        }
    }

    /// Register every scheduled trigger with the cron service. Each
    /// tick dispatches through [`Self::fire_schedule`].
    pub async fn bind_schedules(&self, cron: &CronService) -> Result<usize, TriggerError> {
        let mut bound = 0;
        for entry in self.definitions.iter() {
            let definition = entry.value().clone();
            for trigger in &definition.triggers {
                let TriggerKind::Scheduled { schedule, .. } = &trigger.kind else {
                    continue;
                };
                let dispatcher = self.clone();
                let trigger_name = trigger.name.clone();
                cron.schedule(
                    definition.id,
                    &trigger.name,
                    schedule,
                    Arc::new(move |definition_id, fired_at| {
                        let dispatcher = dispatcher.clone();
                        let trigger_name = trigger_name.clone();
                        Box::pin(async move {
                            if let Err(e) = dispatcher
                                .fire_schedule(&definition_id, &trigger_name, fired_at)
                                .await
                            {
                                tracing::error!(%definition_id, trigger = %trigger_name,
                                    error = %e, "scheduled start failed");
                            }
                        })
                    }),
                )
                .await?;
                bound += 1;
            }
        }
        Ok(bound)
    }

    // -----------------------------------------------------------------------
    // Firing
    // -----------------------------------------------------------------------

    /// Start an instance by workflow name, bypassing filters.
    pub async fn fire_manual(&self, name: &str, payload: Value) -> Result<Uuid, TriggerError> {
        let definition = match self.by_name.get(name).map(|id| *id) {
            Some(id) => self
                .definitions
                .get(&id)
                .map(|d| d.value().as_ref().clone()),
            None => self.scheduler.store().get_definition_by_name(name).await?,
        };
        let Some(definition) = definition else {
            return Err(TriggerError::UnknownWorkflow(name.to_string()));
        };
        let id = self
            .scheduler
            .start(definition, "manual", payload, None, json!({}))
            .await?;
        Ok(id)
    }

    /// Deliver a webhook payload to every trigger bound to `path`.
    /// Returns the started instance ids; triggers whose filters do not
    /// match are passed over silently.
    pub async fn fire_webhook(
        &self,
        path: &str,
        payload: Value,
    ) -> Result<Vec<Uuid>, TriggerError> {
        let bindings = self
            .webhooks
            .get(&normalize_route(path))
            .map(|b| b.value().clone())
            .ok_or_else(|| TriggerError::UnknownRoute(path.to_string()))?;
        self.fire_bindings("webhook", &bindings, payload, None).await
    }

    /// Deliver a platform event to every trigger bound to its class.
    /// A repeated `event_id` returns the already-started instance
    /// instead of starting a duplicate.
    pub async fn fire_event(
        &self,
        event_class: &str,
        event_id: Option<String>,
        payload: Value,
    ) -> Result<Vec<Uuid>, TriggerError> {
        if let Some(id) = &event_id
            && let Some(existing) = self.scheduler.store().find_by_event_id(id).await?
        {
            tracing::debug!(event_id = %id, instance_id = %existing.instance_id,
                "event already consumed");
            return Ok(vec![existing.instance_id]);
        }
        let bindings = self
            .events
            .get(event_class)
            .map(|b| b.value().clone())
            .unwrap_or_default();
        self.fire_bindings("event", &bindings, payload, event_id).await
    }

    /// Start an instance for one schedule tick.
    pub async fn fire_schedule(
        &self,
        definition_id: &Uuid,
        trigger_name: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<Uuid, TriggerError> {
        let Some(definition) = self.definitions.get(definition_id).map(|d| d.value().as_ref().clone())
        else {
            return Err(TriggerError::UnknownWorkflow(definition_id.to_string()));
        };
        let mut payload = json!({
            "trigger": trigger_name,
            "scheduled_at": fired_at,
        });
        let batch = definition.triggers.iter().find_map(|t| match &t.kind {
            TriggerKind::Scheduled {
                batch_size: Some(n), ..
            } if t.name == trigger_name => Some(*n),
            _ => None,
        });
        if let (Some(n), Value::Object(map)) = (batch, &mut payload) {
            map.insert("batch_size".to_string(), json!(n));
        }
        let id = self
            .scheduler
            .start(definition, "scheduled", payload, None, json!({}))
            .await?;
        Ok(id)
    }

    async fn fire_bindings(
        &self,
        trigger_type: &str,
        bindings: &[TriggerBinding],
        payload: Value,
        event_id: Option<String>,
    ) -> Result<Vec<Uuid>, TriggerError> {
        let filter_doc = filter_document(&payload);
        let mut started = Vec::new();
        for binding in bindings {
            if !self.filters_match(binding, &filter_doc) {
                tracing::debug!(workflow = %binding.definition.name,
                    trigger = %binding.trigger.name, "trigger filters did not match");
                continue;
            }
            let mut overlay = json!({});
            if let Err(e) = path::apply_mappings(
                &binding.trigger.transformation,
                &filter_doc,
                &mut overlay,
            ) {
                tracing::warn!(workflow = %binding.definition.name,
                    trigger = %binding.trigger.name, error = %e,
                    "trigger transformation failed, skipping start");
                continue;
            }
            let id = self
                .scheduler
                .start(
                    binding.definition.as_ref().clone(),
                    trigger_type,
                    payload.clone(),
                    event_id.clone(),
                    overlay,
                )
                .await?;
            started.push(id);
        }
        Ok(started)
    }

    /// All filters must match. An unevaluable filter counts as a miss.
    fn filters_match(&self, binding: &TriggerBinding, doc: &Value) -> bool {
        binding.trigger.filters.iter().all(|filter| {
            match self.evaluator.evaluate_bool(filter, doc) {
                Ok(matched) => matched,
                Err(e) => {
                    tracing::warn!(trigger = %binding.trigger.name, %filter, error = %e,
                        "trigger filter failed to evaluate, treating as no match");
                    false
                }
            }
        })
    }
}

/// Document that filters and transformations evaluate against: the
/// payload's own fields at the top level (wrapped in `payload` when the
/// body is not an object) plus a `trigger` namespace.
fn filter_document(payload: &Value) -> Value {
    let mut doc = match payload {
        Value::Object(_) => payload.clone(),
        other => json!({"payload": other}),
    };
    if let Value::Object(map) = &mut doc {
        map.insert("trigger".to_string(), payload.clone());
    }
    doc
}
