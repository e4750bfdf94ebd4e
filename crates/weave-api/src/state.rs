//! Application state wiring the engine together.
//!
//! AppState holds the concrete service instances used by both CLI and
//! REST API. The engine is generic over the execution store and
//! capability invoker traits; AppState pins them to the SQLite store
//! and the configured invoker.

use std::path::PathBuf;
use std::sync::Arc;

use weave_core::cron::CronService;
use weave_core::scheduler::Scheduler;
use weave_core::step::{CapabilityInvoker, EchoInvoker, StepRunner};
use weave_core::store::ExecutionStore;
use weave_core::trigger::TriggerDispatcher;
use weave_infra::sqlite::pool::DatabasePool;
use weave_infra::sqlite::store::SqliteExecutionStore;
use weave_infra::webhook::{WebhookRegistry, WebhookRoute};
use weave_types::workflow::{TriggerKind, WorkflowDefinition};

/// Shared application state holding the engine services.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteExecutionStore>,
    pub scheduler: Scheduler<SqliteExecutionStore>,
    pub dispatcher: TriggerDispatcher<SqliteExecutionStore>,
    pub webhooks: Arc<WebhookRegistry>,
    pub cron: Arc<CronService>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize the application state: connect to the database, wire
    /// the scheduler and trigger dispatcher, and register every stored
    /// definition's triggers.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        let db_url = std::env::var("WEAVE_DB_URL").unwrap_or_else(|_| {
            format!("sqlite://{}?mode=rwc", data_dir.join("weave.db").display())
        });
        Self::init_with(data_dir, &db_url).await
    }

    /// Like [`init`], but with an explicit data directory and database
    /// url instead of the environment.
    ///
    /// [`init`]: Self::init
    pub async fn init_with(data_dir: PathBuf, db_url: &str) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;
        let db_pool = DatabasePool::new(db_url).await?;
        let store = Arc::new(SqliteExecutionStore::new(db_pool.clone()));

        // The capability runtime (agents/tools) is an external concern;
        // without one configured, invocations echo their input.
        let invoker: Arc<dyn CapabilityInvoker> = Arc::new(EchoInvoker);
        let runner = Arc::new(StepRunner::new(invoker.clone(), invoker));

        let scheduler = Scheduler::new(store.clone(), runner);
        let dispatcher = TriggerDispatcher::new(scheduler.clone());
        let webhooks = Arc::new(WebhookRegistry::new());

        let state = Self {
            store,
            scheduler,
            dispatcher,
            webhooks,
            cron: Arc::new(CronService::new()),
            data_dir,
            db_pool,
        };

        // Definitions dropped into <data_dir>/workflows are picked up
        // on startup; the store is the source of truth afterwards.
        for definition in weave_core::definition::discover(&state.data_dir.join("workflows"))? {
            match weave_core::definition::validate(&definition) {
                Ok(()) => state.store.save_definition(&definition).await?,
                Err(e) => {
                    tracing::warn!(workflow = %definition.name, error = %e,
                        "skipping invalid workflow definition");
                }
            }
        }

        for definition in state.store.list_definitions().await? {
            state.register(definition);
        }
        Ok(state)
    }

    /// Register a definition's triggers with the dispatcher and the
    /// webhook registry.
    pub fn register(&self, definition: WorkflowDefinition) {
        for trigger in &definition.triggers {
            if let TriggerKind::Webhook { path, auth } = &trigger.kind {
                self.webhooks.register(
                    path,
                    WebhookRoute {
                        definition_id: definition.id,
                        workflow_name: definition.name.clone(),
                        auth: auth.clone(),
                    },
                );
            }
        }
        self.dispatcher.register_definition(definition);
    }

    /// Crash recovery and background trigger startup for the server:
    /// resume every non-terminal instance and start the cron service
    /// with all scheduled triggers bound.
    pub async fn recover_and_start_triggers(&self) -> anyhow::Result<()> {
        let orphaned = self.store.list_running_instances().await?;
        for instance in orphaned {
            let scheduler = self.scheduler.clone();
            let instance_id = instance.instance_id;
            tracing::info!(%instance_id, workflow = %instance.workflow_name,
                "resuming interrupted instance");
            tokio::spawn(async move {
                if let Err(e) = scheduler.resume(&instance_id).await {
                    tracing::error!(%instance_id, error = %e, "resume failed");
                }
            });
        }

        self.cron.start().await?;
        let bound = self.dispatcher.bind_schedules(&self.cron).await?;
        if bound > 0 {
            tracing::info!(schedules = bound, "cron triggers bound");
        }

        self.catch_up_missed_schedules().await?;
        Ok(())
    }

    /// Seed each schedule's last-fired baseline from the newest
    /// persisted scheduled start, then fire one catch-up run per
    /// definition whose ticks fell into the downtime window.
    async fn catch_up_missed_schedules(&self) -> anyhow::Result<()> {
        for (definition_id, _, _) in self.cron.snapshot().await {
            let recent = self.store.list_instances(Some(definition_id), 50).await?;
            if let Some(last) = recent.iter().find(|i| i.trigger_type == "scheduled") {
                self.cron.seed_baseline(definition_id, last.started_at).await;
            }
        }

        let missed = self.cron.check_missed_runs(&self.cron.snapshot().await);
        for (definition_id, times) in missed {
            let Some(trigger_name) = self.cron.trigger_name(definition_id).await else {
                continue;
            };
            // One catch-up run at the most recent missed tick, not one
            // per tick, so a long outage cannot start a run storm.
            let Some(fired_at) = times.last().copied() else {
                continue;
            };
            tracing::warn!(%definition_id, trigger = %trigger_name,
                missed = times.len(), %fired_at, "catching up missed scheduled run");
            if let Err(e) = self
                .dispatcher
                .fire_schedule(&definition_id, &trigger_name, fired_at)
                .await
            {
                tracing::error!(%definition_id, error = %e, "catch-up run failed to start");
            }
            self.cron.record_fire(definition_id).await;
        }
        Ok(())
    }
}

/// Resolve the data directory from `WEAVE_DATA_DIR`, falling back to
/// `~/.weave`.
pub fn resolve_data_dir() -> PathBuf {
    match std::env::var("WEAVE_DATA_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".weave")
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) async fn state_with_temp_db() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("weave.db").display()
        );
        let state = AppState::init_with(dir.path().to_path_buf(), &url)
            .await
            .unwrap();
        (dir, state)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::state_with_temp_db;
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;
    use weave_types::instance::{ExecutionInstance, InstanceStatus};
    use weave_types::workflow::{
        StepConditions, StepDefinition, StepKind, TriggerDefinition, WorkflowConfig, WorkflowKind,
    };

    fn scheduled_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "nightly-sync".to_string(),
            description: None,
            version: 1,
            kind: WorkflowKind::Sequential,
            config: WorkflowConfig::default(),
            triggers: vec![TriggerDefinition {
                name: "nightly".to_string(),
                kind: TriggerKind::Scheduled {
                    schedule: "every minute".to_string(),
                    timezone: None,
                    batch_size: None,
                },
                filters: vec![],
                transformation: vec![],
            }],
            steps: vec![StepDefinition {
                id: "sync".to_string(),
                name: "Sync".to_string(),
                kind: StepKind::Tool,
                capability_ref: Some("tool.sync".to_string()),
                config: json!({}),
                dependencies: vec![],
                input_mapping: vec![],
                output_mapping: vec![],
                conditions: StepConditions::default(),
                timeout_secs: None,
                retry_policy: None,
                body: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn startup_catches_up_missed_scheduled_runs() {
        let (_dir, state) = state_with_temp_db().await;
        let definition = scheduled_definition();
        let definition_id = definition.id;
        state.store.save_definition(&definition).await.unwrap();
        state.register(definition);

        // A scheduled run from before the outage window.
        let stale = ExecutionInstance {
            instance_id: Uuid::now_v7(),
            definition_id,
            definition_version: 1,
            workflow_name: "nightly-sync".to_string(),
            status: InstanceStatus::Completed,
            trigger_type: "scheduled".to_string(),
            trigger_payload: None,
            event_id: None,
            context: json!({}),
            step_records: BTreeMap::new(),
            error: None,
            started_at: Utc::now() - Duration::minutes(10),
            ended_at: Some(Utc::now() - Duration::minutes(10)),
            revision: 0,
        };
        state.store.create_instance(&stale).await.unwrap();

        state.recover_and_start_triggers().await.unwrap();

        let instances = state
            .store
            .list_instances(Some(definition_id), 10)
            .await
            .unwrap();
        assert!(
            instances.len() >= 2,
            "expected a catch-up run beyond the stale instance, got {}",
            instances.len()
        );
        assert!(instances.iter().all(|i| i.trigger_type == "scheduled"));
        state.cron.stop().await.unwrap();
    }

    #[tokio::test]
    async fn startup_without_history_fires_no_catch_up() {
        let (_dir, state) = state_with_temp_db().await;
        let definition = scheduled_definition();
        let definition_id = definition.id;
        state.store.save_definition(&definition).await.unwrap();
        state.register(definition);

        state.recover_and_start_triggers().await.unwrap();

        let instances = state
            .store
            .list_instances(Some(definition_id), 10)
            .await
            .unwrap();
        assert!(instances.is_empty());
        state.cron.stop().await.unwrap();
    }
}
