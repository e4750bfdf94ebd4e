//! Durable execution store.
//!
//! [`ExecutionStore`] persists workflow definitions and execution
//! instances. Instance writes go through [`save_transition`], which
//! enforces a compare-and-swap on the instance revision so a stale
//! writer can never clobber a newer checkpoint. The engine checkpoints
//! after every status transition; a crash between transitions loses at
//! most the in-flight step attempts.
//!
//! [`save_transition`]: ExecutionStore::save_transition

use dashmap::DashMap;
use uuid::Uuid;
use weave_types::instance::{ExecutionInstance, InstanceStatus};
use weave_types::workflow::WorkflowDefinition;

pub use weave_types::error::StoreError;

pub trait ExecutionStore: Send + Sync + 'static {
    // -- definitions --------------------------------------------------------

    /// Insert or replace a workflow definition.
    fn save_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, StoreError>> + Send;

    /// Look up the newest definition with the given name.
    fn get_definition_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, StoreError>> + Send;

    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, StoreError>> + Send;

    fn delete_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    // -- instances ----------------------------------------------------------

    /// Persist a brand new instance. Fails with [`StoreError::Conflict`]
    /// if the instance id already exists.
    fn create_instance(
        &self,
        instance: &ExecutionInstance,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn load_instance(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionInstance>, StoreError>> + Send;

    /// Persist a state transition. The caller bumps `revision` before
    /// calling; the store verifies the previous revision is still what
    /// is on disk and fails with [`StoreError::RevisionConflict`]
    /// otherwise.
    fn save_transition(
        &self,
        instance: &ExecutionInstance,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Most recent instances, optionally filtered by definition.
    fn list_instances(
        &self,
        definition_id: Option<Uuid>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionInstance>, StoreError>> + Send;

    /// Instances in a non-terminal status, used for crash recovery.
    fn list_running_instances(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionInstance>, StoreError>> + Send;

    /// Look up an instance by trigger event id, for at-most-once event
    /// delivery.
    fn find_by_event_id(
        &self,
        event_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionInstance>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Non-durable store backed by concurrent maps. Used in tests and for
/// ephemeral runs; production uses the SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    definitions: DashMap<Uuid, WorkflowDefinition>,
    instances: DashMap<Uuid, ExecutionInstance>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for MemoryStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        self.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.definitions.get(id).map(|d| d.clone()))
    }

    async fn get_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let mut found: Option<WorkflowDefinition> = None;
        for entry in self.definitions.iter() {
            if entry.name == name
                && found
                    .as_ref()
                    .map(|f| entry.version > f.version)
                    .unwrap_or(true)
            {
                found = Some(entry.clone());
            }
        }
        Ok(found)
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut all: Vec<WorkflowDefinition> =
            self.definitions.iter().map(|e| e.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, StoreError> {
        Ok(self.definitions.remove(id).is_some())
    }

    async fn create_instance(&self, instance: &ExecutionInstance) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.instances.entry(instance.instance_id) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "instance {} already exists",
                instance.instance_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(instance.clone());
                Ok(())
            }
        }
    }

    async fn load_instance(
        &self,
        instance_id: &Uuid,
    ) -> Result<Option<ExecutionInstance>, StoreError> {
        Ok(self.instances.get(instance_id).map(|i| i.clone()))
    }

    async fn save_transition(&self, instance: &ExecutionInstance) -> Result<(), StoreError> {
        let Some(mut existing) = self.instances.get_mut(&instance.instance_id) else {
            return Err(StoreError::NotFound);
        };
        if existing.revision + 1 != instance.revision {
            return Err(StoreError::RevisionConflict {
                expected: existing.revision + 1,
                actual: instance.revision,
            });
        }
        *existing = instance.clone();
        Ok(())
    }

    async fn list_instances(
        &self,
        definition_id: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<ExecutionInstance>, StoreError> {
        let mut all: Vec<ExecutionInstance> = self
            .instances
            .iter()
            .filter(|e| definition_id.map(|id| e.definition_id == id).unwrap_or(true))
            .map(|e| e.clone())
            .collect();
        // UUIDv7 ids sort by creation time
        all.sort_by(|a, b| b.instance_id.cmp(&a.instance_id));
        all.truncate(limit as usize);
        Ok(all)
    }

    async fn list_running_instances(&self) -> Result<Vec<ExecutionInstance>, StoreError> {
        Ok(self
            .instances
            .iter()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.clone())
            .collect())
    }

    async fn find_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<ExecutionInstance>, StoreError> {
        Ok(self
            .instances
            .iter()
            .find(|e| e.event_id.as_deref() == Some(event_id))
            .map(|e| e.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn instance() -> ExecutionInstance {
        ExecutionInstance {
            instance_id: Uuid::now_v7(),
            definition_id: Uuid::now_v7(),
            definition_version: 1,
            workflow_name: "test".to_string(),
            status: InstanceStatus::Pending,
            trigger_type: "manual".to_string(),
            trigger_payload: Some(serde_json::json!({})),
            event_id: None,
            context: serde_json::json!({}),
            step_records: BTreeMap::new(),
            error: None,
            started_at: Utc::now(),
            ended_at: None,
            revision: 0,
        }
    }

    #[tokio::test]
    async fn create_then_load_roundtrips() {
        let store = MemoryStore::new();
        let inst = instance();
        store.create_instance(&inst).await.unwrap();
        let loaded = store.load_instance(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(loaded.instance_id, inst.instance_id);
        assert_eq!(loaded.revision, 0);
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let store = MemoryStore::new();
        let inst = instance();
        store.create_instance(&inst).await.unwrap();
        assert!(matches!(
            store.create_instance(&inst).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn transition_requires_next_revision() {
        let store = MemoryStore::new();
        let mut inst = instance();
        store.create_instance(&inst).await.unwrap();

        inst.revision = 1;
        inst.status = InstanceStatus::Running;
        store.save_transition(&inst).await.unwrap();

        // Replaying the same revision is a conflict
        let err = store.save_transition(&inst).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::RevisionConflict {
                expected: 2,
                actual: 1
            }
        ));

        // Skipping ahead is also a conflict
        inst.revision = 5;
        assert!(matches!(
            store.save_transition(&inst).await,
            Err(StoreError::RevisionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn transition_on_unknown_instance_is_not_found() {
        let store = MemoryStore::new();
        let mut inst = instance();
        inst.revision = 1;
        assert!(matches!(
            store.save_transition(&inst).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn running_filter_excludes_terminal() {
        let store = MemoryStore::new();
        let mut a = instance();
        a.status = InstanceStatus::Running;
        let mut b = instance();
        b.status = InstanceStatus::Completed;
        store.create_instance(&a).await.unwrap();
        store.create_instance(&b).await.unwrap();

        let running = store.list_running_instances().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].instance_id, a.instance_id);
    }

    #[tokio::test]
    async fn event_id_lookup() {
        let store = MemoryStore::new();
        let mut inst = instance();
        inst.event_id = Some("evt-123".to_string());
        store.create_instance(&inst).await.unwrap();

        let found = store.find_by_event_id("evt-123").await.unwrap();
        assert_eq!(found.map(|i| i.instance_id), Some(inst.instance_id));
        assert!(store.find_by_event_id("evt-999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn newest_definition_wins_name_lookup() {
        let store = MemoryStore::new();
        let mut v1 = WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "triage".to_string(),
            description: None,
            version: 1,
            kind: Default::default(),
            config: Default::default(),
            triggers: vec![],
            steps: vec![],
        };
        store.save_definition(&v1).await.unwrap();
        v1.id = Uuid::now_v7();
        v1.version = 3;
        store.save_definition(&v1).await.unwrap();

        let found = store.get_definition_by_name("triage").await.unwrap().unwrap();
        assert_eq!(found.version, 3);
    }

    #[tokio::test]
    async fn list_instances_respects_limit_and_filter() {
        let store = MemoryStore::new();
        let def = Uuid::now_v7();
        for _ in 0..5 {
            let mut inst = instance();
            inst.definition_id = def;
            store.create_instance(&inst).await.unwrap();
        }
        store.create_instance(&instance()).await.unwrap();

        let listed = store.list_instances(Some(def), 3).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|i| i.definition_id == def));
        assert_eq!(store.list_instances(None, 100).await.unwrap().len(), 6);
    }
}
