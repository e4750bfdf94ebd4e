//! SQLite execution store implementation.
//!
//! Implements `ExecutionStore` from `weave-core` using sqlx with split
//! read/write pools. Definitions and instances are stored as JSON blobs
//! with a few extracted columns for filtering; the `revision` column
//! backs the compare-and-set that guards every instance transition.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;
use weave_core::store::ExecutionStore;
use weave_types::error::StoreError;
use weave_types::instance::{ExecutionInstance, InstanceStatus};
use weave_types::workflow::WorkflowDefinition;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionStore`.
pub struct SqliteExecutionStore {
    pool: DatabasePool,
}

impl SqliteExecutionStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    definition: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, StoreError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| StoreError::Query(format!("invalid workflow definition JSON: {e}")))
    }
}

struct InstanceRow {
    instance: String,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance: row.try_get("instance")?,
        })
    }

    fn into_instance(self) -> Result<ExecutionInstance, StoreError> {
        serde_json::from_str(&self.instance)
            .map_err(|e| StoreError::Query(format!("invalid instance JSON: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn status_str(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Pending => "pending",
        InstanceStatus::Running => "running",
        InstanceStatus::Completed => "completed",
        InstanceStatus::Failed => "failed",
        InstanceStatus::Cancelled => "cancelled",
    }
}

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// ExecutionStore impl
// ---------------------------------------------------------------------------

impl ExecutionStore for SqliteExecutionStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let definition_json = serde_json::to_string(definition)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, name, version, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 version = excluded.version,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(definition.id.to_string())
        .bind(&definition.name)
        .bind(definition.version as i64)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|r| DefinitionRow::from_row(&r).map_err(query_err)?.into_definition())
            .transpose()
    }

    async fn get_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(
            "SELECT definition FROM workflow_definitions WHERE name = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.map(|r| DefinitionRow::from_row(&r).map_err(query_err)?.into_definition())
            .transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query("SELECT definition FROM workflow_definitions ORDER BY name, version")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|r| DefinitionRow::from_row(r).map_err(query_err)?.into_definition())
            .collect()
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM workflow_definitions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_instance(&self, instance: &ExecutionInstance) -> Result<(), StoreError> {
        let instance_json = serde_json::to_string(instance)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"INSERT INTO execution_instances
                 (instance_id, definition_id, workflow_name, status, event_id, revision, instance, started_at, ended_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance.instance_id.to_string())
        .bind(instance.definition_id.to_string())
        .bind(&instance.workflow_name)
        .bind(status_str(instance.status))
        .bind(&instance.event_id)
        .bind(instance.revision as i64)
        .bind(&instance_json)
        .bind(format_datetime(&instance.started_at))
        .bind(instance.ended_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.as_database_error().is_some_and(|d| d.is_unique_violation()) => {
                Err(StoreError::Conflict(format!(
                    "instance {} already exists",
                    instance.instance_id
                )))
            }
            Err(e) => Err(query_err(e)),
        }
    }

    async fn load_instance(
        &self,
        instance_id: &Uuid,
    ) -> Result<Option<ExecutionInstance>, StoreError> {
        let row = sqlx::query("SELECT instance FROM execution_instances WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|r| InstanceRow::from_row(&r).map_err(query_err)?.into_instance())
            .transpose()
    }

    async fn save_transition(&self, instance: &ExecutionInstance) -> Result<(), StoreError> {
        let instance_json = serde_json::to_string(instance)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let expected_prior = instance.revision.saturating_sub(1);

        let result = sqlx::query(
            r#"UPDATE execution_instances
               SET status = ?, event_id = ?, revision = ?, instance = ?, ended_at = ?
               WHERE instance_id = ? AND revision = ?"#,
        )
        .bind(status_str(instance.status))
        .bind(&instance.event_id)
        .bind(instance.revision as i64)
        .bind(&instance_json)
        .bind(instance.ended_at.as_ref().map(format_datetime))
        .bind(instance.instance_id.to_string())
        .bind(expected_prior as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Distinguish a missing row from a stale revision.
        let row = sqlx::query("SELECT revision FROM execution_instances WHERE instance_id = ?")
            .bind(instance.instance_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;
        match row {
            None => Err(StoreError::NotFound),
            Some(r) => {
                let stored: i64 = r.try_get("revision").map_err(query_err)?;
                Err(StoreError::RevisionConflict {
                    expected: stored as u64 + 1,
                    actual: instance.revision,
                })
            }
        }
    }

    async fn list_instances(
        &self,
        definition_id: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<ExecutionInstance>, StoreError> {
        // instance_id is a UUIDv7, so ordering by it is creation order.
        let rows = match definition_id {
            Some(id) => {
                sqlx::query(
                    r#"SELECT instance FROM execution_instances
                       WHERE definition_id = ?
                       ORDER BY instance_id DESC LIMIT ?"#,
                )
                .bind(id.to_string())
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT instance FROM execution_instances ORDER BY instance_id DESC LIMIT ?",
                )
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_err)?;

        rows.iter()
            .map(|r| InstanceRow::from_row(r).map_err(query_err)?.into_instance())
            .collect()
    }

    async fn list_running_instances(&self) -> Result<Vec<ExecutionInstance>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT instance FROM execution_instances
               WHERE status IN ('pending', 'running')
               ORDER BY instance_id"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|r| InstanceRow::from_row(r).map_err(query_err)?.into_instance())
            .collect()
    }

    async fn find_by_event_id(
        &self,
        event_id: &str,
    ) -> Result<Option<ExecutionInstance>, StoreError> {
        let row = sqlx::query(
            "SELECT instance FROM execution_instances WHERE event_id = ? ORDER BY instance_id LIMIT 1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.map(|r| InstanceRow::from_row(&r).map_err(query_err)?.into_instance())
            .transpose()
    }
}
