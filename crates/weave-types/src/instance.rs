//! Execution instance types.
//!
//! An `ExecutionInstance` is one running (or completed) invocation of a
//! workflow definition: its own context, per-step records, and retry
//! counters. Instances are created by the trigger dispatcher, mutated
//! exclusively by the scheduler, and become immutable once terminal. Every
//! step transition is persisted so a crashed run can resume from the last
//! durable checkpoint.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// One execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInstance {
    /// UUIDv7 instance ID.
    pub instance_id: Uuid,
    /// ID of the definition being executed.
    pub definition_id: Uuid,
    /// Version of the definition at start time.
    pub definition_version: u32,
    /// Workflow name (denormalized for display).
    pub workflow_name: String,
    /// Current instance status.
    pub status: InstanceStatus,
    /// How this instance was started ("manual", "webhook", "scheduled", "event").
    pub trigger_type: String,
    /// Raw payload from the trigger, retained for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_payload: Option<serde_json::Value>,
    /// External event id used for idempotent event-trigger starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Namespaced execution context, grows monotonically as steps complete.
    pub context: serde_json::Value,
    /// Per-step execution records keyed by step id.
    #[serde(default)]
    pub step_records: BTreeMap<String, StepExecutionRecord>,
    /// Error message when the instance failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the instance started.
    pub started_at: DateTime<Utc>,
    /// When the instance reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Monotonic revision bumped on every persisted transition. Backs the
    /// store's compare-and-set check.
    #[serde(default)]
    pub revision: u64,
}

impl ExecutionInstance {
    /// Fetch a step record, if one exists yet.
    pub fn record(&self, step_id: &str) -> Option<&StepExecutionRecord> {
        self.step_records.get(step_id)
    }
}

/// Overall status of an execution instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Step records
// ---------------------------------------------------------------------------

/// Execution state of a single step within an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    /// Current step status.
    pub status: StepStatus,
    /// Attempts so far (1-based once running, increments on retry).
    #[serde(default)]
    pub attempt_count: u32,
    /// Failure from the most recent attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepFailure>,
    /// Mapped input passed to the most recent attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Post-mapping output written into the context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// When the first attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Status of an individual step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

// ---------------------------------------------------------------------------
// Step failures
// ---------------------------------------------------------------------------

/// Typed failure recorded against a step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: StepErrorKind,
    pub message: String,
    pub retryable: bool,
}

/// Classification of step failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// The attempt exceeded its deadline.
    Timeout,
    /// The agent/tool capability failed or was unreachable.
    CapabilityUnavailable,
    /// A mapping resolved to a value violating the declared shape.
    InvalidMapping,
    /// A condition rule was violated or malformed.
    ConditionViolation,
    /// The instance was cancelled while the attempt was in flight.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
