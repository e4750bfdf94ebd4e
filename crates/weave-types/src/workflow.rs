//! Workflow definition types for Weave.
//!
//! Defines the canonical representation of a workflow: steps joined by
//! dependencies and data mappings, guarded by condition rules, plus trigger
//! configuration and global execution config. Definitions are authored as
//! YAML or JSON, are immutable once published, and are read-only to the
//! engine; editing a definition produces a new version.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// The single source of truth for a workflow's shape. Published definitions
/// never change; a new `version` is assigned on every edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save. Authored documents may omit it.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic version, bumped on every published edit.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Execution shape of the workflow.
    #[serde(rename = "type", default)]
    pub kind: WorkflowKind,
    /// Global execution configuration (timeout, parallelism, failure policy).
    #[serde(default)]
    pub config: WorkflowConfig,
    /// Trigger configurations (webhook, scheduled, event, manual).
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
    /// Ordered list of step definitions forming the workflow graph.
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Execution shape of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Steps run in array order with an implicit dependency chain.
    #[default]
    Sequential,
    /// All steps with satisfied dependencies run at once, bounded by
    /// `config.parallelism`.
    Parallel,
    /// Branch selection is driven by rule evaluation; unselected branches
    /// end skipped.
    Conditional,
    /// Corrective retrieve-and-generate: conditional routing with
    /// rule-driven retry loops back into earlier steps.
    Crag,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step ID (e.g. "classify-ticket"). Unique within a workflow.
    pub id: String,
    /// Human-readable step name.
    #[serde(default)]
    pub name: String,
    /// The kind of step.
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Opaque capability id resolved by the external agent/tool runtime.
    /// Required for `agent` and `tool` steps.
    #[serde(
        default,
        alias = "agent_id",
        alias = "tool_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub capability_ref: Option<String>,
    /// Capability-specific configuration payload, passed through opaquely.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
    /// Step IDs that must succeed before this step is ready.
    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<String>,
    /// Projections applied to the context to build this step's input.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_mapping: Vec<Mapping>,
    /// Projections applied to this step's output back into the context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_mapping: Vec<Mapping>,
    /// Rules evaluated after the step settles, by outcome class.
    #[serde(default)]
    pub conditions: StepConditions,
    /// Step-level timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry configuration. Falls back to `config.retry_policy` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Sub-steps executed per iteration. Only meaningful for `loop` steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<StepDefinition>,
}

/// The kind of step in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Call an LLM-backed agent through the external capability handle.
    Agent,
    /// Call a side-effecting tool through the external capability handle.
    Tool,
    /// Evaluate rules against context only; no external call.
    Condition,
    /// Re-enter a nested sub-graph once per item of an iterable.
    Loop,
}

// ---------------------------------------------------------------------------
// Mappings
// ---------------------------------------------------------------------------

/// A declarative projection from one context path to another.
///
/// `source_path` is a dotted/bracketed path into the execution context
/// (e.g. `workflow.context.ticket.id`, `agent.output.items[0]`);
/// `target_path` names the destination (`agent.input.*`, `tool.input.*`,
/// `workflow.context.*`, `workflow.output.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(alias = "source")]
    pub source_path: String,
    #[serde(alias = "target")]
    pub target_path: String,
    /// Named pure function from the fixed transform registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

// ---------------------------------------------------------------------------
// Condition Rules
// ---------------------------------------------------------------------------

/// Rules evaluated after a step settles, keyed by outcome class.
///
/// Within one class, rules are evaluated in declaration order and the first
/// match wins. No match under `success` means default dependency-driven
/// continuation; no match under `failure` falls back to the global
/// `error_handling.on_step_failure` policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConditions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure: Vec<Rule>,
}

impl StepConditions {
    pub fn is_empty(&self) -> bool {
        self.success.is_empty() && self.failure.is_empty()
    }
}

/// A condition expression plus the action taken when it matches.
///
/// The admin UI emits success rules as `{condition, next_step}` and failure
/// rules as `{condition, action}`; both spellings are accepted. An explicit
/// `next_step` always resolves to a branch target, whatever `action` says.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Boolean expression over the execution context.
    pub condition: String,
    /// Step to force-ready when the rule matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    /// Terminal action when no branch target is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RuleAction>,
}

/// Declarative action name used in rule configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    NextStep,
    Retry,
    Fail,
    CompleteWorkflow,
}

/// The resolved effect of a matched rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEffect {
    /// Force-mark the named step ready (explicit branch override).
    Goto(String),
    /// Schedule another attempt of the failed step.
    Retry,
    /// Fail the step (and consult the global failure policy).
    Fail,
    /// Mark the whole instance completed.
    CompleteWorkflow,
}

impl Rule {
    /// Resolve the configured action into an engine effect.
    ///
    /// Returns `None` for `action: next_step` with no target, which is a
    /// definition bug caught at publish time.
    pub fn effect(&self) -> Option<RuleEffect> {
        if let Some(target) = &self.next_step {
            return Some(RuleEffect::Goto(target.clone()));
        }
        match self.action {
            Some(RuleAction::Retry) => Some(RuleEffect::Retry),
            Some(RuleAction::Fail) => Some(RuleEffect::Fail),
            Some(RuleAction::CompleteWorkflow) => Some(RuleEffect::CompleteWorkflow),
            Some(RuleAction::NextStep) | None => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry configuration for a workflow step.
///
/// A step with `max_retries = N` is attempted at most `N + 1` times; the
/// delay before attempt `k + 1` is `base_delay_ms * backoff_multiplier^(k-1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (default 0: no retry).
    #[serde(default)]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay on each further retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow Config
// ---------------------------------------------------------------------------

/// Global execution configuration for a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow-level timeout in seconds (None = no limit).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Maximum concurrently running steps (None = all ready steps at once).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    /// Default retry policy for steps that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// What happens when a step exhausts retries with no matching rule.
    #[serde(default)]
    pub error_handling: ErrorHandling,
}

/// Failure handling policy for the workflow as a whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub on_step_failure: FailurePolicy,
    /// Audit tag emitted when the instance itself fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_workflow_failure: Option<String>,
}

/// What the scheduler does with an unhandled step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Mark the step failed and keep executing independent branches.
    Continue,
    /// Fail the whole instance and cancel in-flight steps.
    #[default]
    Stop,
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// How a workflow instance gets started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    /// Trigger name, unique within the definition.
    pub name: String,
    #[serde(flatten)]
    pub kind: TriggerKind,
    /// JEXL predicates over the raw payload; all must match for the trigger
    /// to start an instance. Non-matching payloads are accepted and dropped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
    /// Mappings from the external payload into the workflow input.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformation: Vec<Mapping>,
}

/// Trigger source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Started via CLI or API only.
    Manual {},
    /// Incoming webhook call.
    Webhook {
        /// Endpoint path (e.g. "/hooks/ticket-intake").
        path: String,
        /// Authentication verified before any mapping runs.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<WebhookAuth>,
    },
    /// Cron-like schedule.
    Scheduled {
        /// Cron expression or human-readable schedule string.
        schedule: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
        /// Items pulled from the external source per tick.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_size: Option<u32>,
    },
    /// Named external event class.
    Event { event_class: String },
}

/// Authentication configuration for webhook triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookAuth {
    /// HMAC-SHA256 signature over the raw body (`X-Hub-Signature-256`).
    HmacSha256 { secret: String },
    /// Bearer token in the `Authorization` header.
    BearerToken { token: String },
    /// Static key in a configurable header.
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        key: String,
    },
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build a full `WorkflowDefinition` exercising all step and trigger kinds.
    fn sample_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "ticket-triage".to_string(),
            description: Some("Classify and route incoming tickets".to_string()),
            version: 1,
            kind: WorkflowKind::Conditional,
            config: WorkflowConfig {
                timeout_secs: Some(600),
                parallelism: Some(4),
                retry_policy: Some(RetryPolicy {
                    max_retries: 2,
                    base_delay_ms: 500,
                    backoff_multiplier: 2.0,
                }),
                error_handling: ErrorHandling {
                    on_step_failure: FailurePolicy::Continue,
                    on_workflow_failure: Some("triage-failed".to_string()),
                },
            },
            triggers: vec![
                TriggerDefinition {
                    name: "intake".to_string(),
                    kind: TriggerKind::Webhook {
                        path: "/hooks/ticket-intake".to_string(),
                        auth: Some(WebhookAuth::HmacSha256 {
                            secret: "wh-secret".to_string(),
                        }),
                    },
                    filters: vec!["ticket.status == 'new'".to_string()],
                    transformation: vec![Mapping {
                        source_path: "ticket".to_string(),
                        target_path: "workflow.context.ticket".to_string(),
                        transform: None,
                    }],
                },
                TriggerDefinition {
                    name: "nightly".to_string(),
                    kind: TriggerKind::Scheduled {
                        schedule: "0 2 * * *".to_string(),
                        timezone: Some("UTC".to_string()),
                        batch_size: Some(50),
                    },
                    filters: vec![],
                    transformation: vec![],
                },
                TriggerDefinition {
                    name: "escalations".to_string(),
                    kind: TriggerKind::Event {
                        event_class: "ticket.escalated".to_string(),
                    },
                    filters: vec![],
                    transformation: vec![],
                },
                TriggerDefinition {
                    name: "manual".to_string(),
                    kind: TriggerKind::Manual {},
                    filters: vec![],
                    transformation: vec![],
                },
            ],
            steps: vec![
                StepDefinition {
                    id: "classify".to_string(),
                    name: "Classify Ticket".to_string(),
                    kind: StepKind::Agent,
                    capability_ref: Some("classifier-agent".to_string()),
                    config: json!({"model": "default"}),
                    dependencies: vec![],
                    input_mapping: vec![Mapping {
                        source_path: "workflow.context.ticket".to_string(),
                        target_path: "agent.input.ticket".to_string(),
                        transform: None,
                    }],
                    output_mapping: vec![Mapping {
                        source_path: "agent.output.category".to_string(),
                        target_path: "workflow.context.category".to_string(),
                        transform: Some("lower".to_string()),
                    }],
                    conditions: StepConditions {
                        success: vec![Rule {
                            condition: "agent.output.confidence_score >= 0.8".to_string(),
                            next_step: Some("auto-route".to_string()),
                            action: None,
                        }],
                        failure: vec![Rule {
                            condition: "true".to_string(),
                            next_step: None,
                            action: Some(RuleAction::Retry),
                        }],
                    },
                    timeout_secs: Some(60),
                    retry_policy: Some(RetryPolicy {
                        max_retries: 3,
                        base_delay_ms: 250,
                        backoff_multiplier: 1.5,
                    }),
                    body: vec![],
                },
                StepDefinition {
                    id: "auto-route".to_string(),
                    name: "Auto Route".to_string(),
                    kind: StepKind::Tool,
                    capability_ref: Some("router-tool".to_string()),
                    config: serde_json::Value::Null,
                    dependencies: vec![],
                    input_mapping: vec![],
                    output_mapping: vec![],
                    conditions: StepConditions::default(),
                    timeout_secs: None,
                    retry_policy: None,
                    body: vec![],
                },
                StepDefinition {
                    id: "quality-gate".to_string(),
                    name: "Quality Gate".to_string(),
                    kind: StepKind::Condition,
                    capability_ref: None,
                    config: serde_json::Value::Null,
                    dependencies: vec!["classify".to_string()],
                    input_mapping: vec![],
                    output_mapping: vec![],
                    conditions: StepConditions {
                        success: vec![Rule {
                            condition: "workflow.context.category == 'spam'".to_string(),
                            next_step: None,
                            action: Some(RuleAction::CompleteWorkflow),
                        }],
                        failure: vec![],
                    },
                    timeout_secs: None,
                    retry_policy: None,
                    body: vec![],
                },
                StepDefinition {
                    id: "enrich-each".to_string(),
                    name: "Enrich Each Ticket".to_string(),
                    kind: StepKind::Loop,
                    capability_ref: None,
                    config: json!({"items_path": "workflow.context.batch", "max_iterations": 25}),
                    dependencies: vec!["quality-gate".to_string()],
                    input_mapping: vec![],
                    output_mapping: vec![],
                    conditions: StepConditions::default(),
                    timeout_secs: None,
                    retry_policy: None,
                    body: vec![StepDefinition {
                        id: "enrich".to_string(),
                        name: "Enrich".to_string(),
                        kind: StepKind::Tool,
                        capability_ref: Some("enricher-tool".to_string()),
                        config: serde_json::Value::Null,
                        dependencies: vec![],
                        input_mapping: vec![Mapping {
                            source_path: "loop.item".to_string(),
                            target_path: "tool.input.ticket".to_string(),
                            transform: None,
                        }],
                        output_mapping: vec![],
                        conditions: StepConditions::default(),
                        timeout_secs: Some(15),
                        retry_policy: None,
                        body: vec![],
                    }],
                },
            ],
        }
    }

    // -----------------------------------------------------------------------
    // YAML / JSON roundtrip
    // -----------------------------------------------------------------------

    #[test]
    fn test_workflow_definition_yaml_roundtrip() {
        let original = sample_workflow();
        let yaml = serde_yaml_ng::to_string(&original).expect("serialize to YAML");

        assert!(yaml.contains("ticket-triage"));
        assert!(yaml.contains("type: conditional"));
        assert!(yaml.contains("type: webhook"));
        assert!(yaml.contains("type: scheduled"));

        let parsed: WorkflowDefinition =
            serde_yaml_ng::from_str(&yaml).expect("deserialize from YAML");
        assert_eq!(parsed.name, "ticket-triage");
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.triggers.len(), 4);
        assert_eq!(parsed.steps.len(), 4);
        assert_eq!(parsed.steps[3].body.len(), 1);
    }

    #[test]
    fn test_workflow_definition_json_roundtrip() {
        let original = sample_workflow();
        let json_str = serde_json::to_string_pretty(&original).expect("serialize to JSON");
        let parsed: WorkflowDefinition =
            serde_json::from_str(&json_str).expect("deserialize from JSON");
        assert_eq!(parsed.name, original.name);
        assert_eq!(parsed.steps.len(), original.steps.len());
        assert_eq!(parsed.triggers.len(), original.triggers.len());
    }

    // -----------------------------------------------------------------------
    // Step kinds and aliases
    // -----------------------------------------------------------------------

    #[test]
    fn test_step_kind_serde() {
        for (kind, tag) in [
            (StepKind::Agent, "\"agent\""),
            (StepKind::Tool, "\"tool\""),
            (StepKind::Condition, "\"condition\""),
            (StepKind::Loop, "\"loop\""),
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, tag);
            let parsed: StepKind = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_step_accepts_agent_id_alias() {
        let yaml = r#"
id: classify
type: agent
agent_id: classifier-agent
"#;
        let step: StepDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.capability_ref.as_deref(), Some("classifier-agent"));
        assert!(step.dependencies.is_empty());
    }

    #[test]
    fn test_step_accepts_depends_on_alias() {
        let yaml = r#"
id: route
type: tool
tool_id: router
depends_on: [classify]
"#;
        let step: StepDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.dependencies, vec!["classify"]);
    }

    // -----------------------------------------------------------------------
    // Mapping aliases
    // -----------------------------------------------------------------------

    #[test]
    fn test_mapping_accepts_short_field_names() {
        let json = r#"{"source": "a.b", "target": "c.d", "transform": "upper"}"#;
        let mapping: Mapping = serde_json::from_str(json).unwrap();
        assert_eq!(mapping.source_path, "a.b");
        assert_eq!(mapping.target_path, "c.d");
        assert_eq!(mapping.transform.as_deref(), Some("upper"));
    }

    // -----------------------------------------------------------------------
    // Rule effects
    // -----------------------------------------------------------------------

    #[test]
    fn test_rule_next_step_wins_over_action() {
        let rule = Rule {
            condition: "x > 1".to_string(),
            next_step: Some("s1".to_string()),
            action: Some(RuleAction::Fail),
        };
        assert_eq!(rule.effect(), Some(RuleEffect::Goto("s1".to_string())));
    }

    #[test]
    fn test_rule_action_effects() {
        for (action, effect) in [
            (RuleAction::Retry, RuleEffect::Retry),
            (RuleAction::Fail, RuleEffect::Fail),
            (RuleAction::CompleteWorkflow, RuleEffect::CompleteWorkflow),
        ] {
            let rule = Rule {
                condition: "true".to_string(),
                next_step: None,
                action: Some(action),
            };
            assert_eq!(rule.effect(), Some(effect));
        }
    }

    #[test]
    fn test_rule_next_step_action_without_target_is_none() {
        let rule = Rule {
            condition: "true".to_string(),
            next_step: None,
            action: Some(RuleAction::NextStep),
        };
        assert_eq!(rule.effect(), None);
    }

    #[test]
    fn test_rule_ui_shape_parses() {
        // Success rules as the admin UI emits them: condition + next_step.
        let json = r#"{"condition": "agent.output.confidence_score >= 0.8", "next_step": "s1"}"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.effect(), Some(RuleEffect::Goto("s1".to_string())));

        // Failure rules: condition + action.
        let json = r#"{"condition": "true", "action": "retry"}"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.effect(), Some(RuleEffect::Retry));
    }

    // -----------------------------------------------------------------------
    // Retry policy defaults
    // -----------------------------------------------------------------------

    #[test]
    fn test_retry_policy_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_failure_policy_default_is_stop() {
        let config: WorkflowConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.error_handling.on_step_failure, FailurePolicy::Stop);
    }

    // -----------------------------------------------------------------------
    // Trigger variants
    // -----------------------------------------------------------------------

    #[test]
    fn test_trigger_webhook_serde() {
        let trigger = TriggerDefinition {
            name: "intake".to_string(),
            kind: TriggerKind::Webhook {
                path: "/hooks/intake".to_string(),
                auth: Some(WebhookAuth::BearerToken {
                    token: "tok".to_string(),
                }),
            },
            filters: vec!["ticket.status == 'new'".to_string()],
            transformation: vec![],
        };
        let json = serde_json::to_string(&trigger).unwrap();
        assert!(json.contains("\"type\":\"webhook\""));
        assert!(json.contains("\"type\":\"bearer_token\""));
        let parsed: TriggerDefinition = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed.kind, TriggerKind::Webhook { .. }));
        assert_eq!(parsed.filters.len(), 1);
    }

    #[test]
    fn test_trigger_scheduled_serde() {
        let json = r#"{"name": "nightly", "type": "scheduled", "schedule": "every 5 minutes"}"#;
        let parsed: TriggerDefinition = serde_json::from_str(json).unwrap();
        match parsed.kind {
            TriggerKind::Scheduled {
                schedule,
                timezone,
                batch_size,
            } => {
                assert_eq!(schedule, "every 5 minutes");
                assert_eq!(timezone, None);
                assert_eq!(batch_size, None);
            }
            other => panic!("expected scheduled trigger, got {other:?}"),
        }
    }

    #[test]
    fn test_trigger_event_serde() {
        let json = r#"{"name": "esc", "type": "event", "event_class": "ticket.escalated"}"#;
        let parsed: TriggerDefinition = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed.kind, TriggerKind::Event { .. }));
    }

    #[test]
    fn test_webhook_auth_api_key_default_header() {
        let json = r#"{"type": "api_key", "key": "abc"}"#;
        let auth: WebhookAuth = serde_json::from_str(json).unwrap();
        match auth {
            WebhookAuth::ApiKey { header, key } => {
                assert_eq!(header, "x-api-key");
                assert_eq!(key, "abc");
            }
            other => panic!("expected api_key auth, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Realistic YAML parse
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_realistic_yaml_workflow() {
        let yaml = r#"
id: "01938e90-0000-7000-8000-000000000001"
name: ticket-triage
type: sequential
config:
  timeout_secs: 300
  error_handling:
    on_step_failure: continue
triggers:
  - name: intake
    type: webhook
    path: /hooks/intake
    filters:
      - ticket.status == 'new'
    transformation:
      - source: ticket
        target: workflow.context.ticket
steps:
  - id: classify
    name: Classify
    type: agent
    agent_id: classifier
    input_mapping:
      - source: workflow.context.ticket
        target: agent.input.ticket
    retry_policy:
      max_retries: 2
      base_delay_ms: 200
  - id: route
    name: Route
    type: tool
    tool_id: router
    depends_on: [classify]
"#;
        let wf: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(wf.name, "ticket-triage");
        assert_eq!(wf.kind, WorkflowKind::Sequential);
        assert_eq!(wf.config.timeout_secs, Some(300));
        assert_eq!(
            wf.config.error_handling.on_step_failure,
            FailurePolicy::Continue
        );
        assert_eq!(wf.triggers.len(), 1);
        assert_eq!(wf.steps.len(), 2);
        assert_eq!(wf.steps[1].dependencies, vec!["classify"]);
        let policy = wf.steps[0].retry_policy.as_ref().unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay_ms, 200);
        assert_eq!(policy.backoff_multiplier, 2.0);
    }
}
