//! Workflow definition loading and publish-time validation.
//!
//! Definitions arrive as YAML or JSON documents. Everything that can
//! be rejected statically is rejected here, before a definition is
//! saved: graph problems, missing capability references, unknown
//! transforms, dead-end rules, and unusable trigger configuration.
//! The scheduler can then assume a compiled definition is well-formed.

use std::collections::HashSet;
use std::path::Path;

use weave_types::workflow::{
    StepDefinition, StepKind, TriggerKind, WorkflowDefinition,
};

use crate::cron::normalize_schedule;
use crate::graph::{CompiledGraph, GraphError};
use crate::path::is_known_transform;

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to parse workflow definition: {0}")]
    Parse(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("invalid workflow definition: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse a YAML definition document.
pub fn from_yaml(source: &str) -> Result<WorkflowDefinition, DefinitionError> {
    serde_yaml_ng::from_str(source).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Parse a JSON definition document.
pub fn from_json(source: &str) -> Result<WorkflowDefinition, DefinitionError> {
    serde_json::from_str(source).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Load and validate a definition file, dispatching on extension.
pub fn load_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let source = std::fs::read_to_string(path)?;
    let definition = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => from_json(&source)?,
        _ => from_yaml(&source)?,
    };
    validate(&definition)?;
    Ok(definition)
}

/// Scan a directory for `.yaml` / `.yml` / `.json` definition files.
/// Files that fail to parse or validate are skipped with a warning so
/// one broken definition cannot block startup.
pub fn discover(dir: &Path) -> Result<Vec<WorkflowDefinition>, DefinitionError> {
    let mut found = Vec::new();
    if !dir.is_dir() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let ext = path.extension().and_then(|e| e.to_str());
        if !matches!(ext, Some("yaml") | Some("yml") | Some("json")) {
            continue;
        }
        match load_file(&path) {
            Ok(definition) => found.push(definition),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping workflow definition");
            }
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

/// Validate a definition for publication. Returns the compiled graph's
/// errors for topology problems and [`DefinitionError::Invalid`] for
/// everything else.
pub fn validate(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if definition.name.trim().is_empty() {
        return Err(DefinitionError::Invalid("workflow name is empty".into()));
    }
    if definition.version == 0 {
        return Err(DefinitionError::Invalid(
            "workflow version must be at least 1".into(),
        ));
    }
    if let Some(parallelism) = definition.config.parallelism
        && parallelism == 0
    {
        return Err(DefinitionError::Invalid(
            "config.parallelism must be at least 1".into(),
        ));
    }
    if definition.config.timeout_secs == Some(0) {
        return Err(DefinitionError::Invalid(
            "config.timeout_secs must be at least 1".into(),
        ));
    }

    CompiledGraph::compile(definition)?;

    // The graph rejects duplicate top-level ids; loop body steps live
    // outside the graph, so their ids are checked against the top level
    // and each other here.
    let mut seen: HashSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &definition.steps {
        for body_step in &step.body {
            if !seen.insert(body_step.id.as_str()) {
                return Err(DefinitionError::Invalid(format!(
                    "duplicate step id '{}' in loop '{}'",
                    body_step.id, step.id
                )));
            }
        }
    }

    for step in &definition.steps {
        validate_step(step, false)?;
    }

    for trigger in &definition.triggers {
        validate_trigger(trigger)?;
    }

    Ok(())
}

fn validate_step(step: &StepDefinition, in_loop_body: bool) -> Result<(), DefinitionError> {
    match step.kind {
        StepKind::Agent | StepKind::Tool => {
            if step.capability_ref.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(DefinitionError::Invalid(format!(
                    "step '{}' needs a capability reference",
                    step.id
                )));
            }
        }
        StepKind::Condition => {
            if step.conditions.success.is_empty() {
                return Err(DefinitionError::Invalid(format!(
                    "condition step '{}' has no rules",
                    step.id
                )));
            }
        }
        StepKind::Loop => {
            if in_loop_body {
                return Err(DefinitionError::Invalid(format!(
                    "loop step '{}' may not appear inside another loop body",
                    step.id
                )));
            }
            if step.body.is_empty() {
                return Err(DefinitionError::Invalid(format!(
                    "loop step '{}' has an empty body",
                    step.id
                )));
            }
            if step
                .config
                .get("items_path")
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
            {
                return Err(DefinitionError::Invalid(format!(
                    "loop step '{}' needs config.items_path",
                    step.id
                )));
            }
            for body_step in &step.body {
                validate_step(body_step, true)?;
            }
        }
    }

    if step.timeout_secs == Some(0) {
        return Err(DefinitionError::Invalid(format!(
            "step '{}' has a zero timeout",
            step.id
        )));
    }

    for mapping in step.input_mapping.iter().chain(step.output_mapping.iter()) {
        if let Some(transform) = &mapping.transform
            && !is_known_transform(transform)
        {
            return Err(DefinitionError::Invalid(format!(
                "step '{}' uses unknown transform '{transform}'",
                step.id
            )));
        }
        crate::path::parse_path(&mapping.source_path)
            .and_then(|_| crate::path::parse_path(&mapping.target_path))
            .map_err(|e| DefinitionError::Invalid(format!("step '{}': {e}", step.id)))?;
    }

    for rule in step
        .conditions
        .success
        .iter()
        .chain(step.conditions.failure.iter())
    {
        if rule.condition.trim().is_empty() {
            return Err(DefinitionError::Invalid(format!(
                "step '{}' has a rule with an empty condition",
                step.id
            )));
        }
        if rule.effect().is_none() {
            return Err(DefinitionError::Invalid(format!(
                "step '{}' has a next_step rule without a target",
                step.id
            )));
        }
    }

    Ok(())
}

fn validate_trigger(
    trigger: &weave_types::workflow::TriggerDefinition,
) -> Result<(), DefinitionError> {
    match &trigger.kind {
        TriggerKind::Manual {} => {}
        TriggerKind::Webhook { path, .. } => {
            if !path.starts_with('/') {
                return Err(DefinitionError::Invalid(format!(
                    "webhook trigger '{}' path must start with '/'",
                    trigger.name
                )));
            }
        }
        TriggerKind::Scheduled { schedule, .. } => {
            normalize_schedule(schedule).map_err(|e| {
                DefinitionError::Invalid(format!(
                    "scheduled trigger '{}': {e}",
                    trigger.name
                ))
            })?;
        }
        TriggerKind::Event { event_class } => {
            if event_class.trim().is_empty() {
                return Err(DefinitionError::Invalid(format!(
                    "event trigger '{}' has an empty event class",
                    trigger.name
                )));
            }
        }
    }

    for filter in &trigger.filters {
        if filter.trim().is_empty() {
            return Err(DefinitionError::Invalid(format!(
                "trigger '{}' has an empty filter expression",
                trigger.name
            )));
        }
    }

    for mapping in &trigger.transformation {
        crate::path::parse_path(&mapping.source_path)
            .and_then(|_| crate::path::parse_path(&mapping.target_path))
            .map_err(|e| {
                DefinitionError::Invalid(format!("trigger '{}': {e}", trigger.name))
            })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const TRIAGE_YAML: &str = r#"
id: 01936bcd-9f70-7000-8000-000000000001
name: ticket-triage
type: conditional
config:
  parallelism: 4
  error_handling:
    on_step_failure: stop
triggers:
  - name: on-new-ticket
    type: webhook
    path: /hooks/tickets
    filters:
      - "ticket.status == 'new'"
    transformation:
      - source: ticket
        target: workflow.context.ticket
steps:
  - id: classify
    name: Classify Ticket
    type: agent
    agent_id: classifier
    input_mapping:
      - source: workflow.context.ticket
        target: agent.input.ticket
    conditions:
      success:
        - condition: "agent.output.confidence_score >= 0.8"
          next_step: auto_reply
        - condition: "true"
          next_step: escalate
  - id: auto_reply
    name: Auto Reply
    type: tool
    tool_id: replier
  - id: escalate
    name: Escalate
    type: tool
    tool_id: escalator
"#;

    #[test]
    fn parses_and_validates_realistic_yaml() {
        let definition = from_yaml(TRIAGE_YAML).unwrap();
        assert_eq!(definition.name, "ticket-triage");
        assert_eq!(definition.steps.len(), 3);
        validate(&definition).unwrap();
    }

    #[test]
    fn rejects_missing_capability_ref() {
        let mut definition = from_yaml(TRIAGE_YAML).unwrap();
        definition.steps[1].capability_ref = None;
        let err = validate(&definition).unwrap_err();
        assert!(err.to_string().contains("capability reference"), "{err}");
    }

    #[test]
    fn rejects_cycles_through_graph_compile() {
        let mut definition = from_yaml(TRIAGE_YAML).unwrap();
        definition.steps[0].dependencies = vec!["escalate".to_string()];
        definition.steps[2].dependencies = vec!["classify".to_string()];
        let err = validate(&definition).unwrap_err();
        assert!(err.to_string().contains("cycle detected"), "{err}");
    }

    #[test]
    fn rejects_unknown_transform() {
        let mut definition = from_yaml(TRIAGE_YAML).unwrap();
        definition.steps[0].input_mapping[0].transform = Some("reverse".to_string());
        let err = validate(&definition).unwrap_err();
        assert!(err.to_string().contains("unknown transform"), "{err}");
    }

    #[test]
    fn rejects_dead_end_rule() {
        let mut definition = from_yaml(TRIAGE_YAML).unwrap();
        definition.steps[0].conditions.success[0].next_step = None;
        let err = validate(&definition).unwrap_err();
        assert!(err.to_string().contains("without a target"), "{err}");
    }

    #[test]
    fn rejects_zero_parallelism_and_zero_timeouts() {
        let mut definition = from_yaml(TRIAGE_YAML).unwrap();
        definition.config.parallelism = Some(0);
        assert!(validate(&definition).is_err());

        let mut definition = from_yaml(TRIAGE_YAML).unwrap();
        definition.steps[0].timeout_secs = Some(0);
        assert!(validate(&definition).is_err());
    }

    #[test]
    fn rejects_bad_webhook_path() {
        let mut definition = from_yaml(TRIAGE_YAML).unwrap();
        if let TriggerKind::Webhook { path, .. } = &mut definition.triggers[0].kind {
            *path = "tickets".to_string();
        }
        let err = validate(&definition).unwrap_err();
        assert!(err.to_string().contains("start with '/'"), "{err}");
    }

    #[test]
    fn rejects_nested_loops_and_empty_bodies() {
        let yaml = r#"
name: batch
type: sequential
steps:
  - id: fan_out
    name: Fan Out
    type: loop
    config:
      items_path: workflow.context.batch
    body: []
"#;
        let definition = from_yaml(yaml).unwrap();
        let err = validate(&definition).unwrap_err();
        assert!(err.to_string().contains("empty body"), "{err}");
    }

    #[test]
    fn rejects_duplicate_ids_inside_loop_bodies() {
        let yaml = r#"
name: batch
type: sequential
steps:
  - id: fan_out
    name: Fan Out
    type: loop
    config:
      items_path: workflow.context.batch
    body:
      - id: process
        name: Process
        type: tool
        tool_id: worker
      - id: process
        name: Process Again
        type: tool
        tool_id: worker
"#;
        let definition = from_yaml(yaml).unwrap();
        let err = validate(&definition).unwrap_err();
        assert!(err.to_string().contains("duplicate step id 'process'"), "{err}");
    }

    #[test]
    fn rejects_body_id_colliding_with_top_level_step() {
        let yaml = r#"
name: batch
type: sequential
steps:
  - id: collect
    name: Collect
    type: tool
    tool_id: collector
  - id: fan_out
    name: Fan Out
    type: loop
    dependencies: [collect]
    config:
      items_path: workflow.context.batch
    body:
      - id: collect
        name: Shadowing
        type: tool
        tool_id: worker
"#;
        let definition = from_yaml(yaml).unwrap();
        let err = validate(&definition).unwrap_err();
        assert!(err.to_string().contains("duplicate step id 'collect'"), "{err}");
    }

    #[test]
    fn discover_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.yaml"), TRIAGE_YAML).unwrap();
        let mut bad = std::fs::File::create(dir.path().join("bad.yaml")).unwrap();
        writeln!(bad, "steps: [this is not a definition").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "ticket-triage");
    }

    #[test]
    fn load_file_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let definition = from_yaml(TRIAGE_YAML).unwrap();
        let json_path = dir.path().join("triage.json");
        std::fs::write(&json_path, serde_json::to_string(&definition).unwrap()).unwrap();

        let loaded = load_file(&json_path).unwrap();
        assert_eq!(loaded.name, "ticket-triage");
    }
}
