//! Workflow definition CLI commands: validate, register, list.

use std::path::Path;

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use weave_core::store::ExecutionStore;
use weave_types::workflow::TriggerKind;

use crate::state::AppState;

/// Validate a definition file and report problems without touching the
/// store.
pub async fn validate_workflow(file: &str, json: bool) -> Result<()> {
    let definition = weave_core::definition::load_file(Path::new(file))?;
    weave_core::definition::validate(&definition)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "name": definition.name,
                "version": definition.version,
                "steps": definition.steps.len(),
                "valid": true,
            }))?
        );
        return Ok(());
    }

    println!(
        "  {} {} v{} is valid ({} steps, {} triggers)",
        style("✓").green().bold(),
        style(&definition.name).cyan(),
        definition.version,
        definition.steps.len(),
        definition.triggers.len(),
    );
    Ok(())
}

/// Register a definition file: validate, persist, and wire triggers.
pub async fn register_workflow(state: &AppState, file: &str, json: bool) -> Result<()> {
    let definition = weave_core::definition::load_file(Path::new(file))?;
    weave_core::definition::validate(&definition)?;
    state.store.save_definition(&definition).await?;
    state.register(definition.clone());

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "id": definition.id,
                "name": definition.name,
                "version": definition.version,
            }))?
        );
        return Ok(());
    }

    println!(
        "  {} Registered {} v{}",
        style("✓").green().bold(),
        style(&definition.name).cyan(),
        definition.version,
    );
    for trigger in &definition.triggers {
        match &trigger.kind {
            TriggerKind::Webhook { path, .. } => {
                println!("    webhook  POST {path}");
            }
            TriggerKind::Scheduled { schedule, .. } => {
                println!("    schedule {schedule}");
            }
            TriggerKind::Event { event_class } => {
                println!("    event    {event_class}");
            }
            TriggerKind::Manual {} => {
                println!("    manual");
            }
        }
    }
    Ok(())
}

/// List registered workflow definitions.
pub async fn list_workflows(state: &AppState, json: bool) -> Result<()> {
    let definitions = state.store.list_definitions().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&definitions)?);
        return Ok(());
    }

    if definitions.is_empty() {
        println!("  No workflows registered. Try `weave register <file>`.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_BORDERS_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Version").fg(Color::Cyan),
            Cell::new("Steps").fg(Color::Cyan),
            Cell::new("Triggers").fg(Color::Cyan),
            Cell::new("Description").fg(Color::Cyan),
        ]);

    for d in &definitions {
        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(d.version),
            Cell::new(d.steps.len()),
            Cell::new(d.triggers.len()),
            Cell::new(d.description.as_deref().unwrap_or("-")),
        ]);
    }

    println!("{table}");
    Ok(())
}
