//! Execution instance CLI commands: run, list, show, cancel.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use weave_core::store::ExecutionStore;
use weave_types::instance::{InstanceStatus, StepStatus};

use crate::state::AppState;

/// Run a workflow by name and block until it reaches a terminal state.
pub async fn run_workflow(
    state: &AppState,
    name: &str,
    payload: Option<&str>,
    json: bool,
) -> Result<()> {
    let payload = match payload {
        Some(raw) => serde_json::from_str(raw)?,
        None => serde_json::json!({}),
    };
    let definition = state
        .store
        .get_definition_by_name(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no workflow named '{name}'"))?;

    let instance = state
        .scheduler
        .run_to_completion(definition, "manual", payload, None, serde_json::json!({}))
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
        return Ok(());
    }

    println!(
        "  {} Instance {} finished: {}",
        status_mark(&instance.status),
        style(instance.instance_id).dim(),
        format_status(&instance.status),
    );
    for (step_id, record) in &instance.step_records {
        println!(
            "    {: <24} {}  attempts: {}",
            step_id,
            format_step_status(&record.status),
            record.attempt_count,
        );
    }
    if let Some(error) = &instance.error {
        println!("  {} {error}", style("error:").red().bold());
    }
    Ok(())
}

/// List execution instances, newest first.
pub async fn list_instances(
    state: &AppState,
    workflow: Option<&str>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let definition_id = match workflow {
        Some(name) => {
            let definition = state
                .store
                .get_definition_by_name(name)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no workflow named '{name}'"))?;
            Some(definition.id)
        }
        None => None,
    };
    let instances = state.store.list_instances(definition_id, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!("  No instances found.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_BORDERS_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::Cyan),
            Cell::new("Workflow").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Trigger").fg(Color::Cyan),
            Cell::new("Started").fg(Color::Cyan),
        ]);

    for i in &instances {
        table.add_row(vec![
            Cell::new(i.instance_id),
            Cell::new(&i.workflow_name),
            status_cell(&i.status),
            Cell::new(&i.trigger_type),
            Cell::new(i.started_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!("{table}");
    Ok(())
}

/// Show full state of one instance including step records.
pub async fn show_instance(state: &AppState, id: &str, json: bool) -> Result<()> {
    let instance_id: Uuid = id.parse()?;
    let instance = state
        .store
        .load_instance(&instance_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no instance with id '{id}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instance)?);
        return Ok(());
    }

    println!();
    println!(
        "  {}  {}",
        style("Workflow:").bold(),
        style(&instance.workflow_name).cyan()
    );
    println!("  {}  {}", style("Instance:").bold(), instance.instance_id);
    println!(
        "  {}  {}",
        style("Status:").bold(),
        format_status(&instance.status)
    );
    println!("  {}  {}", style("Trigger:").bold(), instance.trigger_type);
    println!("  {}  {}", style("Started:").bold(), instance.started_at);
    if let Some(ended) = instance.ended_at {
        println!("  {}  {ended}", style("Ended:").bold());
    }
    if let Some(error) = &instance.error {
        println!("  {}  {}", style("Error:").bold(), style(error).red());
    }

    if !instance.step_records.is_empty() {
        println!();
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_BORDERS_ONLY)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Status").fg(Color::Cyan),
                Cell::new("Attempts").fg(Color::Cyan),
                Cell::new("Error").fg(Color::Cyan),
            ]);
        for (step_id, record) in &instance.step_records {
            table.add_row(vec![
                Cell::new(step_id),
                step_status_cell(&record.status),
                Cell::new(record.attempt_count),
                Cell::new(
                    record
                        .last_error
                        .as_ref()
                        .map(|e| e.message.as_str())
                        .unwrap_or("-"),
                ),
            ]);
        }
        println!("{table}");
    }
    Ok(())
}

/// Request cancellation of a running instance.
pub async fn cancel_instance(state: &AppState, id: &str, json: bool) -> Result<()> {
    let instance_id: Uuid = id.parse()?;
    state.scheduler.cancel(&instance_id).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "instance_id": instance_id,
                "cancellation": "requested",
            }))?
        );
        return Ok(());
    }

    println!(
        "  {} Cancellation requested for {}",
        style("✓").green().bold(),
        style(instance_id).dim(),
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn format_status(status: &InstanceStatus) -> String {
    match status {
        InstanceStatus::Pending => style("pending").dim().to_string(),
        InstanceStatus::Running => style("running").yellow().to_string(),
        InstanceStatus::Completed => style("completed").green().to_string(),
        InstanceStatus::Failed => style("failed").red().to_string(),
        InstanceStatus::Cancelled => style("cancelled").magenta().to_string(),
    }
}

fn status_mark(status: &InstanceStatus) -> String {
    match status {
        InstanceStatus::Completed => style("✓").green().bold().to_string(),
        InstanceStatus::Failed => style("✗").red().bold().to_string(),
        _ => style("•").yellow().to_string(),
    }
}

fn status_cell(status: &InstanceStatus) -> Cell {
    let color = match status {
        InstanceStatus::Pending => Color::Grey,
        InstanceStatus::Running => Color::Yellow,
        InstanceStatus::Completed => Color::Green,
        InstanceStatus::Failed => Color::Red,
        InstanceStatus::Cancelled => Color::Magenta,
    };
    Cell::new(format!("{status:?}").to_lowercase()).fg(color)
}

fn format_step_status(status: &StepStatus) -> String {
    match status {
        StepStatus::Pending | StepStatus::Ready => style("pending").dim().to_string(),
        StepStatus::Running => style("running").yellow().to_string(),
        StepStatus::Succeeded => style("succeeded").green().to_string(),
        StepStatus::Failed => style("failed").red().to_string(),
        StepStatus::Skipped => style("skipped").dim().to_string(),
    }
}

fn step_status_cell(status: &StepStatus) -> Cell {
    let color = match status {
        StepStatus::Pending | StepStatus::Ready => Color::Grey,
        StepStatus::Running => Color::Yellow,
        StepStatus::Succeeded => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
    };
    Cell::new(format!("{status:?}").to_lowercase()).fg(color)
}
