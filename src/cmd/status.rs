//! Listing, status and health commands.

use anyhow::Result;
use chrono::Utc;
use console::style;
use std::path::Path;

use super::super::Cli;
use super::{open, state_style};

pub fn cmd_list(cli: &Cli, project_dir: &Path, all: bool) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;
    let contexts = orchestrator.list(all);

    if contexts.is_empty() {
        println!();
        println!("No execution contexts. Run 'weave spawn <task-id>' to start one.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<12} {:<10} {:<17} {:<24} Title",
        "Task", "Role", "State", "Branch"
    );
    println!(
        "{:<12} {:<10} {:<17} {:<24} -----",
        "------------", "----------", "-----------------", "------------------------"
    );
    for ctx in &contexts {
        println!(
            "{:<12} {:<10} {:<17} {:<24} {}",
            ctx.task_id,
            ctx.role.as_str(),
            state_style(ctx.state).to_string(),
            ctx.branch.as_deref().unwrap_or("-"),
            ctx.title.as_deref().unwrap_or("")
        );
    }
    println!();
    println!("{} context(s)", contexts.len());
    Ok(())
}

pub async fn cmd_status(
    cli: &Cli,
    project_dir: &Path,
    task_id: Option<&str>,
    json: bool,
) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;
    let entries = orchestrator.status(task_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No active contexts.");
        return Ok(());
    }

    for entry in &entries {
        let ctx = &entry.context;
        println!();
        println!(
            "{} {} ({})",
            style(format!("Task {}", ctx.task_id)).bold().cyan(),
            state_style(ctx.state),
            ctx.role
        );
        if let Some(title) = &ctx.title {
            println!("  Title:      {}", title);
        }
        match (&ctx.workspace_path, &ctx.branch) {
            (Some(path), Some(branch)) => {
                let marker = if entry.workspace_present {
                    style("present").green()
                } else {
                    style("missing").red()
                };
                println!("  Workspace:  {} ({})", path.display(), marker);
                println!("  Branch:     {}", branch);
            }
            _ => println!("  Workspace:  none"),
        }
        if let Some(note) = &entry.note {
            println!("  Branch note: {} as {}", note.status, note.role);
        }
        println!(
            "  Activity:   {} commit(s), {} file(s) changed",
            ctx.metrics.commit_count, ctx.metrics.files_changed
        );
        let idle = format!(
            "{:.1}h idle (threshold {}h)",
            entry.idle_hours, entry.threshold_hours
        );
        if entry.idle_hours > entry.threshold_hours as f64 {
            println!("  Last seen:  {}", style(idle).red());
        } else {
            println!("  Last seen:  {}", idle);
        }
        if !ctx.validation_failures.is_empty() {
            println!("  Validation failures:");
            for failure in &ctx.validation_failures {
                println!("    - {}", style(failure).yellow());
            }
        }
        if let Some(error) = ctx.errors.last() {
            println!("  Last error: {}", style(error).red());
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_health(cli: &Cli, project_dir: &Path, escalate: bool) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;
    let monitor = orchestrator.health_monitor();

    if escalate {
        let reports = monitor.scan().await?;
        if reports.is_empty() {
            println!("No new stuck contexts.");
        }
        for report in &reports {
            println!("{} {}", style("Escalated").red().bold(), report);
        }
        return Ok(());
    }

    let records = monitor.check(Utc::now()).await?;
    if records.is_empty() {
        println!("No active contexts.");
        return Ok(());
    }
    for record in &records {
        let line = format!(
            "{:<12} {:<10} {:>7.1}h / {}h",
            record.task_id,
            record.role.as_str(),
            record.idle_hours,
            record.threshold_hours
        );
        if record.is_stuck() {
            let tag = if record.escalated { "stuck (escalated)" } else { "stuck" };
            println!("{}  {}", line, style(tag).red());
        } else {
            println!("{}  {}", line, style("ok").green());
        }
    }
    Ok(())
}
