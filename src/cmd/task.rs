//! Task lifecycle commands: spawn, handoff, complete, fail, recover,
//! validate and context.

use anyhow::Result;
use console::style;
use std::path::Path;

use weave::gates::DodEvidence;
use weave::orchestrator::{RecoveryOutcome, SpawnRequest};
use weave::role::Role;

use super::super::Cli;
use super::{cancel_on_ctrl_c, open, state_style};

pub async fn cmd_spawn(
    cli: &Cli,
    project_dir: &Path,
    task_id: &str,
    role: Option<&str>,
    branch: Option<String>,
    title: Option<String>,
) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;
    let role = role.map(str::parse::<Role>).transpose()?;
    let cancel = cancel_on_ctrl_c();

    let outcome = orchestrator
        .spawn(
            SpawnRequest {
                task_id: task_id.to_string(),
                role,
                branch,
                title,
            },
            &cancel,
        )
        .await?;

    let ctx = &outcome.context;
    println!(
        "{} task {} as {}",
        style("Spawned").green().bold(),
        ctx.task_id,
        ctx.role
    );
    if let (Some(path), Some(branch)) = (&ctx.workspace_path, &ctx.branch) {
        println!("  Workspace: {}", path.display());
        println!("  Branch:    {}", branch);
    }
    println!(
        "  Context:   {} ({} tokens)",
        outcome.artifact.path.display(),
        outcome.artifact.tokens()
    );
    if outcome.artifact.oversized() {
        println!(
            "  {} context is above the soft ceiling of {} tokens",
            style("⚠").yellow(),
            outcome.artifact.meta.soft_limit
        );
    }
    if !outcome.artifact.meta.missing_sections.is_empty() {
        println!(
            "  {} no knowledge document for: {}",
            style("⚠").yellow(),
            outcome.artifact.meta.missing_sections.join(", ")
        );
    }
    Ok(())
}

pub async fn cmd_handoff(
    cli: &Cli,
    project_dir: &Path,
    task_id: &str,
    evidence: &[String],
) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;
    let evidence = DodEvidence::parse_items(evidence)?;

    let (ctx, evaluation) = orchestrator.handoff(task_id, &evidence).await?;
    println!(
        "Task {} is now {} ({})",
        ctx.task_id,
        state_style(ctx.state),
        evaluation.summary()
    );
    for (criterion, satisfied) in evaluation.checklist() {
        let mark = if satisfied {
            style("✓").green()
        } else {
            style("✗").red()
        };
        println!("  {} {}", mark, criterion);
    }
    Ok(())
}

pub async fn cmd_complete(cli: &Cli, project_dir: &Path, task_id: &str, force: bool) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;
    let outcome = orchestrator.complete(task_id, force).await?;

    println!(
        "{} task {}",
        style("Completed").green().bold(),
        outcome.context.task_id
    );
    println!("  Certificate: {}", outcome.certificate_path.display());
    if !outcome.released {
        println!(
            "  {} workspace was not removed; run `weave recover {}` to remove it",
            style("⚠").yellow(),
            task_id
        );
    }
    Ok(())
}

pub async fn cmd_fail(
    cli: &Cli,
    project_dir: &Path,
    task_id: &str,
    reason: &str,
    force: bool,
) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;
    let ctx = orchestrator.fail(task_id, reason, force).await?;
    println!("Task {} is now {}: {}", ctx.task_id, state_style(ctx.state), reason);
    if ctx.workspace_path.as_deref().is_some_and(Path::is_dir) {
        println!(
            "  {} workspace was not removed; run `weave recover {}` to remove it",
            style("⚠").yellow(),
            task_id
        );
    }
    Ok(())
}

pub async fn cmd_recover(cli: &Cli, project_dir: &Path, task_id: &str) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;
    match orchestrator.recover(task_id).await? {
        RecoveryOutcome::Healthy => {
            println!("Task {} is consistent; nothing to do.", task_id);
        }
        RecoveryOutcome::Repaired(action) => {
            println!("{} task {}: {}", style("Repaired").green().bold(), task_id, action);
        }
    }
    Ok(())
}

pub async fn cmd_validate(cli: &Cli, project_dir: &Path, task_id: &str) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;
    let report = orchestrator.validate(task_id).await?;

    if !report.quality.is_empty() {
        println!("Task quality:");
        print_checks(&report.quality);
    }
    println!("Pre-execution:");
    print_checks(&report.pre_execution);

    if !report.passed() {
        anyhow::bail!(
            "{} check(s) failed for task {}",
            report.failures().len(),
            task_id
        );
    }
    println!("All checks passed.");
    Ok(())
}

fn print_checks(checks: &[weave::gates::CheckResult]) {
    for check in checks {
        if check.passed {
            println!("  {} {}", style("✓").green(), check.name);
        } else {
            println!("  {} {}", style("✗").red(), check.name);
            if let Some(fix) = &check.remediation {
                println!("      {}", style(fix).dim());
            }
        }
    }
}

pub fn cmd_context(cli: &Cli, project_dir: &Path, task_id: &str) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;
    let artifact = orchestrator.context(task_id)?;
    println!(
        "Context for task {} written to {}",
        task_id,
        artifact.path.display()
    );
    println!(
        "  Role: {}  Tokens: {}  Sections: {}",
        artifact.meta.role,
        artifact.tokens(),
        artifact.meta.sections.join(", ")
    );
    if artifact.oversized() {
        println!(
            "  {} above the soft ceiling of {} tokens",
            style("⚠").yellow(),
            artifact.meta.soft_limit
        );
    }
    Ok(())
}
