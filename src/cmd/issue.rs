//! Local issue and sync commands.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use weave::sync::store::{Dependency, IssueFilter, LocalIssue, NewLocalIssue, parse_issue_id};

use super::super::{Cli, IssueCommands};
use super::{cancel_on_ctrl_c, open};

fn issue_id(raw: &str) -> Result<u64> {
    parse_issue_id(raw).with_context(|| format!("Invalid issue id '{}'", raw))
}

pub async fn cmd_issue(cli: &Cli, project_dir: &Path, command: &IssueCommands) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;

    match command {
        IssueCommands::Create {
            title,
            body,
            issue_type,
            role,
            labels,
            criteria,
            dependencies,
            deliverables,
        } => {
            let dependencies = dependencies
                .iter()
                .map(|d| d.parse::<Dependency>())
                .collect::<Result<Vec<_>>>()?;
            let issue = orchestrator.create_issue(NewLocalIssue {
                title: title.clone(),
                body: body.clone(),
                labels: labels.clone(),
                issue_type: issue_type.parse()?,
                role: role.as_deref().map(str::parse).transpose()?,
                acceptance_criteria: criteria.clone(),
                dependencies,
                deliverables: deliverables.clone(),
            })?;
            println!(
                "{} issue #{}: {}",
                style("Created").green().bold(),
                issue.id,
                issue.title
            );
            println!("  Labels: {}", issue.labels.join(", "));
            println!("  Run `weave sync` to push it to the tracker.");
        }
        IssueCommands::List {
            state,
            issue_type,
            role,
        } => {
            let filter = IssueFilter {
                state: state.as_deref().map(str::parse).transpose()?,
                issue_type: issue_type.as_deref().map(str::parse).transpose()?,
                role: role.as_deref().map(str::parse).transpose()?,
            };
            let issues = orchestrator.list_issues(&filter)?;
            if issues.is_empty() {
                println!("No issues.");
                return Ok(());
            }
            println!(
                "{:<6} {:<8} {:<8} {:<10} Title",
                "Id", "Type", "State", "Remote"
            );
            for issue in &issues {
                let remote = match issue.remote_id {
                    Some(number) => format!("#{}", number),
                    None => "unsynced".to_string(),
                };
                println!(
                    "{:<6} {:<8} {:<8} {:<10} {}",
                    issue.id,
                    issue.issue_type.as_str(),
                    issue.state.as_str(),
                    remote,
                    issue.title
                );
            }
        }
        IssueCommands::Show { id } => {
            let issue = orchestrator.show_issue(issue_id(id)?)?;
            print_issue(&issue);
        }
        IssueCommands::Close { id } => {
            let issue = orchestrator.close_issue(issue_id(id)?)?;
            println!("Closed issue #{}: {}", issue.id, issue.title);
        }
    }
    Ok(())
}

fn print_issue(issue: &LocalIssue) {
    println!(
        "{} {}",
        style(format!("#{}", issue.id)).bold().cyan(),
        style(&issue.title).bold()
    );
    println!("  Type:    {}", issue.issue_type);
    println!("  State:   {}", issue.state);
    if let Some(role) = issue.role {
        println!("  Role:    {}", role);
    }
    println!("  Labels:  {}", issue.labels.join(", "));
    match issue.remote_id {
        Some(number) => println!("  Remote:  #{} (synced)", number),
        None => println!("  Remote:  not synced"),
    }
    if !issue.body.is_empty() {
        println!();
        for line in issue.body.lines() {
            println!("  {}", line);
        }
    }
    if !issue.acceptance_criteria.is_empty() {
        println!();
        println!("  Acceptance criteria:");
        for criterion in &issue.acceptance_criteria {
            println!("    - [ ] {}", criterion);
        }
    }
    if !issue.dependencies.is_empty() {
        println!();
        println!("  Depends on:");
        for dep in &issue.dependencies {
            if dep.explanation.is_empty() {
                println!("    - #{}", dep.task_id);
            } else {
                println!("    - #{}: {}", dep.task_id, dep.explanation);
            }
        }
    }
}

pub async fn cmd_sync(cli: &Cli, project_dir: &Path) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;
    let cancel = cancel_on_ctrl_c();
    let report = orchestrator.sync_engine().sync(&cancel).await?;

    println!("{}", report);
    for (id, reason) in &report.rejected {
        println!("  {} #{}: {}", style("rejected").red(), id, reason);
    }
    if let Some(reason) = &report.unavailable {
        println!("  {} {}", style("tracker unavailable:").yellow(), reason);
    }
    Ok(())
}
