use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use weave::config::{Config, WEAVE_DIR};
use weave::errors::OrchestrationError;

mod cmd;

#[derive(Parser)]
#[command(name = "weave")]
#[command(
    version,
    about = "SubAgent orchestrator: isolated worktrees, audited lifecycle, offline issue sync"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the .weave state directory
    Init,
    /// Assemble context, allocate a workspace and activate a task
    Spawn {
        task_id: String,
        /// pm, architect, engineer, reviewer or ux (default: derived from the issue)
        #[arg(short, long)]
        role: Option<String>,
        /// Branch for the workspace (default: task-<task id>)
        #[arg(short, long)]
        branch: Option<String>,
        #[arg(short, long)]
        title: Option<String>,
    },
    /// List execution contexts
    List {
        /// Include completed and failed contexts
        #[arg(short, long)]
        all: bool,
    },
    /// Show live status of one task or all active ones
    Status {
        task_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Reconcile workspace, branch and registry for a task, or remove the
    /// workspace a finished task left behind
    Recover { task_id: String },
    /// Submit Definition of Done evidence and move to awaiting handoff
    Handoff {
        task_id: String,
        /// Criterion, or criterion=true|false (repeatable)
        #[arg(short, long = "evidence")]
        evidence: Vec<String>,
    },
    /// Complete a handed-off task and release its workspace
    Complete {
        task_id: String,
        /// Discard uncommitted or unpushed work in the workspace
        #[arg(long)]
        force: bool,
    },
    /// Mark a task as failed and release its workspace
    Fail {
        task_id: String,
        #[arg(short, long)]
        reason: String,
        /// Discard uncommitted or unpushed work in the workspace
        #[arg(long)]
        force: bool,
    },
    /// Run task-quality and pre-execution checks
    Validate { task_id: String },
    /// Regenerate the context artifact of a task
    Context { task_id: String },
    /// Reconcile local issues with the remote tracker
    Sync,
    /// Manage local issues
    Issue {
        #[command(subcommand)]
        command: IssueCommands,
    },
    /// Report idle contexts
    Health {
        /// Escalate new breaches (audited)
        #[arg(long)]
        escalate: bool,
    },
    /// Inspect the audit log
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Run the health monitor and sync loops until Ctrl-C
    Daemon,
}

#[derive(Subcommand, Clone)]
pub enum IssueCommands {
    /// Create a local issue
    Create {
        title: String,
        #[arg(short, long, default_value = "")]
        body: String,
        /// epic, feature, story, bug, spike or docs
        #[arg(short = 't', long = "type", default_value = "story")]
        issue_type: String,
        #[arg(short, long)]
        role: Option<String>,
        /// Repeatable
        #[arg(short, long = "label")]
        labels: Vec<String>,
        /// Repeatable
        #[arg(short, long = "criterion")]
        criteria: Vec<String>,
        /// "#12: reason" (repeatable)
        #[arg(short, long = "depends-on")]
        dependencies: Vec<String>,
        /// Path of a prior deliverable (repeatable)
        #[arg(long = "deliverable")]
        deliverables: Vec<String>,
    },
    /// List local issues
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(short = 't', long = "type")]
        issue_type: Option<String>,
        #[arg(short, long)]
        role: Option<String>,
    },
    /// Show a local issue
    Show { id: String },
    /// Close a local issue
    Close { id: String },
}

#[derive(Subcommand, Clone)]
pub enum AuditCommands {
    /// Verify the hash chain
    Verify,
    /// Show the most recent entries
    Show {
        #[arg(short, long)]
        task: Option<String>,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => report(&err),
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let log_dir = Config::is_initialized(&project_dir).then(|| project_dir.join(WEAVE_DIR).join("logs"));
    let _guard = weave::logging::init(cli.verbose, log_dir.as_deref());

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir),
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone()),
        Commands::Audit { command } => cmd::cmd_audit(&cmd::load_config(&cli, &project_dir)?, command),
        Commands::Issue { command } => cmd::cmd_issue(&cli, &project_dir, command).await,
        Commands::Spawn {
            task_id,
            role,
            branch,
            title,
        } => {
            cmd::cmd_spawn(
                &cli,
                &project_dir,
                task_id,
                role.as_deref(),
                branch.clone(),
                title.clone(),
            )
            .await
        }
        Commands::List { all } => cmd::cmd_list(&cli, &project_dir, *all),
        Commands::Status { task_id, json } => {
            cmd::cmd_status(&cli, &project_dir, task_id.as_deref(), *json).await
        }
        Commands::Recover { task_id } => cmd::cmd_recover(&cli, &project_dir, task_id).await,
        Commands::Handoff { task_id, evidence } => {
            cmd::cmd_handoff(&cli, &project_dir, task_id, evidence).await
        }
        Commands::Complete { task_id, force } => {
            cmd::cmd_complete(&cli, &project_dir, task_id, *force).await
        }
        Commands::Fail {
            task_id,
            reason,
            force,
        } => cmd::cmd_fail(&cli, &project_dir, task_id, reason, *force).await,
        Commands::Validate { task_id } => cmd::cmd_validate(&cli, &project_dir, task_id).await,
        Commands::Context { task_id } => cmd::cmd_context(&cli, &project_dir, task_id),
        Commands::Sync => cmd::cmd_sync(&cli, &project_dir).await,
        Commands::Health { escalate } => cmd::cmd_health(&cli, &project_dir, *escalate).await,
        Commands::Daemon => cmd::cmd_daemon(&cli, &project_dir).await,
    }
}

/// Print the failure and pick the exit code: 2 when a human has to step in,
/// 1 otherwise.
fn report(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<OrchestrationError>() {
        Some(e) => {
            eprintln!(
                "{} {}",
                console::style(format!("error[{}]:", e.kind())).red().bold(),
                e
            );
            e.exit_code()
        }
        None => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), err);
            1
        }
    }
}
