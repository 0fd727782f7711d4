//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                                             |
//! |-----------|--------------------------------------------------------------|
//! | `project` | `Init`                                                       |
//! | `config`  | `Config`                                                     |
//! | `task`    | `Spawn`, `Handoff`, `Complete`, `Fail`, `Recover`, `Validate`, `Context` |
//! | `status`  | `List`, `Status`, `Health`                                   |
//! | `issue`   | `Issue`, `Sync`                                              |
//! | `audit`   | `Audit`                                                      |
//! | `daemon`  | `Daemon`                                                     |

pub mod audit;
pub mod config;
pub mod daemon;
pub mod issue;
pub mod project;
pub mod status;
pub mod task;

pub use audit::cmd_audit;
pub use config::cmd_config;
pub use daemon::cmd_daemon;
pub use issue::{cmd_issue, cmd_sync};
pub use project::cmd_init;
pub use status::{cmd_health, cmd_list, cmd_status};
pub use task::{
    cmd_complete, cmd_context, cmd_fail, cmd_handoff, cmd_recover, cmd_spawn, cmd_validate,
};

use anyhow::Result;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use weave::config::Config;
use weave::orchestrator::Orchestrator;

use super::Cli;

/// Runtime configuration of an initialised project.
pub fn load_config(cli: &Cli, project_dir: &Path) -> Result<Config> {
    if !Config::is_initialized(project_dir) {
        anyhow::bail!(
            "No .weave directory found in {}. Run 'weave init' first.",
            project_dir.display()
        );
    }
    Config::new(project_dir.to_path_buf(), cli.verbose)
}

pub fn open(cli: &Cli, project_dir: &Path) -> Result<Orchestrator> {
    let config = load_config(cli, project_dir)?;
    config.ensure_directories()?;
    Ok(Orchestrator::open(config)?)
}

/// Token cancelled on the first Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            child.cancel();
        }
    });
    token
}

pub fn state_style(state: weave::orchestrator::LifecycleState) -> console::StyledObject<String> {
    use weave::orchestrator::LifecycleState::*;
    let text = state.to_string();
    match state {
        Active => console::style(text).green(),
        AwaitingHandoff => console::style(text).cyan(),
        Recovering => console::style(text).yellow(),
        Completed => console::style(text).dim(),
        Failed => console::style(text).red(),
        Created => console::style(text),
    }
}
