//! `weave daemon`: health monitor and sync loops until Ctrl-C.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::super::Cli;
use super::{cancel_on_ctrl_c, open};

pub async fn cmd_daemon(cli: &Cli, project_dir: &Path) -> Result<()> {
    let orchestrator = open(cli, project_dir)?;
    let config = orchestrator.config();
    let health_interval = Duration::from_secs(config.toml.health.scan_interval_secs.max(1));
    let sync_interval = Duration::from_secs(config.toml.sync.interval_secs.max(1));

    let monitor = orchestrator.health_monitor();
    let sync = orchestrator.sync_engine();
    let cancel = cancel_on_ctrl_c();

    println!(
        "weave daemon running for {} (health every {}s, sync every {}s). Ctrl-C to stop.",
        config.project_name(),
        health_interval.as_secs(),
        sync_interval.as_secs()
    );
    info!(
        health_secs = health_interval.as_secs(),
        sync_secs = sync_interval.as_secs(),
        "Daemon started"
    );

    tokio::join!(
        monitor.run(health_interval, cancel.clone()),
        sync.run(sync_interval, cancel.clone()),
    );

    info!("Daemon stopped");
    Ok(())
}
