//! Initialization of the `.weave/` state directory.
//!
//! ```text
//! .weave/
//! ├── weave.toml       # Configuration (defaults written on first init)
//! ├── .gitignore       # Keeps state out of `git status`
//! ├── registry.json    # Ownership registry (created on first write)
//! ├── audit.jsonl      # Hash-chained audit log (created on first append)
//! ├── issues.json      # Local issue store (created on first issue)
//! ├── context/         # Assembled context artifacts
//! ├── worktrees/       # One git worktree per task
//! ├── certificates/    # Completion certificates
//! └── logs/            # Rolling log files
//! ```

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::{Config, WEAVE_DIR};
use crate::weave_config::{CONFIG_FILE, WeaveToml};

/// Result of initializing a weave project.
#[derive(Debug)]
pub struct InitResult {
    /// Path to the `.weave` directory
    pub weave_dir: PathBuf,
    /// Whether the directory was newly created (false if it already existed)
    pub created: bool,
    /// Whether a default weave.toml was written
    pub wrote_config: bool,
}

/// Initialize weave in the given project directory.
///
/// Existing files are never overwritten; running init twice completes a
/// partial layout.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let created = !Config::is_initialized(project_dir);
    let weave_dir = project_dir.join(WEAVE_DIR);
    std::fs::create_dir_all(&weave_dir)?;

    let config_path = weave_dir.join(CONFIG_FILE);
    let wrote_config = if config_path.exists() {
        false
    } else {
        WeaveToml::default().save(&config_path)?;
        true
    };

    let config = Config::new(project_dir.to_path_buf(), false)?;
    config.ensure_directories()?;

    Ok(InitResult {
        weave_dir: config.weave_dir,
        created,
        wrote_config,
    })
}
