use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::weave_config::WeaveToml;

/// Name of the state directory inside the project root.
pub const WEAVE_DIR: &str = ".weave";

/// Runtime configuration for weave.
///
/// Resolves every path under `.weave/` and layers the environment over the
/// parsed `weave.toml`: `WEAVE_BASE_BRANCH` overrides `project.base_branch`,
/// `WEAVE_GITHUB_TOKEN` takes precedence over the variable named by
/// `tracker.token_env`.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub weave_dir: PathBuf,
    pub registry_file: PathBuf,
    pub registry_lock: PathBuf,
    pub audit_file: PathBuf,
    pub audit_lock: PathBuf,
    pub issues_file: PathBuf,
    pub issues_lock: PathBuf,
    pub context_dir: PathBuf,
    pub worktree_base: PathBuf,
    pub log_dir: PathBuf,
    pub certificates_dir: PathBuf,
    pub agents_dir: PathBuf,
    pub skills_dir: PathBuf,
    pub verbose: bool,
    pub toml: WeaveToml,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let weave_dir = project_dir.join(WEAVE_DIR);
        let toml = WeaveToml::load_or_default(&weave_dir)?;
        Ok(Self::from_parts(project_dir, toml, verbose))
    }

    /// Build a config from an already resolved project directory and parsed file.
    pub fn from_parts(project_dir: PathBuf, toml: WeaveToml, verbose: bool) -> Self {
        let weave_dir = project_dir.join(WEAVE_DIR);
        let worktree_base = project_dir.join(&toml.workspace.worktree_base);
        Self {
            registry_file: weave_dir.join("registry.json"),
            registry_lock: weave_dir.join("registry.lock"),
            audit_file: weave_dir.join("audit.jsonl"),
            audit_lock: weave_dir.join("audit.lock"),
            issues_file: weave_dir.join("issues.json"),
            issues_lock: weave_dir.join("issues.lock"),
            context_dir: weave_dir.join("context"),
            log_dir: weave_dir.join("logs"),
            certificates_dir: weave_dir.join("certificates"),
            agents_dir: project_dir.join(".github").join("agents"),
            skills_dir: project_dir.join(".github").join("skills"),
            worktree_base,
            weave_dir,
            project_dir,
            verbose,
            toml,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.weave_dir,
            &self.context_dir,
            &self.worktree_base,
            &self.log_dir,
            &self.certificates_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }

        // Keep orchestration state out of the repository's status output.
        let ignore = self.weave_dir.join(".gitignore");
        if !ignore.exists() {
            std::fs::write(&ignore, "*\n").context("Failed to write .weave/.gitignore")?;
        }
        Ok(())
    }

    /// Directory the workspace for `task_id` lives in.
    pub fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.worktree_base.join(crate::util::slugify(task_id))
    }

    /// Path of the assembled context artifact for `task_id`.
    pub fn context_path(&self, task_id: &str) -> PathBuf {
        self.context_dir
            .join(format!("context-{}.md", crate::util::slugify(task_id)))
    }

    pub fn certificate_path(&self, task_id: &str) -> PathBuf {
        self.certificates_dir
            .join(format!("cert-{}.json", crate::util::slugify(task_id)))
    }

    /// Revision new workspaces branch from.
    pub fn base_branch(&self) -> String {
        std::env::var("WEAVE_BASE_BRANCH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.toml.project.base_branch.clone())
            .unwrap_or_else(|| "HEAD".to_string())
    }

    /// API token for the remote tracker, if any.
    pub fn tracker_token(&self) -> Option<String> {
        std::env::var("WEAVE_GITHUB_TOKEN")
            .ok()
            .or_else(|| std::env::var(&self.toml.tracker.token_env).ok())
            .filter(|t| !t.trim().is_empty())
    }

    /// Project name, defaulting to the directory name.
    pub fn project_name(&self) -> String {
        self.toml.project.name.clone().unwrap_or_else(|| {
            self.project_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string())
        })
    }

    /// Whether `.weave/` has been initialised.
    pub fn is_initialized(project_dir: &Path) -> bool {
        project_dir.join(WEAVE_DIR).is_dir()
    }
}
