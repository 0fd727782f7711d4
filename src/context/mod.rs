//! Context assembly: one bounded Markdown artifact per task.
//!
//! The artifact combines, in a fixed order, a header, the role's instruction
//! document, the task title and description, dependencies, acceptance
//! criteria, summaries of prior deliverables and the routed knowledge
//! sections. The body carries no timestamps, so the same inputs always give
//! the same bytes. Metadata lives in a TOML front-matter block:
//!
//! ```text
//! +++
//! task_id = "42"
//! role = "engineer"
//! tokens = 5120
//! ...
//! +++
//!
//! # Context: Task 42 - Add login
//! ```

pub mod routing;
pub mod skills;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::OrchestrationError;
use crate::role::Role;
use crate::sync::store::{Dependency, IssueType, LocalIssue};
use crate::util::{atomic_write, estimate_tokens};
use crate::weave_config::ContextSection;
use routing::{KnowledgeSection, RoutingTable};
use skills::SkillsLoader;

const FRONT_MATTER_FENCE: &str = "+++";

/// What the assembler needs to know about a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSpec {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub issue_type: Option<IssueType>,
    pub role: Option<Role>,
    pub labels: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub dependencies: Vec<Dependency>,
    pub deliverables: Vec<String>,
}

impl From<&LocalIssue> for TaskSpec {
    fn from(issue: &LocalIssue) -> Self {
        TaskSpec {
            task_id: issue.task_id(),
            title: issue.title.clone(),
            description: issue.body.clone(),
            issue_type: Some(issue.issue_type),
            role: issue.role,
            labels: issue.labels.clone(),
            acceptance_criteria: issue.acceptance_criteria.clone(),
            dependencies: issue.dependencies.clone(),
            deliverables: issue.deliverables.clone(),
        }
    }
}

impl TaskSpec {
    /// Explicit role, then `role:` label, then `needs:` labels, then issue type.
    pub fn resolve_role(&self) -> Role {
        if let Some(role) = self.role {
            return role;
        }
        let labels: Vec<String> = self.labels.iter().map(|l| l.trim().to_lowercase()).collect();
        if let Some(role) = labels
            .iter()
            .find_map(|l| l.strip_prefix("role:").and_then(|r| r.parse().ok()))
        {
            return role;
        }
        if labels.iter().any(|l| l == "needs:ux") {
            return Role::Ux;
        }
        if labels.iter().any(|l| l == "needs:review") {
            return Role::Reviewer;
        }
        let issue_type = self.issue_type.or_else(|| {
            labels
                .iter()
                .find_map(|l| l.strip_prefix("type:").and_then(|t| t.parse().ok()))
        });
        issue_type.unwrap_or_default().default_role()
    }
}

/// Front-matter metadata of an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub task_id: String,
    pub role: Role,
    pub tokens: usize,
    pub soft_limit: usize,
    pub hard_limit: usize,
    pub oversized: bool,
    pub sections: Vec<String>,
    pub missing_sections: Vec<String>,
    pub body_sha256: String,
}

impl ArtifactMeta {
    /// Parse the front matter of an artifact file.
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let rest = content
            .strip_prefix(FRONT_MATTER_FENCE)
            .with_context(|| format!("{} has no front matter", path.display()))?;
        let end = rest
            .find(&format!("\n{}\n", FRONT_MATTER_FENCE))
            .with_context(|| format!("{} has unterminated front matter", path.display()))?;
        toml::from_str(&rest[..end]).with_context(|| format!("Failed to parse front matter of {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextArtifact {
    pub path: PathBuf,
    pub meta: ArtifactMeta,
    pub body: String,
}

impl ContextArtifact {
    pub fn tokens(&self) -> usize {
        self.meta.tokens
    }

    pub fn oversized(&self) -> bool {
        self.meta.oversized
    }

    fn render_file(&self) -> Result<String> {
        let front = toml::to_string(&self.meta).context("Failed to serialize front matter")?;
        Ok(format!(
            "{fence}\n{front}{fence}\n\n{body}",
            fence = FRONT_MATTER_FENCE,
            front = front,
            body = self.body
        ))
    }
}

pub struct ContextAssembler {
    project_dir: PathBuf,
    agents_dir: PathBuf,
    skills_dir: PathBuf,
    context_dir: PathBuf,
    limits: ContextSection,
    routing: RoutingTable,
}

impl ContextAssembler {
    pub fn new(
        project_dir: &Path,
        agents_dir: &Path,
        skills_dir: &Path,
        context_dir: &Path,
        limits: ContextSection,
        routing: RoutingTable,
    ) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            agents_dir: agents_dir.to_path_buf(),
            skills_dir: skills_dir.to_path_buf(),
            context_dir: context_dir.to_path_buf(),
            limits,
            routing,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            &config.project_dir,
            &config.agents_dir,
            &config.skills_dir,
            &config.context_dir,
            config.toml.context.clone(),
            config.toml.routing_table()?,
        ))
    }

    pub fn artifact_path(&self, task_id: &str) -> PathBuf {
        self.context_dir
            .join(format!("context-{}.md", crate::util::slugify(task_id)))
    }

    fn role_instructions(&self, role: Role) -> Result<String, OrchestrationError> {
        let path = self.agents_dir.join(role.instruction_file());
        if !path.is_file() {
            return Err(OrchestrationError::MissingRoleInstructions { role, path });
        }
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))
            .map_err(OrchestrationError::Other)
    }

    /// Heading plus first paragraph of a prior deliverable.
    fn summarize_deliverable(&self, rel: &str) -> String {
        if !crate::util::is_contained_path(rel) {
            return "_Outside the project; not read._".to_string();
        }
        let path = self.project_dir.join(rel);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return "_Not found._".to_string();
        };
        summarize(&content, self.limits.summary_lines)
    }

    /// Build the artifact body and metadata without touching the filesystem
    /// beyond reading inputs.
    pub fn render(&self, task: &TaskSpec) -> Result<ContextArtifact, OrchestrationError> {
        let role = task.resolve_role();
        let instructions = self.role_instructions(role)?;

        let routed = self.routing.resolve(&task.labels);
        let mut loader = SkillsLoader::new(&self.skills_dir);
        let mut docs = Vec::new();
        let mut missing = Vec::new();
        for section in &routed {
            match loader.load(*section)? {
                Some(doc) => docs.push(doc),
                None => missing.push(*section),
            }
        }

        let mut body = String::new();
        let type_name = task
            .issue_type
            .map(|t| t.as_str())
            .unwrap_or("unspecified");
        let _ = writeln!(body, "# Context: Task {} - {}\n", task.task_id, task.title);
        let _ = writeln!(body, "- Role: {}", role);
        let _ = writeln!(body, "- Type: {}", type_name);
        if !task.labels.is_empty() {
            let _ = writeln!(body, "- Labels: {}", task.labels.join(", "));
        }

        let _ = write!(body, "\n## Role Instructions\n\n{}", instructions);
        if !instructions.ends_with('\n') {
            body.push('\n');
        }

        let _ = writeln!(body, "\n## Task\n\n{}", task.title);

        let description = task.description.trim();
        let _ = writeln!(
            body,
            "\n## Description\n\n{}",
            if description.is_empty() { "_No description provided._" } else { description }
        );

        body.push_str("\n## Dependencies\n\n");
        if task.dependencies.is_empty() {
            body.push_str("_None._\n");
        }
        for dep in &task.dependencies {
            if dep.explanation.is_empty() {
                let _ = writeln!(body, "- #{}", dep.task_id);
            } else {
                let _ = writeln!(body, "- #{}: {}", dep.task_id, dep.explanation);
            }
        }

        body.push_str("\n## Acceptance Criteria\n\n");
        if task.acceptance_criteria.is_empty() {
            body.push_str("_None specified._\n");
        }
        for criterion in &task.acceptance_criteria {
            let _ = writeln!(body, "- [ ] {}", criterion);
        }

        body.push_str("\n## Prior Deliverables\n\n");
        if task.deliverables.is_empty() {
            body.push_str("_None._\n");
        }
        for rel in &task.deliverables {
            let _ = writeln!(body, "### {}\n\n{}\n", rel, self.summarize_deliverable(rel));
        }

        body.push_str("\n## Knowledge\n\n");
        if docs.is_empty() {
            body.push_str("_No knowledge documents found._\n");
        }
        for doc in &docs {
            let _ = writeln!(body, "{}\n", doc.as_context_section());
        }

        let tokens = estimate_tokens(&body);
        let body_sha256 = format!("{:x}", Sha256::digest(body.as_bytes()));
        let meta = ArtifactMeta {
            task_id: task.task_id.clone(),
            role,
            tokens,
            soft_limit: self.limits.soft_limit_tokens,
            hard_limit: self.limits.hard_limit_tokens,
            oversized: tokens > self.limits.soft_limit_tokens,
            sections: docs.iter().map(|d| d.section.to_string()).collect(),
            missing_sections: missing.iter().map(KnowledgeSection::to_string).collect(),
            body_sha256,
        };
        Ok(ContextArtifact {
            path: self.artifact_path(&task.task_id),
            meta,
            body,
        })
    }

    /// Render and write the artifact. Above the hard ceiling nothing is
    /// written and any previous artifact for the task is removed.
    pub fn assemble(&self, task: &TaskSpec) -> Result<ContextArtifact, OrchestrationError> {
        let artifact = self.render(task)?;
        if artifact.meta.tokens > self.limits.hard_limit_tokens {
            remove_stale(&artifact.path)?;
            warn!(
                task_id = %task.task_id,
                tokens = artifact.meta.tokens,
                ceiling = self.limits.hard_limit_tokens,
                "Context exceeds hard ceiling"
            );
            return Err(OrchestrationError::ContextTooLarge {
                task_id: task.task_id.clone(),
                tokens: artifact.meta.tokens,
                ceiling: self.limits.hard_limit_tokens,
            });
        }

        let contents = artifact.render_file()?;
        atomic_write(&artifact.path, contents.as_bytes())?;
        if artifact.meta.oversized {
            warn!(task_id = %task.task_id, tokens = artifact.meta.tokens, "Context above soft ceiling");
        }
        info!(
            task_id = %task.task_id,
            role = %artifact.meta.role,
            tokens = artifact.meta.tokens,
            sections = artifact.meta.sections.len(),
            "Context assembled"
        );
        debug!(path = %artifact.path.display(), "Context artifact written");
        Ok(artifact)
    }
}

fn remove_stale(path: &Path) -> Result<(), OrchestrationError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OrchestrationError::Other(
            anyhow::Error::new(e).context(format!("Failed to remove stale {}", path.display())),
        )),
    }
}

/// First heading plus the first paragraph after it, at most `max_lines` lines.
pub fn summarize(content: &str, max_lines: usize) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut lines = content.lines().map(str::trim_end).skip_while(|l| l.trim().is_empty());

    let mut in_paragraph = false;
    if let Some(first) = lines.next() {
        out.push(first);
        in_paragraph = !first.starts_with('#');
    }
    for line in lines {
        if out.len() >= max_lines {
            break;
        }
        if line.trim().is_empty() {
            if in_paragraph {
                break;
            }
            continue;
        }
        if line.starts_with('#') && in_paragraph {
            break;
        }
        in_paragraph = true;
        out.push(line);
    }
    out.truncate(max_lines.max(1));
    out.join("\n")
}
