//! Label -> knowledge section routing.
//!
//! Both sides are closed enumerations so a typo in `[routing]` is caught when
//! the configuration loads, not when a context silently comes out thin.

use anyhow::{Result, bail};
use std::collections::BTreeMap;

/// Issue labels that select knowledge sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KnowledgeLabel {
    Api,
    Database,
    Security,
    Frontend,
    Bug,
    Performance,
    Ai,
    Default,
}

impl KnowledgeLabel {
    pub const ALL: [KnowledgeLabel; 8] = [
        KnowledgeLabel::Api,
        KnowledgeLabel::Database,
        KnowledgeLabel::Security,
        KnowledgeLabel::Frontend,
        KnowledgeLabel::Bug,
        KnowledgeLabel::Performance,
        KnowledgeLabel::Ai,
        KnowledgeLabel::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeLabel::Api => "api",
            KnowledgeLabel::Database => "database",
            KnowledgeLabel::Security => "security",
            KnowledgeLabel::Frontend => "frontend",
            KnowledgeLabel::Bug => "bug",
            KnowledgeLabel::Performance => "performance",
            KnowledgeLabel::Ai => "ai",
            KnowledgeLabel::Default => "default",
        }
    }

    /// Match an issue label: case-insensitive, `type:` prefix ignored.
    pub fn from_issue_label(label: &str) -> Option<Self> {
        let lowered = label.trim().to_lowercase();
        let name = lowered.strip_prefix("type:").unwrap_or(&lowered);
        Self::ALL
            .into_iter()
            .filter(|l| *l != KnowledgeLabel::Default)
            .find(|l| l.as_str() == name)
    }
}

impl std::str::FromStr for KnowledgeLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == wanted)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown routing label '{}'. Valid values: {}",
                    s,
                    Self::ALL.map(|l| l.as_str()).join(", ")
                )
            })
    }
}

impl std::fmt::Display for KnowledgeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knowledge documents (`.github/skills/**/<name>/SKILL.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KnowledgeSection {
    CorePrinciples,
    Testing,
    ErrorHandling,
    Security,
    Performance,
    Database,
    Scalability,
    CodeOrganization,
    ApiDesign,
    Configuration,
    Documentation,
    VersionControl,
    TypeSafety,
    DependencyManagement,
    LoggingMonitoring,
    RemoteGitOperations,
    AiAgentDevelopment,
    CodeReviewAndAudit,
    Csharp,
    Python,
    FrontendUi,
    React,
    Blazor,
    Postgresql,
    SqlServer,
}

impl KnowledgeSection {
    /// In catalogue order; the position is the section's number (`#01`..`#25`).
    pub const ALL: [KnowledgeSection; 25] = [
        KnowledgeSection::CorePrinciples,
        KnowledgeSection::Testing,
        KnowledgeSection::ErrorHandling,
        KnowledgeSection::Security,
        KnowledgeSection::Performance,
        KnowledgeSection::Database,
        KnowledgeSection::Scalability,
        KnowledgeSection::CodeOrganization,
        KnowledgeSection::ApiDesign,
        KnowledgeSection::Configuration,
        KnowledgeSection::Documentation,
        KnowledgeSection::VersionControl,
        KnowledgeSection::TypeSafety,
        KnowledgeSection::DependencyManagement,
        KnowledgeSection::LoggingMonitoring,
        KnowledgeSection::RemoteGitOperations,
        KnowledgeSection::AiAgentDevelopment,
        KnowledgeSection::CodeReviewAndAudit,
        KnowledgeSection::Csharp,
        KnowledgeSection::Python,
        KnowledgeSection::FrontendUi,
        KnowledgeSection::React,
        KnowledgeSection::Blazor,
        KnowledgeSection::Postgresql,
        KnowledgeSection::SqlServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeSection::CorePrinciples => "core-principles",
            KnowledgeSection::Testing => "testing",
            KnowledgeSection::ErrorHandling => "error-handling",
            KnowledgeSection::Security => "security",
            KnowledgeSection::Performance => "performance",
            KnowledgeSection::Database => "database",
            KnowledgeSection::Scalability => "scalability",
            KnowledgeSection::CodeOrganization => "code-organization",
            KnowledgeSection::ApiDesign => "api-design",
            KnowledgeSection::Configuration => "configuration",
            KnowledgeSection::Documentation => "documentation",
            KnowledgeSection::VersionControl => "version-control",
            KnowledgeSection::TypeSafety => "type-safety",
            KnowledgeSection::DependencyManagement => "dependency-management",
            KnowledgeSection::LoggingMonitoring => "logging-monitoring",
            KnowledgeSection::RemoteGitOperations => "remote-git-operations",
            KnowledgeSection::AiAgentDevelopment => "ai-agent-development",
            KnowledgeSection::CodeReviewAndAudit => "code-review-and-audit",
            KnowledgeSection::Csharp => "csharp",
            KnowledgeSection::Python => "python",
            KnowledgeSection::FrontendUi => "frontend-ui",
            KnowledgeSection::React => "react",
            KnowledgeSection::Blazor => "blazor",
            KnowledgeSection::Postgresql => "postgresql",
            KnowledgeSection::SqlServer => "sql-server",
        }
    }

    /// Catalogue number, e.g. `#09` for api-design.
    pub fn number(&self) -> String {
        let index = Self::ALL.iter().position(|s| s == self).unwrap_or(0);
        format!("#{:02}", index + 1)
    }
}

impl std::str::FromStr for KnowledgeSection {
    type Err = anyhow::Error;

    /// Accepts the name (`api-design`) or the catalogue number (`#09`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        if let Some(number) = wanted.strip_prefix('#')
            && let Ok(n) = number.parse::<usize>()
            && (1..=Self::ALL.len()).contains(&n)
        {
            return Ok(Self::ALL[n - 1]);
        }
        Self::ALL
            .into_iter()
            .find(|section| section.as_str() == wanted)
            .ok_or_else(|| anyhow::anyhow!("Unknown knowledge section '{}'", s))
    }
}

impl std::fmt::Display for KnowledgeSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Many-to-many mapping from labels to sections. Always has a `default` route.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingTable {
    routes: BTreeMap<KnowledgeLabel, Vec<KnowledgeSection>>,
}

impl RoutingTable {
    /// The routing used when `[routing]` is absent.
    pub fn builtin() -> Self {
        use KnowledgeLabel as L;
        use KnowledgeSection as S;
        let routes = BTreeMap::from([
            (L::Api, vec![S::ApiDesign, S::Security, S::Testing, S::Documentation]),
            (L::Database, vec![S::Database, S::Security, S::Testing]),
            (
                L::Security,
                vec![
                    S::Security,
                    S::Configuration,
                    S::Testing,
                    S::TypeSafety,
                    S::LoggingMonitoring,
                ],
            ),
            (L::Frontend, vec![S::FrontendUi, S::React, S::Testing, S::Documentation]),
            (L::Bug, vec![S::ErrorHandling, S::Testing, S::LoggingMonitoring]),
            (
                L::Performance,
                vec![S::Performance, S::Database, S::Testing, S::LoggingMonitoring],
            ),
            (L::Ai, vec![S::AiAgentDevelopment, S::Security]),
            (L::Default, vec![S::Testing, S::Security, S::Documentation]),
        ]);
        Self { routes }
    }

    /// Build from the raw `[routing]` table, rejecting unknown labels and
    /// sections, empty routes, and a missing `default` route.
    pub fn from_config(raw: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut routes = BTreeMap::new();
        for (label, sections) in raw {
            let label: KnowledgeLabel = label.parse()?;
            if sections.is_empty() {
                bail!("Route '{}' lists no sections", label);
            }
            let parsed = sections
                .iter()
                .map(|s| s.parse::<KnowledgeSection>())
                .collect::<Result<Vec<_>>>()?;
            routes.insert(label, parsed);
        }
        if !routes.contains_key(&KnowledgeLabel::Default) {
            bail!("Routing table has no 'default' route");
        }
        Ok(Self { routes })
    }

    pub fn route(&self, label: KnowledgeLabel) -> &[KnowledgeSection] {
        self.routes.get(&label).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn routes(&self) -> impl Iterator<Item = (KnowledgeLabel, &[KnowledgeSection])> {
        self.routes.iter().map(|(label, sections)| (*label, sections.as_slice()))
    }

    /// Sections for an issue's labels, deduplicated in first-seen order.
    /// Falls back to the `default` route when no label has a route.
    pub fn resolve<S: AsRef<str>>(&self, labels: &[S]) -> Vec<KnowledgeSection> {
        let mut sections = Vec::new();
        let mut matched = false;
        for label in labels {
            let Some(label) = KnowledgeLabel::from_issue_label(label.as_ref()) else {
                continue;
            };
            let Some(route) = self.routes.get(&label) else {
                continue;
            };
            matched = true;
            for section in route {
                if !sections.contains(section) {
                    sections.push(*section);
                }
            }
        }
        if !matched {
            sections = self.route(KnowledgeLabel::Default).to_vec();
        }
        sections
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::builtin()
    }
}
