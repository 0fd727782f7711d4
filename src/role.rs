//! Agent roles.

use serde::{Deserialize, Serialize};

/// The role a SubAgent plays. Together with the task id it identifies an
/// execution context, and it selects instructions and Definition of Done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Pm,
    Architect,
    Engineer,
    Reviewer,
    Ux,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Pm,
        Role::Architect,
        Role::Engineer,
        Role::Reviewer,
        Role::Ux,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pm => "pm",
            Role::Architect => "architect",
            Role::Engineer => "engineer",
            Role::Reviewer => "reviewer",
            Role::Ux => "ux",
        }
    }

    /// File name of the role's instruction document under `.github/agents/`.
    pub fn instruction_file(&self) -> &'static str {
        match self {
            Role::Pm => "product-manager.agent.md",
            Role::Architect => "architect.agent.md",
            Role::Engineer => "engineer.agent.md",
            Role::Reviewer => "reviewer.agent.md",
            Role::Ux => "ux-designer.agent.md",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pm" | "product-manager" => Ok(Role::Pm),
            "architect" => Ok(Role::Architect),
            "engineer" => Ok(Role::Engineer),
            "reviewer" => Ok(Role::Reviewer),
            "ux" | "ux-designer" => Ok(Role::Ux),
            _ => anyhow::bail!(
                "Invalid role '{}'. Valid values: pm, architect, engineer, reviewer, ux",
                s
            ),
        }
    }
}
