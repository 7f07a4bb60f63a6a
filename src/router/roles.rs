use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::RolesConfig;

/// The six pipeline roles, in visiting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Retriever,
    Solver,
    Critic,
    Verifier,
    Rewriter,
}

impl Role {
    /// Pipeline order.
    pub const ALL: [Role; 6] = [
        Role::Planner,
        Role::Retriever,
        Role::Solver,
        Role::Critic,
        Role::Verifier,
        Role::Rewriter,
    ];

    /// Position in [`Role::ALL`]; also the index into a [`RoleTable`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Retriever => "retriever",
            Role::Solver => "solver",
            Role::Critic => "critic",
            Role::Verifier => "verifier",
            Role::Rewriter => "rewriter",
        }
    }

    /// What the role is asked to do; becomes the instruction of its prompt.
    pub fn instruction(&self) -> &'static str {
        match self {
            Role::Planner => "Outline the steps needed to answer the question.",
            Role::Retriever => "Collect the facts from the context that bear on the question.",
            Role::Solver => "Answer the question using the plan and the retrieved facts.",
            Role::Critic => "Point out flaws, gaps or unsupported claims in the draft answer.",
            Role::Verifier => "Check the draft answer against the context and the critique.",
            Role::Rewriter => "Write the final concise answer.",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "planner" => Ok(Role::Planner),
            "retriever" => Ok(Role::Retriever),
            "solver" => Ok(Role::Solver),
            "critic" => Ok(Role::Critic),
            "verifier" => Ok(Role::Verifier),
            "rewriter" => Ok(Role::Rewriter),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// Role-specific routing data.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleProfile {
    pub role: Role,
    pub budget_tokens: usize,
    /// Lowercased
    pub keywords: Vec<String>,
}

/// Lookup table indexed by [`Role::index`].
#[derive(Debug, Clone, PartialEq)]
pub struct RoleTable {
    profiles: [RoleProfile; 6],
}

impl RoleTable {
    pub fn from_config(config: &RolesConfig) -> Self {
        let profiles = Role::ALL.map(|role| {
            let rc = config.get(role);
            RoleProfile {
                role,
                budget_tokens: rc.budget_tokens,
                keywords: rc.keywords.iter().map(|k| k.to_lowercase()).collect(),
            }
        });
        Self { profiles }
    }

    pub fn get(&self, role: Role) -> &RoleProfile {
        &self.profiles[role.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoleProfile> {
        self.profiles.iter()
    }
}
