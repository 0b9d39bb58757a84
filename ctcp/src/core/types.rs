//! Shared deterministic types for the run state machine.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Team role that owns or produces an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Chair,
    Resolver,
    Researcher,
    Librarian,
    ContractGuardian,
    CostController,
    Patchmaker,
    Fixer,
}

impl Role {
    /// Stable lowercase key used in dispatch config and step metadata.
    pub fn key(self) -> &'static str {
        match self {
            Role::Chair => "chair",
            Role::Resolver => "resolver",
            Role::Researcher => "researcher",
            Role::Librarian => "librarian",
            Role::ContractGuardian => "contract_guardian",
            Role::CostController => "cost_controller",
            Role::Patchmaker => "patchmaker",
            Role::Fixer => "fixer",
        }
    }

    /// Human-facing owner label used in gates, trace lines, and prompts.
    pub fn display_name(self) -> &'static str {
        match self {
            Role::Chair => "Chair",
            Role::Resolver => "Resolver",
            Role::Researcher => "Researcher",
            Role::Librarian => "Librarian",
            Role::ContractGuardian => "Contract Guardian",
            Role::CostController => "Cost Controller",
            Role::Patchmaker => "PatchMaker",
            Role::Fixer => "Fixer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Action a dispatched role is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    PlanDraft,
    PlanSigned,
    FileRequest,
    FindWeb,
    ContextPack,
    ReviewContract,
    ReviewCost,
    MakePatch,
    FixPatch,
}

impl Action {
    pub fn key(self) -> &'static str {
        match self {
            Action::PlanDraft => "plan_draft",
            Action::PlanSigned => "plan_signed",
            Action::FileRequest => "file_request",
            Action::FindWeb => "find_web",
            Action::ContextPack => "context_pack",
            Action::ReviewContract => "review_contract",
            Action::ReviewCost => "review_cost",
            Action::MakePatch => "make_patch",
            Action::FixPatch => "fix_patch",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Execution backend a dispatch request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    ManualOutbox,
    LocalExec,
    ApiAgent,
    MockAgent,
}

impl ProviderKind {
    pub fn key(self) -> &'static str {
        match self {
            ProviderKind::ManualOutbox => "manual_outbox",
            ProviderKind::LocalExec => "local_exec",
            ProviderKind::ApiAgent => "api_agent",
            ProviderKind::MockAgent => "mock_agent",
        }
    }

    /// Parse a provider name, returning `None` for unknown values.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "manual_outbox" => Some(ProviderKind::ManualOutbox),
            "local_exec" => Some(ProviderKind::LocalExec),
            "api_agent" => Some(ProviderKind::ApiAgent),
            "mock_agent" => Some(ProviderKind::MockAgent),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Persisted run status in `RUN.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Blocked,
    Fail,
    Pass,
}

impl RunStatus {
    pub fn key(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Blocked => "blocked",
            RunStatus::Fail => "fail",
            RunStatus::Pass => "pass",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Evidence-gathering mode fixed at run creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindMode {
    #[default]
    ResolverOnly,
    ResolverPlusWeb,
}

impl FindMode {
    pub fn key(self) -> &'static str {
        match self {
            FindMode::ResolverOnly => "resolver_only",
            FindMode::ResolverPlusWeb => "resolver_plus_web",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "resolver_only" => Some(FindMode::ResolverOnly),
            "resolver_plus_web" => Some(FindMode::ResolverPlusWeb),
            _ => None,
        }
    }
}

impl fmt::Display for FindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Review verdict parsed from `reviews/review_*.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Approve,
    Block,
}

impl Verdict {
    pub fn key(self) -> &'static str {
        match self {
            Verdict::Approve => "APPROVE",
            Verdict::Block => "BLOCK",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse_normalizes_case_and_whitespace() {
        assert_eq!(
            ProviderKind::parse(" Mock_Agent \n"),
            Some(ProviderKind::MockAgent)
        );
        assert_eq!(ProviderKind::parse("codex"), None);
    }

    #[test]
    fn role_serde_uses_snake_case() {
        let json = serde_json::to_string(&Role::ContractGuardian).expect("serialize");
        assert_eq!(json, "\"contract_guardian\"");
    }

    #[test]
    fn find_mode_parse_rejects_unknown() {
        assert_eq!(FindMode::parse("resolver_only"), Some(FindMode::ResolverOnly));
        assert_eq!(FindMode::parse("web_only"), None);
    }
}
