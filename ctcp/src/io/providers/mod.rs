//! Provider registry: the execution backends a dispatch request routes to.
//!
//! Every provider implements the same two-phase contract: `preview` reports
//! whether the provider could act right now, `execute` performs the work and
//! reports exactly one outcome. Providers write only inside the run
//! directory; the patch guard is the sole writer of repo files.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::core::route::DispatchRequest;
use crate::core::types::ProviderKind;
use crate::io::config::DispatchConfig;
use crate::io::paths::RunPaths;
use crate::io::run_store::RunDoc;

pub mod api_agent;
pub mod local_exec;
pub mod manual_outbox;
pub mod mock_agent;

/// Budgets parsed from `artifacts/guardrails.md`, surfaced in prompts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardrailBudgets {
    pub max_files: Option<u64>,
    pub max_total_bytes: Option<u64>,
    pub max_iterations: Option<u64>,
}

impl GuardrailBudgets {
    pub fn display(value: Option<u64>) -> String {
        value.map(|v| v.to_string()).unwrap_or_else(|| "n/a".to_string())
    }
}

/// Shared read-only context handed to providers.
pub struct ProviderContext<'a> {
    pub repo_root: &'a Path,
    pub run_paths: &'a RunPaths,
    pub doc: &'a RunDoc,
    pub config: &'a DispatchConfig,
    pub budgets: GuardrailBudgets,
}

/// What `preview` says about a request before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preview {
    CanExec,
    Disabled { reason: String },
    OutboxExists { path: String },
    BudgetExceeded { reason: String },
}

/// Terminal status of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Executed,
    ExecFailed,
    OutboxCreated,
    OutboxExists,
    BudgetExceeded,
    Disabled,
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub status: ExecStatus,
    /// Run-relative target the request asked for.
    pub target_path: String,
    pub reason: Option<String>,
    /// Run-relative outbox prompt path, for outbox outcomes.
    pub outbox_path: Option<String>,
    /// Run-relative paths the provider wrote.
    pub writes: Vec<String>,
    /// Failure that must fail the whole run, not just block the gate.
    pub fatal: bool,
}

impl ExecOutcome {
    pub fn executed(target_path: &str, writes: Vec<String>) -> Self {
        Self {
            status: ExecStatus::Executed,
            target_path: target_path.to_string(),
            reason: None,
            outbox_path: None,
            writes,
            fatal: false,
        }
    }

    pub fn failed(target_path: &str, reason: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::ExecFailed,
            target_path: target_path.to_string(),
            reason: Some(reason.into()),
            outbox_path: None,
            writes: Vec::new(),
            fatal: false,
        }
    }

    pub fn fatal(target_path: &str, reason: impl Into<String>) -> Self {
        let mut outcome = Self::failed(target_path, reason);
        outcome.fatal = true;
        outcome
    }

    pub fn outbox(status: ExecStatus, target_path: &str, prompt_path: &str) -> Self {
        Self {
            status,
            target_path: target_path.to_string(),
            reason: None,
            outbox_path: Some(prompt_path.to_string()),
            writes: Vec::new(),
            fatal: false,
        }
    }

    pub fn disabled(target_path: &str, reason: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::Disabled,
            target_path: target_path.to_string(),
            reason: Some(reason.into()),
            outbox_path: None,
            writes: Vec::new(),
            fatal: false,
        }
    }
}

/// Two-phase provider contract.
pub trait Provider {
    fn kind(&self) -> ProviderKind;
    fn preview(&self, ctx: &ProviderContext<'_>, request: &DispatchRequest) -> Result<Preview>;
    fn execute(&self, ctx: &ProviderContext<'_>, request: &DispatchRequest)
    -> Result<ExecOutcome>;
}

/// Look up the provider implementation for a kind.
pub fn provider_for(kind: ProviderKind) -> Box<dyn Provider> {
    match kind {
        ProviderKind::ManualOutbox => Box::new(manual_outbox::ManualOutbox),
        ProviderKind::LocalExec => Box::new(local_exec::LocalExec),
        ProviderKind::ApiAgent => Box::new(api_agent::ApiAgent),
        ProviderKind::MockAgent => Box::new(mock_agent::MockAgent),
    }
}
