//! Gate-to-request derivation and provider resolution.
//!
//! Pure routing: a blocked or failed gate maps to exactly one (role, action,
//! target) request, and the request maps to exactly one provider after
//! applying the override, config, and safety rules.

use serde::Serialize;

use crate::core::gate::{Gate, GateState};
use crate::core::types::{Action, ProviderKind, Role};

/// Work order derived from a gate, handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchRequest {
    pub role: Role,
    pub action: Action,
    /// Run-relative path the provider must produce.
    pub target_path: String,
    /// Paths the gate reported missing, for prompt context.
    pub missing_paths: Vec<String>,
    pub reason: String,
    pub goal: String,
}

/// Derive the dispatch request for a gate, if the gate is dispatchable.
///
/// `pass`, resolve, apply, and verify gates are handled by the Orchestrator
/// itself and yield no request. Table rows are checked in order; the first
/// matching path substring wins.
pub fn derive_request(gate: &Gate, goal: &str) -> Option<DispatchRequest> {
    let request = |role: Role, action: Action, target: &str| {
        Some(DispatchRequest {
            role,
            action,
            target_path: target.to_string(),
            missing_paths: split_paths(&gate.path),
            reason: gate.reason.clone(),
            goal: goal.to_string(),
        })
    };

    if gate.state == GateState::Fail {
        return Some(DispatchRequest {
            role: Role::Fixer,
            action: Action::FixPatch,
            target_path: "artifacts/diff.patch".to_string(),
            missing_paths: vec![
                "failure_bundle.zip".to_string(),
                "artifacts/diff.patch".to_string(),
            ],
            reason: gate.reason.clone(),
            goal: goal.to_string(),
        });
    }
    if gate.state != GateState::Blocked {
        return None;
    }

    let path = gate.path.as_str();
    if path.contains("context_pack.json") {
        return request(Role::Librarian, Action::ContextPack, "artifacts/context_pack.json");
    }
    if path.contains("review_contract.md")
        && path.contains("review_cost.md")
        && gate.reason.to_ascii_lowercase().contains("approve reviews")
    {
        // Rework loop: blocked reviews send the plan back to the chair.
        return request(Role::Chair, Action::PlanDraft, "artifacts/PLAN_draft.md");
    }
    if path.contains("review_contract.md") {
        return request(
            Role::ContractGuardian,
            Action::ReviewContract,
            "reviews/review_contract.md",
        );
    }
    if path.contains("review_cost.md") {
        return request(Role::CostController, Action::ReviewCost, "reviews/review_cost.md");
    }
    if path.contains("PLAN_draft.md") {
        return request(Role::Chair, Action::PlanDraft, "artifacts/PLAN_draft.md");
    }
    if path.contains("PLAN.md") {
        return request(Role::Chair, Action::PlanSigned, "artifacts/PLAN.md");
    }
    if path.contains("file_request.json") {
        return request(Role::Chair, Action::FileRequest, "artifacts/file_request.json");
    }
    if path.contains("find_web.json") {
        return request(Role::Researcher, Action::FindWeb, "artifacts/find_web.json");
    }
    if path.contains("analysis.md") {
        return request(Role::Chair, Action::PlanDraft, "artifacts/analysis.md");
    }
    if path.contains("guardrails.md") {
        return request(Role::Chair, Action::PlanDraft, "artifacts/guardrails.md");
    }
    if path.contains("diff.patch") {
        if gate.owner == Some(Role::Fixer) {
            return request(Role::Fixer, Action::FixPatch, "artifacts/diff.patch");
        }
        return request(Role::Patchmaker, Action::MakePatch, "artifacts/diff.patch");
    }
    None
}

fn split_paths(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in raw.split(['|', ',']) {
        let part = part.trim();
        if part.is_empty() || out.iter().any(|existing| existing == part) {
            continue;
        }
        out.push(part.to_string());
    }
    out
}

/// Chosen provider plus the note explaining any fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderChoice {
    pub provider: ProviderKind,
    pub note: Option<String>,
}

/// Resolve the provider for a request.
///
/// Precedence: `CTCP_FORCE_PROVIDER` (when valid), per-role config mapping,
/// then the config's global mode. Safety rules apply after precedence:
/// `local_exec` only serves `(librarian, context_pack)`, and patch-producing
/// roles never go to the outbox.
pub fn resolve_provider(
    forced: Option<&str>,
    role_provider: Option<ProviderKind>,
    mode: ProviderKind,
    role: Role,
    action: Action,
) -> ProviderChoice {
    let mut note = None;
    let mut provider = match forced.and_then(ProviderKind::parse) {
        Some(kind) => {
            note = Some(format!("forced via CTCP_FORCE_PROVIDER={kind}"));
            kind
        }
        None => role_provider.unwrap_or(mode),
    };

    if provider == ProviderKind::LocalExec
        && !(role == Role::Librarian && action == Action::ContextPack)
    {
        let fallback = match role {
            Role::Patchmaker | Role::Fixer => ProviderKind::ApiAgent,
            _ => ProviderKind::ManualOutbox,
        };
        note = Some(format!("local_exec not allowed for {role}; fallback to {fallback}"));
        provider = fallback;
    }
    if provider == ProviderKind::ManualOutbox && matches!(role, Role::Patchmaker | Role::Fixer) {
        note = Some("manual_outbox disabled for patchmaker/fixer; fallback to api_agent".to_string());
        provider = ProviderKind::ApiAgent;
    }
    ProviderChoice { provider, note }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gate::REVIEWS_PATH;

    fn blocked(path: &str, reason: &str, owner: Option<Role>) -> Gate {
        Gate {
            state: GateState::Blocked,
            owner,
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    #[test]
    fn guardrails_route_to_chair() {
        let gate = blocked("artifacts/guardrails.md", "missing", Some(Role::Chair));
        let req = derive_request(&gate, "goal").expect("request");
        assert_eq!(req.role, Role::Chair);
        assert_eq!(req.action, Action::PlanDraft);
        assert_eq!(req.target_path, "artifacts/guardrails.md");
    }

    #[test]
    fn blocked_reviews_rework_to_chair() {
        let gate = blocked(
            REVIEWS_PATH,
            "waiting for APPROVE reviews (contract=APPROVE, cost=BLOCK)",
            Some(Role::CostController),
        );
        let req = derive_request(&gate, "goal").expect("request");
        assert_eq!(req.role, Role::Chair);
        assert_eq!(req.action, Action::PlanDraft);
        assert_eq!(
            req.missing_paths,
            vec!["reviews/review_contract.md", "reviews/review_cost.md"]
        );
    }

    #[test]
    fn single_missing_review_routes_to_its_guardian() {
        let gate = blocked(
            "reviews/review_contract.md",
            "missing reviews/review_contract.md",
            Some(Role::ContractGuardian),
        );
        let req = derive_request(&gate, "goal").expect("request");
        assert_eq!(req.role, Role::ContractGuardian);
        assert_eq!(req.action, Action::ReviewContract);
    }

    #[test]
    fn plan_path_does_not_shadow_draft() {
        let gate = blocked("artifacts/PLAN_draft.md", "missing", Some(Role::Chair));
        let req = derive_request(&gate, "goal").expect("request");
        assert_eq!(req.action, Action::PlanDraft);

        let gate = blocked("artifacts/PLAN.md", "missing", Some(Role::Chair));
        let req = derive_request(&gate, "goal").expect("request");
        assert_eq!(req.action, Action::PlanSigned);
    }

    #[test]
    fn fail_state_routes_to_fixer() {
        let gate = Gate {
            state: GateState::Fail,
            owner: Some(Role::Fixer),
            path: "failure_bundle.zip".to_string(),
            reason: "verify_failed".to_string(),
        };
        let req = derive_request(&gate, "goal").expect("request");
        assert_eq!(req.role, Role::Fixer);
        assert_eq!(req.action, Action::FixPatch);
        assert_eq!(
            req.missing_paths,
            vec!["failure_bundle.zip", "artifacts/diff.patch"]
        );
    }

    #[test]
    fn verify_gates_are_not_dispatchable() {
        let gate = Gate {
            state: GateState::ReadyVerify,
            owner: None,
            path: "artifacts/diff.patch".to_string(),
            reason: "patch applied, verify pending".to_string(),
        };
        assert!(derive_request(&gate, "goal").is_none());
    }

    #[test]
    fn forced_provider_wins_over_config() {
        let choice = resolve_provider(
            Some("mock_agent"),
            Some(ProviderKind::ApiAgent),
            ProviderKind::ManualOutbox,
            Role::Chair,
            Action::PlanDraft,
        );
        assert_eq!(choice.provider, ProviderKind::MockAgent);
        assert!(choice.note.expect("note").contains("CTCP_FORCE_PROVIDER"));
    }

    #[test]
    fn invalid_forced_provider_is_ignored() {
        let choice = resolve_provider(
            Some("codex"),
            None,
            ProviderKind::ManualOutbox,
            Role::Chair,
            Action::PlanDraft,
        );
        assert_eq!(choice.provider, ProviderKind::ManualOutbox);
        assert_eq!(choice.note, None);
    }

    #[test]
    fn local_exec_is_restricted_to_librarian_context_pack() {
        let choice = resolve_provider(
            None,
            Some(ProviderKind::LocalExec),
            ProviderKind::ManualOutbox,
            Role::Chair,
            Action::PlanDraft,
        );
        assert_eq!(choice.provider, ProviderKind::ManualOutbox);
        assert!(choice.note.expect("note").contains("local_exec not allowed"));

        let choice = resolve_provider(
            None,
            Some(ProviderKind::LocalExec),
            ProviderKind::ManualOutbox,
            Role::Librarian,
            Action::ContextPack,
        );
        assert_eq!(choice.provider, ProviderKind::LocalExec);
    }

    #[test]
    fn patch_roles_never_use_the_outbox() {
        let choice = resolve_provider(
            None,
            None,
            ProviderKind::ManualOutbox,
            Role::Patchmaker,
            Action::MakePatch,
        );
        assert_eq!(choice.provider, ProviderKind::ApiAgent);
        assert!(choice.note.expect("note").contains("manual_outbox disabled"));
    }
}
