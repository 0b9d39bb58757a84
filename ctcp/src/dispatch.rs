//! Dispatcher: turns a blocked gate into exactly one provider execution.
//!
//! Provider selection honors `CTCP_FORCE_PROVIDER`, then the per-role config
//! map, then the global mode, with the routing safety rules applied last. A
//! disabled provider falls back to the manual outbox instead of stalling the
//! run. Whatever a provider claims, the target artifact is re-validated here
//! and deleted when it does not hold up.

use std::path::Path;

use anyhow::Result;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::artifacts::{ArtifactKind, canonical_order, validate_artifact};
use crate::core::gate::Gate;
use crate::core::route::{self, DispatchRequest};
use crate::core::types::{FindMode, ProviderKind};
use crate::io::config::load_dispatch_config;
use crate::io::journal::{append_event, append_step_meta};
use crate::io::paths::RunPaths;
use crate::io::providers::{
    ExecOutcome, ExecStatus, Preview, ProviderContext, provider_for,
};
use crate::io::run_store::{RunDoc, now_iso};
use crate::io::verify::guardrail_budgets;

/// One dispatch attempt, with enough context for the orchestrator to react.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub request: DispatchRequest,
    pub provider: ProviderKind,
    /// Routing notes (forced provider, fallbacks, config normalization).
    pub notes: Vec<String>,
    pub outcome: ExecOutcome,
}

/// Dispatch the single request the gate implies. Returns None when the gate
/// carries no dispatchable work (terminal pass, or ready states).
#[instrument(skip_all, fields(gate = ?gate.state))]
pub fn dispatch_once(
    repo_root: &Path,
    run_paths: &RunPaths,
    doc: &RunDoc,
    gate: &Gate,
) -> Result<Option<DispatchOutcome>> {
    let Some(request) = route::derive_request(gate, &doc.goal) else {
        return Ok(None);
    };
    let config = load_dispatch_config(run_paths)?;
    let mut notes: Vec<String> = config.note.iter().cloned().collect();

    let forced = std::env::var("CTCP_FORCE_PROVIDER").ok();
    let choice = route::resolve_provider(
        forced.as_deref(),
        config.role_provider(request.role),
        config.mode,
        request.role,
        request.action,
    );
    notes.extend(choice.note.iter().cloned());

    let guardrails = std::fs::read_to_string(run_paths.rel("artifacts/guardrails.md")).ok();
    let ctx = ProviderContext {
        repo_root,
        run_paths,
        doc,
        config: &config,
        budgets: guardrail_budgets(guardrails.as_deref()),
    };

    let mut kind = choice.provider;
    let mut provider = provider_for(kind);
    if let Preview::Disabled { reason } = provider.preview(&ctx, &request)? {
        if kind == ProviderKind::ManualOutbox {
            let outcome = ExecOutcome::disabled(&request.target_path, reason.clone());
            record_step(run_paths, gate, &request, kind, &notes, &outcome)?;
            return Ok(Some(DispatchOutcome {
                request,
                provider: kind,
                notes,
                outcome,
            }));
        }
        warn!(provider = kind.key(), reason, "provider disabled, using manual outbox");
        notes.push(format!("{} disabled: {reason}", kind.key()));
        kind = ProviderKind::ManualOutbox;
        provider = provider_for(kind);
    }

    let mut outcome = provider.execute(&ctx, &request)?;
    if outcome.status == ExecStatus::Executed {
        outcome = recheck_target(run_paths, &request, outcome)?;
    }
    if outcome.status == ExecStatus::OutboxCreated {
        if let Some(prompt) = &outcome.outbox_path {
            append_event(
                run_paths,
                request.role.display_name(),
                "OUTBOX_PROMPT_CREATED",
                prompt,
                &[("target", json!(request.target_path))],
            )?;
        }
    }

    record_step(run_paths, gate, &request, kind, &notes, &outcome)?;
    info!(provider = kind.key(), status = ?outcome.status, "dispatch finished");
    Ok(Some(DispatchOutcome {
        request,
        provider: kind,
        notes,
        outcome,
    }))
}

/// Artifact kind for a run-relative target path, if it is a gated artifact.
fn kind_for_target(target: &str) -> Option<ArtifactKind> {
    canonical_order(FindMode::ResolverPlusWeb)
        .iter()
        .copied()
        .find(|kind| kind.rel_path() == target)
}

/// Re-run the artifact validator on what the provider claims it wrote. An
/// invalid artifact is deleted so the gate does not advance past it.
fn recheck_target(
    run_paths: &RunPaths,
    request: &DispatchRequest,
    outcome: ExecOutcome,
) -> Result<ExecOutcome> {
    let Some(kind) = kind_for_target(&request.target_path) else {
        return Ok(outcome);
    };
    let target_abs = run_paths.rel(&request.target_path);
    let content = match std::fs::read_to_string(&target_abs) {
        Ok(content) => content,
        Err(_) => {
            warn!(target = request.target_path, "provider reported success but wrote nothing");
            return Ok(ExecOutcome::failed(
                &request.target_path,
                format!("provider reported success but {} is missing", request.target_path),
            ));
        }
    };
    if let Err(reason) = validate_artifact(kind, &content) {
        warn!(target = request.target_path, reason, "artifact failed validation, deleting");
        std::fs::remove_file(&target_abs).ok();
        return Ok(ExecOutcome::failed(
            &request.target_path,
            format!("artifact failed validation: {reason}"),
        ));
    }
    Ok(outcome)
}

fn record_step(
    run_paths: &RunPaths,
    gate: &Gate,
    request: &DispatchRequest,
    provider: ProviderKind,
    notes: &[String],
    outcome: &ExecOutcome,
) -> Result<()> {
    let inputs: Vec<serde_json::Value> = request
        .missing_paths
        .iter()
        .map(|path| {
            json!({
                "path": path,
                "exists": run_paths.rel(path).exists(),
            })
        })
        .collect();
    let inputs_ready = inputs
        .iter()
        .all(|input| input["exists"].as_bool().unwrap_or(false));
    let ok = matches!(
        outcome.status,
        ExecStatus::Executed | ExecStatus::OutboxCreated | ExecStatus::OutboxExists
    );
    let row = json!({
        "timestamp": now_iso(),
        "gate": {
            "state": gate.state,
            "owner": gate.owner_label(),
            "path": gate.path,
            "reason": gate.reason,
        },
        "role": request.role.key(),
        "action": request.action.key(),
        "provider": provider.key(),
        "notes": notes,
        "inputs": inputs,
        "inputs_ready": inputs_ready,
        "outputs": outcome.writes,
        "status": outcome.status,
        "result": if ok { "OK" } else { "ERR" },
        "error": outcome.reason,
    });
    append_step_meta(run_paths, &row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gate::GateState;
    use crate::core::types::{Role, RunStatus};
    use crate::io::run_store::{RunDoc, WebFindPolicy, ensure_layout, now_iso};
    use std::fs;
    use tempfile::tempdir;

    fn doc(repo_root: &str) -> RunDoc {
        RunDoc {
            schema_version: "ctcp-run-v1".to_string(),
            run_id: "run_test".to_string(),
            goal: "smoke".to_string(),
            status: RunStatus::Running,
            blocked_reason: None,
            find_mode: FindMode::ResolverOnly,
            web_find_policy: WebFindPolicy::default(),
            repo_root: repo_root.to_string(),
            repo_slug: "repo".to_string(),
            git_sha: "abc".to_string(),
            dirty: false,
            verify_iterations: 0,
            max_iterations: 3,
            created_at: now_iso(),
            updated_at: now_iso(),
        }
    }

    fn blocked_gate(path: &str) -> Gate {
        Gate {
            state: GateState::Blocked,
            owner: Some(Role::Chair),
            path: path.to_string(),
            reason: format!("missing {path}"),
        }
    }

    fn write_config(run_paths: &RunPaths, mode: &str) {
        fs::write(
            run_paths.dispatch_config(),
            format!(
                "{{\"schema_version\": \"ctcp-dispatch-config-v1\", \"mode\": \"{mode}\"}}"
            ),
        )
        .expect("write config");
    }

    #[test]
    fn mock_agent_dispatch_writes_and_validates_target() {
        let repo = tempdir().expect("repo");
        let run = tempdir().expect("run");
        let run_paths = RunPaths::new(run.path().join("run_1"));
        ensure_layout(&run_paths, repo.path()).expect("layout");
        write_config(&run_paths, "mock_agent");
        let doc = doc(&repo.path().display().to_string());

        let result = dispatch_once(
            repo.path(),
            &run_paths,
            &doc,
            &blocked_gate("artifacts/guardrails.md"),
        )
        .expect("dispatch")
        .expect("request");
        assert_eq!(result.provider, ProviderKind::MockAgent);
        assert_eq!(result.outcome.status, ExecStatus::Executed);
        assert!(run_paths.rel("artifacts/guardrails.md").exists());

        let meta = fs::read_to_string(run_paths.step_meta()).expect("meta");
        assert!(meta.contains("\"result\":\"OK\""));
    }

    #[test]
    fn disabled_api_agent_falls_back_to_outbox() {
        let repo = tempdir().expect("repo");
        let run = tempdir().expect("run");
        let run_paths = RunPaths::new(run.path().join("run_1"));
        ensure_layout(&run_paths, repo.path()).expect("layout");
        write_config(&run_paths, "api_agent");
        let doc = doc(&repo.path().display().to_string());

        let result = dispatch_once(
            repo.path(),
            &run_paths,
            &doc,
            &blocked_gate("artifacts/guardrails.md"),
        )
        .expect("dispatch")
        .expect("request");
        assert_eq!(result.provider, ProviderKind::ManualOutbox);
        assert_eq!(result.outcome.status, ExecStatus::OutboxCreated);
        assert!(result.notes.iter().any(|n| n.contains("api_agent disabled")));

        let events = fs::read_to_string(run_paths.events()).expect("events");
        assert!(events.contains("OUTBOX_PROMPT_CREATED"));
    }

    #[test]
    fn invalid_artifact_is_deleted_after_execution() {
        let repo = tempdir().expect("repo");
        let run = tempdir().expect("run");
        let run_paths = RunPaths::new(run.path().join("run_1"));
        ensure_layout(&run_paths, repo.path()).expect("layout");
        fs::write(
            run_paths.dispatch_config(),
            "{\"schema_version\": \"ctcp-dispatch-config-v1\", \"mode\": \"mock_agent\", \
             \"providers\": {\"mock_agent\": {\"fault_mode\": \"missing_field\"}}}",
        )
        .expect("write config");
        let doc = doc(&repo.path().display().to_string());

        let result = dispatch_once(
            repo.path(),
            &run_paths,
            &doc,
            &blocked_gate("artifacts/guardrails.md"),
        )
        .expect("dispatch")
        .expect("request");
        assert_eq!(result.outcome.status, ExecStatus::ExecFailed);
        assert!(
            result
                .outcome
                .reason
                .as_deref()
                .expect("reason")
                .contains("failed validation")
        );
        assert!(!run_paths.rel("artifacts/guardrails.md").exists());
    }

    #[test]
    fn terminal_gate_dispatches_nothing() {
        let repo = tempdir().expect("repo");
        let run = tempdir().expect("run");
        let run_paths = RunPaths::new(run.path().join("run_1"));
        ensure_layout(&run_paths, repo.path()).expect("layout");
        let doc = doc(&repo.path().display().to_string());
        let gate = Gate {
            state: GateState::Pass,
            owner: None,
            path: "RUN.json".to_string(),
            reason: "verified".to_string(),
        };
        assert!(
            dispatch_once(repo.path(), &run_paths, &doc, &gate)
                .expect("dispatch")
                .is_none()
        );
    }
}
