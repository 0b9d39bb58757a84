//! Local execution provider: runs the in-process Librarian.
//!
//! Restricted to `(role=librarian, action=context_pack)`. The routing layer
//! already redirects every other combination, so anything else arriving here
//! is reported as a failure rather than executed.

use anyhow::Result;
use tracing::{instrument, warn};

use crate::core::route::DispatchRequest;
use crate::core::types::{Action, ProviderKind, Role};
use crate::io::librarian::{self, BudgetTooSmall, MandatoryFileMissing};
use crate::io::providers::{ExecOutcome, Preview, Provider, ProviderContext};
use crate::io::run_store::{to_pretty_json, write_atomic};

pub struct LocalExec;

fn allowed(request: &DispatchRequest) -> bool {
    request.role == Role::Librarian && request.action == Action::ContextPack
}

impl Provider for LocalExec {
    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalExec
    }

    fn preview(&self, ctx: &ProviderContext<'_>, request: &DispatchRequest) -> Result<Preview> {
        if !allowed(request) {
            return Ok(Preview::Disabled {
                reason: format!(
                    "local_exec forbidden for ({}, {})",
                    request.role, request.action
                ),
            });
        }
        if !ctx.run_paths.rel("artifacts/file_request.json").exists() {
            return Ok(Preview::Disabled {
                reason: "artifacts/file_request.json missing".to_string(),
            });
        }
        Ok(Preview::CanExec)
    }

    #[instrument(skip_all, fields(target = %request.target_path))]
    fn execute(
        &self,
        ctx: &ProviderContext<'_>,
        request: &DispatchRequest,
    ) -> Result<ExecOutcome> {
        if !allowed(request) {
            warn!(role = %request.role, action = %request.action, "local_exec request refused");
            return Ok(ExecOutcome::failed(
                &request.target_path,
                format!(
                    "local_exec forbidden for ({}, {})",
                    request.role, request.action
                ),
            ));
        }
        let request_path = ctx.run_paths.rel("artifacts/file_request.json");
        let raw = match std::fs::read_to_string(&request_path) {
            Ok(raw) => raw,
            Err(e) => {
                return Ok(ExecOutcome::failed(
                    &request.target_path,
                    format!("read artifacts/file_request.json: {e}"),
                ));
            }
        };
        let file_request = match librarian::parse_file_request(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                return Ok(ExecOutcome::failed(
                    &request.target_path,
                    format!("invalid file_request: {e:#}"),
                ));
            }
        };

        match librarian::build_context_pack(ctx.repo_root, &ctx.doc.repo_slug, &file_request) {
            Ok(pack) => {
                write_atomic(&ctx.run_paths.rel(&request.target_path), &to_pretty_json(&pack)?)?;
                let log = format!("librarian: {}\n", pack.summary);
                write_atomic(
                    &ctx.run_paths.logs_dir().join("dispatch_local_exec_librarian.log"),
                    &log,
                )?;
                Ok(ExecOutcome::executed(
                    &request.target_path,
                    vec![request.target_path.clone()],
                ))
            }
            Err(err) => {
                if err.downcast_ref::<MandatoryFileMissing>().is_some() {
                    // A repo without its contract files cannot host this run.
                    return Ok(ExecOutcome::fatal(&request.target_path, format!("{err:#}")));
                }
                if err.downcast_ref::<BudgetTooSmall>().is_some() {
                    return Ok(ExecOutcome::failed(&request.target_path, format!("{err:#}")));
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FindMode, RunStatus};
    use crate::io::config::DispatchConfig;
    use crate::io::paths::RunPaths;
    use crate::io::providers::{ExecStatus, GuardrailBudgets};
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

    fn context_pack_request() -> DispatchRequest {
        DispatchRequest {
            role: Role::Librarian,
            action: Action::ContextPack,
            target_path: "artifacts/context_pack.json".to_string(),
            missing_paths: vec!["artifacts/context_pack.json".to_string()],
            reason: "missing artifacts/context_pack.json".to_string(),
            goal: "smoke".to_string(),
        }
    }

    fn seed_repo(root: &std::path::Path) {
        fs::create_dir_all(root.join("ai_context")).expect("mkdir");
        fs::write(root.join("AGENTS.md"), "# Agents\n").expect("write");
        fs::write(root.join("ai_context/00_AI_CONTRACT.md"), "# Contract\n").expect("write");
        fs::write(root.join("ai_context/CTCP_FAST_RULES.md"), "# Rules\n").expect("write");
        fs::write(root.join("README.md"), "# Readme\n").expect("write");
    }

    fn seed_file_request(run_paths: &RunPaths, max_total_bytes: u64) {
        let doc = serde_json::json!({
            "schema_version": "ctcp-file-request-v1",
            "goal": "smoke",
            "needs": [{"path": "README.md", "mode": "full"}],
            "budget": {"max_files": 8, "max_total_bytes": max_total_bytes},
            "reason": "context"
        });
        fs::write(run_paths.rel("artifacts/file_request.json"), doc.to_string()).expect("write");
    }

    #[test]
    fn builds_context_pack_for_librarian() {
        let repo = tempdir().expect("repo");
        let run = tempdir().expect("run");
        seed_repo(repo.path());
        let run_paths = RunPaths::new(run.path().join("run_1"));
        ensure_layout(&run_paths, repo.path()).expect("layout");
        seed_file_request(&run_paths, 100_000);
        let doc = doc(&repo.path().display().to_string());
        let config = DispatchConfig::default();
        let ctx = ProviderContext {
            repo_root: repo.path(),
            run_paths: &run_paths,
            doc: &doc,
            config: &config,
            budgets: GuardrailBudgets::default(),
        };
        let outcome = LocalExec.execute(&ctx, &context_pack_request()).expect("execute");
        assert_eq!(outcome.status, ExecStatus::Executed);
        let raw = fs::read_to_string(run_paths.rel("artifacts/context_pack.json")).expect("read");
        assert!(raw.contains("ctcp-context-pack-v1"));
        assert!(raw.contains("AGENTS.md"));
    }

    #[test]
    fn budget_too_small_blocks_without_writing() {
        let repo = tempdir().expect("repo");
        let run = tempdir().expect("run");
        seed_repo(repo.path());
        let run_paths = RunPaths::new(run.path().join("run_1"));
        ensure_layout(&run_paths, repo.path()).expect("layout");
        seed_file_request(&run_paths, 4);
        let doc = doc(&repo.path().display().to_string());
        let config = DispatchConfig::default();
        let ctx = ProviderContext {
            repo_root: repo.path(),
            run_paths: &run_paths,
            doc: &doc,
            config: &config,
            budgets: GuardrailBudgets::default(),
        };
        let outcome = LocalExec.execute(&ctx, &context_pack_request()).expect("execute");
        assert_eq!(outcome.status, ExecStatus::ExecFailed);
        assert!(!outcome.fatal);
        assert!(outcome.reason.expect("reason").contains("BUDGET_TOO_SMALL"));
        assert!(!run_paths.rel("artifacts/context_pack.json").exists());
    }

    #[test]
    fn missing_contract_file_is_fatal() {
        let repo = tempdir().expect("repo");
        let run = tempdir().expect("run");
        seed_repo(repo.path());
        fs::remove_file(repo.path().join("AGENTS.md")).expect("remove");
        let run_paths = RunPaths::new(run.path().join("run_1"));
        ensure_layout(&run_paths, repo.path()).expect("layout");
        seed_file_request(&run_paths, 100_000);
        let doc = doc(&repo.path().display().to_string());
        let config = DispatchConfig::default();
        let ctx = ProviderContext {
            repo_root: repo.path(),
            run_paths: &run_paths,
            doc: &doc,
            config: &config,
            budgets: GuardrailBudgets::default(),
        };
        let outcome = LocalExec.execute(&ctx, &context_pack_request()).expect("execute");
        assert!(outcome.fatal);
        assert!(
            outcome
                .reason
                .expect("reason")
                .contains("mandatory context file missing")
        );
    }

    #[test]
    fn non_librarian_request_is_refused() {
        let repo = tempdir().expect("repo");
        let run = tempdir().expect("run");
        let run_paths = RunPaths::new(run.path().join("run_1"));
        ensure_layout(&run_paths, repo.path()).expect("layout");
        let doc = doc(&repo.path().display().to_string());
        let config = DispatchConfig::default();
        let ctx = ProviderContext {
            repo_root: repo.path(),
            run_paths: &run_paths,
            doc: &doc,
            config: &config,
            budgets: GuardrailBudgets::default(),
        };
        let mut request = context_pack_request();
        request.role = Role::Chair;
        request.action = Action::PlanDraft;
        let outcome = LocalExec.execute(&ctx, &request).expect("execute");
        assert_eq!(outcome.status, ExecStatus::ExecFailed);
        assert!(outcome.reason.expect("reason").contains("forbidden"));
    }
}
