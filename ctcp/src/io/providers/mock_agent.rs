//! Mock agent provider: deterministic offline artifact producer.
//!
//! Drives tests and offline smoke runs. Payloads depend only on the request
//! and run document. Fault injection is configured via
//! `providers.mock_agent.{fault_mode,fault_role}` in the dispatch config,
//! overridable with `CTCP_MOCK_AGENT_FAULT_MODE` / `CTCP_MOCK_AGENT_FAULT_ROLE`.

use anyhow::{Result, bail};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::core::route::DispatchRequest;
use crate::core::types::{Action, ProviderKind, Role};
use crate::io::librarian;
use crate::io::paths::is_within;
use crate::io::providers::{ExecOutcome, Preview, Provider, ProviderContext};
use crate::io::run_store::{to_pretty_json, write_atomic};

pub struct MockAgent;

#[derive(Debug, Clone, PartialEq, Eq)]
enum FaultMode {
    RaiseException,
    DropOutput,
    CorruptJson,
    MissingField,
    EmptyFile,
    InvalidPatch,
}

impl FaultMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "raise_exception" => Some(FaultMode::RaiseException),
            "drop_output" => Some(FaultMode::DropOutput),
            "corrupt_json" => Some(FaultMode::CorruptJson),
            "missing_field" => Some(FaultMode::MissingField),
            "empty_file" => Some(FaultMode::EmptyFile),
            "invalid_patch" => Some(FaultMode::InvalidPatch),
            _ => None,
        }
    }
}

fn fault_config(ctx: &ProviderContext<'_>) -> (Option<FaultMode>, String) {
    let section = ctx.config.provider_section("mock_agent");
    let mut mode = section
        .and_then(|s| s.get("fault_mode"))
        .and_then(serde_json::Value::as_str)
        .and_then(FaultMode::parse);
    let mut selector = section
        .and_then(|s| s.get("fault_role"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    if let Ok(env_mode) = std::env::var("CTCP_MOCK_AGENT_FAULT_MODE") {
        mode = FaultMode::parse(&env_mode);
    }
    if let Ok(env_selector) = std::env::var("CTCP_MOCK_AGENT_FAULT_ROLE") {
        selector = env_selector;
    }
    (mode, selector)
}

/// Selector tokens are matched against role, action, `role_action`, and the
/// target filename. An empty selector matches every request.
fn fault_applies(selector: &str, request: &DispatchRequest) -> bool {
    let selector = selector.trim();
    if selector.is_empty() {
        return true;
    }
    let filename = request
        .target_path
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let candidates = [
        request.role.key().to_string(),
        request.action.key().to_string(),
        format!("{}_{}", request.role.key(), request.action.key()),
        filename,
    ];
    selector
        .split(['|', ','])
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .any(|token| {
            let token = token.to_ascii_lowercase();
            candidates.iter().any(|candidate| *candidate == token)
        })
}

impl Provider for MockAgent {
    fn kind(&self) -> ProviderKind {
        ProviderKind::MockAgent
    }

    fn preview(&self, _ctx: &ProviderContext<'_>, _request: &DispatchRequest) -> Result<Preview> {
        Ok(Preview::CanExec)
    }

    #[instrument(skip_all, fields(role = %request.role, target = %request.target_path))]
    fn execute(
        &self,
        ctx: &ProviderContext<'_>,
        request: &DispatchRequest,
    ) -> Result<ExecOutcome> {
        let write_abs = ctx.run_paths.rel(&request.target_path);
        if !is_within(&write_abs, &ctx.run_paths.run_dir) {
            return Ok(ExecOutcome::failed(
                &request.target_path,
                format!("target escapes run dir: {}", request.target_path),
            ));
        }

        let (fault, selector) = fault_config(ctx);
        let fault = fault.filter(|_| fault_applies(&selector, request));
        if let Some(mode) = &fault {
            warn!(?mode, "mock agent fault active");
        }

        match fault {
            Some(FaultMode::RaiseException) => {
                bail!("mock agent fault: raise_exception for {}", request.role)
            }
            Some(FaultMode::DropOutput) => {
                // Claims success without producing the artifact; the
                // dispatcher's validator recheck catches it.
                return Ok(ExecOutcome::executed(&request.target_path, Vec::new()));
            }
            Some(FaultMode::EmptyFile) => {
                write_atomic(&write_abs, "")?;
                return Ok(ExecOutcome::executed(
                    &request.target_path,
                    vec![request.target_path.clone()],
                ));
            }
            Some(FaultMode::CorruptJson) => {
                write_atomic(&write_abs, "{\"broken_json\":")?;
                return Ok(ExecOutcome::executed(
                    &request.target_path,
                    vec![request.target_path.clone()],
                ));
            }
            Some(FaultMode::InvalidPatch) => {
                write_atomic(&write_abs, "mock-invalid-patch\n")?;
                return Ok(ExecOutcome::executed(
                    &request.target_path,
                    vec![request.target_path.clone()],
                ));
            }
            _ => {}
        }
        let degraded = fault == Some(FaultMode::MissingField);

        if request.role == Role::Librarian && request.action == Action::ContextPack {
            return self.context_pack(ctx, request);
        }

        let body = payload(ctx, request, degraded)?;
        write_atomic(&write_abs, &body)?;
        debug!("mock artifact written");
        Ok(ExecOutcome::executed(
            &request.target_path,
            vec![request.target_path.clone()],
        ))
    }
}

impl MockAgent {
    /// The mock librarian answers from the real file request, like local_exec.
    fn context_pack(
        &self,
        ctx: &ProviderContext<'_>,
        request: &DispatchRequest,
    ) -> Result<ExecOutcome> {
        let raw = match std::fs::read_to_string(ctx.run_paths.rel("artifacts/file_request.json")) {
            Ok(raw) => raw,
            Err(e) => {
                return Ok(ExecOutcome::failed(
                    &request.target_path,
                    format!("read artifacts/file_request.json: {e}"),
                ));
            }
        };
        let file_request = librarian::parse_file_request(&raw)?;
        match librarian::build_context_pack(ctx.repo_root, &ctx.doc.repo_slug, &file_request) {
            Ok(pack) => {
                write_atomic(&ctx.run_paths.rel(&request.target_path), &to_pretty_json(&pack)?)?;
                Ok(ExecOutcome::executed(
                    &request.target_path,
                    vec![request.target_path.clone()],
                ))
            }
            Err(err) => Ok(ExecOutcome::failed(&request.target_path, format!("{err:#}"))),
        }
    }
}

fn payload(ctx: &ProviderContext<'_>, request: &DispatchRequest, degraded: bool) -> Result<String> {
    let filename = request.target_path.rsplit('/').next().unwrap_or_default();
    let goal = &request.goal;
    let body = match filename {
        "guardrails.md" => {
            let mut text = format!(
                "find_mode: {}\nmax_files: 20\nmax_total_bytes: 200000\n",
                ctx.doc.find_mode
            );
            if !degraded {
                text.push_str("max_iterations: 3\n");
            }
            text
        }
        "analysis.md" => {
            if degraded {
                String::new()
            } else {
                format!(
                    "# Analysis\n\nGoal: {goal}\n\nThe change is a single documented edit; \
                     verify covers it through the lite gate.\n"
                )
            }
        }
        "PLAN_draft.md" => plan_text("DRAFT", goal, degraded),
        "PLAN.md" => plan_text("SIGNED", goal, degraded),
        "file_request.json" => {
            let mut doc = json!({
                "schema_version": "ctcp-file-request-v1",
                "goal": goal,
                "needs": [
                    {"path": "README.md", "mode": "snippets", "line_ranges": [[1, 24]],
                     "why": "entry point overview"}
                ],
                "budget": {"max_files": 8, "max_total_bytes": 120_000},
                "reason": "minimal context for a one-file documentation patch"
            });
            if degraded {
                if let Some(obj) = doc.as_object_mut() {
                    obj.remove("budget");
                }
            }
            to_pretty_json(&doc)?
        }
        "find_web.json" => {
            let mut result = json!({
                "url": "https://docs.example.com/reference",
                "locator": "section 1",
                "fetched_at": "2026-01-01T00:00:00Z",
                "excerpt": "Reference excerpt relevant to the goal.",
                "why_relevant": "confirms the documented behavior",
                "risk_flags": []
            });
            if degraded {
                if let Some(obj) = result.as_object_mut() {
                    obj.remove("risk_flags");
                }
            }
            let doc = json!({
                "schema_version": "ctcp-find-web-v1",
                "goal": goal,
                "constraints": {
                    "allow_domains": ctx.doc.web_find_policy.allow_domains,
                    "max_queries": ctx.doc.web_find_policy.max_queries,
                    "max_results": ctx.doc.web_find_policy.max_results
                },
                "results": [result]
            });
            to_pretty_json(&doc)?
        }
        "review_contract.md" | "review_cost.md" => {
            if degraded {
                "Verdict: APPROVE\n".to_string()
            } else {
                "Verdict: APPROVE\n\nBlocking Reasons:\n- none\n\nRequired Fix/Artifacts:\n- none\n"
                    .to_string()
            }
        }
        "diff.patch" => probe_patch(goal, request.action == Action::FixPatch),
        other => bail!("mock agent has no payload for target '{other}'"),
    };
    Ok(body)
}

fn plan_text(status: &str, goal: &str, degraded: bool) -> String {
    let mut text = format!(
        "# PLAN\n\n\
         Status: {status}\n\
         Scope-Allow: [docs]\n\
         Scope-Deny: [build, dist]\n"
    );
    if !degraded {
        text.push_str("Gates: [lite, plan_check, patch_check, behavior_catalog_check]\n");
    }
    text.push_str(
        "Budgets: {max_iterations: 3, max_files: 5, max_total_bytes: 200000}\n\
         Stop: lite gate passes\n\
         Behaviors: [B001]\n\
         Results: [R001]\n",
    );
    text.push_str(&format!("\nGoal: {goal}\n"));
    text
}

/// One-file additive patch inside the default allow roots. The fixer variant
/// carries different content so its SHA differs from the first attempt.
fn probe_patch(goal: &str, fixed: bool) -> String {
    let marker = if fixed { "fixed probe" } else { "probe" };
    format!(
        "diff --git a/docs/mock_agent_probe.txt b/docs/mock_agent_probe.txt\n\
         new file mode 100644\n\
         --- /dev/null\n\
         +++ b/docs/mock_agent_probe.txt\n\
         @@ -0,0 +1,2 @@\n\
         +mock agent {marker}\n\
         +goal: {goal}\n"
    )
}
