//! API agent provider: shells out to an external LLM agent command.
//!
//! The agent never edits the repo. It receives a rendered prompt plus an
//! evidence pack under `outbox/`, and its stdout becomes the target artifact
//! after strict parsing. Every invocation is recorded in `api_calls.jsonl`.

use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::core::route::DispatchRequest;
use crate::core::types::{Action, ProviderKind};
use crate::io::journal::append_api_call;
use crate::io::process::run_command_with_timeout;
use crate::io::providers::{
    ExecOutcome, GuardrailBudgets, Preview, Provider, ProviderContext,
};
use crate::io::run_store::{now_iso, write_atomic};

const PROMPT_TEMPLATE: &str = include_str!("prompts/agent_prompt.md");
const AGENT_TIMEOUT: Duration = Duration::from_secs(600);
const OUTPUT_LIMIT_BYTES: usize = 2 * 1024 * 1024;

const REQUIRED_ENV: [&str; 2] = ["OPENAI_API_KEY", "OPENAI_BASE_URL"];

pub struct ApiAgent;

fn env_missing() -> Vec<&'static str> {
    REQUIRED_ENV
        .iter()
        .copied()
        .filter(|name| std::env::var(name).map(|v| v.trim().is_empty()).unwrap_or(true))
        .collect()
}

/// Command template for a request: action-specific env first, then the
/// generic one, then the dispatch config's `providers.api_agent` section.
fn command_template(ctx: &ProviderContext<'_>, action: Action) -> Option<String> {
    let (env_key, config_key) = match action {
        Action::MakePatch | Action::FixPatch => ("CTCP_PATCH_CMD", "patch_cmd"),
        Action::PlanDraft | Action::PlanSigned => ("CTCP_PLAN_CMD", "plan_cmd"),
        _ => ("CTCP_AGENT_CMD", "agent_cmd"),
    };
    for key in [env_key, "CTCP_AGENT_CMD"] {
        if let Ok(value) = std::env::var(key) {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    let section = ctx.config.provider_section("api_agent")?;
    for key in [config_key, "agent_cmd"] {
        if let Some(value) = section.get(key).and_then(serde_json::Value::as_str) {
            if !value.trim().is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

impl Provider for ApiAgent {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ApiAgent
    }

    fn preview(&self, ctx: &ProviderContext<'_>, request: &DispatchRequest) -> Result<Preview> {
        let missing = env_missing();
        if !missing.is_empty() {
            return Ok(Preview::Disabled {
                reason: format!("missing env: {}", missing.join(", ")),
            });
        }
        if command_template(ctx, request.action).is_none() {
            return Ok(Preview::Disabled {
                reason: "no agent command configured (CTCP_AGENT_CMD or providers.api_agent)"
                    .to_string(),
            });
        }
        Ok(Preview::CanExec)
    }

    #[instrument(skip_all, fields(role = %request.role, action = %request.action))]
    fn execute(
        &self,
        ctx: &ProviderContext<'_>,
        request: &DispatchRequest,
    ) -> Result<ExecOutcome> {
        let template = match command_template(ctx, request.action) {
            Some(t) => t,
            None => {
                return Ok(ExecOutcome::disabled(
                    &request.target_path,
                    "no agent command configured (CTCP_AGENT_CMD or providers.api_agent)",
                ));
            }
        };

        let evidence = write_evidence_pack(ctx, request)?;
        let prompt_rel = format!(
            "outbox/AGENT_PROMPT_{}_{}.md",
            request.role.key(),
            request.action.key()
        );
        let prompt = render_prompt(ctx, request, &evidence)?;
        let prompt_abs = ctx.run_paths.rel(&prompt_rel);
        write_atomic(&prompt_abs, &prompt)?;

        let target_abs = ctx.run_paths.rel(&request.target_path);
        let argv = build_argv(&template, &[
            ("{PROMPT_FILE}", prompt_abs.display().to_string()),
            ("{TARGET_FILE}", target_abs.display().to_string()),
            ("{RUN_DIR}", ctx.run_paths.run_dir.display().to_string()),
            ("{REPO_ROOT}", ctx.repo_root.display().to_string()),
            ("{ROLE}", request.role.key().to_string()),
            ("{ACTION}", request.action.key().to_string()),
        ]);
        if argv.is_empty() {
            return Ok(ExecOutcome::failed(
                &request.target_path,
                "agent command template is empty",
            ));
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(ctx.repo_root);
        debug!(cmd = %argv.join(" "), "invoking agent");
        let started = Instant::now();
        let out = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            AGENT_TIMEOUT,
            OUTPUT_LIMIT_BYTES,
        )?;
        let rc = out.exit_code();

        let stem = format!("agent_{}_{}", request.role.key(), request.action.key());
        let mut writes = vec![prompt_rel.clone()];
        writes.extend(evidence.iter().cloned());
        let stdout_log = format!("logs/{stem}.stdout.log");
        let stderr_log = format!("logs/{stem}.stderr.log");
        write_atomic(
            &ctx.run_paths.rel(&stdout_log),
            &(String::from_utf8_lossy(&out.stdout).into_owned()
                + &out.stdout_truncated_notice("agent")),
        )?;
        write_atomic(
            &ctx.run_paths.rel(&stderr_log),
            &(String::from_utf8_lossy(&out.stderr).into_owned()
                + &out.stderr_truncated_notice("agent")),
        )?;
        writes.push(stdout_log);
        writes.push(stderr_log.clone());

        append_api_call(
            ctx.run_paths,
            &json!({
                "ts": now_iso(),
                "role": request.role.key(),
                "action": request.action.key(),
                "target": request.target_path,
                "cmd": argv,
                "rc": rc,
                "timed_out": out.timed_out,
                "duration_ms": started.elapsed().as_millis() as u64,
                "stdout_bytes": out.stdout.len(),
            }),
        )?;

        if out.timed_out {
            return Ok(ExecOutcome::failed(
                &request.target_path,
                format!("agent command timed out after {}s", AGENT_TIMEOUT.as_secs()),
            ));
        }
        if rc != 0 {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let tail = tail_chars(stderr.trim(), 400);
            warn!(rc, "agent command failed");
            return Ok(ExecOutcome::failed(
                &request.target_path,
                format!("agent command exited {rc}: {tail} (see {stderr_log})"),
            ));
        }

        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        let body = match parse_output(&request.target_path, &stdout) {
            Ok(body) => body,
            Err(reason) => {
                if request.target_path.ends_with("diff.patch") {
                    // Leave a blocking review so a human sees why no patch landed.
                    let review = format!(
                        "Verdict: BLOCK\n\nBlocking Reasons:\n- {reason}\n\n\
                         Required Fix/Artifacts:\n- rerun the patch agent; output must be a \
                         unified diff\n",
                    );
                    write_atomic(
                        &ctx.run_paths.rel("reviews/review_api_agent.md"),
                        &review,
                    )?;
                    let mut outcome = ExecOutcome::failed(&request.target_path, reason);
                    outcome.writes = writes;
                    outcome.writes.push("reviews/review_api_agent.md".to_string());
                    return Ok(outcome);
                }
                let mut outcome = ExecOutcome::failed(&request.target_path, reason);
                outcome.writes = writes;
                return Ok(outcome);
            }
        };
        write_atomic(&target_abs, &body)?;
        writes.push(request.target_path.clone());
        Ok(ExecOutcome::executed(&request.target_path, writes))
    }
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

/// Whitespace-split argv with literal placeholder tokens replaced.
fn build_argv(template: &str, subs: &[(&str, String)]) -> Vec<String> {
    template
        .split_whitespace()
        .map(|token| {
            for (key, value) in subs {
                if token == *key {
                    return value.clone();
                }
            }
            token.to_string()
        })
        .collect()
}

/// Strict output parsing per target shape.
///
/// Patch targets must open with a `diff --git ` line. JSON targets keep only
/// the outermost object, tolerating chatter around it. Everything else is
/// passed through as-is.
fn parse_output(target_path: &str, stdout: &str) -> Result<String, String> {
    if target_path.ends_with("diff.patch") {
        let first = stdout.lines().find(|line| !line.trim().is_empty());
        return match first {
            Some(line) if line.starts_with("diff --git ") => {
                let mut body = stdout.trim_start_matches(['\n', '\r']).to_string();
                if !body.ends_with('\n') {
                    body.push('\n');
                }
                Ok(body)
            }
            Some(line) => Err(format!(
                "agent output is not a unified diff (first line: '{}')",
                line.trim()
            )),
            None => Err("agent produced empty output".to_string()),
        };
    }
    if target_path.ends_with(".json") {
        let start = stdout.find('{');
        let end = stdout.rfind('}');
        let (start, end) = match (start, end) {
            (Some(s), Some(e)) if e > s => (s, e),
            _ => return Err("agent output contains no JSON object".to_string()),
        };
        let raw = &stdout[start..=end];
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| format!("agent output is not valid JSON: {e}"))?;
        return serde_json::to_string_pretty(&value)
            .map(|mut s| {
                s.push('\n');
                s
            })
            .map_err(|e| format!("reserialize agent JSON: {e}"));
    }
    if stdout.trim().is_empty() {
        return Err("agent produced empty output".to_string());
    }
    let mut body = stdout.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    Ok(body)
}

/// Copies of the run's relevant artifacts the agent can read next to the
/// prompt. Returns the run-relative paths actually written.
fn write_evidence_pack(
    ctx: &ProviderContext<'_>,
    request: &DispatchRequest,
) -> Result<Vec<String>> {
    let mut written = Vec::new();

    let mut context_md = format!("# Context\n\nGoal: {}\n", request.goal);
    for rel in ["artifacts/analysis.md", "artifacts/context_pack.json"] {
        if let Ok(raw) = std::fs::read_to_string(ctx.run_paths.rel(rel)) {
            context_md.push_str(&format!("\n## {rel}\n\n{raw}\n"));
        }
    }
    write_atomic(&ctx.run_paths.rel("outbox/CONTEXT.md"), &context_md)?;
    written.push("outbox/CONTEXT.md".to_string());

    let mut constraints_md = String::from("# Constraints\n");
    for rel in ["artifacts/guardrails.md", "artifacts/PLAN.md"] {
        if let Ok(raw) = std::fs::read_to_string(ctx.run_paths.rel(rel)) {
            constraints_md.push_str(&format!("\n## {rel}\n\n{raw}\n"));
        }
    }
    write_atomic(&ctx.run_paths.rel("outbox/CONSTRAINTS.md"), &constraints_md)?;
    written.push("outbox/CONSTRAINTS.md".to_string());

    if request.action == Action::FixPatch {
        let report = std::fs::read_to_string(ctx.run_paths.verify_report()).unwrap_or_default();
        let brief = format!(
            "# Fix Brief\n\nThe previous patch failed verification. Produce a replacement \
             patch against the clean repo state.\n\n## artifacts/verify_report.md\n\n{report}\n"
        );
        write_atomic(&ctx.run_paths.rel("outbox/FIX_BRIEF.md"), &brief)?;
        written.push("outbox/FIX_BRIEF.md".to_string());
    }

    if let Ok(raw) = std::fs::read_to_string(ctx.run_paths.rel("artifacts/find_web.json")) {
        let externals = format!("# Externals\n\n## artifacts/find_web.json\n\n{raw}\n");
        write_atomic(&ctx.run_paths.rel("outbox/EXTERNALS.md"), &externals)?;
        written.push("outbox/EXTERNALS.md".to_string());
    }

    Ok(written)
}

fn render_prompt(
    ctx: &ProviderContext<'_>,
    request: &DispatchRequest,
    evidence: &[String],
) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("agent", PROMPT_TEMPLATE)
        .context("register agent template")?;
    let template = env.get_template("agent").context("load agent template")?;
    let patch_only = request.target_path.ends_with("diff.patch");
    let rendered = template
        .render(context! {
            run_dir => ctx.run_paths.run_dir.display().to_string(),
            repo_root => ctx.repo_root.display().to_string(),
            goal => request.goal,
            role_name => request.role.display_name(),
            action => request.action.key(),
            target_path => request.target_path,
            reason => request.reason,
            evidence => evidence,
            max_files => GuardrailBudgets::display(ctx.budgets.max_files),
            max_total_bytes => GuardrailBudgets::display(ctx.budgets.max_total_bytes),
            max_iterations => GuardrailBudgets::display(ctx.budgets.max_iterations),
            patch_only => patch_only,
            instructions => instructions_for(request),
        })
        .context("render agent template")?;
    Ok(rendered)
}

fn instructions_for(request: &DispatchRequest) -> &'static str {
    match request.action {
        Action::PlanDraft => {
            "Draft the planning artifact named by Target-Path, honoring the constraints pack."
        }
        Action::PlanSigned => {
            "Finalize the plan with Status: SIGNED and complete header fields."
        }
        Action::FileRequest => {
            "List the repo files needed for this change as a ctcp-file-request-v1 document."
        }
        Action::FindWeb => {
            "Collect external references as a ctcp-find-web-v1 document; every result needs \
             url, locator, fetched_at, excerpt, why_relevant, and risk_flags."
        }
        Action::ContextPack => {
            "Answer the file request as a ctcp-context-pack-v1 document within its budget."
        }
        Action::ReviewContract | Action::ReviewCost => {
            "Review the PLAN draft; output a Verdict header plus 'Blocking Reasons:' and \
             'Required Fix/Artifacts:' sections."
        }
        Action::MakePatch => {
            "Produce a unified diff implementing the signed plan within Scope-Allow."
        }
        Action::FixPatch => {
            "Produce a replacement unified diff that addresses the failures in FIX_BRIEF.md."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_substitutes_placeholder_tokens() {
        let argv = build_argv(
            "agent-cli --prompt {PROMPT_FILE} --role {ROLE}",
            &[
                ("{PROMPT_FILE}", "/tmp/p.md".to_string()),
                ("{ROLE}", "patchmaker".to_string()),
            ],
        );
        assert_eq!(
            argv,
            vec!["agent-cli", "--prompt", "/tmp/p.md", "--role", "patchmaker"]
        );
    }

    #[test]
    fn patch_output_must_open_with_diff_header() {
        let ok = parse_output("artifacts/diff.patch", "\ndiff --git a/x b/x\n--- a/x\n");
        assert!(ok.expect("diff").starts_with("diff --git "));

        let err = parse_output("artifacts/diff.patch", "Here is your patch:\ndiff --git")
            .expect_err("chatter");
        assert!(err.contains("not a unified diff"));

        let err = parse_output("artifacts/diff.patch", "   \n").expect_err("empty");
        assert!(err.contains("empty output"));
    }

    #[test]
    fn json_output_is_extracted_from_chatter() {
        let body = parse_output(
            "artifacts/file_request.json",
            "Sure, here it is:\n{\"schema_version\": \"v\"}\nHope that helps!",
        )
        .expect("json");
        assert!(body.starts_with("{\n"));
        assert!(body.contains("\"schema_version\": \"v\""));
        assert!(body.ends_with('\n'));

        let err =
            parse_output("artifacts/file_request.json", "no json here").expect_err("no json");
        assert!(err.contains("no JSON object"));

        let err = parse_output("artifacts/file_request.json", "{\"broken\": }")
            .expect_err("broken");
        assert!(err.contains("not valid JSON"));
    }

    #[test]
    fn markdown_output_passes_through() {
        let body = parse_output("artifacts/analysis.md", "# Analysis\nbody").expect("md");
        assert_eq!(body, "# Analysis\nbody\n");
    }
}
