//! Manual outbox provider: numbered prompt files answered by a human.
//!
//! The provider never writes the target artifact itself. It drops a prompt
//! under `outbox/` and the run blocks until a later advance detects that the
//! target appeared. Prompts are deduplicated by (role, action, target) and
//! capped by `max_outbox_prompts`.

use std::fs;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::header::parse_header_map;
use crate::core::route::DispatchRequest;
use crate::core::types::{Action, ProviderKind, Role};
use crate::io::providers::{
    ExecOutcome, ExecStatus, GuardrailBudgets, Preview, Provider, ProviderContext,
};
use crate::io::run_store::write_atomic;

const PROMPT_TEMPLATE: &str = include_str!("prompts/outbox_prompt.md");

static PROMPT_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{3}_.+\.md$").expect("prompt file regex"));

pub struct ManualOutbox;

impl Provider for ManualOutbox {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ManualOutbox
    }

    fn preview(&self, ctx: &ProviderContext<'_>, request: &DispatchRequest) -> Result<Preview> {
        let state = scan_outbox(ctx, request)?;
        if let Some(existing) = state.duplicate {
            return Ok(Preview::OutboxExists { path: existing });
        }
        if state.prompt_count >= ctx.config.budgets.max_outbox_prompts {
            return Ok(Preview::BudgetExceeded {
                reason: budget_reason(state.prompt_count, ctx.config.budgets.max_outbox_prompts),
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
        let state = scan_outbox(ctx, request)?;
        if let Some(existing) = state.duplicate {
            return Ok(ExecOutcome::outbox(
                ExecStatus::OutboxExists,
                &request.target_path,
                &existing,
            ));
        }
        if state.prompt_count >= ctx.config.budgets.max_outbox_prompts {
            let mut outcome = ExecOutcome::failed(
                &request.target_path,
                budget_reason(state.prompt_count, ctx.config.budgets.max_outbox_prompts),
            );
            outcome.status = ExecStatus::BudgetExceeded;
            return Ok(outcome);
        }

        let filename = format!(
            "{:03}_{}_{}.md",
            state.next_index,
            request.role.key(),
            request.action.key()
        );
        let rel = format!("outbox/{filename}");
        let body = render_prompt(ctx, request)?;
        write_atomic(&ctx.run_paths.rel(&rel), &body)?;
        debug!(prompt = %rel, "outbox prompt created");
        Ok(ExecOutcome::outbox(
            ExecStatus::OutboxCreated,
            &request.target_path,
            &rel,
        ))
    }
}

struct OutboxState {
    prompt_count: u32,
    next_index: u32,
    /// Run-relative path of an existing prompt for the same request.
    duplicate: Option<String>,
}

fn budget_reason(count: u32, max: u32) -> String {
    format!("outbox budget exceeded ({count}/{max})")
}

fn scan_outbox(ctx: &ProviderContext<'_>, request: &DispatchRequest) -> Result<OutboxState> {
    let dir = ctx.run_paths.outbox_dir();
    let mut state = OutboxState {
        prompt_count: 0,
        next_index: 1,
        duplicate: None,
    };
    if !dir.exists() {
        return Ok(state);
    }
    let mut names: Vec<String> = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.context("read outbox entry")?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort_unstable();
    for name in names {
        if !PROMPT_FILE.is_match(&name) {
            continue;
        }
        state.prompt_count += 1;
        if let Ok(index) = name[..3].parse::<u32>() {
            state.next_index = state.next_index.max(index + 1);
        }
        let content = fs::read_to_string(dir.join(&name))
            .with_context(|| format!("read outbox prompt {name}"))?;
        let headers = parse_header_map(&content);
        let matches = headers.get("role").map(String::as_str) == Some(request.role.key())
            && headers.get("action").map(String::as_str) == Some(request.action.key())
            && headers.get("target-path").map(String::as_str)
                == Some(request.target_path.as_str());
        if matches && state.duplicate.is_none() {
            state.duplicate = Some(format!("outbox/{name}"));
        }
    }
    Ok(state)
}

fn render_prompt(ctx: &ProviderContext<'_>, request: &DispatchRequest) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("outbox", PROMPT_TEMPLATE)
        .context("register outbox template")?;
    let template = env.get_template("outbox").context("load outbox template")?;
    let write_abs = ctx.run_paths.rel(&request.target_path);
    let patch_only = request.target_path.ends_with("diff.patch");
    let rendered = template
        .render(context! {
            run_dir => ctx.run_paths.run_dir.display().to_string(),
            repo_root => ctx.repo_root.display().to_string(),
            goal => request.goal,
            role => request.role.key(),
            action => request.action.key(),
            target_path => request.target_path,
            write_abs => write_abs.display().to_string(),
            reason => request.reason,
            missing_paths => request.missing_paths,
            max_files => GuardrailBudgets::display(ctx.budgets.max_files),
            max_total_bytes => GuardrailBudgets::display(ctx.budgets.max_total_bytes),
            max_iterations => GuardrailBudgets::display(ctx.budgets.max_iterations),
            patch_only => patch_only,
            instructions => instructions_for(request.role, request.action),
        })
        .context("render outbox template")?;
    Ok(rendered)
}

/// Task body per (role, action), with a generic fallback.
fn instructions_for(role: Role, action: Action) -> &'static str {
    match (role, action) {
        (Role::Chair, Action::PlanDraft) => {
            "Produce the requested planning artifact. Guardrails and analysis use \
             `Key: Value` headers; PLAN_draft.md must carry every PLAN header field \
             with Status: DRAFT."
        }
        (Role::Chair, Action::PlanSigned) => {
            "Sign the plan: copy PLAN_draft.md to the target with Status: SIGNED and \
             the final Scope-Allow, Gates, Budgets, Stop, Behaviors, and Results."
        }
        (Role::Chair, Action::FileRequest) => {
            "Write a ctcp-file-request-v1 JSON document listing the repo files the \
             patch needs, with a budget that covers the mandatory contract files."
        }
        (Role::Researcher, Action::FindWeb) => {
            "Write a ctcp-find-web-v1 JSON document. Every result needs url, locator, \
             fetched_at, excerpt, why_relevant, and risk_flags."
        }
        (Role::ContractGuardian, Action::ReviewContract)
        | (Role::CostController, Action::ReviewCost) => {
            "Review the PLAN draft. Output a Verdict: APPROVE or BLOCK header plus \
             'Blocking Reasons:' and 'Required Fix/Artifacts:' sections."
        }
        (Role::Librarian, Action::ContextPack) => {
            "Produce a ctcp-context-pack-v1 JSON document answering the file request \
             within its byte and file budget."
        }
        (Role::Patchmaker, Action::MakePatch) | (Role::Fixer, Action::FixPatch) => {
            "Produce a unified diff implementing the signed plan within Scope-Allow. \
             Keep it under the patch policy limits."
        }
        _ => "Produce the target artifact described above.",
    }
}
