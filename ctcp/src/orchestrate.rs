//! Run lifecycle: create, inspect, and advance runs.
//!
//! `advance` is the heart of the orchestrator: evaluate the gate, perform the
//! one step it implies (resolve, dispatch, apply, or verify), and repeat until
//! the run blocks on something external or reaches a terminal state. Every
//! state change is journaled before the loop moves on.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::gate::{self, GateState};
use crate::core::types::{FindMode, RunStatus};
use crate::dispatch::{self, DispatchOutcome};
use crate::exit_codes;
use crate::io::bundle::ensure_failure_bundle;
use crate::io::config::ensure_dispatch_config;
use crate::io::git::Git;
use crate::io::journal::{append_event, append_trace, read_events, read_step_meta};
use crate::io::patch_guard::{self, ApplyOutcome};
use crate::io::paths::{self, RunPaths};
use crate::io::providers::ExecStatus;
use crate::io::resolver;
use crate::io::run_store::{
    self, REPO_REF_SCHEMA, RUN_SCHEMA, RepoRef, RunDoc, WebFindPolicy, load_run_doc, now_iso,
    save_run_doc,
};
use crate::io::verify;

pub const DEFAULT_MAX_STEPS: u32 = 16;

const ORCHESTRATOR: &str = "Orchestrator";

/// Options for creating a run.
#[derive(Debug, Clone)]
pub struct NewRunOptions {
    pub repo_root: PathBuf,
    pub goal: String,
    pub run_id: Option<String>,
    pub run_dir: Option<PathBuf>,
    pub find_mode: FindMode,
    pub web_find_policy: WebFindPolicy,
}

/// Create a fresh run directory outside the repo and journal its birth.
#[instrument(skip_all, fields(goal = %opts.goal))]
pub fn new_run(opts: &NewRunOptions) -> Result<RunPaths> {
    let repo_root = opts
        .repo_root
        .canonicalize()
        .with_context(|| format!("resolve repo root {}", opts.repo_root.display()))?;
    let git = Git::new(&repo_root);
    let git_sha = git
        .head_sha()
        .with_context(|| format!("{} is not a usable git repository", repo_root.display()))?;
    let branch = git.current_branch()?;
    let dirty = !git.status_porcelain()?.is_empty();

    let run_id = opts.run_id.clone().unwrap_or_else(paths::default_run_id);
    let run_dir = opts
        .run_dir
        .clone()
        .unwrap_or_else(|| paths::default_run_dir(&repo_root, &run_id));
    let run_paths = RunPaths::new(run_dir);
    run_store::ensure_layout(&run_paths, &repo_root)?;

    let now = now_iso();
    let mut doc = RunDoc {
        schema_version: RUN_SCHEMA.to_string(),
        run_id: run_id.clone(),
        goal: opts.goal.clone(),
        status: RunStatus::Running,
        blocked_reason: None,
        find_mode: opts.find_mode,
        web_find_policy: opts.web_find_policy.clone(),
        repo_root: repo_root.display().to_string(),
        repo_slug: paths::repo_slug(&repo_root),
        git_sha: git_sha.clone(),
        dirty,
        verify_iterations: 0,
        max_iterations: run_store::DEFAULT_MAX_ITERATIONS,
        created_at: now.clone(),
        updated_at: now.clone(),
    };
    save_run_doc(&run_paths, &mut doc)?;
    run_store::save_repo_ref(
        &run_paths,
        &RepoRef {
            schema_version: REPO_REF_SCHEMA.to_string(),
            repo_root: repo_root.display().to_string(),
            branch,
            git_sha,
            dirty,
            captured_at: now,
        },
    )?;
    append_trace(
        &run_paths,
        &format!(
            "# CTCP Run Trace\n\nRun-Id: {run_id}\nGoal: {}\nRepo-Root: {}\n",
            opts.goal,
            repo_root.display()
        ),
    )?;
    run_store::write_atomic(&run_paths.events(), "")?;
    ensure_dispatch_config(&run_paths)?;
    run_store::update_last_run_pointer(&repo_root, &run_paths.run_dir)?;
    append_event(
        &run_paths,
        ORCHESTRATOR,
        "run_created",
        "RUN.json",
        &[("goal", json!(opts.goal)), ("run_id", json!(run_id))],
    )?;
    info!(run_dir = %run_paths.run_dir.display(), "run created");
    Ok(run_paths)
}

/// Print the gate and run status. Returns the process exit code.
pub fn status(run_dir: &Path) -> Result<i32> {
    let run_paths = RunPaths::new(run_dir);
    let doc = load_run_doc(&run_paths)?;
    let snap = run_store::snapshot(&run_paths, &doc)?;
    let gate = gate::evaluate(&snap);
    println!("run: {} ({})", doc.run_id, doc.status);
    if let Some(reason) = &doc.blocked_reason {
        println!("blocked_reason: {reason}");
    }
    println!("gate: {:?}", gate.state);
    println!("owner: {}", gate.owner_label());
    println!("path: {}", gate.path);
    println!("reason: {}", gate.reason);
    println!("iterations: {}/{}", doc.verify_iterations, doc.max_iterations);
    Ok(exit_code_for(doc.status))
}

fn exit_code_for(status: RunStatus) -> i32 {
    match status {
        RunStatus::Fail => exit_codes::INVALID,
        _ => exit_codes::OK,
    }
}

/// Advance the run until it blocks, finishes, or exhausts `max_steps`.
#[instrument(skip_all, fields(run_dir = %run_dir.display(), max_steps))]
pub fn advance(run_dir: &Path, max_steps: u32) -> Result<i32> {
    let run_paths = RunPaths::new(run_dir);
    for step in 0..max_steps.max(1) {
        let mut doc = load_run_doc(&run_paths)?;
        sync_outbox_fulfillment(&run_paths)?;

        if doc.status == RunStatus::Pass {
            return Ok(exit_codes::OK);
        }
        // A blocked run re-enters running for this attempt; if it is still
        // stuck the gate will say so again.
        if doc.status == RunStatus::Blocked {
            doc.status = RunStatus::Running;
            doc.blocked_reason = None;
            save_run_doc(&run_paths, &mut doc)?;
        }

        let snap = run_store::snapshot(&run_paths, &doc)?;
        let gate = gate::evaluate(&snap);
        info!(step, state = ?gate.state, reason = %gate.reason, "gate evaluated");

        match gate.state {
            GateState::Pass => return Ok(exit_codes::OK),
            GateState::ReadyResolve => {
                resolver::resolve_workflow(&run_paths, &doc.goal)?;
                append_event(
                    &run_paths,
                    ORCHESTRATOR,
                    "WORKFLOW_RESOLVED",
                    "artifacts/find_result.json",
                    &[],
                )?;
            }
            GateState::ReadyApply => {
                if let Some(code) = apply_step(&run_paths, &mut doc)? {
                    return Ok(code);
                }
            }
            GateState::ReadyVerify => {
                return verify_step(&run_paths, &mut doc, &snap);
            }
            GateState::Blocked | GateState::Fail => {
                if let Some(code) = dispatch_step(&run_paths, &mut doc, &gate)? {
                    return Ok(code);
                }
            }
        }
    }
    warn!("step budget exhausted without reaching a terminal state");
    Ok(exit_codes::OK)
}

/// Apply the active patch. Returns an exit code when the loop must stop.
fn apply_step(run_paths: &RunPaths, doc: &mut RunDoc) -> Result<Option<i32>> {
    let git = Git::new(&doc.repo_root);
    match patch_guard::apply_patch(run_paths, doc, &git)? {
        ApplyOutcome::Applied { patch_sha256 } => {
            append_event(
                run_paths,
                ORCHESTRATOR,
                "patch_apply",
                "artifacts/diff.patch",
                &[("rc", json!(0)), ("patch_sha256", json!(patch_sha256))],
            )?;
            Ok(None)
        }
        ApplyOutcome::BlockedDirty { entries } => {
            let files: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
            append_event(
                run_paths,
                ORCHESTRATOR,
                "APPLY_BLOCKED_DIRTY",
                "artifacts/diff.patch",
                &[("files", json!(files))],
            )?;
            block(run_paths, doc, "repo_dirty_before_apply")?;
            Ok(Some(exit_codes::OK))
        }
        outcome @ (ApplyOutcome::Denied { .. }
        | ApplyOutcome::CheckFailed { .. }
        | ApplyOutcome::ApplyFailed { .. }) => {
            append_event(
                run_paths,
                ORCHESTRATOR,
                "patch_apply",
                "artifacts/diff.patch",
                &[("error", json!(outcome.reason()))],
            )?;
            block(run_paths, doc, "patch_apply_failed")?;
            Ok(Some(exit_codes::OK))
        }
    }
}

/// Run one verify iteration. Always terminal for this advance call.
fn verify_step(
    run_paths: &RunPaths,
    doc: &mut RunDoc,
    snap: &crate::core::gate::RunSnapshot,
) -> Result<i32> {
    use crate::core::artifacts::ArtifactKind;

    let plan = snap.artifacts.get(&ArtifactKind::PlanSigned).map(String::as_str);
    let guardrails = snap.artifacts.get(&ArtifactKind::Guardrails).map(String::as_str);
    doc.max_iterations = verify::resolve_max_iterations(plan, guardrails);

    if doc.verify_iterations >= doc.max_iterations {
        append_event(
            run_paths,
            ORCHESTRATOR,
            "STOP_MAX_ITERATIONS",
            "RUN.json",
            &[("iterations", json!(doc.verify_iterations))],
        )?;
        block(run_paths, doc, "max_iterations_exceeded")?;
        return Ok(exit_codes::OK);
    }
    doc.verify_iterations += 1;
    save_run_doc(run_paths, doc)?;

    let repo_root = PathBuf::from(&doc.repo_root);
    let result = verify::run_verify(
        run_paths,
        &repo_root,
        doc.verify_iterations,
        doc.max_iterations,
    )?;
    append_trace(
        run_paths,
        &format!(
            "\n## Verify {}/{}\n\n- result: {}\n- rc: {}\n- command: {}\n",
            doc.verify_iterations,
            doc.max_iterations,
            if result.passed { "PASS" } else { "FAIL" },
            result.rc,
            result.command
        ),
    )?;

    if result.passed {
        doc.status = RunStatus::Pass;
        doc.blocked_reason = None;
        save_run_doc(run_paths, doc)?;
        append_event(
            run_paths,
            ORCHESTRATOR,
            "VERIFY_PASSED",
            "artifacts/verify_report.md",
            &[("rc", json!(result.rc))],
        )?;
        append_event(run_paths, ORCHESTRATOR, "run_pass", "RUN.json", &[])?;
        return Ok(exit_codes::OK);
    }

    doc.status = RunStatus::Fail;
    doc.blocked_reason = Some("verify_failed".to_string());
    save_run_doc(run_paths, doc)?;
    append_event(
        run_paths,
        ORCHESTRATOR,
        "VERIFY_FAILED",
        "artifacts/verify_report.md",
        &[("rc", json!(result.rc))],
    )?;

    // Put the repo back the way we found it before anyone looks at it.
    let git = Git::new(&doc.repo_root);
    if !patch_guard::rollback_last_applied(run_paths, &git)? {
        warn!("could not roll back applied patch after failed verify");
    }

    let bundle = ensure_failure_bundle(run_paths)?;
    append_event(run_paths, ORCHESTRATOR, "BUNDLE_CREATED", &bundle, &[])?;

    // Hand the failure to the fixer right away; if its provider needs a
    // human, the prompt is already waiting when someone picks this up.
    let snap = run_store::snapshot(run_paths, doc)?;
    let gate = gate::evaluate(&snap);
    if gate.state == GateState::Fail {
        let repo_root = PathBuf::from(&doc.repo_root);
        if let Some(result) = dispatch::dispatch_once(&repo_root, run_paths, doc, &gate)? {
            journal_dispatch(run_paths, &result)?;
        }
    }
    Ok(exit_codes::INVALID)
}

/// Dispatch the blocked gate's request. Returns an exit code when the loop
/// must stop, None to keep advancing.
fn dispatch_step(run_paths: &RunPaths, doc: &mut RunDoc, gate: &gate::Gate) -> Result<Option<i32>> {
    let repo_root = PathBuf::from(&doc.repo_root);
    let Some(result) = dispatch::dispatch_once(&repo_root, run_paths, doc, gate)? else {
        // Nothing dispatchable; stay blocked on the gate reason.
        block(run_paths, doc, &gate.reason)?;
        return Ok(Some(exit_code_for(doc.status)));
    };
    journal_dispatch(run_paths, &result)?;

    if result.outcome.fatal {
        doc.status = RunStatus::Fail;
        doc.blocked_reason = result.outcome.reason.clone();
        save_run_doc(run_paths, doc)?;
        append_event(
            run_paths,
            ORCHESTRATOR,
            "run_fail",
            "RUN.json",
            &[("reason", json!(result.outcome.reason))],
        )?;
        return Ok(Some(exit_codes::INVALID));
    }

    match result.outcome.status {
        ExecStatus::Executed => Ok(None),
        ExecStatus::OutboxCreated | ExecStatus::OutboxExists => {
            block(run_paths, doc, &gate.reason)?;
            Ok(Some(exit_codes::OK))
        }
        ExecStatus::BudgetExceeded => {
            append_event(
                run_paths,
                ORCHESTRATOR,
                "STOP_BUDGET_EXCEEDED",
                "outbox",
                &[("reason", json!(result.outcome.reason))],
            )?;
            block(
                run_paths,
                doc,
                result.outcome.reason.as_deref().unwrap_or("budget_exceeded"),
            )?;
            Ok(Some(exit_codes::OK))
        }
        ExecStatus::ExecFailed | ExecStatus::Disabled => {
            if result.outcome.status == ExecStatus::ExecFailed {
                let failures = gate_failure_count(run_paths, &gate.path)?;
                let plan = std::fs::read_to_string(run_paths.rel("artifacts/PLAN.md")).ok();
                let limit = verify::repeated_failure_limit(plan.as_deref());
                if failures > limit {
                    doc.status = RunStatus::Fail;
                    doc.blocked_reason = Some("repeated_failure_exceeded".to_string());
                    save_run_doc(run_paths, doc)?;
                    append_event(
                        run_paths,
                        ORCHESTRATOR,
                        "STOP_REPEATED_FAILURE",
                        &gate.path,
                        &[("failures", json!(failures)), ("limit", json!(limit))],
                    )?;
                    let bundle = ensure_failure_bundle(run_paths)?;
                    append_event(run_paths, ORCHESTRATOR, "BUNDLE_CREATED", &bundle, &[])?;
                    return Ok(Some(exit_codes::INVALID));
                }
            }
            block(
                run_paths,
                doc,
                result.outcome.reason.as_deref().unwrap_or("exec_failed"),
            )?;
            Ok(Some(exit_codes::OK))
        }
    }
}

/// How many dispatch attempts at this gate have already failed.
fn gate_failure_count(run_paths: &RunPaths, gate_path: &str) -> Result<u32> {
    let rows = read_step_meta(run_paths)?;
    let count = rows
        .iter()
        .filter(|row| {
            row["gate"]["path"].as_str() == Some(gate_path)
                && row["result"].as_str() == Some("ERR")
        })
        .count();
    Ok(count as u32)
}

fn journal_dispatch(run_paths: &RunPaths, result: &DispatchOutcome) -> Result<()> {
    let role = result.request.role.display_name();
    match result.outcome.status {
        ExecStatus::Executed => append_event(
            run_paths,
            role,
            "LOCAL_EXEC_COMPLETED",
            &result.request.target_path,
            &[("provider", json!(result.provider.key()))],
        ),
        ExecStatus::ExecFailed => append_event(
            run_paths,
            role,
            "LOCAL_EXEC_FAILED",
            &result.request.target_path,
            &[
                ("provider", json!(result.provider.key())),
                ("error", json!(result.outcome.reason)),
            ],
        ),
        // Outbox creation is journaled by the dispatcher itself.
        _ => Ok(()),
    }
}

fn block(run_paths: &RunPaths, doc: &mut RunDoc, reason: &str) -> Result<()> {
    doc.status = RunStatus::Blocked;
    doc.blocked_reason = Some(reason.to_string());
    save_run_doc(run_paths, doc)?;
    info!(reason, "run blocked");
    Ok(())
}

/// Emit `OUTBOX_PROMPT_FULFILLED` for prompts whose target artifact has
/// appeared since the prompt was created.
fn sync_outbox_fulfillment(run_paths: &RunPaths) -> Result<()> {
    let events = read_events(run_paths)?;
    let mut fulfilled: Vec<&str> = Vec::new();
    let mut created: Vec<(&str, &str)> = Vec::new();
    for event in &events {
        let name = event.get("event").and_then(serde_json::Value::as_str);
        let path = event.get("path").and_then(serde_json::Value::as_str);
        match (name, path) {
            (Some("OUTBOX_PROMPT_FULFILLED"), Some(path)) => fulfilled.push(path),
            (Some("OUTBOX_PROMPT_CREATED"), Some(path)) => {
                if let Some(target) = event.get("target").and_then(serde_json::Value::as_str) {
                    created.push((path, target));
                }
            }
            _ => {}
        }
    }
    let pending: Vec<(String, String)> = created
        .iter()
        .filter(|(prompt, target)| {
            !fulfilled.contains(prompt) && run_paths.rel(target).exists()
        })
        .map(|(prompt, target)| (prompt.to_string(), target.to_string()))
        .collect();
    for (prompt, target) in pending {
        append_event(
            run_paths,
            ORCHESTRATOR,
            "OUTBOX_PROMPT_FULFILLED",
            &prompt,
            &[("target", json!(target))],
        )?;
    }
    Ok(())
}

/// Resolve an optional `--run-dir` argument, falling back to the `LAST_RUN`
/// pointer of the repo at the current directory.
pub fn resolve_run_dir(run_dir: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = run_dir {
        return Ok(dir);
    }
    let cwd = std::env::current_dir().context("resolve current directory")?;
    let pointer = paths::last_run_pointer(&cwd);
    let raw = std::fs::read_to_string(&pointer).with_context(|| {
        format!(
            "no --run-dir given and no run pointer at {}",
            pointer.display()
        )
    })?;
    let dir = PathBuf::from(raw.trim());
    if !dir.is_dir() {
        bail!(
            "run pointer {} names a missing run dir {}",
            pointer.display(),
            dir.display()
        );
    }
    Ok(dir)
}

/// Guard for CLI argument parsing: the repo root must exist and be a dir.
pub fn ensure_repo_root(repo_root: &Path) -> Result<()> {
    if !repo_root.is_dir() {
        bail!("repo root {} is not a directory", repo_root.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;
    use tempfile::tempdir;

    fn git_repo() -> tempfile::TempDir {
        let dir = tempdir().expect("tempdir");
        let run = |args: &[&str]| {
            let ok = Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .status()
                .expect("git")
                .success();
            assert!(ok, "git {args:?}");
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        fs::write(dir.path().join("README.md"), "# Repo\n").expect("write");
        run(&["add", "-A"]);
        run(&["commit", "-qm", "init"]);
        dir
    }

    fn options(repo: &Path, run_dir: &Path) -> NewRunOptions {
        NewRunOptions {
            repo_root: repo.to_path_buf(),
            goal: "smoke".to_string(),
            run_id: Some("run_test".to_string()),
            run_dir: Some(run_dir.to_path_buf()),
            find_mode: FindMode::ResolverOnly,
            web_find_policy: WebFindPolicy::default(),
        }
    }

    #[test]
    fn new_run_creates_layout_and_journal() {
        let repo = git_repo();
        let runs = tempdir().expect("runs");
        let run_dir = runs.path().join("run_test");
        let run_paths = new_run(&options(repo.path(), &run_dir)).expect("new run");

        assert!(run_paths.run_doc().exists());
        assert!(run_paths.repo_ref().exists());
        assert!(run_paths.dispatch_config().exists());
        let trace = fs::read_to_string(run_paths.trace()).expect("trace");
        assert!(trace.contains("# CTCP Run Trace"));
        assert!(trace.contains("run_created"));

        let pointer = fs::read_to_string(paths::last_run_pointer(repo.path())).expect("pointer");
        assert!(pointer.trim().ends_with("run_test"));

        let doc = load_run_doc(&run_paths).expect("doc");
        assert_eq!(doc.status, RunStatus::Running);
        assert!(!doc.git_sha.is_empty());
    }

    #[test]
    fn new_run_refuses_non_empty_dir() {
        let repo = git_repo();
        let runs = tempdir().expect("runs");
        let run_dir = runs.path().join("run_test");
        fs::create_dir_all(&run_dir).expect("mkdir");
        fs::write(run_dir.join("stale.txt"), "x").expect("write");

        let err = new_run(&options(repo.path(), &run_dir)).expect_err("conflict");
        assert!(format!("{err:#}").contains("RUN_DIR_CONFLICT"));
    }

    #[test]
    fn advance_blocks_on_first_missing_artifact() {
        let repo = git_repo();
        let runs = tempdir().expect("runs");
        let run_dir = runs.path().join("run_test");
        let run_paths = new_run(&options(repo.path(), &run_dir)).expect("new run");

        let code = advance(&run_paths.run_dir, 4).expect("advance");
        assert_eq!(code, exit_codes::OK);

        let doc = load_run_doc(&run_paths).expect("doc");
        assert_eq!(doc.status, RunStatus::Blocked);
        assert_eq!(
            doc.blocked_reason.as_deref(),
            Some("missing artifacts/guardrails.md")
        );
        // Default mode is manual outbox, so the chair got a prompt.
        assert!(run_paths.rel("outbox/001_chair_plan_draft.md").exists());
    }

    #[test]
    fn explicit_run_dir_wins_over_pointer() {
        let dir = PathBuf::from("/tmp/run_x");
        assert_eq!(resolve_run_dir(Some(dir.clone())).expect("resolve"), dir);
    }

    #[test]
    fn fulfillment_sync_emits_event_when_target_appears() {
        let repo = git_repo();
        let runs = tempdir().expect("runs");
        let run_dir = runs.path().join("run_test");
        let run_paths = new_run(&options(repo.path(), &run_dir)).expect("new run");
        advance(&run_paths.run_dir, 4).expect("advance");

        // A human answers the guardrails prompt.
        fs::write(
            run_paths.rel("artifacts/guardrails.md"),
            "find_mode: resolver_only\nmax_files: 20\nmax_total_bytes: 200000\nmax_iterations: 3\n",
        )
        .expect("write");
        advance(&run_paths.run_dir, 1).expect("advance");

        let events = fs::read_to_string(run_paths.events()).expect("events");
        assert!(events.contains("OUTBOX_PROMPT_FULFILLED"));
    }
}
