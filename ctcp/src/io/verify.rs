//! Verify runner: executes the repo's verification command in a sanitized
//! environment and turns the result into `artifacts/verify_report.md`.
//!
//! The report pins the SHA of the patch it verified, which is how the gate
//! knows whether a later patch revision still needs a verify pass.

use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::core::gate::sha256_hex;
use crate::core::header::header_value;
use crate::io::paths::RunPaths;
use crate::io::process::run_command_with_timeout;
use crate::io::run_store::{DEFAULT_MAX_ITERATIONS, write_atomic};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(1800);
const OUTPUT_LIMIT_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_VERIFY_CMD: &str = "bash scripts/verify_repo.sh";
const MAX_FAILURE_LINES: usize = 8;
const MAX_FAILURE_LINE_CHARS: usize = 300;

static PLAN_MAX_ITERATIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"max_iterations\s*[:=]\s*(\d+)").expect("max_iterations regex"));

static PLAN_REPEATED_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"repeated_failure\s*[:=]\s*(\d+)").expect("repeated_failure regex")
});

pub const DEFAULT_REPEATED_FAILURE_LIMIT: u32 = 3;

/// Result of one verify pass.
#[derive(Debug)]
pub struct VerifyResult {
    pub passed: bool,
    pub rc: i32,
    pub patch_sha256: String,
    pub command: String,
}

/// Iteration budget: PLAN budgets win over guardrails, which win over the
/// built-in default.
pub fn resolve_max_iterations(plan: Option<&str>, guardrails: Option<&str>) -> u32 {
    if let Some(plan) = plan {
        if let Some(caps) = PLAN_MAX_ITERATIONS.captures(plan) {
            if let Ok(n) = caps[1].parse::<u32>() {
                if n > 0 {
                    return n;
                }
            }
        }
    }
    if let Some(guardrails) = guardrails {
        if let Some(raw) = header_value(guardrails, "max_iterations") {
            if let Ok(n) = raw.trim().parse::<u32>() {
                if n > 0 {
                    return n;
                }
            }
        }
    }
    DEFAULT_MAX_ITERATIONS
}

/// How many times one gate may fail its provider before the run turns
/// terminal, from the plan's Stop rules (`repeated_failure=N`).
pub fn repeated_failure_limit(plan: Option<&str>) -> u32 {
    if let Some(plan) = plan {
        if let Some(caps) = PLAN_REPEATED_FAILURE.captures(plan) {
            if let Ok(n) = caps[1].parse::<u32>() {
                if n > 0 {
                    return n;
                }
            }
        }
    }
    DEFAULT_REPEATED_FAILURE_LIMIT
}

fn verify_command() -> String {
    std::env::var("CTCP_VERIFY_CMD")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_VERIFY_CMD.to_string())
}

/// Strip orchestration and provider state from the child environment so the
/// verify result cannot depend on how this run was dispatched. Live API
/// credentials are removed too unless explicitly allowed.
fn sanitize_env(cmd: &mut Command) {
    cmd.env_remove("CTCP_FORCE_PROVIDER");
    cmd.env_remove("CTCP_MOCK_AGENT_FAULT_MODE");
    cmd.env_remove("CTCP_MOCK_AGENT_FAULT_ROLE");
    let allow_live = std::env::var("CTCP_VERIFY_ALLOW_LIVE_API")
        .map(|v| v == "1")
        .unwrap_or(false);
    if !allow_live {
        for key in ["CTCP_LIVE_API", "OPENAI_API_KEY", "CTCP_OPENAI_API_KEY"] {
            cmd.env_remove(key);
        }
    }
    cmd.env("CTCP_SKIP_LITE_REPLAY", "1");
}

/// Run the verify command against the repo and write the report and logs.
#[instrument(skip_all, fields(iteration, max_iterations))]
pub fn run_verify(
    run_paths: &RunPaths,
    repo_root: &std::path::Path,
    iteration: u32,
    max_iterations: u32,
) -> Result<VerifyResult> {
    let patch = std::fs::read_to_string(run_paths.diff()).unwrap_or_default();
    let patch_sha = sha256_hex(&patch);

    let command = verify_command();
    let argv: Vec<&str> = command.split_whitespace().collect();
    let mut cmd = Command::new(argv.first().copied().unwrap_or("false"));
    cmd.args(&argv[1..]).current_dir(repo_root);
    sanitize_env(&mut cmd);

    info!(command, "running verify");
    let out = run_command_with_timeout(cmd, None, VERIFY_TIMEOUT, OUTPUT_LIMIT_BYTES)?;
    let rc = if out.timed_out { -1 } else { out.exit_code() };
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned()
        + &out.stdout_truncated_notice("verify");
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned()
        + &out.stderr_truncated_notice("verify");
    write_atomic(&run_paths.rel("logs/verify.stdout.log"), &stdout)?;
    write_atomic(&run_paths.rel("logs/verify.stderr.log"), &stderr)?;

    let passed = rc == 0;
    if !passed {
        warn!(rc, "verify failed");
    }
    let report = render_report(
        passed,
        iteration,
        max_iterations,
        &patch_sha,
        &command,
        rc,
        &stdout,
        &stderr,
    );
    write_atomic(&run_paths.verify_report(), &report)?;

    Ok(VerifyResult {
        passed,
        rc,
        patch_sha256: patch_sha,
        command,
    })
}

#[allow(clippy::too_many_arguments)]
fn render_report(
    passed: bool,
    iteration: u32,
    max_iterations: u32,
    patch_sha: &str,
    command: &str,
    rc: i32,
    stdout: &str,
    stderr: &str,
) -> String {
    let mut report = format!(
        "# Verify Report\n\n\
         Result: {}\n\
         Gate: lite\n\
         Iteration: {iteration}/{max_iterations}\n\
         Patch-SHA256: {patch_sha}\n\
         Command: {command}\n\
         Exit-Code: {rc}\n\
         Stdout-Log: logs/verify.stdout.log\n\
         Stderr-Log: logs/verify.stderr.log\n",
        if passed { "PASS" } else { "FAIL" },
    );
    if !passed {
        report.push_str("\n## Failures\n");
        for line in failure_lines(stdout, stderr) {
            report.push_str(&format!("- {line}\n"));
        }
    }
    report
}

/// First few stdout/stderr lines that look like failures, clipped per line.
fn failure_lines(stdout: &str, stderr: &str) -> Vec<String> {
    let mut lines = Vec::new();
    for line in stdout.lines().chain(stderr.lines()) {
        let lower = line.to_ascii_lowercase();
        if lower.contains("error") || lower.contains("failed") {
            let mut clipped: String = line.trim().chars().take(MAX_FAILURE_LINE_CHARS).collect();
            if clipped.is_empty() {
                continue;
            }
            if line.trim().chars().count() > MAX_FAILURE_LINE_CHARS {
                clipped.push_str("...");
            }
            lines.push(clipped);
            if lines.len() >= MAX_FAILURE_LINES {
                break;
            }
        }
    }
    if lines.is_empty() {
        lines.push("verify command returned non-zero".to_string());
    }
    lines
}

/// Parse the guardrails budget headers for prompt display.
pub fn guardrail_budgets(guardrails: Option<&str>) -> crate::io::providers::GuardrailBudgets {
    let mut budgets = crate::io::providers::GuardrailBudgets::default();
    let Some(raw) = guardrails else {
        return budgets;
    };
    let parse = |key: &str| header_value(raw, key).and_then(|v| v.trim().parse().ok());
    budgets.max_files = parse("max_files");
    budgets.max_total_bytes = parse("max_total_bytes");
    budgets.max_iterations = parse("max_iterations");
    budgets
}
