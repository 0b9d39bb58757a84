//! Workflow resolver: produces `artifacts/find_result.json`.
//!
//! An external resolver command can be plugged in via `CTCP_RESOLVER_CMD`;
//! it is handed the goal and an output path and must write the document
//! itself. Without one (or when it fails) we fall back to the built-in
//! minimal patch-and-verify workflow so a run can always start.

use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::io::paths::RunPaths;
use crate::io::process::run_command_with_timeout;
use crate::io::run_store::{to_pretty_json, write_atomic};

const RESOLVER_TIMEOUT: Duration = Duration::from_secs(120);
const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

pub const FALLBACK_WORKFLOW_ID: &str = "wf_minimal_patch_verify";

/// Write `artifacts/find_result.json`, via the external resolver when
/// configured, otherwise the built-in fallback.
#[instrument(skip_all, fields(goal))]
pub fn resolve_workflow(run_paths: &RunPaths, goal: &str) -> Result<()> {
    let out_path = run_paths.rel("artifacts/find_result.json");
    if let Some(template) = resolver_command() {
        match run_external(&template, goal, &out_path.display().to_string()) {
            Ok(true) if out_path.exists() => {
                info!("external resolver produced find_result");
                return Ok(());
            }
            Ok(_) => warn!("external resolver produced no output, using fallback"),
            Err(e) => warn!(err = %e, "external resolver failed, using fallback"),
        }
    }

    let doc = json!({
        "schema_version": "ctcp-find-result-v1",
        "goal": goal,
        "selected_workflow_id": FALLBACK_WORKFLOW_ID,
        "candidates": [
            {"workflow_id": FALLBACK_WORKFLOW_ID, "score": 1.0,
             "why": "built-in minimal patch-and-verify workflow"}
        ],
        "decision": {
            "reason": "fallback_minimal_workflow",
            "fallback_used": true
        }
    });
    write_atomic(&out_path, &to_pretty_json(&doc)?)?;
    info!("fallback workflow selected");
    Ok(())
}

fn resolver_command() -> Option<String> {
    std::env::var("CTCP_RESOLVER_CMD")
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Returns Ok(true) when the resolver exited zero.
fn run_external(template: &str, goal: &str, out: &str) -> Result<bool> {
    let argv: Vec<String> = template
        .split_whitespace()
        .map(|token| match token {
            "{GOAL}" => goal.to_string(),
            "{OUT}" => out.to_string(),
            other => other.to_string(),
        })
        .collect();
    let Some(program) = argv.first() else {
        return Ok(false);
    };
    let mut cmd = Command::new(program);
    cmd.args(&argv[1..]);
    let result = run_command_with_timeout(cmd, None, RESOLVER_TIMEOUT, OUTPUT_LIMIT_BYTES)?;
    Ok(!result.timed_out && result.exit_code() == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::artifacts::{ArtifactKind, validate_artifact};
    use crate::io::run_store::ensure_layout;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn fallback_doc_selects_minimal_workflow() {
        let dir = tempdir().expect("tempdir");
        let run_paths = RunPaths::new(dir.path().join("run_1"));
        ensure_layout(&run_paths, Path::new("/work/repo")).expect("layout");

        resolve_workflow(&run_paths, "fix the readme").expect("resolve");
        let raw = std::fs::read_to_string(run_paths.rel("artifacts/find_result.json"))
            .expect("read");
        validate_artifact(ArtifactKind::FindResult, &raw).expect("valid");
        let doc: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(doc["selected_workflow_id"], FALLBACK_WORKFLOW_ID);
        assert_eq!(doc["decision"]["reason"], "fallback_minimal_workflow");
    }

    #[test]
    fn external_resolver_runs_with_substituted_argv() {
        let dir = tempdir().expect("tempdir");
        let out = dir.path().join("find_result.json");
        let ok = run_external("touch {OUT}", "goal", &out.display().to_string()).expect("run");
        assert!(ok);
        assert!(out.exists());
    }

    #[test]
    fn failing_external_resolver_reports_false() {
        let ok = run_external("false", "goal", "/tmp/never.json").expect("run");
        assert!(!ok);
    }
}
