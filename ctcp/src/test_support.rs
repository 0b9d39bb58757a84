//! Test-only helpers for constructing repos and runs.

use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

use crate::core::types::FindMode;
use crate::io::run_store::WebFindPolicy;
use crate::orchestrate::{NewRunOptions, new_run};
use crate::io::paths::RunPaths;

/// A throwaway git repository carrying the mandatory contract files and a
/// verify script, committed so the worktree starts clean.
pub struct TestRepo {
    pub dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        Self::with_verify_script("exit 0\n")
    }

    /// Repo whose `scripts/verify_repo.sh` has the given body.
    pub fn with_verify_script(script: &str) -> Self {
        let dir = TempDir::new().expect("create repo tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("ai_context")).expect("mkdir ai_context");
        fs::create_dir_all(root.join("scripts")).expect("mkdir scripts");
        fs::create_dir_all(root.join("docs")).expect("mkdir docs");
        fs::write(root.join("AGENTS.md"), "# Agents\n\nRoles and rules.\n").expect("write");
        fs::write(
            root.join("ai_context/00_AI_CONTRACT.md"),
            "# AI Contract\n\nArtifacts before actions.\n",
        )
        .expect("write");
        fs::write(
            root.join("ai_context/CTCP_FAST_RULES.md"),
            "# Fast Rules\n\n1. Patch only inside Scope-Allow.\n",
        )
        .expect("write");
        fs::write(root.join("README.md"), "# Test Repo\n\nFixture for runs.\n").expect("write");
        fs::write(root.join("scripts/verify_repo.sh"), script).expect("write");

        git(root, &["init", "-q"]);
        git(root, &["config", "user.email", "test@example.com"]);
        git(root, &["config", "user.name", "Test"]);
        git(root, &["add", "-A"]);
        git(root, &["commit", "-qm", "initial commit"]);
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

pub fn git(root: &Path, args: &[&str]) {
    let ok = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .expect("spawn git")
        .success();
    assert!(ok, "git {args:?} failed");
}

/// Create a run for the repo in its own tempdir. Returns the run dir holder
/// alongside the paths; drop order keeps both alive for the test.
pub fn create_run(repo: &TestRepo, find_mode: FindMode) -> (TempDir, RunPaths) {
    let runs = TempDir::new().expect("create runs tempdir");
    let run_paths = new_run(&NewRunOptions {
        repo_root: repo.root().to_path_buf(),
        goal: "update the readme".to_string(),
        run_id: Some("run_test".to_string()),
        run_dir: Some(runs.path().join("run_test")),
        find_mode,
        web_find_policy: WebFindPolicy::default(),
    })
    .expect("create run");
    (runs, run_paths)
}

/// Point the run's dispatch config at a provider mode, with optional extra
/// provider settings.
pub fn set_dispatch_mode(run_paths: &RunPaths, mode: &str, providers: Option<serde_json::Value>) {
    let doc = serde_json::json!({
        "schema_version": "ctcp-dispatch-config-v1",
        "mode": mode,
        "providers": providers.unwrap_or_else(|| serde_json::json!({})),
    });
    let mut raw = serde_json::to_string_pretty(&doc).expect("serialize config");
    raw.push('\n');
    fs::write(run_paths.dispatch_config(), raw).expect("write dispatch config");
}
