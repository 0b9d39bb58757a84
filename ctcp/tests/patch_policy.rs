//! Patch policy enforcement at the apply gate.

use std::fs;

use ctcp::core::types::{FindMode, RunStatus};
use ctcp::exit_codes;
use ctcp::io::run_store::load_run_doc;
use ctcp::orchestrate::advance;
use ctcp::test_support::{TestRepo, create_run, git, set_dispatch_mode};

#[test]
fn denied_patch_blocks_the_run_without_touching_the_repo() {
    let repo = TestRepo::new();
    // Repo policy that does not allow the docs/ root the mock patch targets.
    fs::create_dir_all(repo.root().join("meta")).expect("mkdir");
    fs::write(
        repo.root().join("meta/patch_policy.json"),
        "{\"allow_roots\": [\"src\", \"README.md\"]}\n",
    )
    .expect("write policy");
    git(repo.root(), &["add", "-A"]);
    git(repo.root(), &["commit", "-qm", "add patch policy"]);

    let (_runs, run_paths) = create_run(&repo, FindMode::ResolverOnly);
    set_dispatch_mode(&run_paths, "mock_agent", None);

    let code = advance(&run_paths.run_dir, 32).expect("advance");
    assert_eq!(code, exit_codes::OK);

    let doc = load_run_doc(&run_paths).expect("doc");
    assert_eq!(doc.status, RunStatus::Blocked);
    assert_eq!(doc.blocked_reason.as_deref(), Some("patch_apply_failed"));

    // No marker, no repo change.
    assert!(!run_paths.patch_marker().exists());
    assert!(!repo.root().join("docs/mock_agent_probe.txt").exists());

    let events = fs::read_to_string(run_paths.events()).expect("events");
    assert!(events.contains("PATCH_POLICY_DENY"));
}

#[test]
fn dirty_worktree_blocks_apply() {
    let repo = TestRepo::new();
    let (_runs, run_paths) = create_run(&repo, FindMode::ResolverOnly);
    set_dispatch_mode(&run_paths, "mock_agent", None);

    // Dirty a tracked file after the run was created.
    fs::write(repo.root().join("README.md"), "# Touched\n").expect("write");

    let code = advance(&run_paths.run_dir, 32).expect("advance");
    assert_eq!(code, exit_codes::OK);

    let doc = load_run_doc(&run_paths).expect("doc");
    assert_eq!(doc.status, RunStatus::Blocked);
    assert_eq!(
        doc.blocked_reason.as_deref(),
        Some("repo_dirty_before_apply")
    );

    let events = fs::read_to_string(run_paths.events()).expect("events");
    assert!(events.contains("APPLY_BLOCKED_DIRTY"));
}
