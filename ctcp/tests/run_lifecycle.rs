//! End-to-end runs driven by the deterministic mock agent.

use std::fs;

use ctcp::core::types::{FindMode, RunStatus};
use ctcp::exit_codes;
use ctcp::io::run_store::load_run_doc;
use ctcp::orchestrate::advance;
use ctcp::test_support::{TestRepo, create_run, set_dispatch_mode};

#[test]
fn mock_agent_run_reaches_pass() {
    let repo = TestRepo::new();
    let (_runs, run_paths) = create_run(&repo, FindMode::ResolverOnly);
    set_dispatch_mode(&run_paths, "mock_agent", None);

    let code = advance(&run_paths.run_dir, 32).expect("advance");
    assert_eq!(code, exit_codes::OK);

    let doc = load_run_doc(&run_paths).expect("doc");
    assert_eq!(doc.status, RunStatus::Pass);
    assert_eq!(doc.verify_iterations, 1);

    // Every gated artifact exists in the run directory.
    for rel in [
        "artifacts/guardrails.md",
        "artifacts/analysis.md",
        "artifacts/find_result.json",
        "artifacts/file_request.json",
        "artifacts/context_pack.json",
        "artifacts/PLAN_draft.md",
        "reviews/review_contract.md",
        "reviews/review_cost.md",
        "artifacts/PLAN.md",
        "artifacts/diff.patch",
        "artifacts/patch_apply.json",
        "artifacts/verify_report.md",
    ] {
        assert!(run_paths.rel(rel).exists(), "missing {rel}");
    }

    let marker: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(run_paths.patch_marker()).expect("marker"))
            .expect("marker json");
    assert_eq!(marker["rc"], 0);

    let report = fs::read_to_string(run_paths.verify_report()).expect("report");
    assert!(report.contains("Result: PASS"));
    assert!(report.contains("Gate: lite"));

    // The mock patch landed in the repo and no failure bundle was produced.
    assert!(repo.root().join("docs/mock_agent_probe.txt").exists());
    assert!(!run_paths.bundle().exists());

    let events = fs::read_to_string(run_paths.events()).expect("events");
    assert!(events.contains("WORKFLOW_RESOLVED"));
    assert!(events.contains("patch_apply"));
    assert!(events.contains("VERIFY_PASSED"));
    assert!(events.contains("run_pass"));
}

#[test]
fn failed_verify_bundles_and_enters_fix_loop() {
    let repo = TestRepo::with_verify_script("echo 'lite gate failed' >&2\nexit 1\n");
    let (_runs, run_paths) = create_run(&repo, FindMode::ResolverOnly);
    set_dispatch_mode(&run_paths, "mock_agent", None);

    let code = advance(&run_paths.run_dir, 32).expect("advance");
    assert_eq!(code, exit_codes::INVALID);

    let doc = load_run_doc(&run_paths).expect("doc");
    assert_eq!(doc.status, RunStatus::Fail);
    assert_eq!(doc.blocked_reason.as_deref(), Some("verify_failed"));
    assert_eq!(doc.verify_iterations, 1);
    assert!(run_paths.bundle().exists());

    let report = fs::read_to_string(run_paths.verify_report()).expect("report");
    assert!(report.contains("Result: FAIL"));
    assert!(report.contains("- lite gate failed"));

    let events = fs::read_to_string(run_paths.events()).expect("events");
    assert!(events.contains("VERIFY_FAILED"));
    assert!(events.contains("BUNDLE_CREATED"));

    // The fixer already produced a replacement patch; a second advance
    // applies it and verifies again.
    let code = advance(&run_paths.run_dir, 32).expect("second advance");
    assert_eq!(code, exit_codes::INVALID);
    let doc = load_run_doc(&run_paths).expect("doc");
    assert_eq!(doc.verify_iterations, 2);

    let diff = fs::read_to_string(run_paths.diff()).expect("diff");
    assert!(diff.contains("fixed probe"));
}

#[test]
fn exhausted_iteration_budget_blocks_the_run() {
    let repo = TestRepo::with_verify_script("echo 'lite gate failed' >&2\nexit 1\n");
    let (_runs, run_paths) = create_run(&repo, FindMode::ResolverOnly);
    set_dispatch_mode(&run_paths, "mock_agent", None);

    // First pass through verify burns one iteration and leaves a fixer patch.
    let code = advance(&run_paths.run_dir, 32).expect("advance");
    assert_eq!(code, exit_codes::INVALID);
    let doc = load_run_doc(&run_paths).expect("doc");
    assert_eq!(doc.verify_iterations, 1);

    // Tighten the signed plan's budget below the iterations already spent.
    let plan_path = run_paths.rel("artifacts/PLAN.md");
    let plan = fs::read_to_string(&plan_path).expect("plan");
    assert!(plan.contains("max_iterations: 3"));
    fs::write(&plan_path, plan.replace("max_iterations: 3", "max_iterations: 1"))
        .expect("write plan");

    // The next advance applies the fixer patch, then stops at the budget
    // instead of verifying again.
    let code = advance(&run_paths.run_dir, 32).expect("second advance");
    assert_eq!(code, exit_codes::OK);

    let doc = load_run_doc(&run_paths).expect("doc");
    assert_eq!(doc.status, RunStatus::Blocked);
    assert_eq!(doc.blocked_reason.as_deref(), Some("max_iterations_exceeded"));
    assert_eq!(doc.max_iterations, 1);
    assert_eq!(doc.verify_iterations, 1);

    let events = fs::read_to_string(run_paths.events()).expect("events");
    assert!(events.contains("STOP_MAX_ITERATIONS"));
}

#[test]
fn resolver_plus_web_run_collects_external_findings() {
    let repo = TestRepo::new();
    let (_runs, run_paths) = create_run(&repo, FindMode::ResolverPlusWeb);
    set_dispatch_mode(&run_paths, "mock_agent", None);

    let code = advance(&run_paths.run_dir, 32).expect("advance");
    assert_eq!(code, exit_codes::OK);

    let doc = load_run_doc(&run_paths).expect("doc");
    assert_eq!(doc.status, RunStatus::Pass);
    let find_web = fs::read_to_string(run_paths.rel("artifacts/find_web.json")).expect("find_web");
    assert!(find_web.contains("risk_flags"));
}
