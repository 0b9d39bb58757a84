//! Provider routing and fallback behavior across a live run directory.

use std::fs;

use ctcp::core::gate::{self, GateState};
use ctcp::core::types::{FindMode, Role, RunStatus};
use ctcp::exit_codes;
use ctcp::io::run_store::{load_run_doc, snapshot};
use ctcp::orchestrate::advance;
use ctcp::test_support::{TestRepo, create_run, set_dispatch_mode};

const GUARDRAILS: &str =
    "find_mode: resolver_only\nmax_files: 20\nmax_total_bytes: 200000\nmax_iterations: 3\n";

#[test]
fn unconfigured_api_agent_falls_back_to_manual_outbox() {
    let repo = TestRepo::new();
    let (_runs, run_paths) = create_run(&repo, FindMode::ResolverOnly);
    set_dispatch_mode(&run_paths, "api_agent", None);

    let code = advance(&run_paths.run_dir, 4).expect("advance");
    assert_eq!(code, exit_codes::OK);

    let doc = load_run_doc(&run_paths).expect("doc");
    assert_eq!(doc.status, RunStatus::Blocked);
    assert!(run_paths.rel("outbox/001_chair_plan_draft.md").exists());

    let meta = fs::read_to_string(run_paths.step_meta()).expect("meta");
    assert!(meta.contains("api_agent disabled"));
    assert!(meta.contains("\"provider\":\"manual_outbox\""));
}

#[test]
fn answered_outbox_prompt_unblocks_the_next_artifact() {
    let repo = TestRepo::new();
    let (_runs, run_paths) = create_run(&repo, FindMode::ResolverOnly);

    advance(&run_paths.run_dir, 4).expect("advance");
    assert!(run_paths.rel("outbox/001_chair_plan_draft.md").exists());

    // A human answers the guardrails prompt; the next advance moves on to
    // analysis and marks the prompt fulfilled.
    fs::write(run_paths.rel("artifacts/guardrails.md"), GUARDRAILS).expect("write");
    advance(&run_paths.run_dir, 4).expect("advance");

    let events = fs::read_to_string(run_paths.events()).expect("events");
    assert!(events.contains("OUTBOX_PROMPT_FULFILLED"));
    assert!(run_paths.rel("outbox/002_chair_plan_draft.md").exists());
}

#[test]
fn librarian_budget_too_small_blocks_context_pack() {
    let repo = TestRepo::new();
    let (_runs, run_paths) = create_run(&repo, FindMode::ResolverOnly);
    set_dispatch_mode(&run_paths, "mock_agent", None);

    // Walk the run up to the file request, then shrink its budget below
    // what the mandatory contract files need.
    advance(&run_paths.run_dir, 4).expect("advance");
    let request_path = run_paths.rel("artifacts/file_request.json");
    let mut request: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&request_path).expect("read")).expect("json");
    request["budget"]["max_total_bytes"] = serde_json::json!(4);
    fs::write(&request_path, request.to_string()).expect("write");

    let code = advance(&run_paths.run_dir, 4).expect("advance");
    assert_eq!(code, exit_codes::OK);

    let doc = load_run_doc(&run_paths).expect("doc");
    assert_eq!(doc.status, RunStatus::Blocked);
    assert!(
        doc.blocked_reason
            .as_deref()
            .expect("reason")
            .contains("BUDGET_TOO_SMALL")
    );
    assert!(!run_paths.rel("artifacts/context_pack.json").exists());
}

#[test]
fn repeated_provider_failures_turn_the_run_terminal() {
    let repo = TestRepo::new();
    let (_runs, run_paths) = create_run(&repo, FindMode::ResolverOnly);
    set_dispatch_mode(
        &run_paths,
        "mock_agent",
        Some(serde_json::json!({
            "mock_agent": {"fault_mode": "missing_field", "fault_role": "chair"}
        })),
    );

    // Each advance attempts the guardrails gate once and fails validation.
    for _ in 0..3 {
        let code = advance(&run_paths.run_dir, 2).expect("advance");
        assert_eq!(code, exit_codes::OK);
        let doc = load_run_doc(&run_paths).expect("doc");
        assert_eq!(doc.status, RunStatus::Blocked);
    }

    let code = advance(&run_paths.run_dir, 2).expect("advance");
    assert_eq!(code, exit_codes::INVALID);

    let doc = load_run_doc(&run_paths).expect("doc");
    assert_eq!(doc.status, RunStatus::Fail);
    assert_eq!(
        doc.blocked_reason.as_deref(),
        Some("repeated_failure_exceeded")
    );
    assert!(run_paths.bundle().exists());

    let events = fs::read_to_string(run_paths.events()).expect("events");
    assert!(events.contains("STOP_REPEATED_FAILURE"));
}

#[test]
fn malformed_find_web_is_rejected_and_stays_with_the_researcher() {
    let repo = TestRepo::new();
    let (_runs, run_paths) = create_run(&repo, FindMode::ResolverPlusWeb);
    set_dispatch_mode(
        &run_paths,
        "mock_agent",
        Some(serde_json::json!({
            "mock_agent": {"fault_mode": "missing_field", "fault_role": "researcher"}
        })),
    );

    let code = advance(&run_paths.run_dir, 8).expect("advance");
    assert_eq!(code, exit_codes::OK);

    let doc = load_run_doc(&run_paths).expect("doc");
    assert_eq!(doc.status, RunStatus::Blocked);
    assert!(
        doc.blocked_reason
            .as_deref()
            .expect("reason")
            .contains("results[0] missing fields: risk_flags")
    );
    assert!(!run_paths.rel("artifacts/find_web.json").exists());

    let snap = snapshot(&run_paths, &doc).expect("snapshot");
    let gate = gate::evaluate(&snap);
    assert_eq!(gate.state, GateState::Blocked);
    assert_eq!(gate.owner, Some(Role::Researcher));
    assert_eq!(gate.path, "artifacts/find_web.json");
}
