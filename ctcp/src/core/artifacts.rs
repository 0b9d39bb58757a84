//! Canonical artifact set and per-artifact validators.
//!
//! Every artifact has a fixed run-relative path, a producer role, and a
//! validator over its raw content. The gate evaluator walks these in
//! canonical order, so validator reasons double as blocked-gate reasons.

use serde_json::Value;

use crate::core::header::{header_value, parse_header_map};
use crate::core::patch::parse_unified_diff;
use crate::core::plan;
use crate::core::schema::{self, ArtifactSchema};
use crate::core::types::{FindMode, Role, Verdict};

/// Artifacts produced by team roles, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    Guardrails,
    Analysis,
    FindResult,
    FindWeb,
    FileRequest,
    ContextPack,
    PlanDraft,
    ReviewContract,
    ReviewCost,
    PlanSigned,
    Diff,
}

impl ArtifactKind {
    /// Run-relative path for the artifact.
    pub fn rel_path(self) -> &'static str {
        match self {
            ArtifactKind::Guardrails => "artifacts/guardrails.md",
            ArtifactKind::Analysis => "artifacts/analysis.md",
            ArtifactKind::FindResult => "artifacts/find_result.json",
            ArtifactKind::FindWeb => "artifacts/find_web.json",
            ArtifactKind::FileRequest => "artifacts/file_request.json",
            ArtifactKind::ContextPack => "artifacts/context_pack.json",
            ArtifactKind::PlanDraft => "artifacts/PLAN_draft.md",
            ArtifactKind::ReviewContract => "reviews/review_contract.md",
            ArtifactKind::ReviewCost => "reviews/review_cost.md",
            ArtifactKind::PlanSigned => "artifacts/PLAN.md",
            ArtifactKind::Diff => "artifacts/diff.patch",
        }
    }

    /// Role responsible for producing the artifact.
    pub fn producer(self) -> Role {
        match self {
            ArtifactKind::Guardrails | ArtifactKind::Analysis => Role::Chair,
            ArtifactKind::FindResult => Role::Resolver,
            ArtifactKind::FindWeb => Role::Researcher,
            ArtifactKind::FileRequest => Role::Chair,
            ArtifactKind::ContextPack => Role::Librarian,
            ArtifactKind::PlanDraft => Role::Chair,
            ArtifactKind::ReviewContract => Role::ContractGuardian,
            ArtifactKind::ReviewCost => Role::CostController,
            ArtifactKind::PlanSigned => Role::Chair,
            ArtifactKind::Diff => Role::Patchmaker,
        }
    }
}

/// Canonical evaluation order for a run's find mode.
///
/// `find_web` participates only in `resolver_plus_web` runs.
pub fn canonical_order(find_mode: FindMode) -> &'static [ArtifactKind] {
    const WITH_WEB: &[ArtifactKind] = &[
        ArtifactKind::Guardrails,
        ArtifactKind::Analysis,
        ArtifactKind::FindResult,
        ArtifactKind::FindWeb,
        ArtifactKind::FileRequest,
        ArtifactKind::ContextPack,
        ArtifactKind::PlanDraft,
        ArtifactKind::ReviewContract,
        ArtifactKind::ReviewCost,
        ArtifactKind::PlanSigned,
        ArtifactKind::Diff,
    ];
    const RESOLVER_ONLY: &[ArtifactKind] = &[
        ArtifactKind::Guardrails,
        ArtifactKind::Analysis,
        ArtifactKind::FindResult,
        ArtifactKind::FileRequest,
        ArtifactKind::ContextPack,
        ArtifactKind::PlanDraft,
        ArtifactKind::ReviewContract,
        ArtifactKind::ReviewCost,
        ArtifactKind::PlanSigned,
        ArtifactKind::Diff,
    ];
    match find_mode {
        FindMode::ResolverOnly => RESOLVER_ONLY,
        FindMode::ResolverPlusWeb => WITH_WEB,
    }
}

/// Validate artifact content, returning a human-readable reason on failure.
pub fn validate_artifact(kind: ArtifactKind, content: &str) -> Result<(), String> {
    match kind {
        ArtifactKind::Guardrails => validate_guardrails(content),
        ArtifactKind::Analysis => validate_analysis(content),
        ArtifactKind::FindResult => {
            validate_json_artifact(content, ArtifactSchema::FindResult, |doc| {
                schema::validate(ArtifactSchema::FindResult, doc)
            })
        }
        ArtifactKind::FindWeb => {
            validate_json_artifact(content, ArtifactSchema::FindWeb, schema::validate_find_web)
        }
        ArtifactKind::FileRequest => {
            validate_json_artifact(content, ArtifactSchema::FileRequest, |doc| {
                schema::validate(ArtifactSchema::FileRequest, doc)
            })
        }
        ArtifactKind::ContextPack => {
            validate_json_artifact(content, ArtifactSchema::ContextPack, |doc| {
                schema::validate(ArtifactSchema::ContextPack, doc)
            })
        }
        ArtifactKind::PlanDraft => plan::validate_draft(content).map_err(|errors| errors.join("; ")),
        ArtifactKind::ReviewContract | ArtifactKind::ReviewCost => {
            validate_review(content).map(|_| ())
        }
        ArtifactKind::PlanSigned => plan::validate_signed(content)
            .map(|_| ())
            .map_err(|errors| errors.join("; ")),
        ArtifactKind::Diff => parse_unified_diff(content)
            .map(|_| ())
            .map_err(|error| error.message),
    }
}

/// Required guardrail keys, checked as `Key: Value` headers.
fn validate_guardrails(content: &str) -> Result<(), String> {
    let headers = parse_header_map(content);
    let mode = headers
        .get("find_mode")
        .ok_or("guardrails missing find_mode")?;
    if FindMode::parse(mode).is_none() {
        return Err(format!("guardrails find_mode invalid: '{mode}'"));
    }
    for key in ["max_files", "max_total_bytes", "max_iterations"] {
        let ok = headers
            .get(key)
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(|value| value > 0)
            .unwrap_or(false);
        if !ok {
            return Err(format!("guardrails {key} must be a positive integer"));
        }
    }
    Ok(())
}

fn validate_analysis(content: &str) -> Result<(), String> {
    if content.trim().is_empty() {
        Err("analysis is empty".to_string())
    } else {
        Ok(())
    }
}

fn validate_json_artifact(
    content: &str,
    schema: ArtifactSchema,
    check: impl Fn(&Value) -> Result<(), Vec<String>>,
) -> Result<(), String> {
    let doc: Value = serde_json::from_str(content)
        .map_err(|e| format!("invalid JSON ({}): {e}", schema.id()))?;
    check(&doc).map_err(|errors| errors.join("; "))
}

/// Validate a review document and extract its verdict.
pub fn validate_review(content: &str) -> Result<Verdict, String> {
    let verdict = match header_value(content, "verdict") {
        Some(raw) if raw.eq_ignore_ascii_case("approve") => Verdict::Approve,
        Some(raw) if raw.eq_ignore_ascii_case("block") => Verdict::Block,
        Some(raw) => return Err(format!("review Verdict must be APPROVE or BLOCK (got '{raw}')")),
        None => return Err("review missing Verdict header".to_string()),
    };
    for section in ["Blocking Reasons:", "Required Fix/Artifacts:"] {
        if !content.contains(section) {
            return Err(format!("review missing section '{section}'"));
        }
    }
    Ok(verdict)
}
