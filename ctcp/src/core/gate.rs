//! Gate evaluation: the single next thing a run is waiting on.
//!
//! `evaluate` is a pure function over a [`RunSnapshot`] assembled from the run
//! directory. The first unmet condition in canonical artifact order wins, so
//! the result is total and deterministic for a given snapshot.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::artifacts::{self, ArtifactKind, canonical_order};
use crate::core::types::{FindMode, Role, RunStatus, Verdict};

/// Hex SHA-256 of artifact content, used to pin patches to apply markers.
pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Parsed `artifacts/patch_apply.json` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchMarker {
    pub patch_sha256: String,
    pub rc: i32,
}

/// In-memory view of a run directory for gate evaluation.
#[derive(Debug, Clone, Default)]
pub struct RunSnapshot {
    pub status: Option<RunStatus>,
    pub blocked_reason: Option<String>,
    pub find_mode: FindMode,
    /// Present artifacts by kind, with raw content.
    pub artifacts: BTreeMap<ArtifactKind, String>,
    /// `artifacts/diff.patch.v2` content when a fixer revision exists.
    pub diff_v2: Option<String>,
    pub patch_marker: Option<PatchMarker>,
    /// `Patch-SHA256` header of `artifacts/verify_report.md`, if present.
    pub verify_report_sha: Option<String>,
}

/// What the run is waiting on next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Pass,
    Fail,
    Blocked,
    /// `find_result` is missing; the in-process resolver produces it.
    ReadyResolve,
    ReadyApply,
    ReadyVerify,
}

/// Evaluated gate: state plus the owner, path, and reason that explain it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gate {
    pub state: GateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<Role>,
    pub path: String,
    pub reason: String,
}

impl Gate {
    fn new(state: GateState, owner: Option<Role>, path: &str, reason: impl Into<String>) -> Self {
        Self {
            state,
            owner,
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Owner label for trace lines and prompts.
    pub fn owner_label(&self) -> String {
        self.owner
            .map(|role| role.display_name().to_string())
            .unwrap_or_else(|| "Orchestrator".to_string())
    }
}

/// Combined blocked path used when both reviews exist but are not approved.
pub const REVIEWS_PATH: &str = "reviews/review_contract.md,reviews/review_cost.md";

/// Compute the next gate for a snapshot. First unmet condition wins.
pub fn evaluate(snap: &RunSnapshot) -> Gate {
    match snap.status {
        Some(RunStatus::Pass) => {
            return Gate::new(GateState::Pass, None, "", "run already passed");
        }
        Some(RunStatus::Fail) => return evaluate_fail_state(snap),
        _ => {}
    }

    for kind in canonical_order(snap.find_mode) {
        if *kind == ArtifactKind::Diff {
            // Handled below so v2 revisions and the apply marker participate.
            continue;
        }
        match snap.artifacts.get(kind) {
            None => {
                let state = if *kind == ArtifactKind::FindResult {
                    GateState::ReadyResolve
                } else {
                    GateState::Blocked
                };
                return Gate::new(
                    state,
                    Some(kind.producer()),
                    kind.rel_path(),
                    format!("missing {}", kind.rel_path()),
                );
            }
            Some(content) => {
                if let Err(reason) = artifacts::validate_artifact(*kind, content) {
                    return Gate::new(
                        GateState::Blocked,
                        Some(kind.producer()),
                        kind.rel_path(),
                        reason,
                    );
                }
            }
        }
    }

    if let Some(gate) = reviews_not_approved(snap) {
        return gate;
    }

    let Some(active) = active_patch(snap) else {
        return Gate::new(
            GateState::Blocked,
            Some(Role::Patchmaker),
            ArtifactKind::Diff.rel_path(),
            format!("missing {}", ArtifactKind::Diff.rel_path()),
        );
    };
    if let Err(reason) = artifacts::validate_artifact(ArtifactKind::Diff, active) {
        return Gate::new(
            GateState::Blocked,
            Some(Role::Patchmaker),
            ArtifactKind::Diff.rel_path(),
            reason,
        );
    }

    let sha = sha256_hex(active);
    if marker_matches(snap, &sha) {
        Gate::new(
            GateState::ReadyVerify,
            None,
            ArtifactKind::Diff.rel_path(),
            "patch applied, verify pending",
        )
    } else {
        Gate::new(
            GateState::ReadyApply,
            None,
            ArtifactKind::Diff.rel_path(),
            "patch ready to apply",
        )
    }
}

/// Fail-state gates keep the fixer loop moving: a fresh patch re-enters
/// apply, an applied-but-unverified patch re-enters verify, otherwise the
/// run stays failed and the fixer owns the bundle.
fn evaluate_fail_state(snap: &RunSnapshot) -> Gate {
    if let Some(active) = active_patch(snap) {
        if artifacts::validate_artifact(ArtifactKind::Diff, active).is_ok() {
            let sha = sha256_hex(active);
            if !marker_matches(snap, &sha) {
                return Gate::new(
                    GateState::ReadyApply,
                    None,
                    ArtifactKind::Diff.rel_path(),
                    "fixer patch ready to apply",
                );
            }
            if snap.verify_report_sha.as_deref() != Some(sha.as_str()) {
                return Gate::new(
                    GateState::ReadyVerify,
                    None,
                    ArtifactKind::Diff.rel_path(),
                    "fixer patch applied, verify pending",
                );
            }
        }
    }
    let reason = snap
        .blocked_reason
        .clone()
        .unwrap_or_else(|| "verify failed".to_string());
    Gate::new(GateState::Fail, Some(Role::Fixer), "failure_bundle.zip", reason)
}

fn reviews_not_approved(snap: &RunSnapshot) -> Option<Gate> {
    let contract = snap
        .artifacts
        .get(&ArtifactKind::ReviewContract)
        .and_then(|content| artifacts::validate_review(content).ok())?;
    let cost = snap
        .artifacts
        .get(&ArtifactKind::ReviewCost)
        .and_then(|content| artifacts::validate_review(content).ok())?;
    if contract == Verdict::Approve && cost == Verdict::Approve {
        return None;
    }
    let owner = if contract != Verdict::Approve {
        Role::ContractGuardian
    } else {
        Role::CostController
    };
    Some(Gate::new(
        GateState::Blocked,
        Some(owner),
        REVIEWS_PATH,
        format!("waiting for APPROVE reviews (contract={contract}, cost={cost})"),
    ))
}

/// The patch up for apply: a fixer `diff.patch.v2` supersedes `diff.patch`.
pub fn active_patch(snap: &RunSnapshot) -> Option<&str> {
    snap.diff_v2
        .as_deref()
        .or_else(|| snap.artifacts.get(&ArtifactKind::Diff).map(String::as_str))
}

fn marker_matches(snap: &RunSnapshot, sha: &str) -> bool {
    snap.patch_marker
        .as_ref()
        .map(|marker| marker.patch_sha256 == sha && marker.rc == 0)
        .unwrap_or(false)
}
