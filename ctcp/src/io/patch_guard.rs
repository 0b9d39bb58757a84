//! Patch guard: the only component allowed to change repository files.
//!
//! Applying a patch is a pipeline with no shortcuts: promote a fixer
//! revision, refuse a dirty worktree, run the policy checks, dry-run with
//! `git apply --check`, then apply and pin the result in
//! `artifacts/patch_apply.json`. The applied patch is kept as
//! `artifacts/last_applied.patch` so a failed verify can roll it back.

use anyhow::{Context, Result, bail};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::gate::sha256_hex;
use crate::core::patch::{PatchError, PatchErrorCode, PatchPolicy, check_policy};
use crate::io::git::{Git, StatusEntry};
use crate::io::journal::append_event;
use crate::io::paths::RunPaths;
use crate::io::run_store::{RunDoc, now_iso, to_pretty_json, write_atomic};

/// Terminal result of one apply attempt.
#[derive(Debug)]
pub enum ApplyOutcome {
    Applied {
        patch_sha256: String,
    },
    /// Tracked files carry uncommitted changes that are not ours to revert.
    BlockedDirty {
        entries: Vec<StatusEntry>,
    },
    /// Patch rejected before touching git (parse, path, or policy).
    Denied {
        error: PatchError,
    },
    /// `git apply --check` refused the patch; nothing was changed.
    CheckFailed {
        rc: i32,
        stderr: String,
    },
    /// The real apply failed after a clean check.
    ApplyFailed {
        rc: i32,
        stderr: String,
    },
}

impl ApplyOutcome {
    /// Short reason string for events and blocked_reason fields.
    pub fn reason(&self) -> String {
        match self {
            ApplyOutcome::Applied { patch_sha256 } => format!("applied {patch_sha256}"),
            ApplyOutcome::BlockedDirty { entries } => {
                format!("repo has {} dirty tracked file(s)", entries.len())
            }
            ApplyOutcome::Denied { error } => error.to_string(),
            ApplyOutcome::CheckFailed { rc, stderr } => {
                format!("{}: git apply --check rc={rc}: {stderr}",
                    PatchErrorCode::PatchGitCheckFail.as_str())
            }
            ApplyOutcome::ApplyFailed { rc, stderr } => {
                format!("{}: git apply rc={rc}: {stderr}", PatchErrorCode::PatchApplyFail.as_str())
            }
        }
    }
}

/// Load the repo's patch policy (`meta/patch_policy.json`), defaulting when
/// the file is absent. A present-but-invalid policy is a denial, not a
/// silent fallback.
pub fn load_policy(repo_root: &std::path::Path) -> Result<PatchPolicy, PatchError> {
    let path = repo_root.join("meta").join("patch_policy.json");
    if !path.exists() {
        return Ok(PatchPolicy::default());
    }
    let raw = std::fs::read_to_string(&path).map_err(|e| {
        PatchError::new(
            PatchErrorCode::PatchPolicyInvalid,
            format!("read {}: {e}", path.display()),
        )
    })?;
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
        PatchError::new(
            PatchErrorCode::PatchPolicyInvalid,
            format!("parse {}: {e}", path.display()),
        )
    })?;
    PatchPolicy::from_value(&value)
}

/// Promote `artifacts/diff.patch.v2` over `artifacts/diff.patch` when the
/// fixer produced a genuinely different patch. Returns true on promotion.
pub fn promote_fixer_patch(run_paths: &RunPaths) -> Result<bool> {
    let v2_path = run_paths.diff_v2();
    if !v2_path.exists() {
        return Ok(false);
    }
    let v2 = std::fs::read_to_string(&v2_path)
        .with_context(|| format!("read {}", v2_path.display()))?;
    let current = std::fs::read_to_string(run_paths.diff()).unwrap_or_default();
    if sha256_hex(&v2) != sha256_hex(&current) {
        write_atomic(&run_paths.diff(), &v2)?;
        info!("fixer patch promoted to artifacts/diff.patch");
    }
    std::fs::remove_file(&v2_path).with_context(|| format!("remove {}", v2_path.display()))?;
    Ok(true)
}

/// Roll back the most recently applied patch, if we still have it.
///
/// Used after a failed verify and by the managed-dirty retry path. Returns
/// false when there is nothing to revert or git refuses the reverse apply.
#[instrument(skip_all)]
pub fn rollback_last_applied(run_paths: &RunPaths, git: &Git) -> Result<bool> {
    let path = run_paths.last_applied_patch();
    if !path.exists() {
        return Ok(false);
    }
    let patch = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let (rc, stderr) = git.apply_reverse(&patch)?;
    if rc != 0 {
        warn!(rc, stderr, "reverse apply failed");
        return Ok(false);
    }
    info!("rolled back last applied patch");
    Ok(true)
}

/// Whether the current dirt is exactly our own previously applied patch,
/// safe to revert before applying a replacement.
fn dirt_is_managed(run_paths: &RunPaths, doc: &RunDoc, patch_sha: &str) -> bool {
    use crate::core::types::RunStatus;
    use crate::io::run_store::load_patch_marker;

    if doc.status != RunStatus::Fail {
        return false;
    }
    if !run_paths.last_applied_patch().exists() {
        return false;
    }
    match load_patch_marker(run_paths) {
        Ok(Some(marker)) => marker.rc == 0 && marker.patch_sha256 != patch_sha,
        _ => false,
    }
}

/// Apply `artifacts/diff.patch` to the repository.
#[instrument(skip_all, fields(repo = %git.workdir().display()))]
pub fn apply_patch(run_paths: &RunPaths, doc: &RunDoc, git: &Git) -> Result<ApplyOutcome> {
    ensure_git_env(git)?;
    if promote_fixer_patch(run_paths)? {
        append_event(
            run_paths,
            "Orchestrator",
            "PATCH_PROMOTED",
            "artifacts/diff.patch",
            &[],
        )?;
    }

    let diff_path = run_paths.diff();
    let patch = std::fs::read_to_string(&diff_path)
        .with_context(|| format!("read {}", diff_path.display()))?;
    let patch_sha = sha256_hex(&patch);

    let dirty = git.status_tracked()?;
    if !dirty.is_empty() {
        if dirt_is_managed(run_paths, doc, &patch_sha) {
            info!("worktree dirty from previous patch, reverting before retry");
            if !rollback_last_applied(run_paths, git)? || git.is_dirty_tracked()? {
                return Ok(ApplyOutcome::BlockedDirty { entries: dirty });
            }
        } else {
            return Ok(ApplyOutcome::BlockedDirty { entries: dirty });
        }
    }

    let policy = match load_policy(git.workdir()) {
        Ok(policy) => policy,
        Err(error) => return Ok(ApplyOutcome::Denied { error }),
    };
    if let Err(error) = check_policy(&patch, &policy) {
        return Ok(ApplyOutcome::Denied { error });
    }

    let (check_rc, check_stderr) = git.apply_check(&patch)?;
    if check_rc != 0 {
        return Ok(ApplyOutcome::CheckFailed {
            rc: check_rc,
            stderr: check_stderr,
        });
    }

    let (rc, stderr) = git.apply(&patch)?;
    write_marker(run_paths, &patch_sha, rc)?;
    if rc != 0 {
        return Ok(ApplyOutcome::ApplyFailed { rc, stderr });
    }
    write_atomic(&run_paths.last_applied_patch(), &patch)?;
    debug!(patch_sha, "patch applied");
    Ok(ApplyOutcome::Applied {
        patch_sha256: patch_sha,
    })
}

fn write_marker(run_paths: &RunPaths, patch_sha: &str, rc: i32) -> Result<()> {
    let marker = json!({
        "patch_sha256": patch_sha,
        "rc": rc,
        "applied_at": now_iso(),
    });
    write_atomic(&run_paths.patch_marker(), &to_pretty_json(&marker)?)
}

fn ensure_git_env(git: &Git) -> Result<()> {
    if git.run_capture(&["rev-parse", "--git-dir"]).is_err() {
        bail!(
            "{}: {} is not a git repository",
            PatchErrorCode::PatchEnvInvalid.as_str(),
            git.workdir().display()
        );
    }
    Ok(())
}
