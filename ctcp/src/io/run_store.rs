//! Run state persistence: `RUN.json`, `repo_ref.json`, and snapshots.
//!
//! The run document is the single source of truth for status and budgets.
//! Writes go through a temp-file rename so a crashed process never leaves a
//! half-written state document.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::artifacts::canonical_order;
use crate::core::gate::{PatchMarker, RunSnapshot};
use crate::core::header::header_value;
use crate::core::types::{FindMode, RunStatus};
use crate::io::paths::{self, RunPaths};

pub const RUN_SCHEMA: &str = "ctcp-run-v1";
pub const REPO_REF_SCHEMA: &str = "ctcp-repo-ref-v1";

/// Default verify iteration budget when neither PLAN nor guardrails set one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Web evidence constraints fixed at run creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebFindPolicy {
    pub allow_domains: Vec<String>,
    pub max_queries: u32,
    pub max_results: u32,
}

impl Default for WebFindPolicy {
    fn default() -> Self {
        Self {
            allow_domains: Vec::new(),
            max_queries: 3,
            max_results: 5,
        }
    }
}

/// Persistent run state document (`RUN.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDoc {
    pub schema_version: String,
    pub run_id: String,
    pub goal: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    pub find_mode: FindMode,
    pub web_find_policy: WebFindPolicy,
    pub repo_root: String,
    pub repo_slug: String,
    pub git_sha: String,
    pub dirty: bool,
    pub verify_iterations: u32,
    pub max_iterations: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// Git reference captured at run creation (`repo_ref.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRef {
    pub schema_version: String,
    pub repo_root: String,
    pub branch: String,
    pub git_sha: String,
    pub dirty: bool,
    pub captured_at: String,
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Write a file atomically via temp file + rename in the same directory.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("no parent dir for {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)
        .with_context(|| format!("STORE_IO_ERROR: write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("STORE_IO_ERROR: rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Pretty-print a serializable document with a trailing newline.
pub fn to_pretty_json<T: Serialize>(value: &T) -> Result<String> {
    let mut text = serde_json::to_string_pretty(value).context("serialize json document")?;
    text.push('\n');
    Ok(text)
}

/// Create the run directory layout.
///
/// Fails with `RUN_DIR_CONFLICT` if the directory exists and is non-empty,
/// and refuses directories inside the target repository.
#[instrument(skip_all, fields(run_dir = %run_paths.run_dir.display()))]
pub fn ensure_layout(run_paths: &RunPaths, repo_root: &Path) -> Result<()> {
    paths::ensure_run_dir_outside_repo(&run_paths.run_dir, repo_root)?;
    if run_paths.run_dir.exists() {
        let non_empty = fs::read_dir(&run_paths.run_dir)
            .with_context(|| format!("read dir {}", run_paths.run_dir.display()))?
            .next()
            .is_some();
        if non_empty {
            bail!(
                "RUN_DIR_CONFLICT: {} exists and is not empty",
                run_paths.run_dir.display()
            );
        }
    }
    for dir in [
        run_paths.artifacts_dir(),
        run_paths.reviews_dir(),
        run_paths.outbox_dir(),
        run_paths.logs_dir(),
    ] {
        fs::create_dir_all(&dir).with_context(|| format!("create dir {}", dir.display()))?;
    }
    debug!("run layout created");
    Ok(())
}

pub fn save_run_doc(run_paths: &RunPaths, doc: &mut RunDoc) -> Result<()> {
    doc.updated_at = now_iso();
    write_atomic(&run_paths.run_doc(), &to_pretty_json(doc)?)
}

pub fn load_run_doc(run_paths: &RunPaths) -> Result<RunDoc> {
    let path = run_paths.run_doc();
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("MISSING_RUN_STATE: read {}", path.display()))?;
    let doc: RunDoc =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    if doc.schema_version != RUN_SCHEMA {
        bail!(
            "unexpected run schema_version '{}' in {}",
            doc.schema_version,
            path.display()
        );
    }
    Ok(doc)
}

pub fn save_repo_ref(run_paths: &RunPaths, repo_ref: &RepoRef) -> Result<()> {
    write_atomic(&run_paths.repo_ref(), &to_pretty_json(repo_ref)?)
}

/// Update the repo-side `LAST_RUN.txt` pointer atomically.
pub fn update_last_run_pointer(repo_root: &Path, run_dir: &Path) -> Result<()> {
    let pointer = paths::last_run_pointer(repo_root);
    write_atomic(&pointer, &format!("{}\n", run_dir.display()))
}

fn read_if_exists(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .with_context(|| format!("read {}", path.display()))
}

/// Assemble the pure gate-evaluation snapshot from the run directory.
pub fn snapshot(run_paths: &RunPaths, doc: &RunDoc) -> Result<RunSnapshot> {
    let mut snap = RunSnapshot {
        status: Some(doc.status),
        blocked_reason: doc.blocked_reason.clone(),
        find_mode: doc.find_mode,
        ..RunSnapshot::default()
    };
    for kind in canonical_order(doc.find_mode) {
        if let Some(content) = read_if_exists(&run_paths.rel(kind.rel_path()))? {
            snap.artifacts.insert(*kind, content);
        }
    }
    snap.diff_v2 = read_if_exists(&run_paths.diff_v2())?;
    snap.patch_marker = load_patch_marker(run_paths)?;
    if let Some(report) = read_if_exists(&run_paths.verify_report())? {
        snap.verify_report_sha = header_value(&report, "patch-sha256");
    }
    Ok(snap)
}

pub fn load_patch_marker(run_paths: &RunPaths) -> Result<Option<PatchMarker>> {
    let Some(raw) = read_if_exists(&run_paths.patch_marker())? else {
        return Ok(None);
    };
    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        // A corrupt marker is treated as absent so the gate re-enters apply.
        Err(_) => return Ok(None),
    };
    let sha = value
        .get("patch_sha256")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    let rc = value
        .get("rc")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(-1) as i32;
    if sha.is_empty() {
        return Ok(None);
    }
    Ok(Some(PatchMarker {
        patch_sha256: sha,
        rc,
    }))
}
