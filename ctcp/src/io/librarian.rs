//! The Librarian: deterministic file extraction under explicit budgets.
//!
//! Converts a `file_request` into a `context_pack`. Mandatory contract files
//! are always included in full; everything else is included, truncated, or
//! omitted strictly in request order, so identical repo state and request
//! always produce byte-identical output.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::io::paths::is_within;

/// Contract files that must appear in every context pack, in full.
pub const MANDATORY_FILES: &[&str] = &[
    "AGENTS.md",
    "ai_context/00_AI_CONTRACT.md",
    "ai_context/CTCP_FAST_RULES.md",
];

/// Contract files included in full when present, but not fatal when absent.
pub const OPTIONAL_CONTRACT_FILES: &[&str] = &["docs/00_CORE.md", "PATCH_README.md"];

/// Prefixes the Librarian never reads from.
pub const DENIED_PREFIXES: &[&str] = &[
    ".git/",
    "runs/",
    "build/",
    "dist/",
    "node_modules/",
    "__pycache__/",
];

/// The budget cannot hold the mandatory contract files; the request must be
/// re-issued with larger limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetTooSmall {
    pub required_bytes: u64,
    pub budget_bytes: u64,
    pub required_files: usize,
    pub budget_files: u64,
}

impl fmt::Display for BudgetTooSmall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BUDGET_TOO_SMALL: mandatory files need {} bytes across {} files, budget allows {} bytes across {} files",
            self.required_bytes, self.required_files, self.budget_bytes, self.budget_files
        )
    }
}

impl std::error::Error for BudgetTooSmall {}

/// A mandatory contract file is absent from the repo. Fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MandatoryFileMissing {
    pub path: String,
}

impl fmt::Display for MandatoryFileMissing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mandatory context file missing: {}", self.path)
    }
}

impl std::error::Error for MandatoryFileMissing {}

/// Parsed `artifacts/file_request.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequest {
    pub schema_version: String,
    #[serde(default)]
    pub goal: String,
    pub needs: Vec<Need>,
    pub budget: RequestBudget,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Need {
    pub path: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub line_ranges: Vec<(i64, i64)>,
    #[serde(default)]
    pub why: String,
}

fn default_mode() -> String {
    "full".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RequestBudget {
    pub max_files: u64,
    pub max_total_bytes: u64,
}

/// Output `artifacts/context_pack.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPack {
    pub schema_version: String,
    pub goal: String,
    pub repo_slug: String,
    pub summary: String,
    pub files: Vec<PackFile>,
    pub omitted: Vec<OmittedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackFile {
    pub path: String,
    pub why: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated: bool,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmittedFile {
    pub path: String,
    pub reason: String,
}

/// Build a context pack from a file request.
///
/// Errors carry [`BudgetTooSmall`] or [`MandatoryFileMissing`] downcastable
/// through anyhow; callers decide whether that blocks or fails the run.
#[instrument(skip_all, fields(needs = request.needs.len()))]
pub fn build_context_pack(
    repo_root: &Path,
    repo_slug: &str,
    request: &FileRequest,
) -> Result<ContextPack> {
    let mandatory = resolve_mandatory(repo_root)?;
    precheck_budget(repo_root, &mandatory, &request.budget)?;

    let mut needs: Vec<Need> = Vec::new();
    for path in &mandatory {
        needs.push(Need {
            path: path.clone(),
            mode: "full".to_string(),
            line_ranges: Vec::new(),
            why: "mandatory contract file".to_string(),
        });
    }
    for need in &request.needs {
        if mandatory.iter().any(|path| *path == need.path) {
            continue;
        }
        needs.push(need.clone());
    }

    let mut files: Vec<PackFile> = Vec::new();
    let mut omitted: Vec<OmittedFile> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut remaining = request.budget.max_total_bytes;

    for need in &needs {
        let mandatory_need = mandatory.iter().any(|path| *path == need.path);
        let omit = |omitted: &mut Vec<OmittedFile>, reason: &str| {
            omitted.push(OmittedFile {
                path: need.path.clone(),
                reason: reason.to_string(),
            });
        };

        let rel = match normalize_request_path(&need.path) {
            Ok(rel) => rel,
            Err(_) => {
                omit(&mut omitted, "invalid_request");
                continue;
            }
        };
        if !seen.insert(rel.clone()) {
            omit(&mut omitted, "irrelevant");
            continue;
        }
        if DENIED_PREFIXES
            .iter()
            .any(|prefix| rel.starts_with(prefix))
        {
            omit(&mut omitted, "denied");
            continue;
        }
        let abs = repo_root.join(&rel);
        if !is_within(&abs, repo_root) {
            omit(&mut omitted, "denied");
            continue;
        }
        if !abs.is_file() {
            omit(&mut omitted, "not_found");
            continue;
        }
        if (files.len() as u64) >= request.budget.max_files {
            omit(&mut omitted, "budget_exceeded");
            continue;
        }
        let content = match fs::read_to_string(&abs) {
            Ok(content) => content,
            Err(_) => {
                omit(&mut omitted, "invalid_request");
                continue;
            }
        };
        let why = if need.why.trim().is_empty() {
            "requested".to_string()
        } else {
            need.why.clone()
        };

        match need.mode.as_str() {
            "full" => {
                let len = content.len() as u64;
                if len <= remaining {
                    remaining -= len;
                    files.push(PackFile {
                        path: rel,
                        why,
                        content,
                        truncated: false,
                    });
                } else if mandatory_need {
                    // The precheck covers mandatory sizes, but the request
                    // order could still starve one if budgets change here.
                    return Err(budget_error(repo_root, &mandatory, &request.budget).into());
                } else if remaining > 0 {
                    let prefix = utf8_prefix(&content, remaining as usize);
                    remaining = 0;
                    files.push(PackFile {
                        path: rel,
                        why,
                        content: prefix,
                        truncated: true,
                    });
                } else {
                    omit(&mut omitted, "budget_exceeded");
                }
            }
            "snippets" => {
                let rendered = render_snippets(&content, &need.line_ranges);
                if rendered.is_empty() {
                    omit(&mut omitted, "irrelevant");
                } else if (rendered.len() as u64) <= remaining {
                    remaining -= rendered.len() as u64;
                    files.push(PackFile {
                        path: rel,
                        why,
                        content: rendered,
                        truncated: false,
                    });
                } else {
                    omit(&mut omitted, "budget_exceeded");
                }
            }
            _ => omit(&mut omitted, "invalid_request"),
        }
    }

    let used_bytes: u64 = files.iter().map(|file| file.content.len() as u64).sum();
    let summary = format!(
        "included={} omitted={} used_bytes={} budget_files={} budget_bytes={}",
        files.len(),
        omitted.len(),
        used_bytes,
        request.budget.max_files,
        request.budget.max_total_bytes
    );
    debug!(included = files.len(), omitted = omitted.len(), "context pack built");
    Ok(ContextPack {
        schema_version: "ctcp-context-pack-v1".to_string(),
        goal: request.goal.clone(),
        repo_slug: repo_slug.to_string(),
        summary,
        files,
        omitted,
    })
}

/// Mandatory paths plus optional contract files that exist in this repo.
fn resolve_mandatory(repo_root: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for path in MANDATORY_FILES {
        if !repo_root.join(path).is_file() {
            return Err(MandatoryFileMissing {
                path: (*path).to_string(),
            }
            .into());
        }
        out.push((*path).to_string());
    }
    for path in OPTIONAL_CONTRACT_FILES {
        if repo_root.join(path).is_file() {
            out.push((*path).to_string());
        }
    }
    Ok(out)
}

fn precheck_budget(
    repo_root: &Path,
    mandatory: &[String],
    budget: &RequestBudget,
) -> Result<()> {
    let error = budget_error(repo_root, mandatory, budget);
    if error.required_bytes > budget.max_total_bytes
        || (error.required_files as u64) > budget.max_files
    {
        return Err(error.into());
    }
    Ok(())
}

fn budget_error(repo_root: &Path, mandatory: &[String], budget: &RequestBudget) -> BudgetTooSmall {
    let required_bytes = mandatory
        .iter()
        .map(|path| {
            fs::metadata(repo_root.join(path))
                .map(|meta| meta.len())
                .unwrap_or(0)
        })
        .sum();
    BudgetTooSmall {
        required_bytes,
        budget_bytes: budget.max_total_bytes,
        required_files: mandatory.len(),
        budget_files: budget.max_files,
    }
}

/// Normalize a requested repo-relative path, rejecting escapes.
fn normalize_request_path(raw: &str) -> Result<String, ()> {
    let path = raw.trim().replace('\\', "/");
    let path = path.strip_prefix("./").unwrap_or(&path).to_string();
    if path.is_empty() || path == "." || path.starts_with('/') {
        return Err(());
    }
    if path.len() >= 2 && path.as_bytes()[1] == b':' {
        return Err(());
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(());
    }
    Ok(path)
}

/// Longest UTF-8-safe prefix of at most `max_bytes`.
fn utf8_prefix(content: &str, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    content[..end].to_string()
}

/// Render snippet ranges as numbered line blocks.
///
/// Ranges are normalized first: invalid pairs dropped, reversed pairs
/// swapped, clamped to file length, sorted, deduplicated.
fn render_snippets(content: &str, ranges: &[(i64, i64)]) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len() as i64;
    let mut normalized: Vec<(i64, i64)> = Vec::new();
    for (start, end) in ranges {
        let (mut start, mut end) = (*start, *end);
        if start > end {
            std::mem::swap(&mut start, &mut end);
        }
        if end < 1 || start > total {
            continue;
        }
        let clamped = (start.max(1), end.min(total));
        if clamped.0 > clamped.1 {
            continue;
        }
        if !normalized.contains(&clamped) {
            normalized.push(clamped);
        }
    }
    normalized.sort_unstable();

    let mut out = String::new();
    for (start, end) in normalized {
        out.push_str(&format!("# lines {start}-{end}\n"));
        for idx in start..=end {
            out.push_str(&format!("{idx:>6}: {}\n", lines[(idx - 1) as usize]));
        }
    }
    out
}

/// Parse and schema-sanity-check a raw file request document.
pub fn parse_file_request(raw: &str) -> Result<FileRequest> {
    let request: FileRequest = serde_json::from_str(raw).context("parse file_request")?;
    Ok(request)
}
