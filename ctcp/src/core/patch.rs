//! Unified diff parsing and patch policy checks.
//!
//! Everything here is pure: the guard parses the patch text, normalizes the
//! touched paths, and enforces the policy before any git command runs. The
//! stable error codes surface in events and step metadata so a blocked run
//! names exactly which rule fired.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable failure codes for the patch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchErrorCode {
    PatchParseInvalid,
    PatchPathInvalid,
    PatchPolicyDeny,
    PatchPolicyInvalid,
    PatchGitCheckFail,
    PatchApplyFail,
    PatchEnvInvalid,
}

impl PatchErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchErrorCode::PatchParseInvalid => "PATCH_PARSE_INVALID",
            PatchErrorCode::PatchPathInvalid => "PATCH_PATH_INVALID",
            PatchErrorCode::PatchPolicyDeny => "PATCH_POLICY_DENY",
            PatchErrorCode::PatchPolicyInvalid => "PATCH_POLICY_INVALID",
            PatchErrorCode::PatchGitCheckFail => "PATCH_GIT_CHECK_FAIL",
            PatchErrorCode::PatchApplyFail => "PATCH_APPLY_FAIL",
            PatchErrorCode::PatchEnvInvalid => "PATCH_ENV_INVALID",
        }
    }
}

/// Patch pipeline failure with a stable code and the rule that fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchError {
    pub code: PatchErrorCode,
    pub message: String,
    /// Policy rule name for `PATCH_POLICY_DENY` (e.g. `deny_prefixes`).
    pub rule: Option<String>,
}

impl PatchError {
    pub fn new(code: PatchErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            rule: None,
        }
    }

    fn deny(rule: &str, message: String) -> Self {
        Self {
            code: PatchErrorCode::PatchPolicyDeny,
            message,
            rule: Some(rule.to_string()),
        }
    }
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for PatchError {}

/// Scope and size limits enforced before `git apply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPolicy {
    pub max_files: usize,
    pub max_added_lines: usize,
    pub allow_roots: Vec<String>,
    pub deny_prefixes: Vec<String>,
    pub deny_suffixes: Vec<String>,
}

impl Default for PatchPolicy {
    fn default() -> Self {
        Self {
            max_files: 5,
            max_added_lines: 400,
            allow_roots: DEFAULT_ALLOW_ROOTS.iter().map(|s| (*s).to_string()).collect(),
            deny_prefixes: DEFAULT_DENY_PREFIXES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            deny_suffixes: DEFAULT_DENY_SUFFIXES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

const DEFAULT_ALLOW_ROOTS: &[&str] = &[
    "src",
    "include",
    "web",
    "scripts",
    "tools",
    "docs",
    "specs",
    "meta",
    "contracts",
    "tests",
    "ai_context",
    "agents",
    "resources",
    "README.md",
    "BUILD.md",
    "PATCH_README.md",
    "AGENTS.md",
    "LICENSE",
    "CMakeLists.txt",
];

const DEFAULT_DENY_PREFIXES: &[&str] = &[
    ".git/",
    "build/",
    "build_lite/",
    "build_verify/",
    "dist/",
    "runs/",
    "artifacts/",
    "node_modules/",
    "__pycache__/",
];

const DEFAULT_DENY_SUFFIXES: &[&str] = &[
    ".lock", ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".webp", ".ico", ".zip", ".7z", ".tar",
    ".gz", ".pdf", ".exe", ".dll", ".so", ".dylib", ".bin", ".jar", ".pyc", ".o", ".obj", ".a",
    ".lib", ".db", ".sqlite", ".sqlite3",
];

impl PatchPolicy {
    /// Build a policy from a JSON override, falling back to defaults per field.
    ///
    /// Rejects non-object values and non-positive limits so a typo in the
    /// dispatch config cannot silently disable the guard.
    pub fn from_value(value: &Value) -> Result<Self, PatchError> {
        let Some(obj) = value.as_object() else {
            return Err(PatchError::new(
                PatchErrorCode::PatchPolicyInvalid,
                "patch policy must be a JSON object",
            ));
        };
        let mut policy = PatchPolicy::default();
        if let Some(raw) = obj.get("max_files") {
            policy.max_files = positive_usize(raw, "max_files")?;
        }
        if let Some(raw) = obj.get("max_added_lines") {
            policy.max_added_lines = positive_usize(raw, "max_added_lines")?;
        }
        for (key, target) in [
            ("allow_roots", &mut policy.allow_roots),
            ("deny_prefixes", &mut policy.deny_prefixes),
            ("deny_suffixes", &mut policy.deny_suffixes),
        ] {
            if let Some(raw) = obj.get(key) {
                *target = string_list(raw, key)?;
            }
        }
        Ok(policy)
    }
}

fn positive_usize(raw: &Value, key: &str) -> Result<usize, PatchError> {
    raw.as_u64()
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .ok_or_else(|| {
            PatchError::new(
                PatchErrorCode::PatchPolicyInvalid,
                format!("patch policy {key} must be a positive integer"),
            )
        })
}

fn string_list(raw: &Value, key: &str) -> Result<Vec<String>, PatchError> {
    let Some(items) = raw.as_array() else {
        return Err(PatchError::new(
            PatchErrorCode::PatchPolicyInvalid,
            format!("patch policy {key} must be an array of strings"),
        ));
    };
    let mut out = Vec::new();
    for item in items {
        let Some(text) = item.as_str() else {
            return Err(PatchError::new(
                PatchErrorCode::PatchPolicyInvalid,
                format!("patch policy {key} must be an array of strings"),
            ));
        };
        out.push(text.to_string());
    }
    Ok(out)
}

/// Size stats for an accepted patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchStats {
    pub touched_files: Vec<String>,
    pub added_lines: usize,
}

static DIFF_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^diff --git a/(.+) b/(.+)$").expect("diff header regex"));
static DRIVE_LETTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]:[\\/]").expect("drive letter regex"));

/// Normalize a repo-relative path from a diff header or policy list.
///
/// Strips `a/`/`b/` and `./` prefixes, rejects absolute paths, drive letters,
/// and `..` traversal.
pub fn normalize_repo_relpath(raw: &str) -> Result<String, PatchError> {
    let mut path = raw.trim().replace('\\', "/");
    for prefix in ["a/", "b/", "./"] {
        if let Some(stripped) = path.strip_prefix(prefix) {
            path = stripped.to_string();
        }
    }
    let invalid = |message: String| PatchError::new(PatchErrorCode::PatchPathInvalid, message);
    if path.is_empty() || path == "." {
        return Err(invalid(format!("empty path in diff: '{raw}'")));
    }
    if path.starts_with('/') || DRIVE_LETTER.is_match(&path) {
        return Err(invalid(format!("absolute path not allowed: '{raw}'")));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(invalid(format!("path traversal not allowed: '{raw}'")));
    }
    Ok(path)
}

/// Extract the touched b-paths from a unified diff.
///
/// The first non-empty line must be a `diff --git` header; a patch touching
/// no files is also a parse failure.
pub fn parse_unified_diff(text: &str) -> Result<Vec<String>, PatchError> {
    let first = text.lines().find(|line| !line.trim().is_empty());
    match first {
        Some(line) if line.starts_with("diff --git ") => {}
        _ => {
            return Err(PatchError::new(
                PatchErrorCode::PatchParseInvalid,
                "patch must start with a 'diff --git ' header",
            ));
        }
    }
    let mut touched = Vec::new();
    for line in text.lines() {
        let Some(caps) = DIFF_HEADER.captures(line) else {
            continue;
        };
        let path = normalize_repo_relpath(&caps[2])?;
        if !touched.contains(&path) {
            touched.push(path);
        }
    }
    if touched.is_empty() {
        return Err(PatchError::new(
            PatchErrorCode::PatchParseInvalid,
            "patch does not touch any files",
        ));
    }
    Ok(touched)
}

/// Count added lines, excluding `+++` file headers.
pub fn count_added_lines(text: &str) -> usize {
    text.lines()
        .filter(|line| line.starts_with('+') && !line.starts_with("+++ "))
        .count()
}

/// Detect binary payloads git would otherwise apply.
pub fn contains_binary_payload(text: &str) -> bool {
    text.contains('\0') || text.contains("GIT binary patch") || text.contains("Binary files ")
}

/// Parse a patch and enforce the policy, in a fixed rule order.
///
/// Checks binary content, then file count, then added lines, then each path
/// against allow roots, deny prefixes, and deny suffixes.
pub fn check_policy(text: &str, policy: &PatchPolicy) -> Result<PatchStats, PatchError> {
    let touched = parse_unified_diff(text)?;
    if contains_binary_payload(text) {
        return Err(PatchError::deny(
            "binary",
            "binary payloads are not allowed".to_string(),
        ));
    }
    if touched.len() > policy.max_files {
        return Err(PatchError::deny(
            "max_files",
            format!(
                "patch touches {} files (max {})",
                touched.len(),
                policy.max_files
            ),
        ));
    }
    let added_lines = count_added_lines(text);
    if added_lines > policy.max_added_lines {
        return Err(PatchError::deny(
            "max_added_lines",
            format!(
                "patch adds {added_lines} lines (max {})",
                policy.max_added_lines
            ),
        ));
    }
    for path in &touched {
        if !path_in_allowed_root(path, &policy.allow_roots) {
            return Err(PatchError::deny(
                "allow_roots",
                format!("path outside allowed roots: '{path}'"),
            ));
        }
        if let Some(prefix) = policy
            .deny_prefixes
            .iter()
            .find(|prefix| matches_prefix(path, prefix))
        {
            return Err(PatchError::deny(
                "deny_prefixes",
                format!("path under denied prefix '{prefix}': '{path}'"),
            ));
        }
        let lowered = path.to_ascii_lowercase();
        if let Some(suffix) = policy
            .deny_suffixes
            .iter()
            .find(|suffix| lowered.ends_with(suffix.as_str()))
        {
            return Err(PatchError::deny(
                "deny_suffixes",
                format!("path has denied suffix '{suffix}': '{path}'"),
            ));
        }
    }
    Ok(PatchStats {
        touched_files: touched,
        added_lines,
    })
}

fn path_in_allowed_root(path: &str, roots: &[String]) -> bool {
    roots.iter().any(|root| {
        let root = root.trim_end_matches('/');
        path == root || path.starts_with(&format!("{root}/"))
    })
}

fn matches_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    path == prefix || path.starts_with(&format!("{prefix}/"))
}
