//! Run directory layout and path resolution.
//!
//! Runs always live outside the target repository, under
//! `$CTCP_RUNS_ROOT` (default `~/.ctcp/runs/<repo_slug>/<run_id>`). The
//! layout struct is the one place that knows where each artifact lives.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::Utc;

/// All well-known paths inside a run directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_dir: PathBuf,
}

impl RunPaths {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_doc(&self) -> PathBuf {
        self.run_dir.join("RUN.json")
    }

    pub fn repo_ref(&self) -> PathBuf {
        self.run_dir.join("repo_ref.json")
    }

    pub fn trace(&self) -> PathBuf {
        self.run_dir.join("TRACE.md")
    }

    pub fn events(&self) -> PathBuf {
        self.run_dir.join("events.jsonl")
    }

    pub fn step_meta(&self) -> PathBuf {
        self.run_dir.join("step_meta.jsonl")
    }

    pub fn api_calls(&self) -> PathBuf {
        self.run_dir.join("api_calls.jsonl")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.run_dir.join("artifacts")
    }

    pub fn reviews_dir(&self) -> PathBuf {
        self.run_dir.join("reviews")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.run_dir.join("outbox")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.run_dir.join("logs")
    }

    pub fn bundle(&self) -> PathBuf {
        self.run_dir.join("failure_bundle.zip")
    }

    pub fn dispatch_config(&self) -> PathBuf {
        self.run_dir.join("artifacts/dispatch_config.json")
    }

    pub fn patch_marker(&self) -> PathBuf {
        self.run_dir.join("artifacts/patch_apply.json")
    }

    pub fn diff(&self) -> PathBuf {
        self.run_dir.join("artifacts/diff.patch")
    }

    pub fn diff_v2(&self) -> PathBuf {
        self.run_dir.join("artifacts/diff.patch.v2")
    }

    pub fn last_applied_patch(&self) -> PathBuf {
        self.run_dir.join("artifacts/last_applied.patch")
    }

    pub fn verify_report(&self) -> PathBuf {
        self.run_dir.join("artifacts/verify_report.md")
    }

    /// Resolve a run-relative path (e.g. an artifact target).
    pub fn rel(&self, rel_path: &str) -> PathBuf {
        self.run_dir.join(rel_path)
    }
}

/// Slug for grouping runs by repository: lowercase directory name with
/// non-alphanumerics collapsed to `_`.
pub fn repo_slug(repo_root: &Path) -> String {
    let name = repo_root
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());
    slugify(&name)
}

pub fn slugify(raw: &str) -> String {
    let mut out = String::new();
    let mut last_was_sep = true;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        "repo".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Timestamped run id, unique at second granularity.
pub fn default_run_id() -> String {
    format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Root directory for all runs: `$CTCP_RUNS_ROOT` or `~/.ctcp/runs`.
pub fn runs_root() -> PathBuf {
    if let Some(root) = std::env::var_os("CTCP_RUNS_ROOT") {
        return PathBuf::from(root);
    }
    home_dir().join(".ctcp").join("runs")
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Default run directory for a repo: `<runs_root>/<repo_slug>/<run_id>`.
pub fn default_run_dir(repo_root: &Path, run_id: &str) -> PathBuf {
    runs_root().join(repo_slug(repo_root)).join(run_id)
}

/// Repo-side pointer to the most recent run.
pub fn last_run_pointer(repo_root: &Path) -> PathBuf {
    repo_root.join("meta").join("run_pointers").join("LAST_RUN.txt")
}

/// Lexical containment check over absolute, normalized components.
///
/// Used both to keep run directories out of the repo and to keep provider
/// writes inside the run directory. Neither path needs to exist.
pub fn is_within(child: &Path, parent: &Path) -> bool {
    let child = normalize(child);
    let parent = normalize(parent);
    child.starts_with(&parent)
}

fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Reject run directories inside the target repository.
pub fn ensure_run_dir_outside_repo(run_dir: &Path, repo_root: &Path) -> Result<()> {
    if is_within(run_dir, repo_root) {
        bail!(
            "run dir {} is inside repo {} (runs must live outside the repository)",
            run_dir.display(),
            repo_root.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("My Repo-2.0"), "my_repo_2_0");
        assert_eq!(slugify("---"), "repo");
    }

    #[test]
    fn run_id_has_expected_shape() {
        let id = default_run_id();
        assert!(id.starts_with("run_"));
        assert_eq!(id.len(), "run_20260830_120000".len());
    }

    #[test]
    fn within_check_handles_traversal() {
        assert!(is_within(
            Path::new("/tmp/runs/repo/run_1/artifacts"),
            Path::new("/tmp/runs")
        ));
        assert!(!is_within(
            Path::new("/tmp/runs/repo/../../etc"),
            Path::new("/tmp/runs")
        ));
    }

    #[test]
    fn run_dir_inside_repo_is_rejected() {
        let err = ensure_run_dir_outside_repo(
            Path::new("/work/repo/runs/run_1"),
            Path::new("/work/repo"),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("inside repo"));
    }

    #[test]
    fn rel_paths_resolve_under_run_dir() {
        let paths = RunPaths::new("/tmp/run_1");
        assert_eq!(
            paths.rel("artifacts/context_pack.json"),
            PathBuf::from("/tmp/run_1/artifacts/context_pack.json")
        );
        assert_eq!(paths.bundle(), PathBuf::from("/tmp/run_1/failure_bundle.zip"));
    }
}
