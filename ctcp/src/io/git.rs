//! Git adapter for the orchestrator.
//!
//! The patch guard enforces git safety (dirty checks, dry-run apply), so we
//! keep a small, explicit wrapper around `git` subprocess calls.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name, or "HEAD" when detached.
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Return the full HEAD SHA.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        self.status_with_args(&["status", "--porcelain=v1", "-uall"])
    }

    /// Status of tracked files only, used by the pre-apply dirty guard.
    pub fn status_tracked(&self) -> Result<Vec<StatusEntry>> {
        self.status_with_args(&["status", "--porcelain=v1", "--untracked-files=no"])
    }

    fn status_with_args(&self, args: &[&str]) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(args)?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True when tracked files carry uncommitted changes.
    pub fn is_dirty_tracked(&self) -> Result<bool> {
        Ok(!self.status_tracked()?.is_empty())
    }

    /// Dry-run a patch from stdin. Returns the git exit code and stderr.
    #[instrument(skip_all)]
    pub fn apply_check(&self, patch: &str) -> Result<(i32, String)> {
        self.apply_with_args(&["apply", "--check", "--whitespace=nowarn", "-"], patch)
    }

    /// Apply a patch from stdin.
    #[instrument(skip_all)]
    pub fn apply(&self, patch: &str) -> Result<(i32, String)> {
        self.apply_with_args(&["apply", "--whitespace=nowarn", "-"], patch)
    }

    /// Reverse-apply a patch from stdin (rollback).
    #[instrument(skip_all)]
    pub fn apply_reverse(&self, patch: &str) -> Result<(i32, String)> {
        self.apply_with_args(&["apply", "-R", "--whitespace=nowarn", "-"], patch)
    }

    fn apply_with_args(&self, args: &[&str], patch: &str) -> Result<(i32, String)> {
        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            stdin
                .write_all(patch.as_bytes())
                .context("write patch to git stdin")?;
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("wait git {}", args.join(" ")))?;
        let rc = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if rc != 0 {
            warn!(rc, "git apply step failed");
        } else {
            debug!("git apply step succeeded");
        }
        Ok((rc, stderr))
    }

    pub fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }
}
