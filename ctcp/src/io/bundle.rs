//! Failure bundle: a single zip of the whole run directory.
//!
//! Created when verify fails so the run can be handed off or archived as
//! one file. The bundle is validated after writing; a bundle that is missing
//! a required entry is an error, not a warning.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::io::paths::RunPaths;

const BUNDLE_NAME: &str = "failure_bundle.zip";

/// Create (or refresh) `failure_bundle.zip` and validate its contents.
/// Returns the run-relative bundle name.
#[instrument(skip_all, fields(run_dir = %run_paths.run_dir.display()))]
pub fn ensure_failure_bundle(run_paths: &RunPaths) -> Result<String> {
    let bundle_path = run_paths.bundle();
    write_bundle(&run_paths.run_dir, &bundle_path)?;
    validate_bundle(run_paths, &bundle_path)?;
    info!("failure bundle written");
    Ok(BUNDLE_NAME.to_string())
}

fn write_bundle(run_dir: &Path, bundle_path: &Path) -> Result<()> {
    let file = File::create(bundle_path)
        .with_context(|| format!("create {}", bundle_path.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut files = Vec::new();
    collect_files(run_dir, run_dir, bundle_path, &mut files)?;
    files.sort();
    for rel in files {
        let name = rel
            .to_str()
            .map(|s| s.replace('\\', "/"))
            .with_context(|| format!("non-utf8 path {}", rel.display()))?;
        zip.start_file(&name, options)
            .with_context(|| format!("start zip entry {name}"))?;
        let content = std::fs::read(run_dir.join(&rel))
            .with_context(|| format!("read {}", rel.display()))?;
        zip.write_all(&content)
            .with_context(|| format!("write zip entry {name}"))?;
        debug!(entry = name, "bundled");
    }
    zip.finish().context("finish zip")?;
    Ok(())
}

fn collect_files(
    root: &Path,
    dir: &Path,
    bundle_path: &Path,
    out: &mut Vec<PathBuf>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.context("read dir entry")?;
        let path = entry.path();
        if path == bundle_path {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, bundle_path, out)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(root)
                .with_context(|| format!("relativize {}", path.display()))?;
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

/// Entries a handoff bundle must always carry, plus every review and outbox
/// file present in the run directory.
fn required_entries(run_paths: &RunPaths) -> Result<Vec<String>> {
    let mut required = vec!["TRACE.md".to_string(), "events.jsonl".to_string()];
    if run_paths.verify_report().exists() {
        required.push("artifacts/verify_report.md".to_string());
    }
    if run_paths.rel("artifacts/PLAN.md").exists() {
        required.push("artifacts/PLAN.md".to_string());
    }
    if run_paths.diff().exists() {
        required.push("artifacts/diff.patch".to_string());
    }
    for dir in ["reviews", "outbox"] {
        let dir_path = run_paths.rel(dir);
        if !dir_path.exists() {
            continue;
        }
        for entry in std::fs::read_dir(&dir_path)
            .with_context(|| format!("read dir {}", dir_path.display()))?
        {
            let entry = entry.context("read dir entry")?;
            if entry.path().is_file() {
                required.push(format!("{dir}/{}", entry.file_name().to_string_lossy()));
            }
        }
    }
    Ok(required)
}

fn validate_bundle(run_paths: &RunPaths, bundle_path: &Path) -> Result<()> {
    let file =
        File::open(bundle_path).with_context(|| format!("open {}", bundle_path.display()))?;
    let archive = ZipArchive::new(file).context("read bundle archive")?;
    let names: Vec<&str> = archive.file_names().collect();
    let missing: Vec<String> = required_entries(run_paths)?
        .into_iter()
        .filter(|entry| !names.contains(&entry.as_str()))
        .collect();
    if !missing.is_empty() {
        bail!("failure bundle is missing entries: {}", missing.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::run_store::ensure_layout;
    use std::fs;
    use tempfile::tempdir;

    fn seeded_run() -> (tempfile::TempDir, RunPaths) {
        let dir = tempdir().expect("tempdir");
        let run_paths = RunPaths::new(dir.path().join("run_1"));
        ensure_layout(&run_paths, Path::new("/work/repo")).expect("layout");
        fs::write(run_paths.trace(), "# Trace\n").expect("write");
        fs::write(run_paths.events(), "{\"event\":\"run_created\"}\n").expect("write");
        fs::write(run_paths.verify_report(), "# Verify Report\n\nResult: FAIL\n").expect("write");
        fs::write(run_paths.rel("artifacts/PLAN.md"), "# PLAN\n").expect("write");
        fs::write(run_paths.diff(), "diff --git a/x b/x\n").expect("write");
        fs::write(
            run_paths.rel("reviews/review_contract.md"),
            "Verdict: APPROVE\n",
        )
        .expect("write");
        fs::write(run_paths.rel("outbox/001_chair_plan_draft.md"), "# Prompt\n").expect("write");
        (dir, run_paths)
    }

    #[test]
    fn bundle_contains_run_files_but_not_itself() {
        let (_dir, run_paths) = seeded_run();
        let rel = ensure_failure_bundle(&run_paths).expect("bundle");
        assert_eq!(rel, "failure_bundle.zip");

        let file = File::open(run_paths.bundle()).expect("open");
        let archive = ZipArchive::new(file).expect("archive");
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert!(names.contains(&"TRACE.md".to_string()));
        assert!(names.contains(&"artifacts/verify_report.md".to_string()));
        assert!(names.contains(&"reviews/review_contract.md".to_string()));
        assert!(names.contains(&"outbox/001_chair_plan_draft.md".to_string()));
        assert!(!names.contains(&"failure_bundle.zip".to_string()));
    }

    #[test]
    fn rebundling_replaces_the_old_archive() {
        let (_dir, run_paths) = seeded_run();
        ensure_failure_bundle(&run_paths).expect("first");
        fs::write(run_paths.rel("reviews/review_cost.md"), "Verdict: APPROVE\n").expect("write");
        ensure_failure_bundle(&run_paths).expect("second");

        let file = File::open(run_paths.bundle()).expect("open");
        let archive = ZipArchive::new(file).expect("archive");
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert!(names.contains(&"reviews/review_cost.md".to_string()));
    }

    #[test]
    fn minimal_run_still_bundles() {
        let dir = tempdir().expect("tempdir");
        let run_paths = RunPaths::new(dir.path().join("run_1"));
        ensure_layout(&run_paths, Path::new("/work/repo")).expect("layout");
        fs::write(run_paths.trace(), "# Trace\n").expect("write");
        fs::write(run_paths.events(), "\n").expect("write");
        ensure_failure_bundle(&run_paths).expect("bundle");
    }
}
