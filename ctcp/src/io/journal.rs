//! Append-only run journals: events, trace, step metadata, api calls.
//!
//! Events are newline-delimited JSON; `TRACE.md` mirrors each event as a
//! human-readable line. Appends are flushed to disk before returning so a
//! crashed step never loses its last record.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::io::paths::RunPaths;
use crate::io::run_store::now_iso;

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    if !line.ends_with('\n') {
        file.write_all(b"\n")
            .with_context(|| format!("append {}", path.display()))?;
    }
    file.sync_all()
        .with_context(|| format!("sync {}", path.display()))?;
    Ok(())
}

/// Append an event record and mirror it into `TRACE.md`.
pub fn append_event(
    run_paths: &RunPaths,
    role: &str,
    event: &str,
    path: &str,
    extra: &[(&str, Value)],
) -> Result<()> {
    let ts = now_iso();
    let mut record = Map::new();
    record.insert("ts".to_string(), json!(ts));
    record.insert("role".to_string(), json!(role));
    record.insert("event".to_string(), json!(event));
    record.insert("path".to_string(), json!(path));
    for (key, value) in extra {
        record.insert((*key).to_string(), value.clone());
    }
    let line = serde_json::to_string(&Value::Object(record)).context("serialize event")?;
    append_line(&run_paths.events(), &line)?;
    append_trace(run_paths, &format!("- {ts} | {role}: {event} ({path})"))?;
    debug!(event, path, "event appended");
    Ok(())
}

/// Append a raw line (or section) to `TRACE.md`.
pub fn append_trace(run_paths: &RunPaths, text: &str) -> Result<()> {
    append_line(&run_paths.trace(), text)
}

/// Read all events, skipping lines that fail to parse.
pub fn read_events(run_paths: &RunPaths) -> Result<Vec<Value>> {
    let path = run_paths.events();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    Ok(raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Append one dispatch record to `step_meta.jsonl`.
pub fn append_step_meta(run_paths: &RunPaths, row: &Value) -> Result<()> {
    let line = serde_json::to_string(row).context("serialize step meta")?;
    append_line(&run_paths.step_meta(), &line)
}

/// Read all dispatch records, skipping lines that fail to parse.
pub fn read_step_meta(run_paths: &RunPaths) -> Result<Vec<Value>> {
    let path = run_paths.step_meta();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    Ok(raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Append one external-call record to `api_calls.jsonl`.
pub fn append_api_call(run_paths: &RunPaths, record: &Value) -> Result<()> {
    let line = serde_json::to_string(record).context("serialize api call")?;
    append_line(&run_paths.api_calls(), &line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn events_mirror_into_trace() {
        let dir = tempdir().expect("tempdir");
        let run_paths = RunPaths::new(dir.path());
        append_event(
            &run_paths,
            "Orchestrator",
            "run_created",
            "RUN.json",
            &[("goal", json!("smoke"))],
        )
        .expect("append");

        let events = read_events(&run_paths).expect("read");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "run_created");
        assert_eq!(events[0]["goal"], "smoke");

        let trace = std::fs::read_to_string(run_paths.trace()).expect("trace");
        assert!(trace.contains("Orchestrator: run_created (RUN.json)"));
    }

    #[test]
    fn malformed_event_lines_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let run_paths = RunPaths::new(dir.path());
        std::fs::write(
            run_paths.events(),
            "{\"ts\":\"t\",\"event\":\"ok\"}\n{broken\n",
        )
        .expect("write");
        let events = read_events(&run_paths).expect("read");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn step_meta_rows_append() {
        let dir = tempdir().expect("tempdir");
        let run_paths = RunPaths::new(dir.path());
        append_step_meta(&run_paths, &json!({"role": "chair"})).expect("append");
        append_step_meta(&run_paths, &json!({"role": "librarian"})).expect("append");
        let raw = std::fs::read_to_string(run_paths.step_meta()).expect("read");
        assert_eq!(raw.lines().count(), 2);

        let rows = read_step_meta(&run_paths).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["role"], "librarian");
    }
}
