//! JSON schema validation for wire-format artifacts.
//!
//! Each JSON artifact carries a `schema_version` discriminator and is checked
//! against an embedded Draft 2020-12 schema. `find_web` gets an extra
//! per-result field check so a blocked gate can name the exact offending
//! entry.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde_json::Value;

/// Embedded schema for one JSON artifact family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactSchema {
    FindResult,
    FindWeb,
    FileRequest,
    ContextPack,
    DispatchConfig,
}

impl ArtifactSchema {
    /// The `schema_version` value documents of this family must carry.
    pub fn id(self) -> &'static str {
        match self {
            ArtifactSchema::FindResult => "ctcp-find-result-v1",
            ArtifactSchema::FindWeb => "ctcp-find-web-v1",
            ArtifactSchema::FileRequest => "ctcp-file-request-v1",
            ArtifactSchema::ContextPack => "ctcp-context-pack-v1",
            ArtifactSchema::DispatchConfig => "ctcp-dispatch-config-v1",
        }
    }

    fn raw(self) -> &'static str {
        match self {
            ArtifactSchema::FindResult => include_str!("../../schemas/find_result.schema.json"),
            ArtifactSchema::FindWeb => include_str!("../../schemas/find_web.schema.json"),
            ArtifactSchema::FileRequest => include_str!("../../schemas/file_request.schema.json"),
            ArtifactSchema::ContextPack => include_str!("../../schemas/context_pack.schema.json"),
            ArtifactSchema::DispatchConfig => {
                include_str!("../../schemas/dispatch_config.schema.json")
            }
        }
    }

    /// Compiled validator, built once per schema on first use.
    fn validator(self) -> &'static Validator {
        static FIND_RESULT: LazyLock<Validator> =
            LazyLock::new(|| compile(ArtifactSchema::FindResult));
        static FIND_WEB: LazyLock<Validator> = LazyLock::new(|| compile(ArtifactSchema::FindWeb));
        static FILE_REQUEST: LazyLock<Validator> =
            LazyLock::new(|| compile(ArtifactSchema::FileRequest));
        static CONTEXT_PACK: LazyLock<Validator> =
            LazyLock::new(|| compile(ArtifactSchema::ContextPack));
        static DISPATCH_CONFIG: LazyLock<Validator> =
            LazyLock::new(|| compile(ArtifactSchema::DispatchConfig));
        match self {
            ArtifactSchema::FindResult => &FIND_RESULT,
            ArtifactSchema::FindWeb => &FIND_WEB,
            ArtifactSchema::FileRequest => &FILE_REQUEST,
            ArtifactSchema::ContextPack => &CONTEXT_PACK,
            ArtifactSchema::DispatchConfig => &DISPATCH_CONFIG,
        }
    }
}

fn compile(schema: ArtifactSchema) -> Validator {
    let doc: Value = serde_json::from_str(schema.raw())
        .unwrap_or_else(|e| panic!("parse embedded schema {}: {e}", schema.id()));
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&doc)
        .unwrap_or_else(|e| panic!("compile embedded schema {}: {e}", schema.id()))
}

/// Validate an instance against its embedded schema.
///
/// Returns every violation message so gate reasons and review notes can list
/// them all at once.
pub fn validate(schema: ArtifactSchema, instance: &Value) -> Result<(), Vec<String>> {
    let errors: Vec<String> = schema
        .validator()
        .iter_errors(instance)
        .map(|error| format!("{}: {error}", error.instance_path()))
        .collect();
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Fields every `find_web` result entry must carry.
pub const FIND_WEB_RESULT_FIELDS: &[&str] = &[
    "url",
    "locator",
    "fetched_at",
    "excerpt",
    "why_relevant",
    "risk_flags",
];

/// Validate a `find_web` document, including per-result required fields.
pub fn validate_find_web(instance: &Value) -> Result<(), Vec<String>> {
    validate(ArtifactSchema::FindWeb, instance)?;
    let mut errors = Vec::new();
    let results = instance
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for (idx, result) in results.iter().enumerate() {
        let mut missing: Vec<&str> = FIND_WEB_RESULT_FIELDS
            .iter()
            .copied()
            .filter(|field| result.get(*field).is_none())
            .collect();
        missing.sort_unstable();
        if !missing.is_empty() {
            errors.push(format!("results[{idx}] missing fields: {}", missing.join(", ")));
            continue;
        }
        if !result
            .get("risk_flags")
            .map(Value::is_array)
            .unwrap_or(false)
        {
            errors.push(format!("results[{idx}] risk_flags must be an array"));
        }
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn find_result_requires_workflow_id() {
        let doc = json!({"schema_version": "ctcp-find-result-v1"});
        let errors = validate(ArtifactSchema::FindResult, &doc).expect_err("must fail");
        assert!(errors.iter().any(|e| e.contains("selected_workflow_id")));
    }

    #[test]
    fn find_result_accepts_fallback_doc() {
        let doc = json!({
            "schema_version": "ctcp-find-result-v1",
            "goal": "smoke",
            "selected_workflow_id": "wf_minimal_patch_verify",
            "decision": {"reason": "fallback_minimal_workflow", "fallback_used": true}
        });
        validate(ArtifactSchema::FindResult, &doc).expect("valid");
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let doc = json!({
            "schema_version": "ctcp-find-result-v2",
            "selected_workflow_id": "wf"
        });
        assert!(validate(ArtifactSchema::FindResult, &doc).is_err());
    }

    #[test]
    fn find_web_names_missing_result_fields() {
        let doc = json!({
            "schema_version": "ctcp-find-web-v1",
            "constraints": {"allow_domains": ["docs.rs"], "max_queries": 3},
            "results": [{
                "url": "https://docs.rs/x",
                "locator": "intro",
                "fetched_at": "2026-01-01T00:00:00Z",
                "excerpt": "text",
                "why_relevant": "covers the api"
            }]
        });
        let errors = validate_find_web(&doc).expect_err("must fail");
        assert_eq!(errors, vec!["results[0] missing fields: risk_flags"]);
    }

    #[test]
    fn find_web_accepts_complete_results() {
        let doc = json!({
            "schema_version": "ctcp-find-web-v1",
            "constraints": {"allow_domains": [], "max_queries": 3},
            "results": [{
                "url": "https://docs.rs/x",
                "locator": "intro",
                "fetched_at": "2026-01-01T00:00:00Z",
                "excerpt": "text",
                "why_relevant": "covers the api",
                "risk_flags": []
            }]
        });
        validate_find_web(&doc).expect("valid");
    }

    #[test]
    fn file_request_requires_positive_budget() {
        let doc = json!({
            "schema_version": "ctcp-file-request-v1",
            "needs": [{"path": "README.md"}],
            "budget": {"max_files": 0, "max_total_bytes": 1000},
            "reason": "context"
        });
        assert!(validate(ArtifactSchema::FileRequest, &doc).is_err());
    }

    #[test]
    fn validators_compile_once_and_are_shared() {
        for schema in [
            ArtifactSchema::FindResult,
            ArtifactSchema::FindWeb,
            ArtifactSchema::FileRequest,
            ArtifactSchema::ContextPack,
            ArtifactSchema::DispatchConfig,
        ] {
            assert!(std::ptr::eq(schema.validator(), schema.validator()));
        }
    }

    #[test]
    fn context_pack_rejects_unknown_omitted_reason() {
        let doc = json!({
            "schema_version": "ctcp-context-pack-v1",
            "summary": "included=0 omitted=1",
            "files": [],
            "omitted": [{"path": "x", "reason": "because"}]
        });
        assert!(validate(ArtifactSchema::ContextPack, &doc).is_err());
    }
}
