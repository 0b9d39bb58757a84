//! Dispatch configuration stored at `artifacts/dispatch_config.json`.
//!
//! Loading is forgiving where the original value can be normalized (unknown
//! providers collapse to `manual_outbox`, budgets clamp to a minimum) and
//! strict where a wrong value would change routing silently (bad JSON or a
//! wrong `schema_version` disables config-driven routing entirely).

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::core::schema::{self, ArtifactSchema};
use crate::core::types::{ProviderKind, Role};
use crate::io::paths::RunPaths;
use crate::io::run_store::{to_pretty_json, write_atomic};

pub const DEFAULT_MAX_OUTBOX_PROMPTS: u32 = 20;

/// Outbox and provider budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchBudgets {
    pub max_outbox_prompts: u32,
}

impl Default for DispatchBudgets {
    fn default() -> Self {
        Self {
            max_outbox_prompts: DEFAULT_MAX_OUTBOX_PROMPTS,
        }
    }
}

/// Parsed dispatch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub schema_version: String,
    pub mode: ProviderKind,
    #[serde(default)]
    pub role_providers: BTreeMap<String, ProviderKind>,
    #[serde(default)]
    pub budgets: DispatchBudgets,
    /// Provider-specific settings (api commands, mock faults, patch policy).
    #[serde(default)]
    pub providers: Value,
    /// Load-time note explaining defaults or normalization, never persisted.
    #[serde(skip)]
    pub note: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let mut role_providers = BTreeMap::new();
        // Recipe default: the librarian runs in-process.
        role_providers.insert("librarian".to_string(), ProviderKind::LocalExec);
        Self {
            schema_version: ArtifactSchema::DispatchConfig.id().to_string(),
            mode: ProviderKind::ManualOutbox,
            role_providers,
            budgets: DispatchBudgets::default(),
            providers: Value::Object(serde_json::Map::new()),
            note: None,
        }
    }
}

impl DispatchConfig {
    /// Provider mapped to a role, if any.
    pub fn role_provider(&self, role: Role) -> Option<ProviderKind> {
        self.role_providers.get(role.key()).copied()
    }

    /// Provider-specific config subtree, e.g. `providers.mock_agent`.
    pub fn provider_section(&self, name: &str) -> Option<&Value> {
        self.providers.get(name)
    }
}

/// Load the dispatch config, falling back to defaults when absent and to a
/// routing-disabled default when the file is present but unusable.
pub fn load_dispatch_config(run_paths: &RunPaths) -> Result<DispatchConfig> {
    let path = run_paths.dispatch_config();
    if !path.exists() {
        let mut config = DispatchConfig::default();
        config.note = Some("dispatch config missing; using defaults".to_string());
        return Ok(config);
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let doc: Value = match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(error = %e, "dispatch config is not valid JSON, routing disabled");
            return Ok(disabled_config(format!("dispatch config invalid JSON: {e}")));
        }
    };
    if let Err(errors) = schema::validate(ArtifactSchema::DispatchConfig, &doc) {
        warn!(errors = ?errors, "dispatch config failed schema check, routing disabled");
        return Ok(disabled_config(format!(
            "dispatch config schema invalid: {}",
            errors.join("; ")
        )));
    }
    Ok(normalize(&doc))
}

/// A config that ignores the broken file: global manual_outbox, no role map.
fn disabled_config(note: String) -> DispatchConfig {
    DispatchConfig {
        role_providers: BTreeMap::new(),
        note: Some(note),
        ..DispatchConfig::default()
    }
}

fn normalize(doc: &Value) -> DispatchConfig {
    let mut config = DispatchConfig::default();
    let mut notes = Vec::new();

    let raw_mode = doc.get("mode").and_then(Value::as_str).unwrap_or_default();
    match ProviderKind::parse(raw_mode) {
        Some(mode) => config.mode = mode,
        None => notes.push(format!("unknown mode '{raw_mode}', using manual_outbox")),
    }

    config.role_providers.clear();
    if let Some(map) = doc.get("role_providers").and_then(Value::as_object) {
        for (role, raw) in map {
            let raw = raw.as_str().unwrap_or_default();
            match ProviderKind::parse(raw) {
                Some(kind) => {
                    config.role_providers.insert(role.clone(), kind);
                }
                None => notes.push(format!("unknown provider '{raw}' for role '{role}', ignored")),
            }
        }
    }

    let raw_budget = doc
        .get("budgets")
        .and_then(|budgets| budgets.get("max_outbox_prompts"))
        .and_then(Value::as_u64);
    if let Some(value) = raw_budget {
        config.budgets.max_outbox_prompts = value.max(1) as u32;
        if value == 0 {
            notes.push("max_outbox_prompts clamped to 1".to_string());
        }
    }

    if let Some(providers) = doc.get("providers") {
        config.providers = providers.clone();
    }
    if !notes.is_empty() {
        config.note = Some(notes.join("; "));
    }
    config
}

/// Write the default dispatch config if none exists yet.
pub fn ensure_dispatch_config(run_paths: &RunPaths) -> Result<()> {
    let path = run_paths.dispatch_config();
    if path.exists() {
        return Ok(());
    }
    write_atomic(&path, &to_pretty_json(&DispatchConfig::default())?)
}
