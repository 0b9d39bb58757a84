//! PLAN contract parsing and validation.
//!
//! A PLAN is a markdown document carrying a flat `Key: Value` header block.
//! The draft validator only checks that the required fields are present; the
//! signed validator additionally enforces field semantics (signed status,
//! required gates, positive budgets, behavior/result id formats).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::header::{parse_header_map, parse_list, parse_map};

/// Header fields every PLAN must carry (draft or signed).
pub const REQUIRED_FIELDS: &[&str] = &[
    "status",
    "scope-allow",
    "scope-deny",
    "gates",
    "budgets",
    "stop",
    "behaviors",
    "results",
];

/// Gate tokens a signed PLAN must list.
pub const REQUIRED_GATES: &[&str] = &["lite", "plan_check", "patch_check", "behavior_catalog_check"];

/// Budget keys that must be positive integers in a signed PLAN.
pub const REQUIRED_BUDGETS: &[&str] = &["max_iterations", "max_files", "max_total_bytes"];

static BEHAVIOR_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^B\d{3}$").expect("behavior id regex"));
static RESULT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^R\d{3}$").expect("result id regex"));

/// Iteration, file, and byte budgets from a signed PLAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanBudgets {
    pub max_iterations: u64,
    pub max_files: u64,
    pub max_total_bytes: u64,
}

/// Parsed signed PLAN contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanContract {
    pub scope_allow: Vec<String>,
    pub scope_deny: Vec<String>,
    pub gates: Vec<String>,
    pub budgets: PlanBudgets,
    pub stop: String,
    pub behaviors: Vec<String>,
    pub results: Vec<String>,
}

/// Check that a PLAN draft carries every required header field.
pub fn validate_draft(text: &str) -> Result<(), Vec<String>> {
    let headers = parse_header_map(text);
    let missing = missing_fields(&headers);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(vec![format!(
            "PLAN missing required fields: {}",
            missing.join(", ")
        )])
    }
}

/// Validate a signed PLAN and extract its contract.
///
/// Collects every violation instead of stopping at the first so a blocked
/// gate reason can name them all.
pub fn validate_signed(text: &str) -> Result<PlanContract, Vec<String>> {
    let headers = parse_header_map(text);
    let mut errors = Vec::new();

    let missing = missing_fields(&headers);
    if !missing.is_empty() {
        errors.push(format!("PLAN missing required fields: {}", missing.join(", ")));
    }

    let status = headers.get("status").map(String::as_str).unwrap_or("");
    if !status.eq_ignore_ascii_case("signed") {
        errors.push(format!("PLAN Status must be SIGNED (got '{status}')"));
    }

    let scope_allow = parse_list(headers.get("scope-allow").map(String::as_str).unwrap_or(""));
    if scope_allow.is_empty() {
        errors.push("PLAN Scope-Allow must be non-empty".to_string());
    }
    let scope_deny = parse_list(headers.get("scope-deny").map(String::as_str).unwrap_or(""));

    let gates = parse_list(headers.get("gates").map(String::as_str).unwrap_or(""));
    let missing_gates: Vec<&str> = REQUIRED_GATES
        .iter()
        .copied()
        .filter(|gate| !gates.iter().any(|item| item == gate))
        .collect();
    if !missing_gates.is_empty() {
        errors.push(format!(
            "PLAN Gates missing required items: {}",
            missing_gates.join(", ")
        ));
    }

    let budget_map = parse_map(headers.get("budgets").map(String::as_str).unwrap_or(""));
    let budgets = parse_budgets(&budget_map, &mut errors);

    let stop = headers.get("stop").map(String::as_str).unwrap_or("").trim().to_string();
    if stop.is_empty() {
        errors.push("PLAN Stop must be non-empty".to_string());
    }

    let behaviors = parse_list(headers.get("behaviors").map(String::as_str).unwrap_or(""));
    if !behaviors.iter().any(|id| BEHAVIOR_ID.is_match(id)) {
        errors.push("PLAN Behaviors must list at least one B### id".to_string());
    }

    let results = parse_list(headers.get("results").map(String::as_str).unwrap_or(""));
    if !results.iter().any(|id| RESULT_ID.is_match(id)) {
        errors.push("PLAN Results must list at least one R### id".to_string());
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(PlanContract {
        scope_allow,
        scope_deny,
        gates,
        budgets,
        stop,
        behaviors,
        results,
    })
}

fn missing_fields(headers: &BTreeMap<String, String>) -> Vec<&'static str> {
    REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| {
            headers
                .get(*field)
                .map(|value| value.trim().is_empty())
                .unwrap_or(true)
        })
        .collect()
}

fn parse_budgets(map: &BTreeMap<String, String>, errors: &mut Vec<String>) -> PlanBudgets {
    let mut out = PlanBudgets {
        max_iterations: 0,
        max_files: 0,
        max_total_bytes: 0,
    };
    for key in REQUIRED_BUDGETS {
        let value = match map.get(*key).and_then(|raw| raw.parse::<u64>().ok()) {
            Some(value) if value > 0 => value,
            _ => {
                errors.push(format!("PLAN Budgets.{key} must be a positive integer"));
                continue;
            }
        };
        match *key {
            "max_iterations" => out.max_iterations = value,
            "max_files" => out.max_files = value,
            _ => out.max_total_bytes = value,
        }
    }
    out
}
