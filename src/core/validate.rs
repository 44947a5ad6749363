//! Document shape validation, applied once centrally before any detector runs.
//!
//! Each kind has required top-level sections; a fixed set of known fields is
//! type-checked when present. Everything else is caller-defined and passes
//! through untouched.

use crate::core::error::KeelsonError;
use crate::core::payload::{Payload, type_name};
use crate::core::store::DocumentKind;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static DOCUMENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid id regex"));

pub const IDENTITY_NAME: &str = "identity.name";

/// Boolean fields consumed by the policy reader and the contradiction rules.
pub const BOOLEAN_FIELDS: &[&str] = &[
    "interaction_preferences.pushback",
    "interaction_preferences.require_confirmation",
    "meta_enforcement.enforce_drift_tracking",
    "meta_enforcement.enforce_contradiction_alerts",
    "meta_enforcement.auto_apply_remediation",
    "meta_enforcement.require_honest_pushback",
    "meta_enforcement.log_all_exchanges",
    "meta_enforcement.preserve_session_memory",
];

pub const OBJECT_SECTIONS: &[&str] = &[
    "formatting_rules",
    "meta_enforcement",
    "halt_mechanism",
    "session_context",
    "custom",
];

pub const SAFE_WORDS: &str = "halt_mechanism.safe_words";
pub const SESSION_PHASE: &str = "session_context.phase";

pub fn required_sections(kind: DocumentKind) -> &'static [&'static str] {
    match kind {
        DocumentKind::User => &["identity", "interaction_preferences"],
        DocumentKind::Agent => &["identity", "capabilities"],
    }
}

pub fn validate_document_id(id: &str) -> Result<(), KeelsonError> {
    if DOCUMENT_ID.is_match(id) {
        Ok(())
    } else {
        Err(KeelsonError::invalid_field(
            "id",
            format!("'{}' must match {}", id, DOCUMENT_ID.as_str()),
        ))
    }
}

#[derive(Default)]
struct Violations {
    entries: Vec<(String, String)>,
}

impl Violations {
    fn push(&mut self, path: &str, message: impl Into<String>) {
        self.entries.push((path.to_string(), message.into()));
    }

    fn into_result(self, kind: DocumentKind) -> Result<(), KeelsonError> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let message = self
            .entries
            .iter()
            .map(|(path, msg)| format!("{}: {}", path, msg))
            .collect::<Vec<_>>()
            .join("; ");
        Err(KeelsonError::ValidationError {
            message: format!("{} document rejected: {}", kind, message),
            fields: self.entries.into_iter().map(|(path, _)| path).collect(),
        })
    }
}

/// Check a full (post-merge) payload against the shape for its kind.
/// Every violation is reported, not just the first.
pub fn validate_payload(kind: DocumentKind, payload: &Payload) -> Result<(), KeelsonError> {
    let mut violations = Violations::default();

    for section in required_sections(kind) {
        match payload.get(section) {
            None => violations.push(section, "required section is missing"),
            Some(Value::Object(_)) => {}
            Some(other) => violations.push(section, format!("must be an object, got {}", type_name(other))),
        }
    }

    match payload.get(IDENTITY_NAME) {
        Some(Value::String(name)) if !name.trim().is_empty() => {}
        Some(Value::String(_)) | None => {
            if matches!(payload.get("identity"), Some(Value::Object(_))) {
                violations.push(IDENTITY_NAME, "must be a non-empty string");
            }
        }
        Some(other) => violations.push(IDENTITY_NAME, format!("must be a string, got {}", type_name(other))),
    }

    for section in OBJECT_SECTIONS {
        if let Some(value) = payload.get(section)
            && !value.is_object()
        {
            violations.push(section, format!("must be an object, got {}", type_name(value)));
        }
    }

    for field in BOOLEAN_FIELDS {
        if let Some(value) = payload.get(field)
            && !value.is_boolean()
        {
            violations.push(field, format!("must be a bool, got {}", type_name(value)));
        }
    }

    match payload.get(SAFE_WORDS) {
        None => {}
        Some(Value::Array(words)) => {
            if words.iter().any(|w| !w.is_string()) {
                violations.push(SAFE_WORDS, "must contain only strings");
            }
        }
        Some(other) => violations.push(SAFE_WORDS, format!("must be an array, got {}", type_name(other))),
    }

    if let Some(value) = payload.get(SESSION_PHASE)
        && !value.is_string()
    {
        violations.push(SESSION_PHASE, format!("must be a string, got {}", type_name(value)));
    }

    violations.into_result(kind)
}
