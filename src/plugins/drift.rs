//! Drift detection between two versions of a document.
//!
//! Only monitored sections are diffed. String leaves are compared with a
//! normalized edit-distance ratio; anything at or below the configured
//! threshold is `shifted`. Non-string changes (type swaps, arrays, bools,
//! numbers) are always `shifted`. A change of the context phase field is
//! always reported, monitored or not.

use crate::core::config::DriftConfig;
use crate::core::payload::{Payload, join_segments};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Slack for float comparison so a ratio that is mathematically equal to the
/// threshold lands on the inclusive side.
const THRESHOLD_EPSILON: f64 = 1e-9;

/// More flagged fields than this makes a report `high` severity.
pub const HIGH_SEVERITY_AFTER: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftClass {
    Added,
    Removed,
    Shifted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Dotted display form of `segments`.
    pub path: String,
    /// Literal keys from the root; a key may contain `.` or spaces.
    pub segments: Vec<String>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    /// Present only when both sides are strings.
    pub similarity: Option<f64>,
    pub classification: DriftClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub changed_fields: Vec<FieldChange>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_digest: Option<String>,
}

impl DriftReport {
    pub fn shifted(&self) -> impl Iterator<Item = &FieldChange> {
        self.changed_fields
            .iter()
            .filter(|c| c.classification == DriftClass::Shifted)
    }

    pub fn paths(&self) -> Vec<&str> {
        self.changed_fields.iter().map(|c| c.path.as_str()).collect()
    }
}

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `1 - edit_distance / max(len_old, len_new)` over normalized text.
/// Two empty strings are identical.
pub fn similarity(old: &str, new: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize(old), &normalize(new))
}

pub fn is_shifted(similarity: f64, threshold: f64) -> bool {
    similarity <= threshold + THRESHOLD_EPSILON
}

pub fn detect_drift(old: &Payload, new: &Payload, config: &DriftConfig) -> Option<DriftReport> {
    let mut changes = Vec::new();
    for section in &config.monitored_sections {
        let segments: Vec<String> = section.split('.').map(String::from).collect();
        diff_value(
            segments,
            old.get(section),
            new.get(section),
            config.threshold,
            &mut changes,
        );
    }

    let phase_path = config.context_phase_field.as_str();
    let (old_phase, new_phase) = (old.get(phase_path), new.get(phase_path));
    if old_phase != new_phase {
        let phase_segments: Vec<String> = phase_path.split('.').map(String::from).collect();
        changes.retain(|c| c.segments != phase_segments);
        let similarity = match (old_phase, new_phase) {
            (Some(Value::String(a)), Some(Value::String(b))) => Some(similarity(a, b)),
            _ => None,
        };
        changes.push(FieldChange {
            path: phase_path.to_string(),
            segments: phase_segments,
            old_value: old_phase.cloned(),
            new_value: new_phase.cloned(),
            similarity,
            classification: DriftClass::Shifted,
        });
    }

    if changes.is_empty() {
        return None;
    }

    let severity = if changes.len() > HIGH_SEVERITY_AFTER {
        Severity::High
    } else {
        Severity::Low
    };
    tracing::debug!(fields = changes.len(), ?severity, "drift detected");

    Some(DriftReport {
        changed_fields: changes,
        severity,
        old_digest: old.digest().ok(),
        new_digest: new.digest().ok(),
    })
}

fn diff_value(
    segments: Vec<String>,
    old: Option<&Value>,
    new: Option<&Value>,
    threshold: f64,
    out: &mut Vec<FieldChange>,
) {
    let change = |classification, similarity| FieldChange {
        path: join_segments(&segments),
        segments: segments.clone(),
        old_value: old.cloned(),
        new_value: new.cloned(),
        similarity,
        classification,
    };

    match (old, new) {
        (None, None) => {}
        (None, Some(_)) => out.push(change(DriftClass::Added, None)),
        (Some(_), None) => out.push(change(DriftClass::Removed, None)),
        (Some(a), Some(b)) if a == b => {}
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let mut child = segments.clone();
                child.push(key.clone());
                diff_value(
                    child,
                    a.get(key),
                    b.get(key),
                    threshold,
                    out,
                );
            }
        }
        (Some(Value::String(a)), Some(Value::String(b))) => {
            let score = similarity(a, b);
            if is_shifted(score, threshold) {
                out.push(change(DriftClass::Shifted, Some(score)));
            }
        }
        // structural or non-string scalar change
        (Some(_), Some(_)) => out.push(change(DriftClass::Shifted, None)),
    }
}
