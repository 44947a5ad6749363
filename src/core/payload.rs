//! Document payload: a tagged value tree addressed by dotted field paths.
//!
//! The tree itself is `serde_json::Value` (string/bool/number/array/object
//! variants). `Payload` pins the root to an object and owns the path and merge
//! semantics every subsystem relies on.

use crate::core::error::KeelsonError;
use crate::core::hash;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::LazyLock;

static PATH_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_-]*$").expect("valid segment regex"));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

/// Split and validate a dotted path such as `interaction_preferences.tone`.
pub fn parse_path(path: &str) -> Result<Vec<&str>, KeelsonError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| !PATH_SEGMENT.is_match(s)) {
        return Err(KeelsonError::invalid_field(path, "invalid field path"));
    }
    Ok(segments)
}

impl Payload {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_value(value: Value) -> Result<Self, KeelsonError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(KeelsonError::invalid(format!(
                "payload root must be an object, got {}",
                type_name(&other)
            ))),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let segments: Vec<&str> = path.split('.').collect();
        self.get_in(&segments)
    }

    /// Like `get`, over literal keys. A key may itself contain `.`.
    pub fn get_in<S: AsRef<str>>(&self, segments: &[S]) -> Option<&Value> {
        let (first, rest) = segments.split_first()?;
        let mut current = self.0.get(first.as_ref())?;
        for segment in rest {
            current = current.as_object()?.get(segment.as_ref())?;
        }
        Some(current)
    }

    pub fn bool_at(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    pub fn str_at(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Set a (possibly nested) leaf, creating intermediate objects as needed.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), KeelsonError> {
        let segments = parse_path(path)?;
        self.set_in(&segments, value)
    }

    /// Like `set`, over literal keys taken from an existing tree. Keys are
    /// not re-validated, so `.` or spaces inside a key are preserved.
    pub fn set_in<S: AsRef<str>>(&mut self, segments: &[S], value: Value) -> Result<(), KeelsonError> {
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| KeelsonError::invalid_field("", "empty field path"))?;

        let mut current = &mut self.0;
        for (depth, segment) in parents.iter().enumerate() {
            let slot = current
                .entry(segment.as_ref().to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            current = match slot {
                Value::Object(map) => map,
                other => {
                    let prefix = join_segments(&segments[..=depth]);
                    return Err(KeelsonError::invalid_field(
                        &prefix,
                        format!("cannot descend into {}", type_name(other)),
                    ));
                }
            };
        }
        current.insert(last.as_ref().to_string(), value);
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        self.remove_in(&segments)
    }

    pub fn remove_in<S: AsRef<str>>(&mut self, segments: &[S]) -> Option<Value> {
        let (last, parents) = segments.split_last()?;
        let mut current = &mut self.0;
        for segment in parents {
            current = current.get_mut(segment.as_ref())?.as_object_mut()?;
        }
        current.remove(last.as_ref())
    }

    /// Merge a patch: non-dotted keys replace whole top-level subtrees, dotted
    /// keys replace one nested leaf. Whole subtrees are applied first.
    pub fn merge_patch(&self, patch: &Payload) -> Result<Payload, KeelsonError> {
        let mut merged = self.clone();
        let (dotted, whole): (Vec<_>, Vec<_>) = patch.0.iter().partition(|(k, _)| k.contains('.'));

        for (key, value) in whole {
            parse_path(key)?;
            merged.0.insert(key.clone(), value.clone());
        }
        for (path, value) in dotted {
            merged.set(path, value.clone())?;
        }
        Ok(merged)
    }

    /// Stable serialized form (object keys are kept sorted by `serde_json`).
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, KeelsonError> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    pub fn digest(&self) -> Result<String, KeelsonError> {
        Ok(hash::sha256_hex(&self.canonical_bytes()?))
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Payload {
    type Error = KeelsonError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Payload::from_value(value)
    }
}

/// Display form of a key path. Lossy when a key contains `.`.
pub fn join_segments<S: AsRef<str>>(segments: &[S]) -> String {
    segments.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(".")
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Dotted paths of every leaf that was added, removed or changed.
/// Objects are descended into; arrays and scalars are compared whole.
pub fn changed_paths(old: &Payload, new: &Payload) -> Vec<String> {
    let mut out = Vec::new();
    diff_maps("", &old.0, &new.0, &mut out);
    out
}

fn diff_maps(prefix: &str, old: &Map<String, Value>, new: &Map<String, Value>, out: &mut Vec<String>) {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for key in keys {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match (old.get(key), new.get(key)) {
            (Some(Value::Object(a)), Some(Value::Object(b))) => diff_maps(&path, a, b, out),
            (Some(a), Some(b)) if a == b => {}
            _ => out.push(path),
        }
    }
}
