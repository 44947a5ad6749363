//! Contradiction evaluation over a single document snapshot.
//!
//! Rules are independent predicates held in a registry; adding one never
//! touches another. Evaluation is pure: same payload, same conflicts, in
//! registration order.

use crate::core::error::KeelsonError;
use crate::core::payload::Payload;
use crate::core::validate::SAFE_WORDS;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const PUSHBACK_WITHOUT_HONESTY: &str = "pushback-without-honesty";
pub const LOGGING_WITHOUT_MEMORY: &str = "logging-without-memory";
pub const CONFIRMATION_WITHOUT_ESCAPE: &str = "confirmation-without-escape";

/// Fix a rule knows how to apply to its own conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Remedy {
    /// Flip a dependent flag so it agrees with the dominant one.
    SetFlag { path: String, value: bool },
    /// Install a minimal default for a missing mechanism.
    InstallDefault { path: String, value: Value },
}

impl Remedy {
    pub fn path(&self) -> &str {
        match self {
            Remedy::SetFlag { path, .. } | Remedy::InstallDefault { path, .. } => path,
        }
    }

    pub fn value(&self) -> Value {
        match self {
            Remedy::SetFlag { value, .. } => Value::Bool(*value),
            Remedy::InstallDefault { value, .. } => value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub rule_id: String,
    pub fields_involved: Vec<String>,
    pub explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remedy: Option<Remedy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictionReport {
    pub conflicts: Vec<Conflict>,
}

impl ContradictionReport {
    pub fn rule_ids(&self) -> Vec<&str> {
        self.conflicts.iter().map(|c| c.rule_id.as_str()).collect()
    }
}

pub trait ContradictionRule: Send + Sync {
    fn id(&self) -> &str;
    fn evaluate(&self, payload: &Payload) -> Option<Conflict>;
}

/// Fires when `trigger` is set to `trigger_value` while `dependent` is
/// explicitly set to `forbidden`. An absent dependent flag never fires.
#[derive(Debug, Clone)]
pub struct FlagPairRule {
    pub id: &'static str,
    pub trigger: &'static str,
    pub trigger_value: bool,
    pub dependent: &'static str,
    pub forbidden: bool,
    pub explanation: &'static str,
}

impl ContradictionRule for FlagPairRule {
    fn id(&self) -> &str {
        self.id
    }

    fn evaluate(&self, payload: &Payload) -> Option<Conflict> {
        let fires = payload.bool_at(self.trigger) == Some(self.trigger_value)
            && payload.bool_at(self.dependent) == Some(self.forbidden);
        fires.then(|| Conflict {
            rule_id: self.id.to_string(),
            fields_involved: vec![self.trigger.to_string(), self.dependent.to_string()],
            explanation: self.explanation.to_string(),
            remedy: Some(Remedy::SetFlag {
                path: self.dependent.to_string(),
                value: !self.forbidden,
            }),
        })
    }
}

/// Fires when `trigger` is set to `trigger_value` but `mechanism` is absent,
/// null, or an empty string/array/object.
#[derive(Debug, Clone)]
pub struct MissingMechanismRule {
    pub id: &'static str,
    pub trigger: &'static str,
    pub trigger_value: bool,
    pub mechanism: &'static str,
    pub default: fn() -> Value,
    pub explanation: &'static str,
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

impl ContradictionRule for MissingMechanismRule {
    fn id(&self) -> &str {
        self.id
    }

    fn evaluate(&self, payload: &Payload) -> Option<Conflict> {
        let fires = payload.bool_at(self.trigger) == Some(self.trigger_value)
            && is_blank(payload.get(self.mechanism));
        fires.then(|| Conflict {
            rule_id: self.id.to_string(),
            fields_involved: vec![self.trigger.to_string(), self.mechanism.to_string()],
            explanation: self.explanation.to_string(),
            remedy: Some(Remedy::InstallDefault {
                path: self.mechanism.to_string(),
                value: (self.default)(),
            }),
        })
    }
}

fn default_safe_words() -> Value {
    json!(["stop"])
}

pub fn builtin_rules() -> Vec<Box<dyn ContradictionRule>> {
    vec![
        Box::new(FlagPairRule {
            id: PUSHBACK_WITHOUT_HONESTY,
            trigger: "interaction_preferences.pushback",
            trigger_value: true,
            dependent: "meta_enforcement.require_honest_pushback",
            forbidden: false,
            explanation: "pushback on the user's ideas is requested while honest pushback is disabled",
        }),
        Box::new(FlagPairRule {
            id: LOGGING_WITHOUT_MEMORY,
            trigger: "meta_enforcement.log_all_exchanges",
            trigger_value: true,
            dependent: "meta_enforcement.preserve_session_memory",
            forbidden: false,
            explanation: "every exchange is logged but session memory is not preserved",
        }),
        Box::new(MissingMechanismRule {
            id: CONFIRMATION_WITHOUT_ESCAPE,
            trigger: "interaction_preferences.require_confirmation",
            trigger_value: true,
            mechanism: SAFE_WORDS,
            default: default_safe_words,
            explanation: "explicit confirmation is required but no safe word can halt the exchange",
        }),
    ]
}

/// Ordered set of independent rules.
pub struct RuleRegistry {
    rules: Vec<Box<dyn ContradictionRule>>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self {
            rules: builtin_rules(),
        }
    }
}

impl RuleRegistry {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule. Ids must be unique within a registry.
    pub fn register(&mut self, rule: Box<dyn ContradictionRule>) -> Result<(), KeelsonError> {
        if self.rules.iter().any(|r| r.id() == rule.id()) {
            return Err(KeelsonError::invalid(format!(
                "contradiction rule '{}' is already registered",
                rule.id()
            )));
        }
        self.rules.push(rule);
        Ok(())
    }

    pub fn rule_ids(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    pub fn evaluate(&self, payload: &Payload) -> Option<ContradictionReport> {
        let conflicts: Vec<Conflict> = self.rules.iter().filter_map(|r| r.evaluate(payload)).collect();
        if conflicts.is_empty() {
            None
        } else {
            Some(ContradictionReport { conflicts })
        }
    }
}
