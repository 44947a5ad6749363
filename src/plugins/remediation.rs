//! Bounded remediation loop.
//!
//! An explicit state machine:
//!
//! ```text
//! Evaluating -> Proposing -> AutoApplying -> Reevaluating -> Proposing ...
//!                         \-> AwaitingConfirmation -> Deferred
//! Evaluating/Reevaluating with nothing actionable -> Converged
//! Proposing with the iteration budget spent       -> IterationCapReached
//! ```
//!
//! The loop never touches storage. It returns the mutated payload and one
//! `FeedbackIteration` per applied round; the document pipeline writes them to
//! the ledger inside the same transaction as the update.

use crate::core::config::{DriftConfig, RemediationConfig};
use crate::core::payload::Payload;
use crate::plugins::contradiction::{ContradictionReport, RuleRegistry};
use crate::plugins::drift::{self, DriftReport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

pub const ENFORCE_DRIFT_FLAG: &str = "meta_enforcement.enforce_drift_tracking";
pub const ENFORCE_CONTRADICTION_FLAG: &str = "meta_enforcement.enforce_contradiction_alerts";
pub const AUTO_APPLY_FLAG: &str = "meta_enforcement.auto_apply_remediation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Evaluating,
    Proposing,
    AutoApplying,
    AwaitingConfirmation,
    Reevaluating,
    Converged,
    IterationCapReached,
    Deferred,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopState::Converged | LoopState::IterationCapReached | LoopState::Deferred
        )
    }
}

/// Enforcement switches, read from the document and the engine config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationPolicy {
    pub enforce_drift: bool,
    pub enforce_contradictions: bool,
    pub auto_apply: bool,
    pub max_iterations: u32,
}

impl RemediationPolicy {
    pub fn from_document(payload: &Payload, config: &RemediationConfig) -> Self {
        Self {
            enforce_drift: payload.bool_at(ENFORCE_DRIFT_FLAG).unwrap_or(false),
            enforce_contradictions: payload.bool_at(ENFORCE_CONTRADICTION_FLAG).unwrap_or(false),
            auto_apply: payload.bool_at(AUTO_APPLY_FLAG).unwrap_or(config.auto_confirm),
            max_iterations: config.max_iterations,
        }
    }

    /// Entry condition: something was reported in a category the document enforces.
    pub fn should_enter(&self, drift: Option<&DriftReport>, conflicts: Option<&ContradictionReport>) -> bool {
        (self.enforce_drift && drift.is_some()) || (self.enforce_contradictions && conflicts.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ProposalOrigin {
    Drift,
    Contradiction { rule_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub origin: ProposalOrigin,
    pub path: String,
    /// Literal keys the proposal writes through; `path` is for display.
    pub segments: Vec<String>,
    pub current: Option<Value>,
    /// `None` removes the field.
    pub proposed: Option<Value>,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackIteration {
    pub iteration: u32,
    pub proposals: Vec<Proposal>,
    pub applied: usize,
    pub auto_confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationOutcome {
    pub terminal: LoopState,
    pub payload: Payload,
    pub iterations: Vec<FeedbackIteration>,
    /// Proposals that were not applied: awaiting a caller decision, or left
    /// over when the budget ran out.
    pub pending: Vec<Proposal>,
    pub residual_drift: Option<DriftReport>,
    pub residual_conflicts: Option<ContradictionReport>,
    pub trace: Vec<LoopState>,
}

impl RemediationOutcome {
    pub fn warning(&self) -> Option<String> {
        match self.terminal {
            LoopState::IterationCapReached => Some(format!(
                "remediation stopped after {} iterations with {} unresolved proposal(s)",
                self.iterations.len(),
                self.pending.len()
            )),
            LoopState::Deferred => Some(format!(
                "remediation deferred: {} proposal(s) await confirmation",
                self.pending.len()
            )),
            _ => None,
        }
    }

    pub fn summary(&self) -> String {
        match self.terminal {
            LoopState::Converged => format!("converged after {} iteration(s)", self.iterations.len()),
            _ => self.warning().unwrap_or_default(),
        }
    }
}

pub struct RemediationLoop<'a> {
    drift: &'a DriftConfig,
    rules: &'a RuleRegistry,
    policy: RemediationPolicy,
}

impl<'a> RemediationLoop<'a> {
    pub fn new(drift: &'a DriftConfig, rules: &'a RuleRegistry, policy: RemediationPolicy) -> Self {
        Self {
            drift,
            rules,
            policy,
        }
    }

    /// Drive the state machine to a terminal state. `baseline` is the last
    /// committed payload (absent on create); drift is always measured against it.
    pub fn run(&self, baseline: Option<&Payload>, proposed: Payload) -> RemediationOutcome {
        let mut payload = proposed;
        let mut state = LoopState::Evaluating;
        let mut trace = Vec::new();
        let mut iterations: Vec<FeedbackIteration> = Vec::new();
        let mut pending: Vec<Proposal> = Vec::new();
        let mut residual_drift = None;
        let mut residual_conflicts = None;

        while !state.is_terminal() {
            trace.push(state);
            state = match state {
                LoopState::Evaluating | LoopState::Reevaluating => {
                    residual_drift = baseline.and_then(|b| drift::detect_drift(b, &payload, self.drift));
                    residual_conflicts = self.rules.evaluate(&payload);
                    pending = self.propose(&payload, residual_drift.as_ref(), residual_conflicts.as_ref());
                    if pending.is_empty() {
                        LoopState::Converged
                    } else {
                        LoopState::Proposing
                    }
                }
                LoopState::Proposing => {
                    if iterations.len() as u32 >= self.policy.max_iterations {
                        LoopState::IterationCapReached
                    } else if self.policy.auto_apply {
                        LoopState::AutoApplying
                    } else {
                        LoopState::AwaitingConfirmation
                    }
                }
                LoopState::AutoApplying => {
                    let proposals = std::mem::take(&mut pending);
                    let applied = apply_proposals(&mut payload, &proposals);
                    iterations.push(FeedbackIteration {
                        iteration: iterations.len() as u32 + 1,
                        proposals,
                        applied,
                        auto_confirmed: true,
                        payload_digest: payload.digest().ok(),
                    });
                    tracing::debug!(iteration = iterations.len(), applied, "remediation round applied");
                    LoopState::Reevaluating
                }
                LoopState::AwaitingConfirmation => LoopState::Deferred,
                terminal => terminal,
            };
        }
        trace.push(state);

        match state {
            LoopState::IterationCapReached => {
                tracing::warn!(iterations = iterations.len(), pending = pending.len(), "remediation iteration cap reached")
            }
            LoopState::Deferred => {
                tracing::warn!(pending = pending.len(), "remediation deferred to caller")
            }
            _ => {}
        }

        RemediationOutcome {
            terminal: state,
            payload,
            iterations,
            pending,
            residual_drift,
            residual_conflicts,
            trace,
        }
    }

    /// One proposal per actionable issue in an enforced category. Drift
    /// reverts come first; a contradiction fix for the same path replaces the
    /// revert, and a revert that would re-trigger a rule on its own path is
    /// dropped so the two never undo each other.
    pub fn propose(
        &self,
        payload: &Payload,
        drift: Option<&DriftReport>,
        conflicts: Option<&ContradictionReport>,
    ) -> Vec<Proposal> {
        let mut fixes = Vec::new();
        if self.policy.enforce_contradictions
            && let Some(report) = conflicts
        {
            for conflict in &report.conflicts {
                if let Some(remedy) = &conflict.remedy {
                    fixes.push(Proposal {
                        origin: ProposalOrigin::Contradiction {
                            rule_id: conflict.rule_id.clone(),
                        },
                        path: remedy.path().to_string(),
                        segments: remedy.path().split('.').map(String::from).collect(),
                        current: None,
                        proposed: Some(remedy.value()),
                        rationale: conflict.explanation.clone(),
                    });
                }
            }
        }
        let claimed: BTreeSet<&[String]> = fixes.iter().map(|p| p.segments.as_slice()).collect();

        let mut reverts = Vec::new();
        if self.policy.enforce_drift
            && let Some(report) = drift
        {
            for change in report.shifted() {
                if claimed.contains(change.segments.as_slice()) {
                    continue;
                }
                let revert = Proposal {
                    origin: ProposalOrigin::Drift,
                    path: change.path.clone(),
                    segments: change.segments.clone(),
                    current: change.new_value.clone(),
                    proposed: change.old_value.clone(),
                    rationale: match change.similarity {
                        Some(s) => format!("revert shifted field (similarity {:.2})", s),
                        None => "revert structural change".to_string(),
                    },
                };
                if !self.reintroduces_conflict(payload, &revert) {
                    reverts.push(revert);
                }
            }
        }

        reverts.extend(fixes);
        reverts
    }

    fn reintroduces_conflict(&self, payload: &Payload, revert: &Proposal) -> bool {
        if !self.policy.enforce_contradictions {
            return false;
        }
        let mut trial = payload.clone();
        apply_proposals(&mut trial, std::slice::from_ref(revert));
        self.rules.evaluate(&trial).is_some_and(|report| {
            report
                .conflicts
                .iter()
                .any(|c| c.fields_involved.iter().any(|f| f == &revert.path))
        })
    }
}

/// Apply proposals in order; returns how many took effect. A proposal whose
/// path cannot be written is skipped.
pub fn apply_proposals(payload: &mut Payload, proposals: &[Proposal]) -> usize {
    let mut applied = 0;
    for proposal in proposals {
        let result = match &proposal.proposed {
            Some(value) => payload.set_in(&proposal.segments, value.clone()),
            None => {
                payload.remove_in(&proposal.segments);
                Ok(())
            }
        };
        match result {
            Ok(()) => applied += 1,
            Err(e) => tracing::warn!(path = %proposal.path, error = %e, "remediation proposal skipped"),
        }
    }
    applied
}
