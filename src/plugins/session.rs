//! Session state: one small live record per document, overwritten in place.
//!
//! `record` is the only writer. Document mutations call it as their last step
//! inside the same transaction, so state, document and ledger agree.

use crate::core::error::KeelsonError;
use crate::core::store::{DocumentKind, Store, subject_key};
use crate::core::time::Timestamp;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: String,
    pub waiting_for: String,
    pub last_action: String,
    pub last_feedback: String,
    pub timestamp: Timestamp,
}

/// Partial update; `None` leaves the field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub phase: Option<String>,
    pub waiting_for: Option<String>,
    pub last_action: Option<String>,
    pub last_feedback: Option<String>,
}

impl SessionPatch {
    pub fn action(action: impl Into<String>) -> Self {
        Self {
            last_action: Some(action.into()),
            ..Self::default()
        }
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn waiting_for(mut self, waiting_for: impl Into<String>) -> Self {
        self.waiting_for = Some(waiting_for.into());
        self
    }

    pub fn feedback(mut self, feedback: impl Into<String>) -> Self {
        self.last_feedback = Some(feedback.into());
        self
    }

    fn apply(self, state: &mut SessionState) {
        if let Some(phase) = self.phase {
            state.phase = phase;
        }
        if let Some(waiting_for) = self.waiting_for {
            state.waiting_for = waiting_for;
        }
        if let Some(last_action) = self.last_action {
            state.last_action = last_action;
        }
        if let Some(last_feedback) = self.last_feedback {
            state.last_feedback = last_feedback;
        }
    }
}

pub(crate) fn load(conn: &Connection, kind: DocumentKind, id: &str) -> Result<Option<SessionState>, KeelsonError> {
    let state = conn
        .query_row(
            "SELECT phase, waiting_for, last_action, last_feedback, timestamp
             FROM session_state WHERE kind = ?1 AND id = ?2",
            params![kind.as_str(), id],
            |row| {
                Ok(SessionState {
                    phase: row.get(0)?,
                    waiting_for: row.get(1)?,
                    last_action: row.get(2)?,
                    last_feedback: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(state)
}

/// Merge `patch` into the stored state (or the zero value) and write it back.
pub(crate) fn record(
    conn: &Connection,
    kind: DocumentKind,
    id: &str,
    patch: SessionPatch,
    now: Timestamp,
) -> Result<SessionState, KeelsonError> {
    let mut state = load(conn, kind, id)?.unwrap_or_default();
    patch.apply(&mut state);
    state.timestamp = now;

    conn.execute(
        "INSERT INTO session_state(kind, id, phase, waiting_for, last_action, last_feedback, timestamp)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(kind, id) DO UPDATE SET
           phase = excluded.phase,
           waiting_for = excluded.waiting_for,
           last_action = excluded.last_action,
           last_feedback = excluded.last_feedback,
           timestamp = excluded.timestamp",
        params![
            kind.as_str(),
            id,
            state.phase,
            state.waiting_for,
            state.last_action,
            state.last_feedback,
            state.timestamp,
        ],
    )?;
    Ok(state)
}

pub(crate) fn remove(conn: &Connection, kind: DocumentKind, id: &str) -> Result<(), KeelsonError> {
    conn.execute(
        "DELETE FROM session_state WHERE kind = ?1 AND id = ?2",
        params![kind.as_str(), id],
    )?;
    Ok(())
}

/// Current state, or the zero value when nothing was recorded yet.
pub fn get_session_state(store: &Store, kind: DocumentKind, id: &str) -> Result<SessionState, KeelsonError> {
    store
        .broker()
        .with_conn("session.get", |conn| Ok(load(conn, kind, id)?.unwrap_or_default()))
}

/// Last-writer-wins update for an existing document, serialized with its
/// other mutations.
pub fn update_session_state(
    store: &Store,
    kind: DocumentKind,
    id: &str,
    patch: SessionPatch,
) -> Result<SessionState, KeelsonError> {
    let now = store.clock().now();
    store
        .broker()
        .with_subject_tx(&subject_key(kind, id), "session.update", |conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM documents WHERE kind = ?1 AND id = ?2",
                    params![kind.as_str(), id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(KeelsonError::NotFound(format!("{} document '{}'", kind, id)));
            }
            record(conn, kind, id, patch, now)
        })
}
