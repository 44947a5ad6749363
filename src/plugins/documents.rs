//! Versioned document store: the update pipeline that ties the detectors,
//! the remediation loop, the audit ledger and session state together.
//!
//! Every mutation runs under the document's lock in one immediate
//! transaction. Validation and detection happen first; the document row, its
//! version history, the audit entries and the session record are written only
//! after every check passed, and commit together.

use crate::core::codec::PayloadCodec;
use crate::core::error::KeelsonError;
use crate::core::payload::{self, Payload};
use crate::core::store::{DocumentKind, Store, subject_key};
use crate::core::time::Timestamp;
use crate::core::validate::{self, SESSION_PHASE};
use crate::core::version::Version;
use crate::plugins::audit::{self, AuditEventType};
use crate::plugins::contradiction::ContradictionReport;
use crate::plugins::drift::{self, DriftReport};
use crate::plugins::remediation::{LoopState, RemediationLoop, RemediationOutcome, RemediationPolicy};
use crate::plugins::session::{self, SessionPatch};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;

/// Phase recorded for a new document that does not name one.
pub const DEFAULT_PHASE: &str = "active";
pub const DELETED_PHASE: &str = "deleted";
/// `waiting_for` value while deferred proposals await the caller.
pub const AWAITING_CONFIRMATION: &str = "caller_confirmation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionState {
    Live,
    /// Payload retained, flagged deleted.
    Soft,
    /// Physically removed; only a tombstone and the audit trail remain.
    Hard,
}

impl DeletionState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletionState::Live => "live",
            DeletionState::Soft => "soft",
            DeletionState::Hard => "hard",
        }
    }
}

impl fmt::Display for DeletionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeletionState {
    type Err = KeelsonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(DeletionState::Live),
            "soft" => Ok(DeletionState::Soft),
            "hard" => Ok(DeletionState::Hard),
            other => Err(KeelsonError::invalid(format!("unknown deletion state '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub kind: DocumentKind,
    pub id: String,
    pub payload: Payload,
    pub version: Version,
    pub deleted: DeletionState,
    pub created_at: Timestamp,
    pub last_updated: Timestamp,
}

impl Document {
    pub fn is_live(&self) -> bool {
        self.deleted == DeletionState::Live
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub kind: DocumentKind,
    pub id: String,
    pub last_version: Version,
    pub deleted_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    /// Soft-deleted records are returned too.
    #[default]
    IncludeDeleted,
    LiveOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: Version,
    pub digest: String,
    pub recorded_at: Timestamp,
}

/// Result of `create_document` / `update_document`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub document: Document,
    /// Paths that differ from the previous committed payload.
    pub changed_fields: Vec<String>,
    pub drift: Option<DriftReport>,
    pub contradictions: Option<ContradictionReport>,
    pub remediation: Option<RemediationOutcome>,
    /// Non-fatal conditions: iteration cap reached, deferred proposals.
    pub warnings: Vec<String>,
}

impl MutationOutcome {
    pub fn remediation_state(&self) -> Option<LoopState> {
        self.remediation.as_ref().map(|r| r.terminal)
    }
}

/// Detector and remediation results for one proposed payload.
struct Evaluation {
    payload: Payload,
    drift: Option<DriftReport>,
    contradictions: Option<ContradictionReport>,
    remediation: Option<RemediationOutcome>,
}

impl Evaluation {
    fn deferred(&self) -> bool {
        self.remediation.as_ref().is_some_and(|r| r.terminal == LoopState::Deferred)
    }

    fn feedback(&self) -> String {
        self.remediation.as_ref().map(|r| r.summary()).unwrap_or_default()
    }

    fn warnings(&self) -> Vec<String> {
        self.remediation.iter().filter_map(|r| r.warning()).collect()
    }

    fn remediation_detail(&self) -> Value {
        match &self.remediation {
            None => Value::Null,
            Some(r) => json!({
                "terminal": r.terminal,
                "iterations": r.iterations.len(),
                "pending": r.pending,
            }),
        }
    }
}

fn evaluate(
    store: &Store,
    kind: DocumentKind,
    policy: RemediationPolicy,
    baseline: Option<&Payload>,
    proposed: Payload,
) -> Result<Evaluation, KeelsonError> {
    let drift_config = &store.config.drift;
    let drift = baseline.and_then(|old| drift::detect_drift(old, &proposed, drift_config));
    let contradictions = store.rules().evaluate(&proposed);

    let (payload, remediation) = if policy.should_enter(drift.as_ref(), contradictions.as_ref()) {
        let outcome = RemediationLoop::new(drift_config, store.rules(), policy).run(baseline, proposed);
        (outcome.payload.clone(), Some(outcome))
    } else {
        (proposed, None)
    };

    // remediation may rewrite fields; the committed payload must still be well-formed
    validate::validate_payload(kind, &payload)?;

    Ok(Evaluation {
        payload,
        drift,
        contradictions,
        remediation,
    })
}

/// Detector findings and remediation rounds, in the order they happened.
fn log_evaluation(
    conn: &Connection,
    kind: DocumentKind,
    id: &str,
    eval: &Evaluation,
    now: Timestamp,
) -> Result<(), KeelsonError> {
    if let Some(report) = &eval.drift {
        audit::append_entry(conn, kind, id, AuditEventType::Drift, &serde_json::to_value(report)?, now)?;
    }
    if let Some(report) = &eval.contradictions {
        audit::append_entry(
            conn,
            kind,
            id,
            AuditEventType::Contradiction,
            &serde_json::to_value(report)?,
            now,
        )?;
    }
    if let Some(outcome) = &eval.remediation {
        for iteration in &outcome.iterations {
            audit::append_entry(
                conn,
                kind,
                id,
                AuditEventType::RecursiveFeedback,
                &serde_json::to_value(iteration)?,
                now,
            )?;
        }
        if outcome.terminal == LoopState::IterationCapReached {
            let detail = json!({
                "iterations": outcome.iterations.len(),
                "pending": outcome.pending,
                "residual_conflicts": outcome.residual_conflicts.as_ref().map(|r| r.rule_ids()),
                "residual_drift": outcome.residual_drift.as_ref().map(|r| r.paths()),
            });
            audit::append_entry(conn, kind, id, AuditEventType::FeedbackUnresolved, &detail, now)?;
        }
    }
    Ok(())
}

struct DocumentRow {
    version: String,
    deleted: String,
    payload: Vec<u8>,
    created_at: Timestamp,
    last_updated: Timestamp,
}

fn row_to_document(
    codec: &dyn PayloadCodec,
    kind: DocumentKind,
    id: &str,
    row: DocumentRow,
) -> Result<Document, KeelsonError> {
    Ok(Document {
        kind,
        id: id.to_string(),
        payload: codec.decode(&row.payload)?,
        version: row.version.parse()?,
        deleted: row.deleted.parse()?,
        created_at: row.created_at,
        last_updated: row.last_updated,
    })
}

pub(crate) fn load(
    conn: &Connection,
    codec: &dyn PayloadCodec,
    kind: DocumentKind,
    id: &str,
) -> Result<Option<Document>, KeelsonError> {
    let row = conn
        .query_row(
            "SELECT version, deleted, payload, created_at, last_updated
             FROM documents WHERE kind = ?1 AND id = ?2",
            params![kind.as_str(), id],
            |row| {
                Ok(DocumentRow {
                    version: row.get(0)?,
                    deleted: row.get(1)?,
                    payload: row.get(2)?,
                    created_at: row.get(3)?,
                    last_updated: row.get(4)?,
                })
            },
        )
        .optional()?;
    row.map(|r| row_to_document(codec, kind, id, r)).transpose()
}

fn load_tombstone(conn: &Connection, kind: DocumentKind, id: &str) -> Result<Option<Tombstone>, KeelsonError> {
    let row: Option<(String, Timestamp)> = conn
        .query_row(
            "SELECT last_version, deleted_at FROM tombstones WHERE kind = ?1 AND id = ?2",
            params![kind.as_str(), id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(last_version, deleted_at)| {
        Ok(Tombstone {
            kind,
            id: id.to_string(),
            last_version: last_version.parse()?,
            deleted_at,
        })
    })
    .transpose()
}

fn version_history(conn: &Connection, kind: DocumentKind, id: &str) -> Result<Vec<VersionRecord>, KeelsonError> {
    let mut stmt = conn.prepare(
        "SELECT version, digest, recorded_at FROM document_versions WHERE kind = ?1 AND id = ?2",
    )?;
    let rows = stmt
        .query_map(params![kind.as_str(), id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Timestamp>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // text order is not version order
    let mut records = rows
        .into_iter()
        .map(|(version, digest, recorded_at)| {
            Ok(VersionRecord {
                version: version.parse()?,
                digest,
                recorded_at,
            })
        })
        .collect::<Result<Vec<_>, KeelsonError>>()?;
    records.sort_by_key(|r| r.version);
    Ok(records)
}

/// Highest version this `(kind, id)` ever held, across soft and hard deletes.
fn highest_version(conn: &Connection, kind: DocumentKind, id: &str) -> Result<Option<Version>, KeelsonError> {
    let from_history = version_history(conn, kind, id)?.last().map(|r| r.version);
    let from_tombstone = load_tombstone(conn, kind, id)?.map(|t| t.last_version);
    Ok(from_history.max(from_tombstone))
}

fn record_version(
    conn: &Connection,
    codec: &dyn PayloadCodec,
    doc: &Document,
) -> Result<(), KeelsonError> {
    conn.execute(
        "INSERT INTO document_versions(kind, id, version, payload, digest, recorded_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            doc.kind.as_str(),
            doc.id,
            doc.version.to_string(),
            codec.encode(&doc.payload)?,
            doc.payload.digest()?,
            doc.last_updated,
        ],
    )?;
    Ok(())
}

fn session_patch(action: &str, phase: Option<String>, eval: &Evaluation) -> SessionPatch {
    let mut patch = SessionPatch::action(action)
        .waiting_for(if eval.deferred() { AWAITING_CONFIRMATION } else { "" })
        .feedback(eval.feedback());
    patch.phase = phase;
    patch
}

fn not_found(kind: DocumentKind, id: &str) -> KeelsonError {
    KeelsonError::NotFound(format!("{} document '{}'", kind, id))
}

/// Create a document at `1.0.0`, or at the next major version when the id
/// was previously deleted. Contradictions are evaluated (and remediated if the
/// document opts in); there is nothing to drift from.
pub fn create_document(
    store: &Store,
    kind: DocumentKind,
    id: &str,
    payload: Payload,
) -> Result<MutationOutcome, KeelsonError> {
    validate::validate_document_id(id)?;
    validate::validate_payload(kind, &payload)?;
    let now = store.clock().now();
    let codec = store.codec();

    let outcome = store
        .broker()
        .with_subject_tx(&subject_key(kind, id), "documents.create", |conn| {
            if let Some(existing) = load(conn, codec, kind, id)?
                && existing.is_live()
            {
                return Err(KeelsonError::AlreadyExists(format!("{} document '{}'", kind, id)));
            }
            let version = highest_version(conn, kind, id)?
                .map(Version::next_incarnation)
                .unwrap_or(Version::INITIAL);

            let policy = RemediationPolicy::from_document(&payload, &store.config.remediation);
            let eval = evaluate(store, kind, policy, None, payload)?;

            let document = Document {
                kind,
                id: id.to_string(),
                payload: eval.payload.clone(),
                version,
                deleted: DeletionState::Live,
                created_at: now,
                last_updated: now,
            };
            conn.execute(
                "INSERT OR REPLACE INTO documents(kind, id, version, deleted, payload, created_at, last_updated)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    kind.as_str(),
                    id,
                    version.to_string(),
                    DeletionState::Live.as_str(),
                    codec.encode(&document.payload)?,
                    now,
                    now,
                ],
            )?;
            conn.execute(
                "DELETE FROM tombstones WHERE kind = ?1 AND id = ?2",
                params![kind.as_str(), id],
            )?;
            record_version(conn, codec, &document)?;

            log_evaluation(conn, kind, id, &eval, now)?;
            audit::append_entry(
                conn,
                kind,
                id,
                AuditEventType::Create,
                &json!({
                    "version": version,
                    "digest": document.payload.digest()?,
                    "remediation": eval.remediation_detail(),
                }),
                now,
            )?;

            let phase = document
                .payload
                .str_at(SESSION_PHASE)
                .unwrap_or(DEFAULT_PHASE)
                .to_string();
            session::record(conn, kind, id, session_patch("create", Some(phase), &eval), now)?;

            Ok(MutationOutcome {
                changed_fields: payload::changed_paths(&Payload::new(), &document.payload),
                warnings: eval.warnings(),
                document,
                drift: eval.drift,
                contradictions: eval.contradictions,
                remediation: eval.remediation,
            })
        })?;

    tracing::info!(
        kind = kind.as_str(),
        id,
        version = %outcome.document.version,
        remediation = ?outcome.remediation_state(),
        "document created"
    );
    Ok(outcome)
}

pub fn get_document(
    store: &Store,
    kind: DocumentKind,
    id: &str,
    visibility: Visibility,
) -> Result<Document, KeelsonError> {
    let doc = store
        .broker()
        .with_conn("documents.get", |conn| load(conn, store.codec(), kind, id))?
        .ok_or_else(|| not_found(kind, id))?;
    match visibility {
        Visibility::LiveOnly if !doc.is_live() => Err(not_found(kind, id)),
        _ => Ok(doc),
    }
}

/// Merge `patch` into the live document and commit it as the next version.
///
/// Non-dotted keys replace whole subtrees; dotted keys replace one nested
/// leaf. Enforcement flags are read from the committed version, so a patch
/// cannot switch enforcement off for the change that would trip it.
pub fn update_document(
    store: &Store,
    kind: DocumentKind,
    id: &str,
    patch: Payload,
) -> Result<MutationOutcome, KeelsonError> {
    validate::validate_document_id(id)?;
    let now = store.clock().now();
    let codec = store.codec();

    let outcome = store
        .broker()
        .with_subject_tx(&subject_key(kind, id), "documents.update", |conn| {
            let current = load(conn, codec, kind, id)?
                .filter(Document::is_live)
                .ok_or_else(|| not_found(kind, id))?;

            let merged = current.payload.merge_patch(&patch)?;
            validate::validate_payload(kind, &merged)?;

            let policy = RemediationPolicy::from_document(&current.payload, &store.config.remediation);
            let eval = evaluate(store, kind, policy, Some(&current.payload), merged)?;
            let changed_fields = payload::changed_paths(&current.payload, &eval.payload);

            let version = current.version.bump_minor(store.config.versioning.minor_step);
            let document = Document {
                payload: eval.payload.clone(),
                version,
                last_updated: now,
                ..current.clone()
            };
            conn.execute(
                "UPDATE documents SET version = ?3, payload = ?4, last_updated = ?5
                 WHERE kind = ?1 AND id = ?2",
                params![
                    kind.as_str(),
                    id,
                    version.to_string(),
                    codec.encode(&document.payload)?,
                    now,
                ],
            )?;
            record_version(conn, codec, &document)?;

            log_evaluation(conn, kind, id, &eval, now)?;
            audit::append_entry(
                conn,
                kind,
                id,
                AuditEventType::Update,
                &json!({
                    "from": current.version,
                    "to": version,
                    "changed_fields": changed_fields,
                    "digest": document.payload.digest()?,
                    "remediation": eval.remediation_detail(),
                }),
                now,
            )?;

            let phase = document.payload.str_at(SESSION_PHASE).map(str::to_string);
            session::record(conn, kind, id, session_patch("update", phase, &eval), now)?;

            Ok(MutationOutcome {
                document,
                changed_fields,
                warnings: eval.warnings(),
                drift: eval.drift,
                contradictions: eval.contradictions,
                remediation: eval.remediation,
            })
        })?;

    tracing::info!(
        kind = kind.as_str(),
        id,
        version = %outcome.document.version,
        changed = outcome.changed_fields.len(),
        remediation = ?outcome.remediation_state(),
        "document updated"
    );
    Ok(outcome)
}

/// Flag the document deleted and set its version to the `0.0.0` sentinel.
/// Soft-deleting an already soft-deleted document returns it unchanged.
pub fn soft_delete_document(store: &Store, kind: DocumentKind, id: &str) -> Result<Document, KeelsonError> {
    validate::validate_document_id(id)?;
    let now = store.clock().now();
    let codec = store.codec();

    let (document, changed) = store
        .broker()
        .with_subject_tx(&subject_key(kind, id), "documents.soft_delete", |conn| {
            let current = load(conn, codec, kind, id)?.ok_or_else(|| not_found(kind, id))?;
            if current.deleted == DeletionState::Soft {
                return Ok((current, false));
            }

            conn.execute(
                "UPDATE documents SET deleted = ?3, version = ?4, last_updated = ?5
                 WHERE kind = ?1 AND id = ?2",
                params![
                    kind.as_str(),
                    id,
                    DeletionState::Soft.as_str(),
                    Version::SOFT_DELETED.to_string(),
                    now,
                ],
            )?;
            audit::append_entry(
                conn,
                kind,
                id,
                AuditEventType::Delete,
                &json!({"mode": DeletionState::Soft, "previous_version": current.version}),
                now,
            )?;
            session::record(
                conn,
                kind,
                id,
                SessionPatch::action("soft_delete").phase(DELETED_PHASE).waiting_for(""),
                now,
            )?;

            let document = Document {
                deleted: DeletionState::Soft,
                version: Version::SOFT_DELETED,
                last_updated: now,
                ..current
            };
            Ok((document, true))
        })?;

    if changed {
        tracing::info!(kind = kind.as_str(), id, "document soft-deleted");
    }
    Ok(document)
}

/// Physically remove the document, its version history and its session
/// state. A tombstone records the last version; audit entries are kept.
pub fn hard_delete_document(store: &Store, kind: DocumentKind, id: &str) -> Result<Tombstone, KeelsonError> {
    validate::validate_document_id(id)?;
    let now = store.clock().now();
    let codec = store.codec();

    let tombstone = store
        .broker()
        .with_subject_tx(&subject_key(kind, id), "documents.hard_delete", |conn| {
            let current = load(conn, codec, kind, id)?.ok_or_else(|| not_found(kind, id))?;
            let last_version = highest_version(conn, kind, id)?.unwrap_or(current.version);

            for sql in [
                "DELETE FROM documents WHERE kind = ?1 AND id = ?2",
                "DELETE FROM document_versions WHERE kind = ?1 AND id = ?2",
            ] {
                conn.execute(sql, params![kind.as_str(), id])?;
            }
            session::remove(conn, kind, id)?;
            conn.execute(
                "INSERT OR REPLACE INTO tombstones(kind, id, last_version, deleted_at) VALUES(?1, ?2, ?3, ?4)",
                params![kind.as_str(), id, last_version.to_string(), now],
            )?;
            audit::append_entry(
                conn,
                kind,
                id,
                AuditEventType::Delete,
                &json!({
                    "mode": DeletionState::Hard,
                    "previous_state": current.deleted,
                    "last_version": last_version,
                }),
                now,
            )?;

            Ok(Tombstone {
                kind,
                id: id.to_string(),
                last_version,
                deleted_at: now,
            })
        })?;

    tracing::info!(
        kind = kind.as_str(),
        id,
        last_version = %tombstone.last_version,
        "document hard-deleted"
    );
    Ok(tombstone)
}

pub fn get_tombstone(store: &Store, kind: DocumentKind, id: &str) -> Result<Option<Tombstone>, KeelsonError> {
    store
        .broker()
        .with_conn("documents.tombstone", |conn| load_tombstone(conn, kind, id))
}

/// Documents ordered by kind then id, optionally restricted to one kind.
pub fn list_documents(
    store: &Store,
    kind: Option<DocumentKind>,
    visibility: Visibility,
) -> Result<Vec<Document>, KeelsonError> {
    let codec = store.codec();
    store.broker().with_conn("documents.list", |conn| {
        let mut sql = String::from(
            "SELECT kind, id, version, deleted, payload, created_at, last_updated FROM documents",
        );
        let mut conditions = Vec::new();
        if kind.is_some() {
            conditions.push("kind = ?1");
        }
        if visibility == Visibility::LiveOnly {
            conditions.push("deleted = 'live'");
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY kind, id");

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String, DocumentRow)> {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                DocumentRow {
                    version: row.get(2)?,
                    deleted: row.get(3)?,
                    payload: row.get(4)?,
                    created_at: row.get(5)?,
                    last_updated: row.get(6)?,
                },
            ))
        };
        let rows = match kind {
            Some(k) => stmt.query_map(params![k.as_str()], map_row)?.collect::<Result<Vec<_>, _>>()?,
            None => stmt.query_map([], map_row)?.collect::<Result<Vec<_>, _>>()?,
        };

        rows.into_iter()
            .map(|(kind, id, row)| row_to_document(codec, kind.parse()?, &id, row))
            .collect()
    })
}

/// Every committed version of a document, oldest first.
pub fn list_versions(store: &Store, kind: DocumentKind, id: &str) -> Result<Vec<VersionRecord>, KeelsonError> {
    let history = store
        .broker()
        .with_conn("documents.versions", |conn| version_history(conn, kind, id))?;
    if history.is_empty() {
        return Err(not_found(kind, id));
    }
    Ok(history)
}

/// Payload as it was committed at `version`.
pub fn get_version(
    store: &Store,
    kind: DocumentKind,
    id: &str,
    version: Version,
) -> Result<Payload, KeelsonError> {
    let codec = store.codec();
    let blob: Option<Vec<u8>> = store.broker().with_conn("documents.get_version", |conn| {
        Ok(conn
            .query_row(
                "SELECT payload FROM document_versions WHERE kind = ?1 AND id = ?2 AND version = ?3",
                params![kind.as_str(), id, version.to_string()],
                |row| row.get(0),
            )
            .optional()?)
    })?;
    match blob {
        Some(blob) => codec.decode(&blob),
        None => Err(KeelsonError::NotFound(format!(
            "{} document '{}' at version {}",
            kind, id, version
        ))),
    }
}
