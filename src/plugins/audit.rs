//! Append-only, hash-chained audit ledger keyed by document.
//!
//! Each entry hashes its own envelope (sequence, event type, timestamp, the
//! exact stored detail text) together with the previous entry's hash. The
//! first entry of a document chains from `GENESIS_HASH`. Entries are never
//! updated or deleted, including when the document itself is hard-deleted.

use crate::core::error::KeelsonError;
use crate::core::hash::{self, GENESIS_HASH};
use crate::core::store::{DocumentKind, Store, subject_key};
use crate::core::time::{self, Timestamp};
use rayon::prelude::*;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Create,
    Update,
    Delete,
    Drift,
    Contradiction,
    RecursiveFeedback,
    FeedbackUnresolved,
    Export,
}

impl AuditEventType {
    pub const ALL: [AuditEventType; 8] = [
        AuditEventType::Create,
        AuditEventType::Update,
        AuditEventType::Delete,
        AuditEventType::Drift,
        AuditEventType::Contradiction,
        AuditEventType::RecursiveFeedback,
        AuditEventType::FeedbackUnresolved,
        AuditEventType::Export,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AuditEventType::Create => "create",
            AuditEventType::Update => "update",
            AuditEventType::Delete => "delete",
            AuditEventType::Drift => "drift",
            AuditEventType::Contradiction => "contradiction",
            AuditEventType::RecursiveFeedback => "recursive_feedback",
            AuditEventType::FeedbackUnresolved => "feedback_unresolved",
            AuditEventType::Export => "export",
        }
    }

    /// Events only the document pipeline may write.
    pub fn is_mutation_bound(self) -> bool {
        !matches!(self, AuditEventType::Export)
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = KeelsonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditEventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| KeelsonError::invalid(format!("unknown audit event type '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub kind: DocumentKind,
    pub document_id: String,
    pub event_id: String,
    pub event_type: AuditEventType,
    pub detail: Value,
    pub prev_hash: String,
    pub entry_hash: String,
    pub recorded_at: Timestamp,
}

/// Filter for `query_audit`. Results are always most-recent-first.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub limit: Option<usize>,
    /// Only entries recorded at or after this time.
    pub since: Option<Timestamp>,
    /// Empty means every event type.
    pub event_types: Vec<AuditEventType>,
}

impl AuditQuery {
    pub fn of_type(event_type: AuditEventType) -> Self {
        Self {
            event_types: vec![event_type],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainReport {
    pub kind: DocumentKind,
    pub document_id: String,
    pub entries: usize,
    pub intact: bool,
    pub first_break: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
}

pub fn compute_entry_hash(
    sequence: u64,
    event_type: AuditEventType,
    recorded_at: Timestamp,
    detail: &str,
    prev_hash: &str,
) -> String {
    hash::sha256_fields(&[
        sequence.to_string().as_bytes(),
        event_type.as_str().as_bytes(),
        recorded_at.to_string().as_bytes(),
        detail.as_bytes(),
        prev_hash.as_bytes(),
    ])
}

/// Append inside an open transaction. The caller holds the document lock.
pub(crate) fn append_entry(
    conn: &Connection,
    kind: DocumentKind,
    document_id: &str,
    event_type: AuditEventType,
    detail: &Value,
    recorded_at: Timestamp,
) -> Result<AuditEntry, KeelsonError> {
    let last: Option<(i64, String)> = conn
        .query_row(
            "SELECT sequence, entry_hash FROM audit_entries
             WHERE kind = ?1 AND document_id = ?2 ORDER BY sequence DESC LIMIT 1",
            params![kind.as_str(), document_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (sequence, prev_hash) = match last {
        Some((seq, hash)) => (seq as u64 + 1, hash),
        None => (1, GENESIS_HASH.to_string()),
    };

    let detail_text = serde_json::to_string(detail)?;
    let entry_hash = compute_entry_hash(sequence, event_type, recorded_at, &detail_text, &prev_hash);
    let event_id = time::new_event_id();

    conn.execute(
        "INSERT INTO audit_entries(kind, document_id, sequence, event_id, event_type, detail, prev_hash, entry_hash, recorded_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            kind.as_str(),
            document_id,
            sequence as i64,
            event_id,
            event_type.as_str(),
            detail_text,
            prev_hash,
            entry_hash,
            recorded_at,
        ],
    )?;

    Ok(AuditEntry {
        sequence,
        kind,
        document_id: document_id.to_string(),
        event_id,
        event_type,
        detail: detail.clone(),
        prev_hash,
        entry_hash,
        recorded_at,
    })
}

/// Append a standalone event for a stored document under its lock. Lifecycle
/// and pipeline events are written only by the mutation that causes them.
pub fn append_event(
    store: &Store,
    kind: DocumentKind,
    document_id: &str,
    event_type: AuditEventType,
    detail: Value,
) -> Result<AuditEntry, KeelsonError> {
    if event_type.is_mutation_bound() {
        return Err(KeelsonError::invalid(format!(
            "'{}' events are recorded by document mutations only",
            event_type
        )));
    }
    let now = store.clock().now();
    store
        .broker()
        .with_subject_tx(&subject_key(kind, document_id), "audit.append", |conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM documents WHERE kind = ?1 AND id = ?2",
                    params![kind.as_str(), document_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(KeelsonError::NotFound(format!("{} document '{}'", kind, document_id)));
            }
            append_entry(conn, kind, document_id, event_type, &detail, now)
        })
}

struct RawEntry {
    sequence: u64,
    event_id: String,
    event_type: String,
    detail: String,
    prev_hash: String,
    entry_hash: String,
    recorded_at: Timestamp,
}

fn raw_to_entry(kind: DocumentKind, document_id: &str, raw: RawEntry) -> Result<AuditEntry, KeelsonError> {
    // Tampered detail may no longer be JSON; surface it as text rather than fail the read.
    let detail = serde_json::from_str(&raw.detail).unwrap_or(Value::String(raw.detail));
    Ok(AuditEntry {
        sequence: raw.sequence,
        kind,
        document_id: document_id.to_string(),
        event_id: raw.event_id,
        event_type: raw.event_type.parse()?,
        detail,
        prev_hash: raw.prev_hash,
        entry_hash: raw.entry_hash,
        recorded_at: raw.recorded_at,
    })
}

fn map_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        sequence: row.get::<_, i64>(0)? as u64,
        event_id: row.get(1)?,
        event_type: row.get(2)?,
        detail: row.get(3)?,
        prev_hash: row.get(4)?,
        entry_hash: row.get(5)?,
        recorded_at: row.get(6)?,
    })
}

/// Filtered entries for one document, most recent first.
pub(crate) fn query_entries(
    conn: &Connection,
    kind: DocumentKind,
    document_id: &str,
    query: &AuditQuery,
) -> Result<Vec<AuditEntry>, KeelsonError> {
    let mut conditions = vec!["kind = ?1".to_string(), "document_id = ?2".to_string()];
    let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> =
        vec![Box::new(kind.as_str()), Box::new(document_id.to_string())];

    if let Some(since) = query.since {
        params_vec.push(Box::new(since));
        conditions.push(format!("recorded_at >= ?{}", params_vec.len()));
    }
    if !query.event_types.is_empty() {
        let mut slots = Vec::new();
        for event_type in &query.event_types {
            params_vec.push(Box::new(event_type.as_str()));
            slots.push(format!("?{}", params_vec.len()));
        }
        conditions.push(format!("event_type IN ({})", slots.join(", ")));
    }

    let limit_clause = match query.limit {
        Some(limit) => format!(" LIMIT {}", limit),
        None => String::new(),
    };
    let sql = format!(
        "SELECT sequence, event_id, event_type, detail, prev_hash, entry_hash, recorded_at
         FROM audit_entries WHERE {} ORDER BY sequence DESC{}",
        conditions.join(" AND "),
        limit_clause
    );

    let mut stmt = conn.prepare(&sql)?;
    let params_refs: Vec<&dyn rusqlite::types::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    let raws = stmt
        .query_map(params_refs.as_slice(), map_raw)?
        .collect::<Result<Vec<_>, _>>()?;

    raws.into_iter()
        .map(|raw| raw_to_entry(kind, document_id, raw))
        .collect()
}

/// Read-only, and keeps working after the document is hard-deleted.
pub fn query_audit(
    store: &Store,
    kind: DocumentKind,
    document_id: &str,
    query: &AuditQuery,
) -> Result<Vec<AuditEntry>, KeelsonError> {
    store
        .broker()
        .with_conn("audit.query", |conn| query_entries(conn, kind, document_id, query))
}

/// Recompute the chain from genesis and report the first mismatch, if any.
pub fn inspect_chain(store: &Store, kind: DocumentKind, document_id: &str) -> Result<ChainReport, KeelsonError> {
    let raws = store.broker().with_conn("audit.verify", |conn| {
        let mut stmt = conn.prepare(
            "SELECT sequence, event_id, event_type, detail, prev_hash, entry_hash, recorded_at
             FROM audit_entries WHERE kind = ?1 AND document_id = ?2 ORDER BY sequence ASC",
        )?;
        let rows = stmt
            .query_map(params![kind.as_str(), document_id], map_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    let mut expected_prev = GENESIS_HASH.to_string();
    let mut expected_seq = 1u64;
    let mut broken: Option<(u64, String)> = None;

    for raw in &raws {
        let issue = if raw.sequence != expected_seq {
            Some(format!("expected sequence {}, found {}", expected_seq, raw.sequence))
        } else if raw.prev_hash != expected_prev {
            Some("predecessor hash mismatch".to_string())
        } else {
            match raw.event_type.parse::<AuditEventType>() {
                Err(_) => Some(format!("unknown event type '{}'", raw.event_type)),
                Ok(event_type) => {
                    let recomputed =
                        compute_entry_hash(raw.sequence, event_type, raw.recorded_at, &raw.detail, &raw.prev_hash);
                    (recomputed != raw.entry_hash).then(|| "entry hash mismatch".to_string())
                }
            }
        };
        if let Some(issue) = issue {
            broken = Some((raw.sequence, issue));
            break;
        }
        expected_prev = raw.entry_hash.clone();
        expected_seq += 1;
    }

    if let Some((sequence, issue)) = &broken {
        tracing::error!(
            kind = kind.as_str(),
            document_id,
            sequence,
            issue = issue.as_str(),
            "audit chain integrity failure"
        );
    }

    Ok(ChainReport {
        kind,
        document_id: document_id.to_string(),
        entries: raws.len(),
        intact: broken.is_none(),
        first_break: broken.as_ref().map(|(seq, _)| *seq),
        issue: broken.map(|(_, issue)| issue),
    })
}

pub fn verify_chain(store: &Store, kind: DocumentKind, document_id: &str) -> Result<bool, KeelsonError> {
    Ok(inspect_chain(store, kind, document_id)?.intact)
}

/// Like `verify_chain`, but a broken chain is an error.
pub fn require_intact_chain(store: &Store, kind: DocumentKind, document_id: &str) -> Result<(), KeelsonError> {
    let report = inspect_chain(store, kind, document_id)?;
    match report.first_break {
        None => Ok(()),
        Some(sequence) => Err(KeelsonError::ChainIntegrityError {
            kind: kind.as_str().to_string(),
            id: document_id.to_string(),
            sequence,
        }),
    }
}

/// Verify every document chain in the ledger. Chains are independent, so
/// they are checked in parallel.
pub fn verify_all_chains(store: &Store) -> Result<Vec<ChainReport>, KeelsonError> {
    let subjects: Vec<(String, String)> = store.broker().with_conn("audit.subjects", |conn| {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT kind, document_id FROM audit_entries ORDER BY kind, document_id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    subjects
        .par_iter()
        .map(|(kind, id)| inspect_chain(store, kind.parse()?, id))
        .collect()
}
