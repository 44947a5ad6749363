//! Document export bundles.
//!
//! A bundle is the current document plus, optionally, its audit trail. It can
//! be pinned to a `ContentStore` and committed to by a `Prover`; the export
//! itself is recorded in the ledger.

use crate::core::error::KeelsonError;
use crate::core::store::{DocumentKind, Store, subject_key};
use crate::core::time::Timestamp;
use crate::plugins::audit::{self, AuditEntry, AuditEventType, AuditQuery};
use crate::plugins::capability::{ContentStore, ProofReceipt, Prover};
use crate::plugins::documents::{self, Document};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Default, Clone, Copy)]
pub struct ExportOptions<'a> {
    pub include_audit: bool,
    pub content_store: Option<&'a dyn ContentStore>,
    pub prover: Option<&'a dyn Prover>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub document: Document,
    /// Digest of the exported payload.
    pub digest: String,
    /// Oldest first. Does not include the `export` entry for this bundle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<Vec<AuditEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<ProofReceipt>,
    pub exported_at: Timestamp,
}

#[derive(Serialize)]
struct PinnedContent<'b> {
    document: &'b Document,
    audit: Option<&'b [AuditEntry]>,
}

/// Statement a prover commits to for one exported version.
pub fn export_statement(document: &Document) -> String {
    format!("{}@{}", subject_key(document.kind, &document.id), document.version)
}

pub fn export_document(
    store: &Store,
    kind: DocumentKind,
    id: &str,
    options: &ExportOptions<'_>,
) -> Result<ExportBundle, KeelsonError> {
    let now = store.clock().now();
    let codec = store.codec();

    let bundle = store
        .broker()
        .with_subject_tx(&subject_key(kind, id), "export.document", |conn| {
            let document = documents::load(conn, codec, kind, id)?
                .ok_or_else(|| KeelsonError::NotFound(format!("{} document '{}'", kind, id)))?;
            let digest = document.payload.digest()?;

            let audit_trail = if options.include_audit {
                let mut entries = audit::query_entries(conn, kind, id, &AuditQuery::default())?;
                entries.reverse();
                Some(entries)
            } else {
                None
            };

            let content_ref = match options.content_store {
                Some(content_store) => {
                    let pinned = serde_json::to_vec(&PinnedContent {
                        document: &document,
                        audit: audit_trail.as_deref(),
                    })?;
                    Some(content_store.put(&pinned)?)
                }
                None => None,
            };
            let receipt = match options.prover {
                Some(prover) => Some(prover.prove(&export_statement(&document), &document.payload.canonical_bytes()?)?),
                None => None,
            };

            audit::append_entry(
                conn,
                kind,
                id,
                AuditEventType::Export,
                &json!({
                    "version": document.version,
                    "digest": digest,
                    "include_audit": options.include_audit,
                    "audit_entries": audit_trail.as_ref().map(Vec::len),
                    "content_ref": content_ref,
                    "commitment": receipt.as_ref().map(|r| r.commitment.clone()),
                }),
                now,
            )?;

            Ok(ExportBundle {
                document,
                digest,
                audit: audit_trail,
                content_ref,
                receipt,
                exported_at: now,
            })
        })?;

    tracing::info!(
        kind = kind.as_str(),
        id,
        version = %bundle.document.version,
        pinned = bundle.content_ref.is_some(),
        "document exported"
    );
    Ok(bundle)
}
