use keelson::core::codec::{JsonCodec, PayloadCodec};
use keelson::core::config::EngineConfig;
use keelson::core::error::KeelsonError;
use keelson::core::payload::Payload;
use keelson::core::store::{DocumentKind, Store};
use keelson::core::time::{Clock, ManualClock};
use keelson::core::version::Version;
use keelson::plugins::audit::{self, AuditEventType, AuditQuery};
use keelson::plugins::documents::{
    self, DEFAULT_PHASE, DELETED_PHASE, DeletionState, Visibility,
};
use keelson::plugins::drift::{DriftClass, Severity};
use keelson::plugins::session;
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

fn payload(v: Value) -> Payload {
    Payload::from_value(v).expect("object payload")
}

fn open_store() -> (TempDir, Store, Arc<ManualClock>) {
    let tmp = tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(1_000));
    let store = Store::open(tmp.path())
        .expect("open store")
        .with_clock(clock.clone());
    (tmp, store, clock)
}

fn ada() -> Payload {
    payload(json!({
        "identity": {"name": "Ada"},
        "interaction_preferences": {"formality": "casual", "tone": "warm"}
    }))
}

fn audit_types(store: &Store, id: &str) -> Vec<AuditEventType> {
    let mut entries = audit::query_audit(store, DocumentKind::User, id, &AuditQuery::default()).expect("audit");
    entries.reverse();
    entries.into_iter().map(|e| e.event_type).collect()
}

#[test]
fn create_then_get() {
    let (_tmp, store, _clock) = open_store();
    let outcome = documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("create");

    assert_eq!(outcome.document.version, Version::INITIAL);
    assert_eq!(outcome.document.deleted, DeletionState::Live);
    assert_eq!(outcome.document.created_at, 1_000);
    assert!(outcome.drift.is_none());
    assert!(outcome.contradictions.is_none());
    assert!(outcome.remediation.is_none());
    assert!(outcome.warnings.is_empty());

    let doc = documents::get_document(&store, DocumentKind::User, "ada", Visibility::LiveOnly).expect("get");
    assert_eq!(doc, outcome.document);
    assert_eq!(doc.payload, ada());

    let state = session::get_session_state(&store, DocumentKind::User, "ada").expect("session");
    assert_eq!(state.phase, DEFAULT_PHASE);
    assert_eq!(state.last_action, "create");
    assert_eq!(state.timestamp, 1_000);

    assert_eq!(audit_types(&store, "ada"), vec![AuditEventType::Create]);
    assert!(audit::verify_chain(&store, DocumentKind::User, "ada").unwrap());
}

#[test]
fn ids_are_scoped_by_kind() {
    let (_tmp, store, _clock) = open_store();
    documents::create_document(&store, DocumentKind::User, "shared", ada()).expect("user");
    let agent = payload(json!({"identity": {"name": "bot"}, "capabilities": {"tools": ["search"]}}));
    documents::create_document(&store, DocumentKind::Agent, "shared", agent).expect("agent with same id");
    assert!(documents::get_document(&store, DocumentKind::Agent, "shared", Visibility::LiveOnly).is_ok());
}

#[test]
fn duplicate_create_fails_without_side_effects() {
    let (_tmp, store, _clock) = open_store();
    documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("create");
    let err = documents::create_document(&store, DocumentKind::User, "ada", ada()).unwrap_err();
    assert!(matches!(err, KeelsonError::AlreadyExists(_)));
    assert_eq!(audit_types(&store, "ada").len(), 1);
}

#[test]
fn invalid_create_writes_nothing() {
    let (_tmp, store, _clock) = open_store();
    let bad = payload(json!({"identity": {"name": "Ada"}}));
    let err = documents::create_document(&store, DocumentKind::User, "ada", bad).unwrap_err();
    assert_eq!(err.fields(), ["interaction_preferences".to_string()]);

    assert!(matches!(
        documents::get_document(&store, DocumentKind::User, "ada", Visibility::IncludeDeleted),
        Err(KeelsonError::NotFound(_))
    ));
    assert!(audit_types(&store, "ada").is_empty());
    assert_eq!(
        session::get_session_state(&store, DocumentKind::User, "ada").unwrap(),
        session::SessionState::default()
    );

    assert!(documents::create_document(&store, DocumentKind::User, "../ada", ada()).is_err());
}

#[test]
fn versions_strictly_increase_across_updates() {
    let (_tmp, store, clock) = open_store();
    documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("create");

    let mut seen = vec![Version::INITIAL];
    for depth in ["shallow", "medium", "deep", "deeper"] {
        clock.advance(10);
        let patch = payload(json!({"interaction_preferences.depth": depth}));
        let outcome = documents::update_document(&store, DocumentKind::User, "ada", patch).expect("update");
        let last = *seen.last().unwrap();
        assert!(outcome.document.version > last);
        assert_eq!(outcome.document.last_updated, clock.now());
        seen.push(outcome.document.version);
    }

    let history: Vec<Version> = documents::list_versions(&store, DocumentKind::User, "ada")
        .expect("history")
        .into_iter()
        .map(|r| r.version)
        .collect();
    assert_eq!(history, seen);
    assert_eq!(history.last(), Some(&Version::new(1, 4, 0)));

    let original = documents::get_version(&store, DocumentKind::User, "ada", Version::INITIAL).expect("v1");
    assert_eq!(original, ada());
    assert!(matches!(
        documents::get_version(&store, DocumentKind::User, "ada", Version::new(9, 9, 9)),
        Err(KeelsonError::NotFound(_))
    ));
}

#[test]
fn unchanged_update_still_bumps_version() {
    let (_tmp, store, _clock) = open_store();
    documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("create");
    let outcome = documents::update_document(&store, DocumentKind::User, "ada", Payload::new()).expect("update");
    assert_eq!(outcome.document.version, Version::new(1, 1, 0));
    assert!(outcome.changed_fields.is_empty());
}

#[test]
fn minor_step_comes_from_config() {
    let tmp = tempdir().expect("tempdir");
    let mut config = EngineConfig::default();
    config.versioning.minor_step = 5;
    let store = Store::open_with_config(tmp.path(), config).expect("store");
    documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("create");
    let outcome = documents::update_document(&store, DocumentKind::User, "ada", Payload::new()).expect("update");
    assert_eq!(outcome.document.version.to_string(), "1.5.0");
}

#[test]
fn update_records_changed_paths() {
    let (_tmp, store, _clock) = open_store();
    documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("create");
    let patch = payload(json!({
        "interaction_preferences.tone": "warmer",
        "custom": {"editor": "helix"}
    }));
    let outcome = documents::update_document(&store, DocumentKind::User, "ada", patch).expect("update");
    assert_eq!(outcome.changed_fields, vec!["custom", "interaction_preferences.tone"]);

    let latest = audit::query_audit(
        &store,
        DocumentKind::User,
        "ada",
        &AuditQuery::of_type(AuditEventType::Update),
    )
    .expect("audit");
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].detail["from"], json!("1.0.0"));
    assert_eq!(latest[0].detail["to"], json!("1.1.0"));
    assert_eq!(
        latest[0].detail["changed_fields"],
        json!(["custom", "interaction_preferences.tone"])
    );
}

#[test]
fn failed_update_leaves_everything_unchanged() {
    let (_tmp, store, _clock) = open_store();
    documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("create");

    let bad = payload(json!({"interaction_preferences.pushback": "sometimes"}));
    let err = documents::update_document(&store, DocumentKind::User, "ada", bad).unwrap_err();
    assert!(err.fields().iter().any(|f| f == "interaction_preferences.pushback"));

    let doc = documents::get_document(&store, DocumentKind::User, "ada", Visibility::LiveOnly).unwrap();
    assert_eq!(doc.version, Version::INITIAL);
    assert_eq!(doc.payload, ada());
    assert_eq!(audit_types(&store, "ada"), vec![AuditEventType::Create]);

    assert!(matches!(
        documents::update_document(&store, DocumentKind::User, "nobody", Payload::new()),
        Err(KeelsonError::NotFound(_))
    ));
}

#[test]
fn formality_shift_is_reported_as_drift() {
    let (_tmp, store, _clock) = open_store();
    documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("create");

    let patch = payload(json!({"interaction_preferences.formality": "stoic"}));
    let outcome = documents::update_document(&store, DocumentKind::User, "ada", patch).expect("update");

    let drift = outcome.drift.expect("drift report");
    assert_eq!(drift.changed_fields.len(), 1);
    let change = &drift.changed_fields[0];
    assert_eq!(change.path, "interaction_preferences.formality");
    assert_eq!(change.classification, DriftClass::Shifted);
    assert_eq!(drift.severity, Severity::Low);
    // not enforced by the document, so nothing is reverted
    assert!(outcome.remediation.is_none());
    assert_eq!(outcome.document.payload.str_at("interaction_preferences.formality"), Some("stoic"));

    assert_eq!(
        audit_types(&store, "ada"),
        vec![AuditEventType::Create, AuditEventType::Drift, AuditEventType::Update]
    );
}

#[test]
fn session_phase_follows_document() {
    let (_tmp, store, _clock) = open_store();
    let mut doc = ada();
    doc.set("session_context.phase", json!("onboarding")).unwrap();
    documents::create_document(&store, DocumentKind::User, "ada", doc).expect("create");
    assert_eq!(
        session::get_session_state(&store, DocumentKind::User, "ada").unwrap().phase,
        "onboarding"
    );

    documents::update_document(
        &store,
        DocumentKind::User,
        "ada",
        payload(json!({"interaction_preferences.tone": "warmer"})),
    )
    .expect("update");
    let state = session::get_session_state(&store, DocumentKind::User, "ada").unwrap();
    assert_eq!(state.phase, "onboarding");
    assert_eq!(state.last_action, "update");
}

#[test]
fn soft_delete_is_idempotent() {
    let (_tmp, store, clock) = open_store();
    documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("create");

    clock.advance(5);
    let first = documents::soft_delete_document(&store, DocumentKind::User, "ada").expect("soft delete");
    assert_eq!(first.deleted, DeletionState::Soft);
    assert_eq!(first.version, Version::SOFT_DELETED);
    assert_eq!(first.payload, ada());

    clock.advance(5);
    let second = documents::soft_delete_document(&store, DocumentKind::User, "ada").expect("again");
    assert_eq!(first, second);
    assert_eq!(audit_types(&store, "ada"), vec![AuditEventType::Create, AuditEventType::Delete]);

    let delete = &audit::query_audit(&store, DocumentKind::User, "ada", &AuditQuery::of_type(AuditEventType::Delete))
        .unwrap()[0];
    assert_eq!(delete.detail["mode"], json!("soft"));
    assert_eq!(delete.detail["previous_version"], json!("1.0.0"));

    assert!(matches!(
        documents::get_document(&store, DocumentKind::User, "ada", Visibility::LiveOnly),
        Err(KeelsonError::NotFound(_))
    ));
    assert!(documents::get_document(&store, DocumentKind::User, "ada", Visibility::IncludeDeleted).is_ok());
    assert!(matches!(
        documents::update_document(&store, DocumentKind::User, "ada", Payload::new()),
        Err(KeelsonError::NotFound(_))
    ));
    assert_eq!(
        session::get_session_state(&store, DocumentKind::User, "ada").unwrap().phase,
        DELETED_PHASE
    );
}

#[test]
fn recreate_after_soft_delete_starts_next_major() {
    let (_tmp, store, _clock) = open_store();
    documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("create");
    documents::update_document(&store, DocumentKind::User, "ada", Payload::new()).expect("update");
    documents::soft_delete_document(&store, DocumentKind::User, "ada").expect("soft delete");

    let outcome = documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("recreate");
    assert_eq!(outcome.document.version, Version::new(2, 0, 0));
    assert!(outcome.document.is_live());
    assert!(audit::verify_chain(&store, DocumentKind::User, "ada").unwrap());
}

#[test]
fn hard_delete_keeps_audit_trail() {
    let (_tmp, store, _clock) = open_store();
    documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("create");
    documents::update_document(&store, DocumentKind::User, "ada", Payload::new()).expect("update");

    let tombstone = documents::hard_delete_document(&store, DocumentKind::User, "ada").expect("hard delete");
    assert_eq!(tombstone.last_version, Version::new(1, 1, 0));
    assert_eq!(
        documents::get_tombstone(&store, DocumentKind::User, "ada").unwrap(),
        Some(tombstone)
    );

    assert!(matches!(
        documents::get_document(&store, DocumentKind::User, "ada", Visibility::IncludeDeleted),
        Err(KeelsonError::NotFound(_))
    ));
    assert!(matches!(
        documents::list_versions(&store, DocumentKind::User, "ada"),
        Err(KeelsonError::NotFound(_))
    ));
    assert_eq!(
        session::get_session_state(&store, DocumentKind::User, "ada").unwrap(),
        session::SessionState::default()
    );

    assert_eq!(
        audit_types(&store, "ada"),
        vec![AuditEventType::Create, AuditEventType::Update, AuditEventType::Delete]
    );
    assert!(audit::verify_chain(&store, DocumentKind::User, "ada").unwrap());
    assert!(matches!(
        documents::hard_delete_document(&store, DocumentKind::User, "ada"),
        Err(KeelsonError::NotFound(_))
    ));

    let reborn = documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("recreate");
    assert_eq!(reborn.document.version, Version::new(2, 0, 0));
    assert_eq!(documents::get_tombstone(&store, DocumentKind::User, "ada").unwrap(), None);
}

#[test]
fn list_documents_filters_by_kind_and_visibility() {
    let (_tmp, store, _clock) = open_store();
    for id in ["b", "a", "c"] {
        documents::create_document(&store, DocumentKind::User, id, ada()).expect("create");
    }
    let agent = payload(json!({"identity": {"name": "bot"}, "capabilities": {}}));
    documents::create_document(&store, DocumentKind::Agent, "bot", agent).expect("agent");
    documents::soft_delete_document(&store, DocumentKind::User, "c").expect("soft delete");

    let all = documents::list_documents(&store, None, Visibility::IncludeDeleted).unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all[0].kind, DocumentKind::Agent);

    let live_users: Vec<String> = documents::list_documents(&store, Some(DocumentKind::User), Visibility::LiveOnly)
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(live_users, vec!["a", "b"]);
}

/// Codec whose blobs are not plain JSON.
struct XorCodec;

impl PayloadCodec for XorCodec {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, KeelsonError> {
        Ok(JsonCodec.encode(payload)?.into_iter().map(|b| b ^ 0x5a).collect())
    }

    fn decode(&self, blob: &[u8]) -> Result<Payload, KeelsonError> {
        let plain: Vec<u8> = blob.iter().map(|b| b ^ 0x5a).collect();
        JsonCodec.decode(&plain)
    }
}

#[test]
fn persisted_payload_is_opaque_codec_output() {
    let (tmp, store, _clock) = open_store();
    let store = store.with_codec(Arc::new(XorCodec));
    documents::create_document(&store, DocumentKind::User, "ada", ada()).expect("create");

    let conn = keelson::core::db::db_connect(&keelson::core::db::keelson_db_path(tmp.path()).to_string_lossy())
        .expect("connect");
    let blob: Vec<u8> = conn
        .query_row("SELECT payload FROM documents WHERE kind = 'user' AND id = 'ada'", [], |row| {
            row.get(0)
        })
        .expect("blob");
    assert!(serde_json::from_slice::<Value>(&blob).is_err());

    let doc = documents::get_document(&store, DocumentKind::User, "ada", Visibility::LiveOnly).expect("get");
    assert_eq!(doc.payload, ada());

    let plain = Store::open(tmp.path()).expect("plain store");
    assert!(matches!(
        documents::get_document(&plain, DocumentKind::User, "ada", Visibility::LiveOnly),
        Err(KeelsonError::CodecError(_))
    ));
}
