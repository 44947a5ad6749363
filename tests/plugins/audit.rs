use keelson::core::db;
use keelson::core::error::KeelsonError;
use keelson::core::hash::GENESIS_HASH;
use keelson::core::payload::Payload;
use keelson::core::store::{DocumentKind, Store};
use keelson::core::time::ManualClock;
use keelson::plugins::audit::{self, AuditEventType, AuditQuery};
use keelson::plugins::documents;
use rstest::rstest;
use rusqlite::params;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

fn payload(v: Value) -> Payload {
    Payload::from_value(v).expect("object payload")
}

fn open_store() -> (TempDir, Store, Arc<ManualClock>) {
    let tmp = tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(10_000));
    let store = Store::open(tmp.path())
        .expect("open store")
        .with_clock(clock.clone());
    (tmp, store, clock)
}

fn seed(store: &Store, clock: &ManualClock, id: &str, updates: usize) {
    documents::create_document(
        store,
        DocumentKind::User,
        id,
        payload(json!({"identity": {"name": id}, "interaction_preferences": {"tone": "warm"}})),
    )
    .expect("create");
    for i in 0..updates {
        clock.advance(100);
        documents::update_document(
            store,
            DocumentKind::User,
            id,
            payload(json!({"custom.counter": i})),
        )
        .expect("update");
    }
}

fn raw_exec(root: &Path, sql: &str, seq: i64) {
    let conn = db::db_connect(&db::keelson_db_path(root).to_string_lossy()).expect("connect");
    conn.execute(sql, params![seq]).expect("tamper");
}

#[test]
fn chain_links_from_genesis() {
    let (_tmp, store, clock) = open_store();
    seed(&store, &clock, "ada", 3);

    let mut entries = audit::query_audit(&store, DocumentKind::User, "ada", &AuditQuery::default()).unwrap();
    entries.reverse();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0].prev_hash, GENESIS_HASH);
    for (i, pair) in entries.windows(2).enumerate() {
        assert_eq!(pair[1].prev_hash, pair[0].entry_hash);
        assert_eq!(pair[1].sequence, i as u64 + 2);
    }
    assert!(audit::verify_chain(&store, DocumentKind::User, "ada").unwrap());
}

#[test]
fn empty_chain_verifies() {
    let (_tmp, store, _clock) = open_store();
    let report = audit::inspect_chain(&store, DocumentKind::Agent, "ghost").unwrap();
    assert!(report.intact);
    assert_eq!(report.entries, 0);
}

#[test]
fn tampered_detail_breaks_chain_from_that_point() {
    let (tmp, store, clock) = open_store();
    seed(&store, &clock, "ada", 3);
    seed(&store, &clock, "bob", 1);

    // one-byte change inside the stored detail text of entry 2
    raw_exec(
        tmp.path(),
        "UPDATE audit_entries SET detail = replace(detail, '1.0.0', '1.0.1')
         WHERE kind = 'user' AND document_id = 'ada' AND sequence = ?1",
        2,
    );

    let report = audit::inspect_chain(&store, DocumentKind::User, "ada").unwrap();
    assert!(!report.intact);
    assert_eq!(report.first_break, Some(2));
    assert!(!audit::verify_chain(&store, DocumentKind::User, "ada").unwrap());

    match audit::require_intact_chain(&store, DocumentKind::User, "ada") {
        Err(KeelsonError::ChainIntegrityError { kind, id, sequence }) => {
            assert_eq!(kind, "user");
            assert_eq!(id, "ada");
            assert_eq!(sequence, 2);
        }
        other => panic!("expected chain integrity error, got {:?}", other),
    }

    // other documents are unaffected
    assert!(audit::verify_chain(&store, DocumentKind::User, "bob").unwrap());

    // later appends do not repair the chain
    clock.advance(1);
    documents::update_document(&store, DocumentKind::User, "ada", Payload::new()).expect("update");
    assert!(!audit::verify_chain(&store, DocumentKind::User, "ada").unwrap());
}

#[test]
fn deleting_an_entry_is_detected() {
    let (tmp, store, clock) = open_store();
    seed(&store, &clock, "ada", 2);
    raw_exec(
        tmp.path(),
        "DELETE FROM audit_entries WHERE kind = 'user' AND document_id = 'ada' AND sequence = ?1",
        2,
    );
    let report = audit::inspect_chain(&store, DocumentKind::User, "ada").unwrap();
    assert_eq!(report.first_break, Some(3));
}

#[test]
fn query_is_most_recent_first_and_filterable() {
    let (_tmp, store, clock) = open_store();
    seed(&store, &clock, "ada", 3);

    let all = audit::query_audit(&store, DocumentKind::User, "ada", &AuditQuery::default()).unwrap();
    let sequences: Vec<u64> = all.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![4, 3, 2, 1]);

    let limited = audit::query_audit(
        &store,
        DocumentKind::User,
        "ada",
        &AuditQuery {
            limit: Some(2),
            ..AuditQuery::default()
        },
    )
    .unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].sequence, 4);

    let since = audit::query_audit(
        &store,
        DocumentKind::User,
        "ada",
        &AuditQuery {
            since: Some(10_200),
            ..AuditQuery::default()
        },
    )
    .unwrap();
    assert_eq!(since.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![4, 3]);

    let creates = audit::query_audit(
        &store,
        DocumentKind::User,
        "ada",
        &AuditQuery {
            event_types: vec![AuditEventType::Create, AuditEventType::Delete],
            ..AuditQuery::default()
        },
    )
    .unwrap();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].event_type, AuditEventType::Create);
    assert_eq!(creates[0].recorded_at, 10_000);
}

#[test]
fn append_event_extends_the_same_chain() {
    let (_tmp, store, clock) = open_store();
    seed(&store, &clock, "ada", 0);

    let entry = audit::append_event(
        &store,
        DocumentKind::User,
        "ada",
        AuditEventType::Export,
        json!({"target": "archive"}),
    )
    .expect("append");
    assert_eq!(entry.sequence, 2);
    assert_eq!(entry.detail["target"], json!("archive"));
    assert!(!entry.event_id.is_empty());
    assert!(audit::verify_chain(&store, DocumentKind::User, "ada").unwrap());
}

#[test]
fn append_event_requires_a_stored_document() {
    let (_tmp, store, _clock) = open_store();
    let err = audit::append_event(
        &store,
        DocumentKind::User,
        "nobody",
        AuditEventType::Export,
        json!({}),
    )
    .unwrap_err();
    assert!(matches!(err, KeelsonError::NotFound(_)));
    assert!(audit::query_audit(&store, DocumentKind::User, "nobody", &AuditQuery::default())
        .unwrap()
        .is_empty());
}

#[rstest]
#[case(AuditEventType::Create)]
#[case(AuditEventType::Update)]
#[case(AuditEventType::Delete)]
#[case(AuditEventType::Drift)]
#[case(AuditEventType::RecursiveFeedback)]
fn append_event_refuses_mutation_events(#[case] event_type: AuditEventType) {
    let (_tmp, store, clock) = open_store();
    seed(&store, &clock, "ada", 0);

    let err = audit::append_event(&store, DocumentKind::User, "ada", event_type, json!({})).unwrap_err();
    assert!(matches!(err, KeelsonError::ValidationError { .. }));
    let report = audit::inspect_chain(&store, DocumentKind::User, "ada").unwrap();
    assert_eq!(report.entries, 1);
}

#[test]
fn timestamps_and_sequences_are_stored_as_integers() {
    let (tmp, store, clock) = open_store();
    // past i32 range, as real epoch milliseconds are
    clock.advance(1_760_000_000_000);
    seed(&store, &clock, "ada", 1);

    let conn = db::db_connect(&db::keelson_db_path(tmp.path()).to_string_lossy()).expect("connect");
    let (seq_type, at_type, max_seq, last_at): (String, String, i64, i64) = conn
        .query_row(
            "SELECT typeof(sequence), typeof(recorded_at), sequence, recorded_at FROM audit_entries
             WHERE document_id = 'ada' ORDER BY sequence DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .expect("row");
    assert_eq!((seq_type.as_str(), at_type.as_str()), ("integer", "integer"));
    assert_eq!(max_seq, 2);
    assert_eq!(last_at, 1_760_000_010_100);

    let created_type: String = conn
        .query_row("SELECT typeof(created_at) FROM documents WHERE id = 'ada'", [], |row| row.get(0))
        .expect("row");
    assert_eq!(created_type, "integer");

    let doc = documents::get_document(&store, DocumentKind::User, "ada", documents::Visibility::LiveOnly).unwrap();
    assert_eq!(doc.created_at, 1_760_000_010_000);
    let entries = audit::query_audit(&store, DocumentKind::User, "ada", &AuditQuery::default()).unwrap();
    assert_eq!(entries[0].sequence, 2);
    assert_eq!(entries[0].recorded_at, 1_760_000_010_100);
}

#[test]
fn verify_all_chains_reports_every_subject() {
    let (tmp, store, clock) = open_store();
    seed(&store, &clock, "ada", 1);
    seed(&store, &clock, "bob", 1);
    documents::create_document(
        &store,
        DocumentKind::Agent,
        "bot",
        payload(json!({"identity": {"name": "bot"}, "capabilities": {}})),
    )
    .expect("agent");
    raw_exec(
        tmp.path(),
        "UPDATE audit_entries SET entry_hash = 'ff' WHERE kind = 'user' AND document_id = 'bob' AND sequence = ?1",
        1,
    );

    let reports = audit::verify_all_chains(&store).unwrap();
    assert_eq!(reports.len(), 3);
    let broken: Vec<&str> = reports
        .iter()
        .filter(|r| !r.intact)
        .map(|r| r.document_id.as_str())
        .collect();
    assert_eq!(broken, vec!["bob"]);
    assert_eq!(reports[0].kind, DocumentKind::Agent);
}
