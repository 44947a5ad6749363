use keelson::core::error::KeelsonError;
use keelson::core::payload::Payload;
use keelson::core::store::{DocumentKind, Store};
use keelson::core::time::ManualClock;
use keelson::plugins::audit::{self, AuditQuery};
use keelson::plugins::documents::{self, AWAITING_CONFIRMATION};
use keelson::plugins::session::{self, SessionPatch, SessionState};
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

fn agent() -> Payload {
    Payload::from_value(json!({
        "identity": {"name": "scout"},
        "capabilities": {"tools": ["search"]}
    }))
    .unwrap()
}

#[test]
fn missing_state_is_zero_value() {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let state = session::get_session_state(&store, DocumentKind::Agent, "nobody").unwrap();
    assert_eq!(state, SessionState::default());
    assert_eq!(state.timestamp, 0);
}

#[test]
fn update_is_last_writer_wins_and_partial() {
    let tmp = tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(500));
    let store = Store::open(tmp.path()).unwrap().with_clock(clock.clone());
    documents::create_document(&store, DocumentKind::Agent, "scout", agent()).unwrap();

    clock.advance(10);
    let state = session::update_session_state(
        &store,
        DocumentKind::Agent,
        "scout",
        SessionPatch::action("handoff").waiting_for("operator"),
    )
    .unwrap();
    assert_eq!(state.phase, "active");
    assert_eq!(state.last_action, "handoff");
    assert_eq!(state.waiting_for, "operator");
    assert_eq!(state.timestamp, 510);

    clock.advance(10);
    session::update_session_state(
        &store,
        DocumentKind::Agent,
        "scout",
        SessionPatch::default().phase("review").waiting_for(""),
    )
    .unwrap();
    let state = session::get_session_state(&store, DocumentKind::Agent, "scout").unwrap();
    assert_eq!(state.phase, "review");
    assert_eq!(state.last_action, "handoff");
    assert!(state.waiting_for.is_empty());
    assert_eq!(state.timestamp, 520);

    // session writes are not ledger events
    let entries = audit::query_audit(&store, DocumentKind::Agent, "scout", &AuditQuery::default()).unwrap();
    assert_eq!(entries.len(), 1);
}

#[test]
fn update_requires_an_existing_document() {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let err = session::update_session_state(&store, DocumentKind::User, "ghost", SessionPatch::action("x")).unwrap_err();
    assert!(matches!(err, KeelsonError::NotFound(_)));
    assert_eq!(
        session::get_session_state(&store, DocumentKind::User, "ghost").unwrap(),
        SessionState::default()
    );
}

#[test]
fn deferred_remediation_waits_for_caller() {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let doc = Payload::from_value(json!({
        "identity": {"name": "Ada"},
        "interaction_preferences": {"pushback": true},
        "meta_enforcement": {
            "enforce_contradiction_alerts": true,
            "auto_apply_remediation": false,
            "require_honest_pushback": false
        }
    }))
    .unwrap();
    documents::create_document(&store, DocumentKind::User, "ada", doc).unwrap();

    let state = session::get_session_state(&store, DocumentKind::User, "ada").unwrap();
    assert_eq!(state.waiting_for, AWAITING_CONFIRMATION);
    assert!(state.last_feedback.contains("await confirmation"));

    // clean update clears the wait
    let fix = Payload::from_value(json!({"meta_enforcement.require_honest_pushback": true})).unwrap();
    documents::update_document(&store, DocumentKind::User, "ada", fix).unwrap();
    let state = session::get_session_state(&store, DocumentKind::User, "ada").unwrap();
    assert!(state.waiting_for.is_empty());
    assert_eq!(state.last_action, "update");
}
