//! Centralized database schema definitions for the keelson store.
//!
//! Everything lives in one SQLite database so that a document write, its audit
//! entries and its session state commit in the same transaction.

pub const KEELSON_DB_NAME: &str = "keelson.db";
pub const KEELSON_CONFIG_NAME: &str = "keelson.toml";
pub const KEELSON_SCHEMA_VERSION: u32 = 1;

pub const META_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

// --- Documents ---

pub const DOCUMENTS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        version TEXT NOT NULL,
        deleted TEXT NOT NULL DEFAULT 'live', -- live, soft
        payload BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        last_updated INTEGER NOT NULL,
        PRIMARY KEY (kind, id)
    )
";

pub const DOCUMENT_VERSIONS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS document_versions (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        version TEXT NOT NULL,
        payload BLOB NOT NULL,
        digest TEXT NOT NULL,
        recorded_at INTEGER NOT NULL,
        PRIMARY KEY (kind, id, version)
    )
";

pub const TOMBSTONES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tombstones (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        last_version TEXT NOT NULL,
        deleted_at INTEGER NOT NULL,
        PRIMARY KEY (kind, id)
    )
";

// --- Audit ledger ---

pub const AUDIT_ENTRIES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS audit_entries (
        kind TEXT NOT NULL,
        document_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        event_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        detail TEXT NOT NULL, -- canonical JSON, hashed byte-for-byte
        prev_hash TEXT NOT NULL,
        entry_hash TEXT NOT NULL,
        recorded_at INTEGER NOT NULL,
        PRIMARY KEY (kind, document_id, sequence)
    )
";
pub const AUDIT_ENTRIES_INDEX_TYPE: &str =
    "CREATE INDEX IF NOT EXISTS idx_audit_entries_type ON audit_entries(kind, document_id, event_type)";

// --- Session state ---

pub const SESSION_STATE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS session_state (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        phase TEXT NOT NULL DEFAULT '',
        waiting_for TEXT NOT NULL DEFAULT '',
        last_action TEXT NOT NULL DEFAULT '',
        last_feedback TEXT NOT NULL DEFAULT '',
        timestamp INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (kind, id)
    )
";

pub const ALL_SCHEMAS: &[&str] = &[
    META_SCHEMA,
    DOCUMENTS_SCHEMA,
    DOCUMENT_VERSIONS_SCHEMA,
    TOMBSTONES_SCHEMA,
    AUDIT_ENTRIES_SCHEMA,
    AUDIT_ENTRIES_INDEX_TYPE,
    SESSION_STATE_SCHEMA,
];
