use crate::core::error;
use crate::core::schemas;
use rusqlite::{Connection, params};
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::KeelsonError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::KeelsonError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::KeelsonError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::KeelsonError::RusqliteError)?;
    Ok(conn)
}

pub fn keelson_db_path(root: &Path) -> PathBuf {
    root.join(schemas::KEELSON_DB_NAME)
}

/// Create the store directory and every table. Safe to call repeatedly.
pub fn initialize_keelson_db(root: &Path) -> Result<(), error::KeelsonError> {
    fs::create_dir_all(root).map_err(error::KeelsonError::IoError)?;
    let db_path = keelson_db_path(root);
    let conn = db_connect(&db_path.to_string_lossy())?;

    for schema in schemas::ALL_SCHEMAS {
        conn.execute_batch(schema)?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES('schema_version', ?1)",
        params![schemas::KEELSON_SCHEMA_VERSION.to_string()],
    )?;

    tracing::debug!(path = %db_path.display(), "keelson database initialized");
    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<u32, error::KeelsonError> {
    let raw: String = conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    raw.parse::<u32>()
        .map_err(|_| error::KeelsonError::invalid(format!("corrupt schema_version '{}'", raw)))
}
