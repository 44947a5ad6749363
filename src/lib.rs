//! Keelson: versioned operational identity documents for users and agents
//!
//! **Keelson keeps the documents that describe how a user wants to be worked
//! with, or how an agent is allowed to behave, honest over time.**
//!
//! Every accepted change becomes a new version, every event lands in a
//! tamper-evident ledger, and every proposed payload is checked for drift
//! against the last version and for contradictions within itself before it
//! is committed.
//!
//! # Core Principles
//!
//! - **Local-first**: One SQLite database under the store root holds everything
//! - **Atomic**: A document write, its audit entries and its session state commit together
//! - **Tamper-evident**: Audit entries form a SHA-256 hash chain per document
//! - **Bounded**: Remediation is an explicit state machine with an iteration cap
//! - **Document-governed**: Enforcement switches live inside each document
//!
//! # Architecture
//!
//! ## The Thin Waist
//!
//! All state access routes through `DbBroker`:
//! - Per-document serialization (in-process lock table)
//! - One immediate transaction per mutation, committed only on success
//!
//! ## Update pipeline
//!
//! ```text
//! load current -> merge patch -> validate -> drift + contradictions
//!   -> remediation loop (if the document opts in) -> validate
//!   -> persist version + audit entries + session state
//! ```
//!
//! ## Subsystems (Plugins)
//!
//! - `documents`: Create, read, update, soft/hard delete, version history
//! - `audit`: Hash-chained ledger, queries and chain verification
//! - `session`: Live per-document state record
//! - `drift`: Monitored-section diff with normalized similarity scoring
//! - `contradiction`: Registry of independent rules over one snapshot
//! - `remediation`: Bounded propose/apply/re-evaluate loop
//! - `capability`: Content store and prover seams with in-memory stand-ins
//! - `export`: Document bundles, optionally pinned and committed to
//!
//! # Examples
//!
//! ```no_run
//! use keelson::core::payload::Payload;
//! use keelson::core::store::{DocumentKind, Store};
//! use keelson::plugins::documents;
//! use serde_json::json;
//!
//! # fn main() -> Result<(), keelson::core::error::KeelsonError> {
//! let store = Store::open(std::path::Path::new(".keelson"))?;
//! let payload = Payload::from_value(json!({
//!     "identity": {"name": "Ada"},
//!     "interaction_preferences": {"formality": "casual"}
//! }))?;
//! documents::create_document(&store, DocumentKind::User, "ada", payload)?;
//!
//! let patch = Payload::from_value(json!({"interaction_preferences.formality": "stoic"}))?;
//! let outcome = documents::update_document(&store, DocumentKind::User, "ada", patch)?;
//! assert!(outcome.drift.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: Fundamental types (store, broker, payload, version, config, validation)
//! - [`plugins`]: Subsystem implementations (documents, audit, drift, remediation, etc.)

pub mod core;
pub mod plugins;
