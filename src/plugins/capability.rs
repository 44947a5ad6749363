//! Capability seams for content pinning and proof receipts.
//!
//! The core hands bytes to these traits and records whatever reference or
//! receipt comes back; it never interprets them. The in-memory
//! implementations are stand-ins: `MemoryContentStore` hands out `mock://`
//! references and `DigestProver` produces a plain SHA-256 commitment, which
//! is not a zero-knowledge proof.

use crate::core::error::KeelsonError;
use crate::core::hash;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

pub const MOCK_REF_PREFIX: &str = "mock://sha256/";
pub const DIGEST_SCHEME: &str = "sha256-commitment";

pub trait ContentStore: Send + Sync {
    /// Store `bytes` and return an opaque reference to them.
    fn put(&self, bytes: &[u8]) -> Result<String, KeelsonError>;
    fn get(&self, reference: &str) -> Result<Option<Vec<u8>>, KeelsonError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofReceipt {
    pub scheme: String,
    pub statement: String,
    pub commitment: String,
}

pub trait Prover: Send + Sync {
    fn prove(&self, statement: &str, witness: &[u8]) -> Result<ProofReceipt, KeelsonError>;
    fn verify(&self, receipt: &ProofReceipt, witness: &[u8]) -> Result<bool, KeelsonError>;
}

/// Content-addressed map held in memory.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blobs: Mutex<FxHashMap<String, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for MemoryContentStore {
    fn put(&self, bytes: &[u8]) -> Result<String, KeelsonError> {
        let reference = format!("{}{}", MOCK_REF_PREFIX, hash::sha256_hex(bytes));
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| KeelsonError::IoError(std::io::Error::other("content store lock poisoned")))?;
        blobs.entry(reference.clone()).or_insert_with(|| bytes.to_vec());
        Ok(reference)
    }

    fn get(&self, reference: &str) -> Result<Option<Vec<u8>>, KeelsonError> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| KeelsonError::IoError(std::io::Error::other("content store lock poisoned")))?;
        Ok(blobs.get(reference).cloned())
    }
}

/// Commits to `(statement, witness)` with SHA-256.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestProver;

impl DigestProver {
    fn commit(statement: &str, witness: &[u8]) -> String {
        hash::sha256_fields(&[DIGEST_SCHEME.as_bytes(), statement.as_bytes(), witness])
    }
}

impl Prover for DigestProver {
    fn prove(&self, statement: &str, witness: &[u8]) -> Result<ProofReceipt, KeelsonError> {
        Ok(ProofReceipt {
            scheme: DIGEST_SCHEME.to_string(),
            statement: statement.to_string(),
            commitment: Self::commit(statement, witness),
        })
    }

    fn verify(&self, receipt: &ProofReceipt, witness: &[u8]) -> Result<bool, KeelsonError> {
        Ok(receipt.scheme == DIGEST_SCHEME && receipt.commitment == Self::commit(&receipt.statement, witness))
    }
}
