//! Payload codec seam.
//!
//! The store persists whatever bytes the codec produces and never looks
//! inside them. Encryption at rest plugs in here.

use crate::core::error::KeelsonError;
use crate::core::payload::Payload;

pub trait PayloadCodec: Send + Sync {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, KeelsonError>;
    fn decode(&self, blob: &[u8]) -> Result<Payload, KeelsonError>;
}

/// Plain JSON blobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, KeelsonError> {
        payload.canonical_bytes()
    }

    fn decode(&self, blob: &[u8]) -> Result<Payload, KeelsonError> {
        let value: serde_json::Value = serde_json::from_slice(blob)
            .map_err(|e| KeelsonError::CodecError(format!("undecodable payload blob: {}", e)))?;
        Payload::from_value(value).map_err(|e| KeelsonError::CodecError(e.to_string()))
    }
}
