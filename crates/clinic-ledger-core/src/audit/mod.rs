//! Hash-chained, append-only audit ledger.
//!
//! Each entry commits to its sequence number, the previous entry's hash and
//! the serialized event. Checkpoints seal the chain head so truncation or a
//! wholesale rewrite is caught even when the rewritten chain is internally
//! consistent.

mod chain;
mod checkpoint;

pub use chain::*;
pub use checkpoint::*;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::db::DbError;

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Audit ledger errors.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Audit ledger is empty")]
    EmptyLedger,
}

impl From<rusqlite::Error> for AuditError {
    fn from(e: rusqlite::Error) -> Self {
        AuditError::Database(DbError::Sqlite(e))
    }
}

pub type AuditResult<T> = Result<T, AuditError>;

/// SHA-256 hash of data, hex-encoded.
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash of one entry, computed over the stored payload text.
///
/// The material is the JSON object `{event, prev_hash, sequence}`; maps are
/// key-sorted so the same payload always hashes the same way.
pub fn compute_entry_hash(sequence: i64, prev_hash: &str, payload: &str) -> AuditResult<String> {
    let event: serde_json::Value = serde_json::from_str(payload)?;
    let material = serde_json::json!({
        "sequence": sequence,
        "prev_hash": prev_hash,
        "event": event,
    });
    Ok(hash_data(material.to_string().as_bytes()))
}
