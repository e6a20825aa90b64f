//! Error types for the topology store.

use thiserror::Error;

use crate::slots::SlotId;

/// Result type alias for store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during store operations.
///
/// `NotFound` is the distinguished "no such slot / record" status that
/// callers are expected to match on explicitly.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("table {table} is full ({capacity} slots)")]
    Full { table: &'static str, capacity: usize },

    #[error("slot {id} out of range for table {table}")]
    OutOfRange { table: &'static str, id: SlotId },

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}
