use std::io;
use thiserror::Error;

/// Unified error taxonomy for the storage engine.
///
/// Corrupt WAL tails never surface here — they are expected after a crash and
/// are truncated silently during replay. Everything else that is corrupt
/// (manifest JSON, SSTable blocks and footers) is fatal for the operation
/// that observed it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// On-disk state violates the format: undecodable manifest, bad SSTable
    /// footer, or a block CRC mismatch.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// The named thing does not exist (index, backup, collection).
    #[error("not found: {0}")]
    NotFound(String),

    /// A batch would leave two distinct ids holding the same key in a unique
    /// index.
    #[error("unique constraint violation on index {index:?}: key {key:?}")]
    UniqueConstraintViolation { index: String, key: String },

    /// The batch guard failed: the store has not yet reached the required
    /// sequence.
    #[error("sequence too low: required {required}, current {current}")]
    SequenceTooLow { required: u64, current: u64 },

    /// A document or id failed to encode or decode as JSON.
    #[error("document encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    /// An underlying filesystem error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<wal::WalError> for StoreError {
    fn from(e: wal::WalError) -> Self {
        match e {
            wal::WalError::Io(io) => StoreError::Io(io),
            wal::WalError::Corrupt => StoreError::Corrupt("wal frame".to_string()),
        }
    }
}

impl From<sstable::SstError> for StoreError {
    fn from(e: sstable::SstError) -> Self {
        match e {
            sstable::SstError::Io(io) => StoreError::Io(io),
            sstable::SstError::Corrupt(msg) => StoreError::Corrupt(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
