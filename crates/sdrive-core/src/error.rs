use thiserror::Error;

use crate::types::RevisionId;

pub type TransferResult<T> = Result<T, TransferError>;

/// Failure of a block or revision transfer.
///
/// Integrity faults (`IndexGap`, `KeyMismatch`, `DataPacketMismatch`,
/// `ContentCorrupted`) are fatal to the transfer and never retried here.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("missing block index {expected} (listing returned {found})")]
    IndexGap { expected: u32, found: u32 },

    #[error("content key packet cannot be decrypted with the node key")]
    KeyMismatch,

    #[error("block {index}: data packet was not produced with the revision content key")]
    DataPacketMismatch { index: u32 },

    #[error("block {index}: content decryption failed")]
    ContentCorrupted { index: u32 },

    #[error("invalid revision state: {0}")]
    InvalidState(String),

    #[error("requested amount {amount} is outside 1..={max}")]
    InvalidAmount { amount: usize, max: usize },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

/// Conflict descriptor returned when a revision cannot be created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionConflict {
    /// Revision currently holding the name, if it is not a draft
    pub conflicting_revision_id: Option<RevisionId>,
    /// Existing draft revision, if any
    pub draft_revision_id: Option<RevisionId>,
    /// Client that created the existing draft
    pub draft_client_id: Option<String>,
}

/// Faults reported by the metadata/API collaborator.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("revision conflict: {0:?}")]
    RevisionConflict(RevisionConflict),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected ({code}): {message}")]
    Rejected { code: u32, message: String },

    #[error("transport: {0}")]
    Transport(String),
}
