use std::{array::TryFromSliceError, num::TryFromIntError, sync::Arc};

use thiserror::Error as ThisError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, ThisError, Clone)]
pub enum Error {
    #[error("storage error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("corrupt oplog: {0}")]
    CorruptOplog(String),

    #[error("corrupt tree: {0}")]
    CorruptTree(String),

    #[error("node {0} not found")]
    NodeNotFound(u64),

    #[error("block {0} is not available")]
    BlockNotAvailable(u64),

    #[error("proof contains an invalid signature")]
    InvalidSignature,

    #[error("proof mismatch: {0}")]
    ProofMismatch(String),

    #[error("underflowed proof: {0}")]
    UnderflowedProof(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("conflicting trees at length {length} and fork {fork}")]
    Conflict { length: u64, fork: u64 },

    #[error("request timed out")]
    RequestTimeout,

    #[error("request cancelled")]
    RequestCancelled,

    #[error("session closed")]
    SessionClosed,

    #[error("failed to deserialize: {0}")]
    FailedDeserialization(String),
}

impl Error {
    /// Whether the error was caused by a remote peer sending bad data, as
    /// opposed to a local failure.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::InvalidSignature | Error::ProofMismatch(_) | Error::UnderflowedProof(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(Arc::new(error))
    }
}

impl From<bincode::Error> for Error {
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn from(error: bincode::Error) -> Self {
        Error::FailedDeserialization(format!("{}", error))
    }
}

impl From<serde_json::Error> for Error {
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn from(error: serde_json::Error) -> Self {
        Error::FailedDeserialization(format!("{}", error))
    }
}

impl From<hex::FromHexError> for Error {
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn from(error: hex::FromHexError) -> Self {
        Error::FailedDeserialization(format!("{}", error))
    }
}

impl From<TryFromIntError> for Error {
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn from(error: TryFromIntError) -> Self {
        Error::FailedDeserialization(format!("invalid number format: {}", error))
    }
}

impl From<TryFromSliceError> for Error {
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn from(error: TryFromSliceError) -> Self {
        Error::FailedDeserialization(format!("invalid slice format: {}", error))
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn from(error: ed25519_dalek::SignatureError) -> Self {
        Error::FailedDeserialization(format!("invalid signature format: {}", error))
    }
}
