use crate::replica::ReplicaError;

/// LogError is the façade-level failure surface. Timeouts are deliberately
/// not an error: timed-out operations resolve to `Ok(None)` at the public
/// API so callers can tell "no result yet" from "failed".
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum LogError {
    #[error("failed to recover the log: {0}")]
    RecoveryFailed(String),
    #[error("the log is being deleted")]
    Deleted,
    #[error("the log reader is being deleted")]
    ReaderDeleted,
    #[error("the log writer is being deleted")]
    WriterDeleted,
    #[error("no election has been performed")]
    NoElection,
    #[error("coordinator failure: {0}")]
    Coordinator(String),
    #[error("bad read range (includes pending entries)")]
    PendingEntries,
    #[error("bad read range (includes missing entries)")]
    MissingEntries,
    #[error("bad read range ({0})")]
    BadRange(String),
    #[error("replica failure: {0}")]
    Replica(String),
    #[error("failed to initialize the log: {0}")]
    Initialization(String),
    #[error("unexpectedly discarded")]
    Discarded,
}

impl From<ReplicaError> for LogError {
    fn from(failure: ReplicaError) -> Self {
        match failure {
            ReplicaError::BadRange(reason) => LogError::BadRange(reason.to_string()),
            ReplicaError::Discarded => LogError::Discarded,
            other => LogError::Replica(other.to_string()),
        }
    }
}
