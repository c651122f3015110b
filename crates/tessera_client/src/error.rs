//! Client error taxonomy.
//!
//! Misuse and flow-control failures surface directly from the call that
//! caused them. Per-operation write failures never cross the apply/flush
//! boundary; they are collected as [`RowError`](crate::RowError)s and
//! drained from the session's error collector.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::op::WriteOp;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Server-reported status for one failed row within a write request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowErrorCode {
    /// Update or delete targeted a row that does not exist.
    NotFound,
    /// Insert targeted a key that already exists.
    AlreadyPresent,
    /// The row was malformed for the destination tablet.
    InvalidRow,
}

impl std::fmt::Display for RowErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RowErrorCode::NotFound => "not found",
            RowErrorCode::AlreadyPresent => "already present",
            RowErrorCode::InvalidRow => "invalid row",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Error)]
pub enum ClientError {
    /// The call is invalid in the object's current state, e.g. closing a
    /// session with pending operations or reconfiguring an open scanner.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Manual-flush sessions reject applies that would overrun the
    /// mutation buffer. The rejected operation rides along so the caller
    /// keeps ownership; recover it with [`ClientError::into_rejected_op`].
    #[error("mutation buffer space exhausted")]
    BufferSpaceExhausted(Box<WriteOp>),

    /// Summary status for a flush that completed with row errors pending
    /// in the error collector.
    #[error("failed to flush data: {failures} row error(s) pending")]
    SomeOperationsFailed { failures: usize },

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("tablet not found: {0}")]
    TabletNotFound(String),

    /// Per-row failure reported by the serving tablet.
    #[error("row error ({code}): {message}")]
    Row { code: RowErrorCode, message: String },
}

impl ClientError {
    /// Recover the operation rejected by a buffer-space failure.
    pub fn into_rejected_op(self) -> Option<WriteOp> {
        match self {
            ClientError::BufferSpaceExhausted(op) => Some(*op),
            _ => None,
        }
    }

    /// True for failures where the server may have applied the write even
    /// though the client saw an error.
    pub(crate) fn is_ambiguous(&self) -> bool {
        matches!(self, ClientError::TimedOut(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_ambiguous() {
        assert!(ClientError::TimedOut("write".into()).is_ambiguous());
        assert!(!ClientError::Transport("refused".into()).is_ambiguous());
    }
}
