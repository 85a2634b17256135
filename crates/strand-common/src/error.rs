//! Error types for Strand
//!
//! This module defines:
//! - `StrandError`: the error enum shared by every replication component
//! - `ErrorKind`: the coarse taxonomy used to decide between retry, drop and abort
//! - `ErrorCode`: structured codes carried in node error responses

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::{ChangeId, NodeId};

/// Replication and cluster-synchronization errors
#[derive(thiserror::Error, Debug)]
pub enum StrandError {
    #[error("quorum lost: {0}")]
    QuorumLost(String),

    #[error("change id {change_id} collides with a proposal from node {node_id}")]
    Collision { change_id: ChangeId, node_id: NodeId },

    #[error("request `{request}` to node {node_id} timed out after {timeout:?}")]
    Timeout {
        node_id: NodeId,
        request: &'static str,
        timeout: Duration,
    },

    #[error("node {0} is not available")]
    NodeUnavailable(NodeId),

    #[error("synchronization interrupted: {0}")]
    SyncInterrupted(String),

    #[error("failed to apply change {change_id}: {reason}")]
    ApplyFailed { change_id: ChangeId, reason: String },

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid node state: {0}")]
    InvalidNodeState(String),

    #[error("out of order archive append: expected change {expected}, got {got}")]
    ArchiveOutOfOrder { expected: ChangeId, got: ChangeId },

    #[error("bad data: {0}")]
    BadData(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error taxonomy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Logged, counted, and retried by the component that owns the request
    Retryable,
    /// Lost a tie-break; the proposal is dropped and a fresh id must be derived
    Rejected,
    /// Cluster consistency is at risk, the process must terminate
    Fatal,
    /// Persisted state or configuration is unusable, refuse to start
    Operator,
    /// Anything else, reported back to the caller as is
    Other,
}

impl StrandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StrandError::QuorumLost(_)
            | StrandError::Timeout { .. }
            | StrandError::NodeUnavailable(_)
            | StrandError::SyncInterrupted(_)
            | StrandError::NetworkError(_) => ErrorKind::Retryable,
            StrandError::Collision { .. } => ErrorKind::Rejected,
            StrandError::ApplyFailed { .. } | StrandError::ArchiveOutOfOrder { .. } => {
                ErrorKind::Fatal
            }
            StrandError::InvalidNodeState(_) | StrandError::ConfigError(_) => ErrorKind::Operator,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable | ErrorKind::Rejected)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Message exposed to clients; quorum mechanics stay internal
    pub fn client_message(&self) -> String {
        match self.kind() {
            ErrorKind::Retryable | ErrorKind::Rejected => {
                "node is temporarily unable to handle the request".to_string()
            }
            _ => self.to_string(),
        }
    }

    pub fn error_code(&self) -> ErrorCode<'static> {
        match self.kind() {
            ErrorKind::Retryable | ErrorKind::Rejected => NODE_ERROR,
            ErrorKind::Fatal => INTERNAL_ERROR,
            ErrorKind::Operator => OPERATION_ERROR,
            ErrorKind::Other => match self {
                StrandError::BadData(_) => BAD_DATA,
                _ => INTERNAL_ERROR,
            },
        }
    }
}

/// Error code structure for node error responses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

impl Display for ErrorCode<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

pub const OPERATION_ERROR: ErrorCode<'static> = ErrorCode {
    code: -63,
    message: "operation error",
};

pub const BAD_DATA: ErrorCode<'static> = ErrorCode {
    code: -54,
    message: "bad data",
};

pub const NODE_ERROR: ErrorCode<'static> = ErrorCode {
    code: -52,
    message: "node error",
};

pub const INTERNAL_ERROR: ErrorCode<'static> = ErrorCode {
    code: -50,
    message: "internal error",
};
