//! Error taxonomy of the sync engine.
//!
//! Connection-lifecycle failures never leave the engine; they are retried.
//! What does reach the host application is either a typed `SyncError` from a
//! handle call or one of the surfaced `SyncEvent`s (authentication failure,
//! replay failure).

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::queue::OperationKind;

/// Why opening the channel failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenError {
    /// Handshake rejected because the credential is invalid or expired.
    #[error("Handshake rejected: {0}")]
    Unauthorized(String),
    /// Transport-level failure (DNS, TCP, TLS, upgrade).
    #[error("Network error: {0}")]
    Network(String),
    #[error("Connection attempt timed out")]
    Timeout,
}

/// Credential refresh failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Credential refresh failed: {0}")]
pub struct AuthError(pub String);

/// Why a queued operation could not be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("Target message {0} was deleted")]
    TargetDeleted(String),
    #[error(transparent)]
    Encoding(#[from] ProtocolError),
}

/// Errors returned to callers of the engine handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Offline queue full ({capacity} operations); {kind:?} operation rejected")]
    QueueFull { kind: OperationKind, capacity: usize },
    #[error("Event {0} cannot be queued while offline")]
    NotQueueable(&'static str),
    #[error("Sync engine has stopped")]
    EngineStopped,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
