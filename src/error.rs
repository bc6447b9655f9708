// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy shared by every data-plane and control-plane module.

use std::io;
use thiserror::Error;

/// The error kinds a core component can raise.
///
/// Propagation rule (see `DspdError::is_transient`): transient kinds never
/// poison a client; all others set the owning object's sticky `error` field.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DspdError {
    /// Temporary condition; caller should retry after waiting.
    #[error("resource temporarily unavailable")]
    Again,
    /// Async op started, result pending.
    #[error("operation in progress")]
    InProgress,
    /// Underrun (playback) or overrun (capture).
    #[error("stream xrun")]
    Pipe,
    /// Hardware suspended.
    #[error("device suspended")]
    Strpipe,
    /// Wrong direction or handle never bound.
    #[error("bad file descriptor")]
    BadFd,
    /// Operation invalid in current state.
    #[error("bad state")]
    BadF,
    /// Device vanished (hotplug, kill).
    #[error("no such device")]
    NoDev,
    /// Wire packet malformed or truncated.
    #[error("protocol error")]
    Protocol,
    /// Shared-memory invariant violated; security boundary.
    #[error("fault: shared memory invariant violated")]
    Fault,
    /// Parameter out of range.
    #[error("invalid argument")]
    Invalid,
    /// Conflicts with an outstanding operation.
    #[error("busy")]
    Busy,
    /// Operation was cancelled via `cancel_io`.
    #[error("operation cancelled")]
    Cancelled,
}

impl DspdError {
    /// Transient errors never poison the owning client (§7).
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            DspdError::Again | DspdError::InProgress | DspdError::BadFd | DspdError::Busy
        )
    }

    /// Whether this error should immediately tear down the transport
    /// (a client that corrupts shared memory is treated as hostile).
    pub fn is_security_fault(self) -> bool {
        matches!(self, DspdError::Fault)
    }
}

pub type DspdResult<T> = Result<T, DspdError>;

impl From<DspdError> for io::Error {
    fn from(e: DspdError) -> Self {
        let kind = match e {
            DspdError::Again | DspdError::Busy => io::ErrorKind::WouldBlock,
            DspdError::InProgress => io::ErrorKind::WouldBlock,
            DspdError::BadFd | DspdError::BadF | DspdError::Invalid => io::ErrorKind::InvalidInput,
            DspdError::NoDev => io::ErrorKind::NotFound,
            DspdError::Protocol => io::ErrorKind::InvalidData,
            DspdError::Cancelled => io::ErrorKind::Interrupted,
            DspdError::Pipe | DspdError::Strpipe | DspdError::Fault => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}
