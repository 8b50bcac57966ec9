//! Flat error taxonomy for the reconciliation engine (spec §7).
//!
//! Positive values are passed-through `errno`s; negative values are
//! ZFS-specific. Mirrors the plain `pub enum Error` style used by
//! `vfs::Error` / `mount::Error` rather than a `std::error::Error`-derive
//! heavy hierarchy.

use std::fmt;

/// Result alias used throughout the reconciliation engine.
pub type Result<T> = std::result::Result<T, ReconcileError>;

/// ZFS-specific status codes (spec §6/§7). `errno` values flow through
/// unchanged via [`ReconcileError::Errno`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A positive `errno` value passed through from a syscall.
    Errno(i32),
    /// `REQUEST_TOO_LONG` — encode would exceed the max packet size.
    RequestTooLong,
    /// `INVALID_REQUEST` — malformed packet.
    InvalidRequest,
    /// `UNKNOWN_FUNCTION` — unrecognised wire function id.
    UnknownFunction,
    /// `INVALID_AUTH_LEVEL` — RPC received before required auth stage.
    InvalidAuthLevel,
    /// `STALE` — dentry or capability no longer matches current `gen`.
    Stale,
    /// `METADATA_ERROR` — hash-file or sidecar write failed.
    MetadataError,
    /// `UPDATE_FAILED` — background update could not make progress.
    UpdateFailed,
    /// `INVALID_REPLY` — reply did not match expected shape.
    InvalidReply,
    /// `EXITING` — daemon is shutting down.
    Exiting,
    /// `COULD_NOT_CONNECT` — TCP connect failed.
    CouldNotConnect,
    /// `COULD_NOT_AUTH` — authentication handshake failed.
    CouldNotAuth,
    /// `CONNECTION_CLOSED` — fd closed with requests still pending.
    ConnectionClosed,
    /// `REQUEST_TIMEOUT` — no reply within `REQUEST_TIMEOUT` seconds.
    RequestTimeout,
    /// `BUSY` — transient, retry with bounded jitter.
    Busy,
    /// `CHANGED` — master data changed mid-operation, restart.
    Changed,
    /// `SLOW_BUSY` — slow link saturated, requeue and back off.
    SlowBusy,
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Errno(e) => write!(f, "errno {e}"),
            ReconcileError::RequestTooLong => write!(f, "request too long"),
            ReconcileError::InvalidRequest => write!(f, "invalid request"),
            ReconcileError::UnknownFunction => write!(f, "unknown function"),
            ReconcileError::InvalidAuthLevel => write!(f, "invalid auth level"),
            ReconcileError::Stale => write!(f, "stale file handle"),
            ReconcileError::MetadataError => write!(f, "metadata error"),
            ReconcileError::UpdateFailed => write!(f, "update failed"),
            ReconcileError::InvalidReply => write!(f, "invalid reply"),
            ReconcileError::Exiting => write!(f, "exiting"),
            ReconcileError::CouldNotConnect => write!(f, "could not connect"),
            ReconcileError::CouldNotAuth => write!(f, "could not authenticate"),
            ReconcileError::ConnectionClosed => write!(f, "connection closed"),
            ReconcileError::RequestTimeout => write!(f, "request timeout"),
            ReconcileError::Busy => write!(f, "busy"),
            ReconcileError::Changed => write!(f, "changed"),
            ReconcileError::SlowBusy => write!(f, "slow link busy"),
        }
    }
}

impl ReconcileError {
    /// True for errors the reconcile engine recovers from in-layer (spec §7).
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Busy | ReconcileError::Changed | ReconcileError::SlowBusy)
    }
}

impl From<std::io::Error> for ReconcileError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => ReconcileError::Errno(code),
            None => ReconcileError::MetadataError,
        }
    }
}
