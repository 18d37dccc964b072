//! Error taxonomy for the sync protocol
//!
//! Only transport failures tear a session down; everything else is logged
//! and the session keeps serving. `SwizError::is_fatal_to_session` is the
//! single place that policy lives.

use std::io;
use thiserror::Error;

/// Framing and grammar violations. Never fatal to a session: the offending
/// packet is dropped and the receive loop keeps going.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed command: {raw:?}")]
    Malformed { raw: String },

    #[error("command field is {len} bytes, limit is {max}")]
    CommandTooLong { len: usize, max: usize },

    #[error("payload of {size} bytes exceeds the {max} byte cap")]
    OversizedPayload { size: usize, max: usize },

    #[error("header command field is not NUL-terminated UTF-8")]
    BadCommandField,

    #[error("bad handshake: {reason}")]
    BadHandshake { reason: String },
}

/// Socket-level failures. Any of these ends the session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("read timed out")]
    Timeout,

    #[error("connection closed by peer")]
    Closed,

    #[error("socket error: {0}")]
    Io(io::Error),
}

// Classify io errors the way the receive loops need them: timeouts are
// idle ticks, the eof/reset family means the peer is gone.
impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> TransportError {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => TransportError::Closed,
            _ => TransportError::Io(e),
        }
    }
}

/// File transfer failures: path escapes, filesystem errors, broken chunk
/// streams. The affected transfer is abandoned; the session survives.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("path escapes the sync root: {path:?}")]
    PathEscape { path: String },

    #[error("cannot read {path}: {source}")]
    Unreadable { path: String, source: io::Error },

    #[error("cannot write {path}: {source}")]
    Unwritable { path: String, source: io::Error },

    #[error("peer reported failure for {path}")]
    PeerFailed { path: String },

    #[error("chunk for {path} without a transfer in progress")]
    NoTransfer { path: String },

    #[error("out-of-order chunk for {path}: got {got}, wanted {want}")]
    OutOfOrder { path: String, got: i32, want: i32 },
}

/// Server resource limits.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("user {user} already has {max} live sessions")]
    SessionCeiling { user: String, max: usize },
}

/// Invalid startup parameters.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid username {name:?}: {reason}")]
    BadUsername { name: String, reason: &'static str },

    #[error("invalid address {addr:?}: {reason}")]
    BadAddress { addr: String, reason: &'static str },

    #[error("sync directory {path:?}: {reason}")]
    BadDirectory { path: String, reason: &'static str },
}

#[derive(Debug, Error)]
pub enum SwizError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SwizError {
    /// True only for transport failures. Protocol, transfer, resource and
    /// config errors are logged and the session keeps running.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, SwizError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_kill_a_session() {
        let transport: SwizError = TransportError::Closed.into();
        assert!(transport.is_fatal_to_session());

        let protocol: SwizError = ProtocolError::Malformed { raw: "x".into() }.into();
        assert!(!protocol.is_fatal_to_session());

        let transfer: SwizError =
            TransferError::PeerFailed { path: "a.txt".into() }.into();
        assert!(!transfer.is_fatal_to_session());
    }

    #[test]
    fn io_classification() {
        let t = TransportError::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(matches!(t, TransportError::Timeout));
        let c = TransportError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(c, TransportError::Closed));
        let o = TransportError::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(o, TransportError::Io(_)));
    }
}
