use thiserror::Error;

use crate::codec::FramingError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error taxonomy for the PTP/IP protocol engine.
///
/// Per-object errors ([`Error::DownloadFailed`], a single Sony gate
/// timeout, a RAW skip) are recovered locally by the caller and surfaced to
/// the sink without ending the session. Transport errors, command-response
/// failures on session-level operations, and framing violations are fatal:
/// the session transitions to `Closed` and emits `session_did_fail` then
/// `session_did_disconnect`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("timed out connecting to {0}")]
    ConnectTimeout(std::net::SocketAddr),

    #[error("connection refused by {0}")]
    ConnectRefused(std::net::SocketAddr),

    #[error("host {0} is unreachable")]
    HostUnreachable(std::net::SocketAddr),

    #[error("handshake failed at stage {stage}: {reason}")]
    HandshakeFailed { stage: u8, reason: String },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("command 0x{opcode:04x} failed with response code 0x{response_code:04x}")]
    CommandFailed { opcode: u16, response_code: u16 },

    #[error("sony object-in-memory property never reached 0x8000 within budget")]
    ObjectInMemoryTimeout,

    #[error("download of object 0x{handle:08x} failed: {reason}")]
    DownloadFailed { handle: u32, reason: String },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// True for errors that should end the session (as opposed to being
    /// recovered per-object and surfaced to the sink).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::DownloadFailed { .. } | Error::ObjectInMemoryTimeout
        )
    }
}
