use std::io;
use thiserror::Error;

use crate::client::ConnectionState;
use crate::frame;

/// Errors produced by a client connection.
///
/// `OperationFailed` and `Timeout` are scoped to a single command and leave
/// the connection usable; every other variant raised by a command operation
/// is fatal and leaves the connection faulted.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying byte stream failed. Fatal to the connection.
    #[error("transport I/O failure")]
    Io(#[from] io::Error),

    /// The server sent bytes which cannot be decoded as a protocol message.
    /// Fatal to the connection, since the stream cannot be re-framed.
    #[error("malformed protocol message: {0}")]
    Malformed(String),

    /// Negotiation was rejected by the server or could not be completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server greeted us with a protocol flavor we do not support.
    #[error("unsupported protocol flavor, server magic {magic:#018x}")]
    ProtocolMismatch { magic: u64 },

    /// The server rejected a single command. Other in-flight commands and the
    /// connection itself are unaffected.
    #[error("server rejected command with errno {code}{}", offset.map(|o| format!(" at offset {o}")).unwrap_or_default())]
    OperationFailed { code: u32, offset: Option<u64> },

    /// The operation is not legal in the connection's current state.
    #[error("operation invalid in connection state {state:?}")]
    InvalidState { state: ConnectionState },

    /// A caller-supplied deadline elapsed before the command completed. The
    /// command stays on the wire; its eventual reply is discarded.
    #[error("operation deadline elapsed")]
    Timeout,

    /// The connection failed while this command was in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// A Result specialized for use in this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<frame::Error> for Error {
    /// Converts a codec-level error into its public equivalent. `Incomplete`
    /// never escapes the read loops, so mapping it here is a backstop.
    fn from(src: frame::Error) -> Error {
        match src {
            frame::Error::UnsupportedMagic(magic) => Error::ProtocolMismatch { magic },
            other => Error::Malformed(other.to_string()),
        }
    }
}
