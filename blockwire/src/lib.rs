//! An asynchronous Rust client implementation of the [Network Block
//! Device (NBD)](https://en.wikipedia.org/wiki/Network_block_device)
//! protocol: handshake negotiation, export selection, and pipelined block
//! I/O with structured reply support.

extern crate bitflags;
extern crate log;
extern crate num_derive;

mod client;
mod consts;
mod error;
mod frame;
mod handshake;
mod transmit;

pub use client::{
    ConnectOptions, Connection, ConnectionState, TlsStatus, TransportParams, TransportStream,
};
pub use error::{Error, Result};
pub use handshake::frame::{ExportInfo, ListedExport, TransmissionFlags};
pub use handshake::Flavor;

use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream which can carry an NBD session, such as a TCP or
/// Unix domain socket, or an in-memory pipe in tests.
pub trait Stream: AsyncRead + AsyncWrite + Unpin {}

impl<S: AsyncRead + AsyncWrite + Unpin> Stream for S {}
