use log::debug;
use std::future::Future;
use std::io;
#[cfg(unix)]
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time;

use crate::handshake::frame::{ExportInfo, ListedExport};
use crate::handshake::{Flavor, NegotiationOptions, Negotiator};
use crate::transmit::{Completion, IoConnection, IoKind};
use crate::{Error, Stream};

/// Transport endpoint parameters, typically produced by an external URI
/// parser from schemes such as `nbd://` or `nbd+unix://`.
#[derive(Clone, Debug)]
pub enum TransportParams {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix { path: PathBuf },
}

/// Caller knobs for establishing a connection.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// The export to select; the empty string names the server default.
    pub export_name: String,
    /// Whether to request the structured replies extension when the server's
    /// dialect allows it.
    pub structured_replies: bool,
    /// How long `close` waits for in-flight commands to finish before the
    /// stream is torn down regardless.
    pub drain_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            export_name: String::new(),
            structured_replies: true,
            drain_timeout: Duration::from_secs(1),
        }
    }
}

impl ConnectOptions {
    fn negotiation(&self) -> NegotiationOptions {
        NegotiationOptions {
            export_name: self.export_name.clone(),
            structured_replies: self.structured_replies,
        }
    }
}

/// Whether the connection's stream was upgraded to a secure channel during
/// negotiation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TlsStatus {
    Off,
    Active,
}

/// The lifecycle state of a [`Connection`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No transport has been opened yet.
    Unconnected,
    /// The handshake is in progress.
    Connecting,
    /// Commands may be issued.
    Ready,
    /// A close is draining in-flight commands.
    Closing,
    /// The connection was closed by the caller.
    Closed,
    /// An unrecoverable transport or protocol error occurred. Absorbing:
    /// every subsequent operation fails fast without touching the transport.
    Faulted,
}

/// An established NBD client connection to a single export.
///
/// A connection is produced by [`Connection::connect`] or
/// [`Connection::handshake`] and immediately ready for I/O. All command
/// operations require `Ready` state; a fatal transport or protocol error
/// moves the connection to `Faulted`, after which only `close` is useful.
pub struct Connection<S> {
    io: Option<IoConnection<S>>,
    export: ExportInfo,
    flavor: Flavor,
    structured_replies: bool,
    tls: TlsStatus,
    state: ConnectionState,
    drain_timeout: Duration,
}

impl Connection<TransportStream> {
    /// Establishes a transport connection per `params` and immediately
    /// performs the client handshake, returning a connection ready for I/O.
    pub async fn connect(params: &TransportParams, options: ConnectOptions) -> crate::Result<Self> {
        let stream = match params {
            TransportParams::Tcp { host, port } => {
                // Set TCP_NODELAY, per:
                // https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md#protocol-phases.
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                TransportStream::Tcp(stream)
            }
            #[cfg(unix)]
            TransportParams::Unix { path } => {
                TransportStream::Unix(UnixStream::connect(path).await?)
            }
        };

        Self::handshake(stream, options).await
    }
}

impl<S: Stream> Connection<S> {
    /// Initiates the NBD client handshake over `stream` (typically a TCP
    /// connection, but any duplex byte stream works) and returns a connection
    /// ready for I/O.
    pub async fn handshake(stream: S, options: ConnectOptions) -> crate::Result<Self> {
        let negotiator = Negotiator::new(stream, options.negotiation());
        let (conn, outcome) = negotiator.run().await?;

        Ok(Self::ready(
            IoConnection::new(conn, outcome.export.flags, outcome.structured_replies),
            outcome.export,
            outcome.flavor,
            outcome.structured_replies,
            TlsStatus::Off,
            options.drain_timeout,
        ))
    }

    /// Like [`Connection::handshake`], but negotiates a TLS upgrade first.
    /// Once the server acknowledges the upgrade, `upgrade` is invoked with
    /// the bare stream to apply the external secure-channel wrapper, and
    /// negotiation resumes on the stream it returns.
    pub async fn handshake_tls<T, F, Fut>(
        stream: S,
        options: ConnectOptions,
        upgrade: F,
    ) -> crate::Result<Connection<T>>
    where
        T: Stream,
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let negotiator = Negotiator::new(stream, options.negotiation());
        let (stream, flags) = negotiator.run_until_tls().await?;

        let wrapped = upgrade(stream)
            .await
            .map_err(|err| Error::HandshakeFailed(format!("TLS upgrade failed: {err}")))?;

        let negotiator = Negotiator::resume(wrapped, flags, options.negotiation());
        let (conn, outcome) = negotiator.run_options().await?;

        Ok(Connection::ready(
            IoConnection::new(conn, outcome.export.flags, outcome.structured_replies),
            outcome.export,
            outcome.flavor,
            outcome.structured_replies,
            TlsStatus::Active,
            options.drain_timeout,
        ))
    }

    /// Enumerates the exports a server offers. The stream is consumed:
    /// listing and connecting require separate connections.
    pub async fn list_exports(stream: S) -> crate::Result<Vec<ListedExport>> {
        let negotiator = Negotiator::new(
            stream,
            NegotiationOptions {
                export_name: String::new(),
                structured_replies: false,
            },
        );

        negotiator.list().await
    }

    fn ready(
        io: IoConnection<S>,
        export: ExportInfo,
        flavor: Flavor,
        structured_replies: bool,
        tls: TlsStatus,
        drain_timeout: Duration,
    ) -> Self {
        debug!(
            "connection ready: flavor {flavor:?}, export {:?}, {} bytes",
            export.name, export.size
        );

        Self {
            io: Some(io),
            export,
            flavor,
            structured_replies,
            tls,
            state: ConnectionState::Ready,
            drain_timeout,
        }
    }

    /// Returns the negotiated export attributes.
    pub fn export(&self) -> &ExportInfo {
        &self.export
    }

    /// Returns the negotiated handshake flavor.
    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Returns true if the connection negotiated structured replies.
    pub fn structured_replies(&self) -> bool {
        self.structured_replies
    }

    /// Returns whether the stream was upgraded to a secure channel.
    pub fn tls_status(&self) -> TlsStatus {
        self.tls
    }

    /// Returns the connection's lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reads `length` bytes at `offset`. A `deadline` of `None` waits
    /// indefinitely; an elapsed deadline abandons the command locally and its
    /// eventual reply is discarded.
    pub async fn read(
        &mut self,
        offset: u64,
        length: u32,
        deadline: Option<Duration>,
    ) -> crate::Result<Vec<u8>> {
        self.command(IoKind::Read, offset, length, None, deadline)
            .await
    }

    /// Writes `data` at `offset`.
    pub async fn write(
        &mut self,
        offset: u64,
        data: &[u8],
        deadline: Option<Duration>,
    ) -> crate::Result<()> {
        let length = u32::try_from(data.len()).map_err(|_err| Error::OperationFailed {
            code: crate::consts::NBD_EOVERFLOW,
            offset: None,
        })?;

        self.command(IoKind::Write, offset, length, Some(data), deadline)
            .await
            .map(|_data| ())
    }

    /// Flushes the server's write cache for this export.
    pub async fn flush(&mut self, deadline: Option<Duration>) -> crate::Result<()> {
        self.command(IoKind::Flush, 0, 0, None, deadline)
            .await
            .map(|_data| ())
    }

    /// Discards `length` bytes at `offset`; subsequent reads of the range
    /// return unspecified data.
    pub async fn trim(
        &mut self,
        offset: u64,
        length: u32,
        deadline: Option<Duration>,
    ) -> crate::Result<()> {
        self.command(IoKind::Trim, offset, length, None, deadline)
            .await
            .map(|_data| ())
    }

    /// Closes the connection: waits for in-flight commands up to the drain
    /// timeout, notifies the server, and tears down the stream. Idempotent;
    /// errors during teardown are swallowed since the stream is being
    /// discarded either way.
    pub async fn close(&mut self) {
        if self.state != ConnectionState::Ready {
            // Already closed, faulted, or mid-close: nothing further to do.
            self.io = None;
            return;
        }

        self.state = ConnectionState::Closing;
        let drain_timeout = self.drain_timeout;

        if let Some(io) = self.io.as_mut() {
            let drain = async {
                while io.outstanding() > 0 {
                    match io.poll_replies().await {
                        // Completions at this point belong to commands whose
                        // callers already gave up.
                        Ok(_completions) => {}
                        Err(_err) => break,
                    }
                }
            };

            let _ = time::timeout(drain_timeout, drain).await;
            let _ = io.disconnect().await;
            let _ = io.shutdown().await;
        }

        self.io = None;
        self.state = ConnectionState::Closed;
        debug!("connection closed");
    }

    /// Submits one command and drives the connection until its reply
    /// arrives, the deadline elapses, or the connection fails.
    async fn command(
        &mut self,
        kind: IoKind,
        offset: u64,
        length: u32,
        payload: Option<&[u8]>,
        deadline: Option<Duration>,
    ) -> crate::Result<Vec<u8>> {
        if self.state != ConnectionState::Ready {
            return Err(Error::InvalidState { state: self.state });
        }

        let io = match self.io.as_mut() {
            Some(io) => io,
            None => return Err(Error::InvalidState { state: self.state }),
        };

        let cookie = match io.submit(kind, offset, length, payload).await {
            Ok(cookie) => cookie,
            // Local validation failures are scoped to this command.
            Err(err @ Error::OperationFailed { .. }) => return Err(err),
            // Anything else means the stream is broken.
            Err(err) => return Err(self.fault(err)),
        };

        match deadline {
            None => self.wait_for(cookie).await,
            Some(deadline) => match time::timeout(deadline, self.wait_for(cookie)).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    // The command stays on the wire; discard its eventual
                    // reply instead of delivering it.
                    if let Some(io) = self.io.as_mut() {
                        io.abandon(cookie);
                    }
                    Err(Error::Timeout)
                }
            },
        }
    }

    /// Reads replies until `cookie` completes, surfacing its result.
    async fn wait_for(&mut self, cookie: u64) -> crate::Result<Vec<u8>> {
        loop {
            let io = match self.io.as_mut() {
                Some(io) => io,
                None => return Err(Error::InvalidState { state: self.state }),
            };

            let completions = match io.poll_replies().await {
                Ok(completions) => completions,
                Err(err) => return Err(self.fault(err)),
            };

            for completion in completions {
                if completion.cookie == cookie {
                    return completion.result;
                }

                // No other live callers exist under the single-driver model;
                // a foreign completion here can only mean the server replied
                // to a command nobody is waiting on anymore.
                let Completion { cookie, kind, .. } = completion;
                debug!("dropping completion for {kind:?} cookie {cookie} with no waiter");
            }
        }
    }

    /// Records a fatal error: all in-flight commands complete with
    /// `ConnectionLost`, the stream is dropped, and the connection becomes
    /// `Faulted`. Returns the error the active caller should observe.
    fn fault(&mut self, err: Error) -> Error {
        let reason = err.to_string();

        if let Some(mut io) = self.io.take() {
            // The only live caller is the one observing `err`; completions
            // manufactured here have nobody left to claim them.
            let _ = io.fail_all(&reason);
        }

        self.state = ConnectionState::Faulted;
        debug!("connection faulted: {reason}");

        match err {
            // The transport failed out from under the in-flight commands.
            Error::Io(..) | Error::ConnectionLost(..) => Error::ConnectionLost(reason),
            // Codec-level corruption keeps its own identity.
            other => other,
        }
    }
}

/// A transport stream dialed from [`TransportParams`], wrapping the concrete
/// socket types behind one concrete type.
pub enum TransportStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
