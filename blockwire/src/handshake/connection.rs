use bytes::{Buf, BytesMut};
use log::{debug, warn};
use std::io::{self, Cursor};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

use crate::consts::*;
use crate::Stream;

use super::frame::*;

/// The handshake dialect negotiated with a server.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Flavor {
    /// The legacy dialect: export attributes arrive in the greeting and no
    /// options can be negotiated.
    Oldstyle,
    /// The newstyle dialect without the fixed extensions.
    Newstyle,
    /// The fixed newstyle dialect, required for structured replies and
    /// rich export selection.
    NewstyleFixed,
}

/// A low level NBD connection type which deals with reading and writing
/// `Frames` rather than high-level operations.
pub(crate) struct RawConnection<S> {
    pub(crate) stream: BufWriter<S>,
    pub(crate) buffer: BytesMut,
}

impl<S: Stream> RawConnection<S> {
    /// Creates an NBD client connection from `stream`.
    pub(crate) fn new(stream: S) -> Self {
        RawConnection {
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Reads a single `Frame` of the specified `FrameType` from the underlying
    /// stream.
    pub(crate) async fn read_frame(
        &mut self,
        frame_type: FrameType,
    ) -> crate::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.parse_frame(frame_type)? {
                // We read enough data to parse an entire frame, return it now.
                return Ok(Some(frame));
            }

            // There is not enough buffered data to read a frame. Attempt to
            // read more data from the socket. 0 indicates "end of stream".
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                // The remote closed the connection.
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Err(crate::Error::Malformed(
                        "connection reset with partial frame buffered".to_string(),
                    ));
                }
            }
        }
    }

    /// Write a single `Frame` value to the underlying stream.
    pub(crate) async fn write_frame(&mut self, frame: Frame) -> io::Result<()> {
        if frame.write(&mut self.stream).await?.is_some() {
            // Wrote a frame, flush it now.
            self.stream.flush().await
        } else {
            Ok(())
        }
    }

    /// Try to parse a single `Frame` but also terminate early with an
    /// incomplete error if we need to read more data from the stream.
    fn parse_frame(&mut self, frame_type: FrameType) -> crate::Result<Option<Frame>> {
        use crate::frame::Error::Incomplete;

        // Begin checking the data we have buffered and see if we can return an
        // entire Frame of the specified type.
        let mut buf = Cursor::new(&self.buffer[..]);
        match Frame::check(&mut buf, frame_type) {
            Ok(_) => {
                // Found a frame, reset the cursor, parse the entire Frame, then
                // advance the cursor beyond this Frame again for the next read.
                let len = buf.position() as usize;

                buf.set_position(0);
                let frame = Frame::parse(&mut buf, frame_type)?;

                self.buffer.advance(len);
                Ok(Some(frame))
            }
            // Not enough data for an entire Frame.
            Err(Incomplete) => Ok(None),
            // Failed to parse.
            Err(e) => Err(e.into()),
        }
    }

    /// Consumes the connection and returns the bare stream, failing if any
    /// unparsed bytes remain buffered.
    fn into_stream(self) -> crate::Result<S> {
        if !self.buffer.is_empty() {
            return Err(crate::Error::Malformed(
                "server sent unsolicited bytes during negotiation".to_string(),
            ));
        }

        Ok(self.stream.into_inner())
    }
}

/// Caller knobs controlling what the negotiator asks of a server.
#[derive(Clone, Debug)]
pub(crate) struct NegotiationOptions {
    pub(crate) export_name: String,
    pub(crate) structured_replies: bool,
}

/// The result of a completed handshake: everything the transmission phase
/// needs to know about the connection. Immutable once produced.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub(crate) flavor: Flavor,
    pub(crate) export: ExportInfo,
    pub(crate) structured_replies: bool,
}

/// The state of an in-progress negotiation. Errors move the negotiator to
/// `Failed`; it never leaves that state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum NegotiationState {
    AwaitServerMagic,
    NegotiateOptions,
    SelectExport,
    Ready,
    Failed,
}

/// Drives a freshly opened stream through the NBD handshake to a validated
/// connection. Each phase is a method which consumes the previous state and
/// advances `state`, so an out-of-order call is a programming error caught by
/// the state assertions rather than a protocol violation on the wire.
pub(crate) struct Negotiator<S> {
    conn: RawConnection<S>,
    options: NegotiationOptions,
    state: NegotiationState,
    flags: HandshakeFlags,
}

impl<S: Stream> Negotiator<S> {
    /// Creates a negotiator around `stream`, ready to read the server's
    /// greeting.
    pub(crate) fn new(stream: S, options: NegotiationOptions) -> Self {
        Self {
            conn: RawConnection::new(stream),
            options,
            state: NegotiationState::AwaitServerMagic,
            flags: HandshakeFlags::empty(),
        }
    }

    /// Rebuilds a negotiator mid-handshake on `stream`, typically after the
    /// caller wrapped the original stream in a secure channel. The negotiator
    /// resumes at option negotiation with the greeting flags it had already
    /// observed.
    pub(crate) fn resume(stream: S, flags: HandshakeFlags, options: NegotiationOptions) -> Self {
        Self {
            conn: RawConnection::new(stream),
            options,
            state: NegotiationState::NegotiateOptions,
            flags,
        }
    }

    /// Runs the whole handshake to completion and returns the raw connection
    /// along with the negotiated outcome.
    pub(crate) async fn run(mut self) -> crate::Result<(RawConnection<S>, Outcome)> {
        match self.await_server_magic().await? {
            Greeting::Oldstyle { size, flags } => self.finish_oldstyle(size, flags),
            Greeting::Newstyle(..) => self.run_options().await,
        }
    }

    /// Runs the handshake up to and including a STARTTLS acknowledgement,
    /// then hands the bare stream back so the caller can apply the external
    /// secure-channel wrapper. Resume with [`Negotiator::resume`] on the
    /// wrapped stream.
    pub(crate) async fn run_until_tls(mut self) -> crate::Result<(S, HandshakeFlags)> {
        match self.await_server_magic().await? {
            Greeting::Oldstyle { .. } => Err(self.fail(crate::Error::HandshakeFailed(
                "oldstyle servers cannot negotiate TLS".to_string(),
            ))),
            Greeting::Newstyle(flags) => {
                self.start_tls().await?;
                Ok((self.conn.into_stream()?, flags))
            }
        }
    }

    /// Runs option negotiation and export selection after a newstyle
    /// greeting, completing the handshake.
    pub(crate) async fn run_options(mut self) -> crate::Result<(RawConnection<S>, Outcome)> {
        assert_eq!(self.state, NegotiationState::NegotiateOptions);

        let fixed = self.flags.contains(HandshakeFlags::FIXED_NEWSTYLE);

        // Structured replies require the fixed dialect; plain newstyle
        // servers predate the option.
        let structured_replies = if fixed && self.options.structured_replies {
            self.negotiate_structured_replies().await?
        } else {
            false
        };

        self.state = NegotiationState::SelectExport;
        let export = self.select_export(fixed).await?;

        debug!(
            "handshake ready: export {:?}, {} bytes, structured replies {}",
            export.name, export.size, structured_replies
        );

        self.state = NegotiationState::Ready;
        let outcome = Outcome {
            flavor: if fixed {
                Flavor::NewstyleFixed
            } else {
                Flavor::Newstyle
            },
            export,
            structured_replies,
        };

        Ok((self.conn, outcome))
    }

    /// Enumerates the server's exports over a fresh connection, then asks the
    /// server to abort the negotiation. The stream is consumed; listing and
    /// connecting require separate connections.
    pub(crate) async fn list(mut self) -> crate::Result<Vec<ListedExport>> {
        match self.await_server_magic().await? {
            Greeting::Oldstyle { .. } => {
                return Err(self.fail(crate::Error::HandshakeFailed(
                    "oldstyle servers cannot enumerate exports".to_string(),
                )))
            }
            Greeting::Newstyle(flags) => {
                if !flags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
                    return Err(self.fail(crate::Error::HandshakeFailed(
                        "server does not support the fixed newstyle dialect".to_string(),
                    )));
                }
            }
        }

        self.write_option(OptionRequest::List).await?;

        let mut exports = Vec::new();
        loop {
            let reply = self.read_option_reply(NBD_OPT_LIST).await?;
            match reply.body {
                ReplyBody::Server(export) => exports.push(export),
                ReplyBody::Ack => break,
                ReplyBody::Error(message) => {
                    return Err(self.fail(crate::Error::HandshakeFailed(format!(
                        "server rejected export list request: {message}"
                    ))))
                }
                _ => {
                    return Err(self.fail(crate::Error::Malformed(
                        "unexpected reply to export list request".to_string(),
                    )))
                }
            }
        }

        // Tell the server we are done; it will acknowledge and close. The
        // acknowledgement read is best-effort since some servers close first.
        self.write_option(OptionRequest::Abort).await?;
        let _ = self.conn.read_frame(FrameType::OptionReply).await;

        Ok(exports)
    }

    /// Reads and validates the server's greeting, transitioning out of
    /// `AwaitServerMagic`.
    async fn await_server_magic(&mut self) -> crate::Result<Greeting> {
        assert_eq!(self.state, NegotiationState::AwaitServerMagic);

        let greeting = match self.conn.read_frame(FrameType::ServerGreeting).await {
            Ok(Some(Frame::ServerGreeting(greeting))) => greeting,
            Ok(Some(..)) => unreachable!("read_frame returned a mismatched frame"),
            Ok(None) => {
                return Err(self.fail(crate::Error::HandshakeFailed(
                    "server terminated connection before greeting".to_string(),
                )))
            }
            Err(err) => return Err(self.fail(err)),
        };

        match greeting {
            Greeting::Oldstyle { .. } => {
                debug!("server greeted with oldstyle handshake");
                // Terminal for negotiation purposes; finish_oldstyle completes
                // the handshake without further I/O.
                self.state = NegotiationState::Ready;
            }
            Greeting::Newstyle(flags) => {
                debug!("server greeted with newstyle handshake, flags: {flags:?}");
                self.flags = flags;
                self.state = NegotiationState::NegotiateOptions;

                // Answer with our own flags: fixed newstyle when the server
                // offers it, and no-zeroes when offered so the legacy export
                // padding is elided.
                let mut client_flags = ClientFlags::empty();
                if flags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
                    client_flags |= ClientFlags::FIXED_NEWSTYLE;
                }
                if flags.contains(HandshakeFlags::NO_ZEROES) {
                    client_flags |= ClientFlags::NO_ZEROES;
                }

                if let Err(err) = self.conn.write_frame(Frame::ClientFlags(client_flags)).await {
                    return Err(self.fail(err.into()));
                }
            }
        }

        Ok(greeting)
    }

    /// Completes an oldstyle handshake from greeting data alone.
    fn finish_oldstyle(
        self,
        size: u64,
        flags: TransmissionFlags,
    ) -> crate::Result<(RawConnection<S>, Outcome)> {
        if !self.options.export_name.is_empty() {
            return Err(crate::Error::HandshakeFailed(
                "oldstyle servers cannot select a named export".to_string(),
            ));
        }

        Ok((
            self.conn,
            Outcome {
                flavor: Flavor::Oldstyle,
                export: ExportInfo {
                    name: String::new(),
                    size,
                    flags,
                    ..Default::default()
                },
                structured_replies: false,
            },
        ))
    }

    /// Requests the structured replies extension. A declined request is
    /// recorded, not fatal.
    async fn negotiate_structured_replies(&mut self) -> crate::Result<bool> {
        self.write_option(OptionRequest::StructuredReply).await?;

        let reply = self.read_option_reply(NBD_OPT_STRUCTURED_REPLY).await?;
        if reply.is_ack() {
            debug!("server accepted structured replies");
            return Ok(true);
        }

        if reply.is_error() {
            // Not fatal; simple replies remain available.
            warn!("server declined structured replies: {:?}", reply.body);
            return Ok(false);
        }

        Err(self.fail(crate::Error::Malformed(
            "unexpected reply to structured replies request".to_string(),
        )))
    }

    /// Sends the STARTTLS option and expects an acknowledgement. The caller
    /// is responsible for wrapping the stream afterwards.
    async fn start_tls(&mut self) -> crate::Result<()> {
        if !self.flags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
            return Err(self.fail(crate::Error::HandshakeFailed(
                "server does not support the fixed newstyle dialect required for TLS".to_string(),
            )));
        }

        self.write_option(OptionRequest::StartTls).await?;

        let reply = self.read_option_reply(NBD_OPT_STARTTLS).await?;
        if reply.is_ack() {
            debug!("server accepted TLS upgrade");
            return Ok(());
        }

        // TLS was explicitly requested by the caller, so a declined upgrade
        // fails the handshake rather than being recorded.
        Err(self.fail(crate::Error::HandshakeFailed(format!(
            "server declined TLS upgrade: {:?}",
            reply.body
        ))))
    }

    /// Selects the target export, preferring the Go option on fixed newstyle
    /// servers and falling back to the legacy export-name option.
    async fn select_export(&mut self, fixed: bool) -> crate::Result<ExportInfo> {
        assert_eq!(self.state, NegotiationState::SelectExport);

        if fixed {
            match self.go().await? {
                Some(export) => return Ok(export),
                // Server does not know Go; fall through to export-name.
                None => debug!("server declined go option, falling back to export name"),
            }
        }

        self.export_name().await
    }

    /// Attempts export selection via the Go option. Returns `Ok(None)` when
    /// the server does not support Go at all.
    async fn go(&mut self) -> crate::Result<Option<ExportInfo>> {
        let name = self.options.export_name.clone();
        self.write_option(OptionRequest::Go(GoRequest {
            name: if name.is_empty() { None } else { Some(name) },
            info_requests: vec![
                InfoType::Export,
                InfoType::Name,
                InfoType::Description,
                InfoType::BlockSize,
            ],
        }))
        .await?;

        let mut export = ExportInfo {
            name: self.options.export_name.clone(),
            ..Default::default()
        };
        let mut saw_export_info = false;

        loop {
            let reply = self.read_option_reply(NBD_OPT_GO).await?;
            match reply.body {
                ReplyBody::Info(InfoPayload::Export { size, flags }) => {
                    saw_export_info = true;
                    export.size = size;
                    export.flags = flags;
                }
                ReplyBody::Info(InfoPayload::Name(name)) => export.name = name,
                ReplyBody::Info(InfoPayload::Description(description)) => {
                    export.description = description
                }
                ReplyBody::Info(InfoPayload::BlockSize { preferred, .. }) => {
                    export.block_size = Some(preferred)
                }
                // Servers may send info types newer than this client.
                ReplyBody::Info(InfoPayload::Unknown(..)) => {}
                ReplyBody::Ack => break,
                ReplyBody::Error(message) => {
                    if reply.code == NBD_REP_ERR_UNSUP {
                        return Ok(None);
                    }

                    return Err(self.fail(crate::Error::HandshakeFailed(format!(
                        "server rejected export {:?}: {message}",
                        self.options.export_name
                    ))));
                }
                ReplyBody::Server(..) | ReplyBody::Unknown => {
                    return Err(self.fail(crate::Error::Malformed(
                        "unexpected reply to go request".to_string(),
                    )))
                }
            }
        }

        if !saw_export_info {
            // The mandatory export info fragment never arrived.
            return Err(self.fail(crate::Error::HandshakeFailed(
                "server acknowledged go without export information".to_string(),
            )));
        }

        Ok(Some(export))
    }

    /// Selects the export via the legacy export-name option. The server
    /// answers with size and flags directly, or terminates the connection for
    /// an unknown name.
    async fn export_name(&mut self) -> crate::Result<ExportInfo> {
        let name = self.options.export_name.clone();
        self.write_option(OptionRequest::ExportName(name.clone()))
            .await?;

        let no_zeroes = self.flags.contains(HandshakeFlags::NO_ZEROES);
        let ack = match self
            .conn
            .read_frame(FrameType::ExportAck { no_zeroes })
            .await
        {
            Ok(Some(Frame::ExportAck(ack))) => ack,
            Ok(Some(..)) => unreachable!("read_frame returned a mismatched frame"),
            Ok(None) => {
                return Err(self.fail(crate::Error::HandshakeFailed(format!(
                    "server terminated connection selecting export {name:?}"
                ))))
            }
            Err(err) => return Err(self.fail(err)),
        };

        Ok(ExportInfo {
            name,
            size: ack.size,
            flags: ack.flags,
            ..Default::default()
        })
    }

    /// Writes a single option request frame.
    async fn write_option(&mut self, option: OptionRequest) -> crate::Result<()> {
        if let Err(err) = self.conn.write_frame(Frame::OptionRequest(option)).await {
            return Err(self.fail(err.into()));
        }

        Ok(())
    }

    /// Reads a single option reply frame and verifies it responds to
    /// `option`.
    async fn read_option_reply(&mut self, option: u32) -> crate::Result<OptionReply> {
        let reply = match self.conn.read_frame(FrameType::OptionReply).await {
            Ok(Some(Frame::OptionReply(reply))) => reply,
            Ok(Some(..)) => unreachable!("read_frame returned a mismatched frame"),
            Ok(None) => {
                return Err(self.fail(crate::Error::HandshakeFailed(
                    "server terminated connection during option negotiation".to_string(),
                )))
            }
            Err(err) => return Err(self.fail(err)),
        };

        if reply.option != option {
            return Err(self.fail(crate::Error::Malformed(format!(
                "server replied to option {} while option {option} was pending",
                reply.option
            ))));
        }

        Ok(reply)
    }

    /// Transitions to the terminal `Failed` state and passes `err` through
    /// for the caller to surface.
    fn fail(&mut self, err: crate::Error) -> crate::Error {
        self.state = NegotiationState::Failed;
        err
    }
}
