use bytes::{Buf, BytesMut};
use log::{trace, warn};
use std::collections::HashMap;
use std::io::Cursor;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

use super::frame::{
    Chunk, ChunkPayload, CommandFlags, Frame, Header, IoKind, PayloadLengths, Reply,
};
use crate::consts::*;
use crate::frame::MAX_IO_LENGTH;
use crate::handshake::frame::TransmissionFlags;
use crate::handshake::RawConnection;
use crate::Stream;

/// A command which completed, ready to hand back to its caller.
#[derive(Debug)]
pub(crate) struct Completion {
    pub(crate) cookie: u64,
    pub(crate) kind: IoKind,
    /// The payload for a successful read; empty for other commands.
    pub(crate) result: crate::Result<Vec<u8>>,
}

/// One outstanding command, owned by the multiplexer until its reply is fully
/// assembled.
#[derive(Debug)]
struct Pending {
    kind: IoKind,
    offset: u64,
    length: u32,
    state: PendingState,
    assembly: Assembly,
}

/// The reply progress of a `Pending` command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum PendingState {
    /// No reply bytes observed yet.
    Waiting,
    /// At least one structured chunk has arrived.
    Replying,
    /// The caller gave up on this command; it stays in the table so replies
    /// can still be framed, but its completion is discarded.
    Abandoned,
}

/// Accumulates structured reply chunks for one command until the final chunk
/// is observed. The buffer is allocated lazily on the first data chunk and
/// starts zeroed, so hole chunks only need bounds checking.
#[derive(Debug, Default)]
struct Assembly {
    data: Vec<u8>,
    error: Option<(u32, Option<u64>)>,
}

/// The in-flight command table, keyed by cookie.
#[derive(Debug, Default)]
struct InflightTable {
    commands: HashMap<u64, Pending>,
}

impl PayloadLengths for InflightTable {
    fn simple_payload_length(&self, cookie: u64) -> Option<usize> {
        self.commands.get(&cookie).map(|pending| match pending.kind {
            IoKind::Read => pending.length as usize,
            _ => 0,
        })
    }
}

/// A low level NBD connection type which multiplexes data transmission
/// commands over a single stream: it serializes outbound request frames,
/// matches inbound replies to outstanding commands by cookie, and assembles
/// structured replies.
pub(crate) struct IoConnection<S> {
    stream: BufWriter<S>,
    buffer: BytesMut,
    inflight: InflightTable,
    next_cookie: u64,
    structured: bool,
    export_flags: TransmissionFlags,
}

impl<S: Stream> IoConnection<S> {
    /// Creates a connection ready for I/O by consuming the stream and buffer
    /// from the handshake phase.
    pub(crate) fn new(conn: RawConnection<S>, export_flags: TransmissionFlags, structured: bool) -> Self {
        Self {
            stream: conn.stream,
            buffer: conn.buffer,
            inflight: InflightTable::default(),
            next_cookie: 1,
            structured,
            export_flags,
        }
    }

    /// Returns the number of commands currently in flight, including
    /// abandoned ones still awaiting replies.
    pub(crate) fn outstanding(&self) -> usize {
        self.inflight.commands.len()
    }

    /// Encodes and writes one command frame, records it in the in-flight
    /// table, and returns its cookie. Multiple submissions may be pipelined
    /// before any reply is read.
    pub(crate) async fn submit(
        &mut self,
        kind: IoKind,
        offset: u64,
        length: u32,
        payload: Option<&[u8]>,
    ) -> crate::Result<u64> {
        self.validate(kind, offset, length, payload)?;

        let cookie = self.allocate_cookie();
        let header = Header {
            flags: CommandFlags::empty(),
            kind,
            cookie,
            offset,
            length,
        };

        let frame = match kind {
            IoKind::Read => Frame::ReadRequest(header),
            IoKind::Write => Frame::WriteRequest(header, payload.unwrap_or_default()),
            IoKind::Flush => Frame::FlushRequest(header),
            IoKind::Trim => Frame::TrimRequest(header),
            IoKind::Disconnect => Frame::Disconnect(header),
        };

        frame.write(&mut self.stream).await?;
        self.stream.flush().await?;

        trace!("submitted {kind:?} cookie {cookie}, offset {offset}, length {length}");

        // Disconnect never receives a reply, so it is not tracked.
        if kind != IoKind::Disconnect {
            self.inflight.commands.insert(
                cookie,
                Pending {
                    kind,
                    offset,
                    length,
                    state: PendingState::Waiting,
                    assembly: Assembly::default(),
                },
            );
        }

        Ok(cookie)
    }

    /// Reads exactly one reply message from the stream and applies it to the
    /// in-flight table, returning any completions it produced. Completions
    /// for abandoned commands are discarded rather than returned. Reply order
    /// need not match submission order.
    pub(crate) async fn poll_replies(&mut self) -> crate::Result<Vec<Completion>> {
        let reply = match self.read_reply().await? {
            Some(reply) => reply,
            None => {
                return Err(crate::Error::ConnectionLost(
                    "server closed connection with commands in flight".to_string(),
                ))
            }
        };

        let mut completions = Vec::new();
        if let Some(completion) = self.apply(reply)? {
            completions.push(completion);
        }

        Ok(completions)
    }

    /// Best-effort cancellation: takes effect only if no reply bytes for
    /// `cookie` have been observed yet. Returns true if the command was
    /// abandoned.
    pub(crate) fn cancel(&mut self, cookie: u64) -> bool {
        match self.inflight.commands.get_mut(&cookie) {
            Some(pending) if pending.state == PendingState::Waiting => {
                pending.state = PendingState::Abandoned;
                true
            }
            _ => false,
        }
    }

    /// Unconditionally abandons `cookie`, for callers whose deadline elapsed.
    /// The command stays in the table for reply framing; its completion is
    /// discarded on arrival.
    pub(crate) fn abandon(&mut self, cookie: u64) {
        if let Some(pending) = self.inflight.commands.get_mut(&cookie) {
            pending.state = PendingState::Abandoned;
        }
    }

    /// Completes every in-flight command with `ConnectionLost`, returning the
    /// completions for non-abandoned commands. Called when the stream fails.
    pub(crate) fn fail_all(&mut self, reason: &str) -> Vec<Completion> {
        let mut completions = Vec::new();
        for (cookie, pending) in self.inflight.commands.drain() {
            if pending.state == PendingState::Abandoned {
                continue;
            }

            completions.push(Completion {
                cookie,
                kind: pending.kind,
                result: Err(crate::Error::ConnectionLost(reason.to_string())),
            });
        }

        completions
    }

    /// Sends a disconnect request, after which the server will not read
    /// further commands.
    pub(crate) async fn disconnect(&mut self) -> crate::Result<()> {
        self.submit(IoKind::Disconnect, 0, 0, None).await?;
        Ok(())
    }

    /// Shuts down the write half of the stream, flushing buffered data.
    pub(crate) async fn shutdown(&mut self) -> crate::Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Validates a command locally before it is put on the wire, failing
    /// fast with the errno the server would reply with.
    fn validate(
        &self,
        kind: IoKind,
        offset: u64,
        length: u32,
        payload: Option<&[u8]>,
    ) -> crate::Result<()> {
        let reject = |code| Err(crate::Error::OperationFailed { code, offset: None });

        if offset.checked_add(u64::from(length)).is_none() {
            return reject(NBD_EINVAL);
        }

        match kind {
            IoKind::Read | IoKind::Write if length as usize > MAX_IO_LENGTH => {
                return reject(NBD_EOVERFLOW)
            }
            _ => {}
        }

        match kind {
            IoKind::Write => {
                if payload.map(<[u8]>::len) != Some(length as usize) {
                    return reject(NBD_EINVAL);
                }
                if self.export_flags.contains(TransmissionFlags::READ_ONLY) {
                    return reject(NBD_EPERM);
                }
            }
            IoKind::Trim => {
                if self.export_flags.contains(TransmissionFlags::READ_ONLY) {
                    return reject(NBD_EPERM);
                }
                if !self.export_flags.contains(TransmissionFlags::SEND_TRIM) {
                    return reject(NBD_ENOTSUP);
                }
            }
            IoKind::Flush => {
                if !self.export_flags.contains(TransmissionFlags::SEND_FLUSH) {
                    return reject(NBD_ENOTSUP);
                }
            }
            IoKind::Read | IoKind::Disconnect => {}
        }

        Ok(())
    }

    /// Allocates a cookie not currently in use by an outstanding command.
    fn allocate_cookie(&mut self) -> u64 {
        loop {
            let cookie = self.next_cookie;
            // Zero is never a valid cookie.
            self.next_cookie = self.next_cookie.wrapping_add(1).max(1);

            if !self.inflight.commands.contains_key(&cookie) {
                return cookie;
            }
        }
    }

    /// Reads a single `Reply` from the underlying stream.
    async fn read_reply(&mut self) -> crate::Result<Option<Reply>> {
        loop {
            if let Some(reply) = self.parse_reply()? {
                // We read enough data to parse an entire reply, return it now.
                return Ok(Some(reply));
            }

            // There is not enough buffered data to read a reply. Attempt to
            // read more data from the socket. 0 indicates "end of stream".
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                // The remote closed the connection.
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Err(crate::Error::Malformed(
                        "connection reset with partial reply buffered".to_string(),
                    ));
                }
            }
        }
    }

    /// Try to parse a single `Reply` but also terminate early with an
    /// incomplete error if we need to read more data from the stream.
    fn parse_reply(&mut self) -> crate::Result<Option<Reply>> {
        use crate::frame::Error::Incomplete;

        let mut buf = Cursor::new(&self.buffer[..]);
        match Reply::check(&mut buf, &self.inflight) {
            Ok(_) => {
                // Found a reply, reset the cursor, parse the entire Reply,
                // then advance the cursor beyond it for the next read.
                let len = buf.position() as usize;

                buf.set_position(0);
                let reply = Reply::parse(&mut buf, &self.inflight)?;

                self.buffer.advance(len);
                Ok(Some(reply))
            }
            // Not enough data for an entire Reply.
            Err(Incomplete) => Ok(None),
            // Failed to parse.
            Err(e) => Err(e.into()),
        }
    }

    /// Applies one decoded reply to the in-flight table. Returns a completion
    /// when the reply finishes a command the caller still wants.
    fn apply(&mut self, reply: Reply) -> crate::Result<Option<Completion>> {
        match reply {
            Reply::Simple {
                cookie,
                errno,
                data,
            } => {
                let pending = self.remove(cookie)?;

                let result = if errno == NBD_OK {
                    Ok(data)
                } else {
                    Err(crate::Error::OperationFailed {
                        code: errno,
                        offset: None,
                    })
                };

                Ok(self.complete(cookie, pending, result))
            }
            Reply::Chunk(chunk) => self.apply_chunk(chunk),
        }
    }

    /// Folds one structured reply chunk into its command's assembly,
    /// completing the command when the final chunk is observed.
    fn apply_chunk(&mut self, chunk: Chunk) -> crate::Result<Option<Completion>> {
        if !self.structured {
            return Err(crate::Error::Malformed(
                "server sent a structured reply chunk without negotiation".to_string(),
            ));
        }

        let Chunk {
            cookie,
            done,
            payload,
        } = chunk;

        // Take the command out of the table while the chunk is folded in;
        // it is reinserted unless this was the final chunk.
        let mut pending = self.remove(cookie)?;

        if pending.state == PendingState::Waiting {
            pending.state = PendingState::Replying;
        }

        match payload {
            ChunkPayload::None => {}
            ChunkPayload::OffsetData { offset, data } => {
                if pending.kind != IoKind::Read {
                    return Err(crate::Error::Malformed(
                        "server sent a data chunk for a non-read command".to_string(),
                    ));
                }

                let start = Self::chunk_range(&pending, offset, data.len())?;
                if pending.assembly.data.is_empty() {
                    pending.assembly.data = vec![0u8; pending.length as usize];
                }
                pending.assembly.data[start..start + data.len()].copy_from_slice(&data);
            }
            ChunkPayload::OffsetHole { offset, length } => {
                if pending.kind != IoKind::Read {
                    return Err(crate::Error::Malformed(
                        "server sent a hole chunk for a non-read command".to_string(),
                    ));
                }

                // The assembly buffer reads as zeroes already; only the range
                // needs validation.
                Self::chunk_range(&pending, offset, length as usize)?;
                if pending.assembly.data.is_empty() {
                    pending.assembly.data = vec![0u8; pending.length as usize];
                }
            }
            ChunkPayload::Error {
                errno,
                message,
                offset,
            } => {
                if !message.is_empty() {
                    warn!("server error for cookie {cookie}: {message}");
                }

                // The first error wins; later chunks may still arrive before
                // the terminating chunk.
                if pending.assembly.error.is_none() {
                    pending.assembly.error = Some((errno, offset));
                }
            }
        }

        if !done {
            self.inflight.commands.insert(cookie, pending);
            return Ok(None);
        }

        let result = match pending.assembly.error.take() {
            Some((code, offset)) => Err(crate::Error::OperationFailed { code, offset }),
            None => Ok(std::mem::take(&mut pending.assembly.data)),
        };

        Ok(self.complete(cookie, pending, result))
    }

    /// Validates that a chunk's absolute range lies within its command's
    /// requested window, returning the relative start offset.
    fn chunk_range(pending: &Pending, offset: u64, len: usize) -> crate::Result<usize> {
        let start = offset
            .checked_sub(pending.offset)
            .ok_or_else(|| chunk_bounds_error(pending, offset))?;

        match start.checked_add(len as u64) {
            Some(end) if end <= u64::from(pending.length) => Ok(start as usize),
            _ => Err(chunk_bounds_error(pending, offset)),
        }
    }

    /// Produces a completion for a finished command, or discards it if the
    /// caller abandoned the command.
    fn complete(
        &mut self,
        cookie: u64,
        pending: Pending,
        result: crate::Result<Vec<u8>>,
    ) -> Option<Completion> {
        if pending.state == PendingState::Abandoned {
            trace!("discarding completion for abandoned cookie {cookie}");
            return None;
        }

        trace!("completed {:?} cookie {cookie}", pending.kind);

        Some(Completion {
            cookie,
            kind: pending.kind,
            result,
        })
    }

    /// Removes a command from the in-flight table for a simple reply.
    fn remove(&mut self, cookie: u64) -> crate::Result<Pending> {
        self.inflight.commands.remove(&cookie).ok_or_else(|| {
            crate::Error::Malformed(format!("server sent a reply for unknown cookie {cookie}"))
        })
    }
}

/// Builds the error for a structured chunk which escapes its command's range.
fn chunk_bounds_error(pending: &Pending, offset: u64) -> crate::Error {
    crate::Error::Malformed(format!(
        "chunk at offset {offset} escapes request window at offset {}, length {}",
        pending.offset, pending.length
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    /// Builds a multiplexer over an in-memory pipe, handing back the server
    /// half for scripting raw bytes.
    fn connection(structured: bool) -> (IoConnection<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let flags = TransmissionFlags::HAS_FLAGS
            | TransmissionFlags::SEND_FLUSH
            | TransmissionFlags::SEND_TRIM;

        (
            IoConnection::new(RawConnection::new(client), flags, structured),
            server,
        )
    }

    /// Builds a simple reply for `cookie` carrying `data`.
    fn simple_reply(cookie: u64, errno: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = vec![];
        buf.extend_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf.extend_from_slice(&errno.to_be_bytes());
        buf.extend_from_slice(&cookie.to_be_bytes());
        buf.extend_from_slice(data);
        buf
    }

    /// Builds a structured chunk for `cookie` with raw `chunk_type` and
    /// payload bytes.
    fn chunk(cookie: u64, done: bool, chunk_type: u16, payload: &[u8]) -> Vec<u8> {
        let flags = if done { NBD_REPLY_FLAG_DONE } else { 0 };

        let mut buf = vec![];
        buf.extend_from_slice(&NBD_STRUCTURED_REPLY_MAGIC.to_be_bytes());
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&chunk_type.to_be_bytes());
        buf.extend_from_slice(&cookie.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Reads and discards one request frame plus `payload` trailing bytes,
    /// returning the request's cookie.
    async fn read_request(server: &mut tokio::io::DuplexStream, payload: usize) -> u64 {
        let mut buf = vec![0u8; 28 + payload];
        server
            .read_exact(&mut buf)
            .await
            .expect("failed to read request");

        u64::from_be_bytes(buf[8..16].try_into().expect("invalid cookie bytes"))
    }

    #[tokio::test]
    async fn replies_out_of_submission_order() {
        let (mut conn, mut server) = connection(false);

        let cookie_a = conn
            .submit(IoKind::Read, 0, 2, None)
            .await
            .expect("failed to submit first read");
        let cookie_b = conn
            .submit(IoKind::Read, 2, 2, None)
            .await
            .expect("failed to submit second read");

        assert_ne!(cookie_a, cookie_b, "cookies must be distinct");

        assert_eq!(read_request(&mut server, 0).await, cookie_a);
        assert_eq!(read_request(&mut server, 0).await, cookie_b);

        // Answer B before A; each caller must still receive its own bytes.
        server
            .write_all(&simple_reply(cookie_b, NBD_OK, &[3, 4]))
            .await
            .expect("failed to write reply");
        server
            .write_all(&simple_reply(cookie_a, NBD_OK, &[1, 2]))
            .await
            .expect("failed to write reply");

        let first = conn.poll_replies().await.expect("failed to poll replies");
        let second = conn.poll_replies().await.expect("failed to poll replies");

        assert_eq!(first[0].cookie, cookie_b);
        assert_eq!(
            first[0].result.as_deref().expect("read B failed"),
            &[3, 4],
            "read B returned the wrong bytes"
        );
        assert_eq!(second[0].cookie, cookie_a);
        assert_eq!(
            second[0].result.as_deref().expect("read A failed"),
            &[1, 2],
            "read A returned the wrong bytes"
        );
        assert_eq!(conn.outstanding(), 0);
    }

    #[tokio::test]
    async fn structured_read_assembles_chunks() {
        let (mut conn, mut server) = connection(true);

        let cookie = conn
            .submit(IoKind::Read, 512, 8, None)
            .await
            .expect("failed to submit read");
        read_request(&mut server, 0).await;

        // Two data chunks covering disjoint ranges, then a bare terminator.
        let mut first = 512u64.to_be_bytes().to_vec();
        first.extend_from_slice(&[1, 2, 3, 4]);
        let mut second = 516u64.to_be_bytes().to_vec();
        second.extend_from_slice(&[5, 6, 7, 8]);

        let script = [
            chunk(cookie, false, NBD_REPLY_TYPE_OFFSET_DATA, &first),
            chunk(cookie, false, NBD_REPLY_TYPE_OFFSET_DATA, &second),
            chunk(cookie, true, NBD_REPLY_TYPE_NONE, &[]),
        ]
        .concat();
        server
            .write_all(&script)
            .await
            .expect("failed to write chunks");

        // The first two chunks do not complete the command.
        assert!(conn.poll_replies().await.expect("poll failed").is_empty());
        assert!(conn.poll_replies().await.expect("poll failed").is_empty());

        let completions = conn.poll_replies().await.expect("poll failed");
        assert_eq!(completions[0].cookie, cookie);
        assert_eq!(
            completions[0].result.as_deref().expect("read failed"),
            &[1, 2, 3, 4, 5, 6, 7, 8],
            "assembled bytes out of offset order"
        );
    }

    #[tokio::test]
    async fn structured_error_chunk_fails_command() {
        let (mut conn, mut server) = connection(true);

        let cookie = conn
            .submit(IoKind::Read, 0, 4, None)
            .await
            .expect("failed to submit read");
        read_request(&mut server, 0).await;

        // errno, message length, message, then offset.
        let mut payload = NBD_EIO.to_be_bytes().to_vec();
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&2u64.to_be_bytes());

        server
            .write_all(&chunk(cookie, true, NBD_REPLY_TYPE_ERROR_OFFSET, &payload))
            .await
            .expect("failed to write chunk");

        let completions = conn.poll_replies().await.expect("poll failed");
        match &completions[0].result {
            Err(crate::Error::OperationFailed { code, offset }) => {
                assert_eq!(*code, NBD_EIO);
                assert_eq!(*offset, Some(2));
            }
            res => panic!("expected operation failed, got: {res:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_before_reply_discards_completion() {
        let (mut conn, mut server) = connection(false);

        let cookie = conn
            .submit(IoKind::Read, 0, 2, None)
            .await
            .expect("failed to submit read");
        read_request(&mut server, 0).await;

        assert!(conn.cancel(cookie), "cancel should succeed before a reply");
        // A second cancel is a no-op.
        assert!(!conn.cancel(cookie));

        server
            .write_all(&simple_reply(cookie, NBD_OK, &[1, 2]))
            .await
            .expect("failed to write reply");

        // The reply is consumed for framing but its completion is dropped.
        let completions = conn.poll_replies().await.expect("poll failed");
        assert!(completions.is_empty(), "cancelled completion was delivered");
        assert_eq!(conn.outstanding(), 0);
    }

    #[tokio::test]
    async fn validation_failures_stay_local() {
        let (mut conn, _server) = connection(false);

        // offset + length overflows.
        match conn.submit(IoKind::Read, u64::MAX, 2, None).await {
            Err(crate::Error::OperationFailed { code, .. }) => assert_eq!(code, NBD_EINVAL),
            res => panic!("expected EINVAL, got: {res:?}"),
        }

        // Write payload length mismatch.
        match conn.submit(IoKind::Write, 0, 4, Some(&[1, 2])).await {
            Err(crate::Error::OperationFailed { code, .. }) => assert_eq!(code, NBD_EINVAL),
            res => panic!("expected EINVAL, got: {res:?}"),
        }

        assert_eq!(conn.outstanding(), 0, "rejected commands must not be tracked");
    }

    #[tokio::test]
    async fn readonly_export_rejects_writes() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let mut conn = IoConnection::new(
            RawConnection::new(client),
            TransmissionFlags::HAS_FLAGS | TransmissionFlags::READ_ONLY,
            false,
        );

        match conn.submit(IoKind::Write, 0, 2, Some(&[1, 2])).await {
            Err(crate::Error::OperationFailed { code, .. }) => assert_eq!(code, NBD_EPERM),
            res => panic!("expected EPERM, got: {res:?}"),
        }

        match conn.submit(IoKind::Flush, 0, 0, None).await {
            Err(crate::Error::OperationFailed { code, .. }) => assert_eq!(code, NBD_ENOTSUP),
            res => panic!("expected ENOTSUP, got: {res:?}"),
        }
    }

    #[tokio::test]
    async fn connection_loss_fails_inflight_commands() {
        let (mut conn, mut server) = connection(false);

        let cookie = conn
            .submit(IoKind::Read, 0, 2, None)
            .await
            .expect("failed to submit read");
        read_request(&mut server, 0).await;
        drop(server);

        match conn.poll_replies().await {
            Err(crate::Error::ConnectionLost(..)) => {}
            res => panic!("expected connection lost, got: {res:?}"),
        }

        let completions = conn.fail_all("stream failed");
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].cookie, cookie);
        match &completions[0].result {
            Err(crate::Error::ConnectionLost(..)) => {}
            res => panic!("expected connection lost completion, got: {res:?}"),
        }
    }
}
