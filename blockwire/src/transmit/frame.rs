use bitflags::bitflags;
use std::io::{self, Cursor};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::consts::*;
use crate::frame::*;

/// The type of a reply for error reporting.
#[derive(Copy, Clone, Debug)]
pub enum ReplyType {
    Simple,
    Structured,
}

/// The kind of I/O operation a command performs.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum IoKind {
    Read = NBD_CMD_READ,
    Write = NBD_CMD_WRITE,
    Disconnect = NBD_CMD_DISC,
    Flush = NBD_CMD_FLUSH,
    Trim = NBD_CMD_TRIM,
}

bitflags! {
    /// An I/O command flag present in a `Header`.
    pub(crate) struct CommandFlags: u16 {
        const FUA = NBD_CMD_FLAG_FUA;
    }
}

/// The header for each data transmission request.
#[derive(Debug, PartialEq)]
pub(crate) struct Header {
    pub(crate) flags: CommandFlags,
    pub(crate) kind: IoKind,
    pub(crate) cookie: u64,
    pub(crate) offset: u64,
    pub(crate) length: u32,
}

/// An opaque value used to carry data trailing a `Header` in write requests.
type Data<'a> = &'a [u8];

/// An NBD transmission request frame sent to the server. Note that the frame
/// types here do not necessarily correspond to the NBD specification, but are
/// used to chunk up logical operations in this library.
#[derive(Debug)]
pub(crate) enum Frame<'a> {
    Disconnect(Header),
    ReadRequest(Header),
    WriteRequest(Header, Data<'a>),
    FlushRequest(Header),
    TrimRequest(Header),
}

impl<'a> Frame<'a> {
    /// Writes the current `Frame` out to `dst`. It returns `Some(())` if any
    /// bytes were written to the stream or `None` if not.
    pub(crate) async fn write<S: AsyncWrite + Unpin>(self, dst: &mut S) -> io::Result<Option<()>> {
        let (header, body) = match &self {
            Self::Disconnect(header)
            | Self::ReadRequest(header)
            | Self::FlushRequest(header)
            | Self::TrimRequest(header) => (header, None),
            Self::WriteRequest(header, body) => (header, Some(*body)),
        };

        dst.write_u32(NBD_REQUEST_MAGIC).await?;
        dst.write_u16(header.flags.bits()).await?;
        dst.write_u16(header.kind as u16).await?;
        dst.write_u64(header.cookie).await?;
        dst.write_u64(header.offset).await?;
        dst.write_u32(header.length).await?;

        if let Some(body) = body {
            dst.write_all(body).await?;
        }

        Ok(Some(()))
    }
}

/// A single reply message read off the wire, not yet matched to an
/// outstanding command.
#[derive(Debug, PartialEq)]
pub(crate) enum Reply {
    /// A simple reply: an errno, plus the payload for a successful read.
    Simple {
        cookie: u64,
        errno: u32,
        data: Vec<u8>,
    },
    /// One structured reply chunk; a command may span several.
    Chunk(Chunk),
}

impl Reply {
    /// Returns the cookie this reply responds to.
    pub(crate) fn cookie(&self) -> u64 {
        match self {
            Self::Simple { cookie, .. } => *cookie,
            Self::Chunk(chunk) => chunk.cookie,
        }
    }
}

/// A structured reply chunk for one command.
#[derive(Debug, PartialEq)]
pub(crate) struct Chunk {
    pub(crate) cookie: u64,
    /// Set on the final chunk for a command.
    pub(crate) done: bool,
    pub(crate) payload: ChunkPayload,
}

/// The typed payload of one structured reply chunk.
#[derive(Debug, PartialEq)]
pub(crate) enum ChunkPayload {
    /// No payload; used by lone terminating chunks.
    None,
    /// Data for a portion of a read, at an absolute device offset.
    OffsetData { offset: u64, data: Vec<u8> },
    /// A hole in a read: the given range reads as zeroes.
    OffsetHole { offset: u64, length: u32 },
    /// A command error, optionally located at an absolute device offset.
    Error {
        errno: u32,
        message: String,
        offset: Option<u64>,
    },
}

/// Resolves the payload length a simple reply carries for a given cookie:
/// the request length for a read, zero for everything else, `None` for a
/// cookie that is not in flight.
pub(crate) trait PayloadLengths {
    fn simple_payload_length(&self, cookie: u64) -> Option<usize>;
}

impl Reply {
    /// Determines if enough data is available to parse a `Reply` from `src`.
    /// Simple replies to reads carry a payload with no length field of its
    /// own, so `lengths` resolves the expected count by cookie.
    pub(crate) fn check(src: &mut Cursor<&[u8]>, lengths: &impl PayloadLengths) -> Result<()> {
        match get_u32(src)? {
            NBD_SIMPLE_REPLY_MAGIC => {
                let errno = get_u32(src)?;
                let cookie = get_u64(src)?;

                let length = lengths
                    .simple_payload_length(cookie)
                    .ok_or(Error::TransmitProtocol(ReplyType::Simple))?;

                // Failed reads carry no payload.
                if errno == NBD_OK {
                    skip(src, length)?;
                }

                Ok(())
            }
            NBD_STRUCTURED_REPLY_MAGIC => {
                // Flags, type, cookie.
                get_u16(src)?;
                get_u16(src)?;
                get_u64(src)?;

                let length = get_u32(src)? as usize;
                if length > MAX_IO_LENGTH {
                    return Err(Error::TransmitProtocol(ReplyType::Structured));
                }

                skip(src, length)?;
                Ok(())
            }
            // The stream cannot be re-framed after this.
            _ => Err(Error::TransmitProtocol(ReplyType::Simple)),
        }
    }

    /// Parses the next `Reply` from `src` after a successful check.
    pub(crate) fn parse(src: &mut Cursor<&[u8]>, lengths: &impl PayloadLengths) -> Result<Reply> {
        match get_u32(src)? {
            NBD_SIMPLE_REPLY_MAGIC => {
                let errno = get_u32(src)?;
                let cookie = get_u64(src)?;

                let length = lengths
                    .simple_payload_length(cookie)
                    .ok_or(Error::TransmitProtocol(ReplyType::Simple))?;

                let mut data = vec![];
                if errno == NBD_OK && length > 0 {
                    data = vec![0u8; length];
                    get_exact(src, &mut data)?;
                }

                Ok(Reply::Simple {
                    cookie,
                    errno,
                    data,
                })
            }
            NBD_STRUCTURED_REPLY_MAGIC => {
                let flags = get_u16(src)?;
                let chunk_type = get_u16(src)?;
                let cookie = get_u64(src)?;
                let length = get_u32(src)? as usize;

                let payload = Self::parse_chunk_payload(src, chunk_type, length)?;

                Ok(Reply::Chunk(Chunk {
                    cookie,
                    done: flags & NBD_REPLY_FLAG_DONE != 0,
                    payload,
                }))
            }
            _ => Err(Error::TransmitProtocol(ReplyType::Simple)),
        }
    }

    /// Decodes a structured chunk payload according to its type.
    fn parse_chunk_payload(
        src: &mut Cursor<&[u8]>,
        chunk_type: u16,
        length: usize,
    ) -> Result<ChunkPayload> {
        match chunk_type {
            NBD_REPLY_TYPE_NONE => {
                if length != 0 {
                    return Err(Error::TransmitProtocol(ReplyType::Structured));
                }

                Ok(ChunkPayload::None)
            }
            NBD_REPLY_TYPE_OFFSET_DATA => {
                if length < 8 {
                    return Err(Error::TransmitProtocol(ReplyType::Structured));
                }

                let offset = get_u64(src)?;
                let mut data = vec![0u8; length - 8];
                get_exact(src, &mut data)?;

                Ok(ChunkPayload::OffsetData { offset, data })
            }
            NBD_REPLY_TYPE_OFFSET_HOLE => {
                // Fixed length.
                if length != 12 {
                    return Err(Error::TransmitProtocol(ReplyType::Structured));
                }

                let offset = get_u64(src)?;
                let hole = get_u32(src)?;

                Ok(ChunkPayload::OffsetHole {
                    offset,
                    length: hole,
                })
            }
            NBD_REPLY_TYPE_ERROR | NBD_REPLY_TYPE_ERROR_OFFSET => {
                if length < 6 {
                    return Err(Error::TransmitProtocol(ReplyType::Structured));
                }

                let errno = get_u32(src)?;
                let message_length = get_u16(src)? as usize;
                if message_length > MAX_OPTION_LENGTH {
                    return Err(Error::TransmitProtocol(ReplyType::Structured));
                }

                let mut message = vec![0u8; message_length];
                get_exact(src, &mut message)?;
                let message = String::from_utf8(message)
                    .map_err(|_err| Error::TransmitProtocol(ReplyType::Structured))?;

                let (offset, want_length) = if chunk_type == NBD_REPLY_TYPE_ERROR_OFFSET {
                    (Some(get_u64(src)?), 6 + message_length + 8)
                } else {
                    (None, 6 + message_length)
                };

                if length != want_length {
                    return Err(Error::TransmitProtocol(ReplyType::Structured));
                }

                Ok(ChunkPayload::Error {
                    errno,
                    message,
                    offset,
                })
            }
            // An unknown chunk type cannot be safely interpreted; whether it
            // carried an error is ambiguous, so fail the stream.
            _ => Err(Error::TransmitProtocol(ReplyType::Structured)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    impl PayloadLengths for HashMap<u64, usize> {
        fn simple_payload_length(&self, cookie: u64) -> Option<usize> {
            self.get(&cookie).copied()
        }
    }

    fn read_lengths() -> HashMap<u64, usize> {
        HashMap::from([(1, 4), (2, 0)])
    }

    macro_rules! frame_write_tests {
        ($($name:ident: $value:expr,)*) => {
        $(
            #[tokio::test]
            async fn $name() {
                let (frame, want) = $value;
                let frame_msg = format!("{:?}", frame);

                let mut got = vec![];
                frame.write(&mut got).await.expect("failed to write frame");

                assert_eq!(
                    &want[..],
                    &got[..],
                    "unexpected frame bytes for {}",
                    frame_msg
                );
            }
        )*
        }
    }

    frame_write_tests! {
        read_request: (
            Frame::ReadRequest(Header {
                flags: CommandFlags::empty(),
                kind: IoKind::Read,
                cookie: 1,
                offset: 512,
                length: 4,
            }),
            vec![
                // Magic.
                0x25, 0x60, 0x95, 0x13,
                // Flags, read command.
                0, 0, 0, 0,
                // Cookie.
                0, 0, 0, 0, 0, 0, 0, 1,
                // Offset.
                0, 0, 0, 0, 0, 0, 2, 0,
                // Length.
                0, 0, 0, 4,
            ],
        ),
        write_request: (
            Frame::WriteRequest(
                Header {
                    flags: CommandFlags::FUA,
                    kind: IoKind::Write,
                    cookie: 2,
                    offset: 0,
                    length: 4,
                },
                &[0xaa, 0xbb, 0xcc, 0xdd],
            ),
            vec![
                0x25, 0x60, 0x95, 0x13,
                // FUA flag, write command.
                0, 1, 0, 1,
                0, 0, 0, 0, 0, 0, 0, 2,
                0, 0, 0, 0, 0, 0, 0, 0,
                0, 0, 0, 4,
                // Payload.
                0xaa, 0xbb, 0xcc, 0xdd,
            ],
        ),
        flush_request: (
            Frame::FlushRequest(Header {
                flags: CommandFlags::empty(),
                kind: IoKind::Flush,
                cookie: 3,
                offset: 0,
                length: 0,
            }),
            vec![
                0x25, 0x60, 0x95, 0x13,
                0, 0, 0, 3,
                0, 0, 0, 0, 0, 0, 0, 3,
                0, 0, 0, 0, 0, 0, 0, 0,
                0, 0, 0, 0,
            ],
        ),
        trim_request: (
            Frame::TrimRequest(Header {
                flags: CommandFlags::empty(),
                kind: IoKind::Trim,
                cookie: 4,
                offset: 1024,
                length: 512,
            }),
            vec![
                0x25, 0x60, 0x95, 0x13,
                0, 0, 0, 4,
                0, 0, 0, 0, 0, 0, 0, 4,
                0, 0, 0, 0, 0, 0, 4, 0,
                0, 0, 2, 0,
            ],
        ),
        disconnect_request: (
            Frame::Disconnect(Header {
                flags: CommandFlags::empty(),
                kind: IoKind::Disconnect,
                cookie: 5,
                offset: 0,
                length: 0,
            }),
            vec![
                0x25, 0x60, 0x95, 0x13,
                0, 0, 0, 2,
                0, 0, 0, 0, 0, 0, 0, 5,
                0, 0, 0, 0, 0, 0, 0, 0,
                0, 0, 0, 0,
            ],
        ),
    }

    macro_rules! reply_read_tests {
        ($($name:ident: $value:expr,)*) => {
        $(
            #[test]
            fn $name() {
                let (buf, want) = $value;
                let lengths = read_lengths();
                let mut src = Cursor::new(&buf[..]);

                Reply::check(&mut src, &lengths).expect("failed to check reply");
                src.set_position(0);

                let got = Reply::parse(&mut src, &lengths).expect("failed to parse reply");
                assert_eq!(want, got, "unexpected reply contents");
            }
        )*
        }
    }

    reply_read_tests! {
        simple_reply_read_ok: (
            vec![
                // Magic.
                0x67, 0x44, 0x66, 0x98,
                // No error.
                0, 0, 0, 0,
                // Cookie 1: a 4 byte read.
                0, 0, 0, 0, 0, 0, 0, 1,
                // Payload.
                1, 2, 3, 4,
            ],
            Reply::Simple {
                cookie: 1,
                errno: NBD_OK,
                data: vec![1, 2, 3, 4],
            },
        ),
        simple_reply_read_error_no_payload: (
            vec![
                0x67, 0x44, 0x66, 0x98,
                // EIO.
                0, 0, 0, 5,
                0, 0, 0, 0, 0, 0, 0, 1,
            ],
            Reply::Simple {
                cookie: 1,
                errno: NBD_EIO,
                data: vec![],
            },
        ),
        simple_reply_flush_ok: (
            vec![
                0x67, 0x44, 0x66, 0x98,
                0, 0, 0, 0,
                // Cookie 2: no payload.
                0, 0, 0, 0, 0, 0, 0, 2,
            ],
            Reply::Simple {
                cookie: 2,
                errno: NBD_OK,
                data: vec![],
            },
        ),
        chunk_offset_data: (
            vec![
                // Magic.
                0x66, 0x8e, 0x33, 0xef,
                // Flags: none; type: offset data.
                0, 0, 0, 1,
                0, 0, 0, 0, 0, 0, 0, 1,
                // Length: offset plus two bytes.
                0, 0, 0, 10,
                // Offset.
                0, 0, 0, 0, 0, 0, 0, 2,
                // Data.
                0xaa, 0xbb,
            ],
            Reply::Chunk(Chunk {
                cookie: 1,
                done: false,
                payload: ChunkPayload::OffsetData {
                    offset: 2,
                    data: vec![0xaa, 0xbb],
                },
            }),
        ),
        chunk_offset_hole: (
            vec![
                0x66, 0x8e, 0x33, 0xef,
                // Flags: done; type: offset hole.
                0, 1, 0, 2,
                0, 0, 0, 0, 0, 0, 0, 1,
                0, 0, 0, 12,
                0, 0, 0, 0, 0, 0, 2, 0,
                0, 0, 2, 0,
            ],
            Reply::Chunk(Chunk {
                cookie: 1,
                done: true,
                payload: ChunkPayload::OffsetHole {
                    offset: 512,
                    length: 512,
                },
            }),
        ),
        chunk_none_done: (
            vec![
                0x66, 0x8e, 0x33, 0xef,
                // Flags: done; type: none.
                0, 1, 0, 0,
                0, 0, 0, 0, 0, 0, 0, 1,
                0, 0, 0, 0,
            ],
            Reply::Chunk(Chunk {
                cookie: 1,
                done: true,
                payload: ChunkPayload::None,
            }),
        ),
        chunk_error: (
            [
                vec![
                    0x66, 0x8e, 0x33, 0xef,
                    // Flags: done; type: error.
                    0, 1, 0x80, 1,
                    0, 0, 0, 0, 0, 0, 0, 2,
                    // Length: errno, message length, message.
                    0, 0, 0, 10,
                    // EIO.
                    0, 0, 0, 5,
                    // Message.
                    0, 4,
                ],
                b"oops".to_vec(),
            ].concat(),
            Reply::Chunk(Chunk {
                cookie: 2,
                done: true,
                payload: ChunkPayload::Error {
                    errno: NBD_EIO,
                    message: "oops".to_string(),
                    offset: None,
                },
            }),
        ),
        chunk_error_offset: (
            [
                vec![
                    0x66, 0x8e, 0x33, 0xef,
                    // Flags: done; type: error with offset.
                    0, 1, 0x80, 2,
                    0, 0, 0, 0, 0, 0, 0, 2,
                    0, 0, 0, 18,
                    0, 0, 0, 5,
                    0, 4,
                ],
                b"oops".to_vec(),
                vec![0, 0, 0, 0, 0, 0, 2, 0],
            ].concat(),
            Reply::Chunk(Chunk {
                cookie: 2,
                done: true,
                payload: ChunkPayload::Error {
                    errno: NBD_EIO,
                    message: "oops".to_string(),
                    offset: Some(512),
                },
            }),
        ),
    }

    #[test]
    fn reply_unknown_cookie() {
        let buf = vec![
            0x67, 0x44, 0x66, 0x98,
            0, 0, 0, 0,
            // Cookie 99 is not in flight; the expected payload length for
            // this reply cannot be known.
            0, 0, 0, 0, 0, 0, 0, 99,
        ];
        let mut src = Cursor::new(&buf[..]);

        match Reply::check(&mut src, &read_lengths()) {
            Err(Error::TransmitProtocol(..)) => {}
            res => panic!("expected transmit protocol error, got: {res:?}"),
        }
    }

    #[test]
    fn reply_bad_magic() {
        let buf = vec![0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0];
        let mut src = Cursor::new(&buf[..]);

        match Reply::check(&mut src, &read_lengths()) {
            Err(Error::TransmitProtocol(..)) => {}
            res => panic!("expected transmit protocol error, got: {res:?}"),
        }
    }

    #[test]
    fn reply_truncated_payload() {
        let buf = vec![
            0x67, 0x44, 0x66, 0x98,
            0, 0, 0, 0,
            // Cookie 1 expects 4 payload bytes; only two are present.
            0, 0, 0, 0, 0, 0, 0, 1,
            1, 2,
        ];
        let mut src = Cursor::new(&buf[..]);

        match Reply::check(&mut src, &read_lengths()) {
            Err(Error::Incomplete) => {}
            res => panic!("expected incomplete, got: {res:?}"),
        }
    }

    #[test]
    fn chunk_oversized_length() {
        let buf = vec![
            0x66, 0x8e, 0x33, 0xef,
            0, 0, 0, 1,
            0, 0, 0, 0, 0, 0, 0, 1,
            // Length beyond any sane I/O payload.
            0x7f, 0xff, 0xff, 0xff,
        ];
        let mut src = Cursor::new(&buf[..]);

        match Reply::check(&mut src, &read_lengths()) {
            Err(Error::TransmitProtocol(..)) => {}
            res => panic!("expected transmit protocol error, got: {res:?}"),
        }
    }
}
