use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::io::{self, Write};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::consts::*;
use crate::frame::*;

/// Information about a Network Block Device export as negotiated with a
/// server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExportInfo {
    pub name: String,
    pub description: String,
    pub size: u64,
    /// Preferred block size, when the server reported one.
    pub block_size: Option<u32>,
    pub flags: TransmissionFlags,
}

impl ExportInfo {
    /// Returns true if the export rejects writes.
    pub fn readonly(&self) -> bool {
        self.flags.contains(TransmissionFlags::READ_ONLY)
    }

    /// Returns true if the export accepts flush commands.
    pub fn supports_flush(&self) -> bool {
        self.flags.contains(TransmissionFlags::SEND_FLUSH)
    }

    /// Returns true if the export accepts trim commands.
    pub fn supports_trim(&self) -> bool {
        self.flags.contains(TransmissionFlags::SEND_TRIM)
    }

    /// Returns true if the server allows multiple connections to this export.
    pub fn multi_conn(&self) -> bool {
        self.flags.contains(TransmissionFlags::CAN_MULTI_CONN)
    }
}

/// A named export as enumerated by a list request, along with free-form
/// server metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct ListedExport {
    pub name: String,
    pub metadata: String,
}

/// Denotes the expected type of a `Frame` without knowledge of its associated
/// data.
#[derive(Copy, Clone, Debug)]
pub enum FrameType {
    ServerGreeting,
    OptionReply,
    ExportAck {
        /// Whether the no-zeroes flag was negotiated. Servers which did not
        /// negotiate it append legacy zero padding to the acknowledgement.
        no_zeroes: bool,
    },
}

/// An NBD handshake data frame as seen from the client side. Note that the
/// frame types here do not necessarily correspond to the NBD specification,
/// but are used to chunk up logical operations in this library.
#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    ServerGreeting(Greeting),
    ClientFlags(ClientFlags),
    OptionRequest(OptionRequest),
    OptionReply(OptionReply),
    ExportAck(ExportAck),
}

/// The server's opening preamble, which selects the handshake flavor for the
/// rest of the negotiation.
#[derive(Debug, PartialEq)]
pub(crate) enum Greeting {
    /// A newstyle server; option negotiation follows. Whether the fixed
    /// newstyle dialect applies is carried in the flags.
    Newstyle(HandshakeFlags),
    /// An oldstyle server; the default export's attributes arrive in the
    /// greeting itself and no option negotiation takes place.
    Oldstyle { size: u64, flags: TransmissionFlags },
}

bitflags! {
    /// Valid bitflags for a server handshake.
    pub(crate) struct HandshakeFlags: u16 {
        const FIXED_NEWSTYLE = NBD_FLAG_FIXED_NEWSTYLE;
        const NO_ZEROES      = NBD_FLAG_NO_ZEROES;
    }

    /// Valid bitflags for a client handshake.
    pub(crate) struct ClientFlags: u32 {
        const FIXED_NEWSTYLE = NBD_FLAG_C_FIXED_NEWSTYLE;
        const NO_ZEROES      = NBD_FLAG_C_NO_ZEROES;
    }

    /// Transmission capabilities advertised for an export.
    #[derive(Default)]
    pub struct TransmissionFlags: u16 {
        const HAS_FLAGS         = NBD_FLAG_HAS_FLAGS;
        const READ_ONLY         = NBD_FLAG_READ_ONLY;
        const SEND_FLUSH        = NBD_FLAG_SEND_FLUSH;
        const SEND_FUA          = NBD_FLAG_SEND_FUA;
        const ROTATIONAL        = NBD_FLAG_ROTATIONAL;
        const SEND_TRIM         = NBD_FLAG_SEND_TRIM;
        const SEND_WRITE_ZEROES = NBD_FLAG_SEND_WRITE_ZEROES;
        const SEND_DF           = NBD_FLAG_SEND_DF;
        const CAN_MULTI_CONN    = NBD_FLAG_CAN_MULTI_CONN;
        const SEND_RESIZE       = NBD_FLAG_SEND_RESIZE;
    }
}

/// The contents of known options which this client can send to a server.
#[derive(Debug, PartialEq)]
pub(crate) enum OptionRequest {
    Abort,
    /// Legacy export selection; the server answers with an `ExportAck` rather
    /// than an option reply, or disconnects on an unknown name.
    ExportName(String),
    Go(GoRequest),
    List,
    StartTls,
    StructuredReply,
}

impl OptionRequest {
    /// Returns the associated option code for `self`.
    pub(crate) fn code(&self) -> u32 {
        match self {
            Self::Abort => NBD_OPT_ABORT,
            Self::ExportName(..) => NBD_OPT_EXPORT_NAME,
            Self::Go(..) => NBD_OPT_GO,
            Self::List => NBD_OPT_LIST,
            Self::StartTls => NBD_OPT_STARTTLS,
            Self::StructuredReply => NBD_OPT_STRUCTURED_REPLY,
        }
    }
}

/// A Go or Info option as sent by a client.
#[derive(Debug, PartialEq)]
pub(crate) struct GoRequest {
    pub(crate) name: Option<String>,
    pub(crate) info_requests: Vec<InfoType>,
}

impl GoRequest {
    /// Writes the request bytes for a `GoRequest` to `dst`.
    fn write(&self, dst: &mut Vec<u8>) -> io::Result<()> {
        if let Some(name) = &self.name {
            // A name is present, write its length and the bytes if any exist.
            let length = name.len() as u32;
            Write::write_all(dst, &length.to_be_bytes())?;
            if length > 0 {
                Write::write_all(dst, name.as_bytes())?;
            }
        } else {
            Write::write_all(dst, &0u32.to_be_bytes())?;
        };

        Write::write_all(dst, &(self.info_requests.len() as u16).to_be_bytes())?;
        for info_request in &self.info_requests {
            Write::write_all(dst, &(*info_request as u16).to_be_bytes())?;
        }

        Ok(())
    }
}

/// Denotes the type of an information request from a client.
#[repr(u16)]
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
pub(crate) enum InfoType {
    Export = NBD_INFO_EXPORT,
    Name = NBD_INFO_NAME,
    Description = NBD_INFO_DESCRIPTION,
    BlockSize = NBD_INFO_BLOCK_SIZE,
}

/// A single option reply frame sent by the server. Replies to one option may
/// span several of these; the negotiator accumulates them until it observes
/// an acknowledgement or an error.
#[derive(Debug, PartialEq)]
pub(crate) struct OptionReply {
    /// The option code this reply responds to.
    pub(crate) option: u32,
    /// The raw reply code; errors have the high bit set.
    pub(crate) code: u32,
    pub(crate) body: ReplyBody,
}

impl OptionReply {
    /// Returns true if this reply carries a server-signalled error.
    pub(crate) fn is_error(&self) -> bool {
        self.code & NBD_REP_FLAG_ERROR != 0
    }

    /// Returns true if this reply is a final acknowledgement.
    pub(crate) fn is_ack(&self) -> bool {
        self.code == NBD_REP_ACK
    }
}

/// The decoded body of a single option reply frame.
#[derive(Debug, PartialEq)]
pub(crate) enum ReplyBody {
    /// A bare acknowledgement terminating the replies for one option.
    Ack,
    /// One export enumerated by a list request.
    Server(ListedExport),
    /// One piece of export information for a Go or Info request.
    Info(InfoPayload),
    /// A server-signalled error, with an optional human-readable message.
    Error(String),
    /// A success reply this client does not recognize; its body was skipped.
    Unknown,
}

/// Typed export information carried by an info reply.
#[derive(Debug, PartialEq)]
pub(crate) enum InfoPayload {
    Export { size: u64, flags: TransmissionFlags },
    Name(String),
    Description(String),
    BlockSize { min: u32, preferred: u32, max: u32 },
    /// An info type this client does not recognize; its body was skipped.
    Unknown(u16),
}

/// The server's direct answer to an export-name option: the export's size and
/// transmission flags, optionally followed by legacy zero padding.
#[derive(Debug, PartialEq)]
pub(crate) struct ExportAck {
    pub(crate) size: u64,
    pub(crate) flags: TransmissionFlags,
}

impl Frame {
    /// Determines if enough data is available to parse a `Frame` of the given
    /// `FrameType` from `src`.
    pub(crate) fn check(src: &mut io::Cursor<&[u8]>, frame_type: FrameType) -> Result<()> {
        match frame_type {
            FrameType::ServerGreeting => {
                let magic = get_u64(src)?;
                if magic != NBDMAGIC {
                    return Err(Error::UnsupportedMagic(magic));
                }

                match get_u64(src)? {
                    IHAVEOPT => {
                        // Newstyle: handshake flags follow.
                        get_u16(src)?;
                        Ok(())
                    }
                    CLISERV_MAGIC => {
                        // Oldstyle: size, flags, legacy padding.
                        get_u64(src)?;
                        get_u32(src)?;
                        skip(src, NBD_ZERO_PAD)?;
                        Ok(())
                    }
                    magic => Err(Error::UnsupportedMagic(magic)),
                }
            }
            FrameType::OptionReply => {
                if get_u64(src)? != REPLYMAGIC {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                // Option and reply codes.
                get_u32(src)?;
                get_u32(src)?;

                let length = get_u32(src)? as usize;
                if length > MAX_OPTION_LENGTH {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                skip(src, length)?;
                Ok(())
            }
            FrameType::ExportAck { no_zeroes } => {
                get_u64(src)?;
                get_u16(src)?;
                if !no_zeroes {
                    skip(src, NBD_ZERO_PAD)?;
                }
                Ok(())
            }
        }
    }

    /// Parses the next `Frame` according to the given `FrameType`.
    pub(crate) fn parse(src: &mut io::Cursor<&[u8]>, frame_type: FrameType) -> Result<Frame> {
        match frame_type {
            FrameType::ServerGreeting => {
                let magic = get_u64(src)?;
                if magic != NBDMAGIC {
                    return Err(Error::UnsupportedMagic(magic));
                }

                match get_u64(src)? {
                    IHAVEOPT => {
                        let flags = HandshakeFlags::from_bits(get_u16(src)?)
                            .ok_or(Error::HandshakeProtocol(frame_type))?;

                        Ok(Frame::ServerGreeting(Greeting::Newstyle(flags)))
                    }
                    CLISERV_MAGIC => {
                        let size = get_u64(src)?;

                        // Oldstyle flags are 32 bits on the wire but only the
                        // low half carries transmission flags.
                        let flags = TransmissionFlags::from_bits_truncate(get_u32(src)? as u16);
                        skip(src, NBD_ZERO_PAD)?;

                        Ok(Frame::ServerGreeting(Greeting::Oldstyle { size, flags }))
                    }
                    magic => Err(Error::UnsupportedMagic(magic)),
                }
            }
            FrameType::OptionReply => {
                if get_u64(src)? != REPLYMAGIC {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                let option = get_u32(src)?;
                let code = get_u32(src)?;

                let length = get_u32(src)? as usize;
                if length > MAX_OPTION_LENGTH {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                let body = Self::parse_reply_body(src, frame_type, code, length)?;

                Ok(Frame::OptionReply(OptionReply { option, code, body }))
            }
            FrameType::ExportAck { no_zeroes } => {
                let size = get_u64(src)?;

                // Tolerate transmission flag bits newer than this client.
                let flags = TransmissionFlags::from_bits_truncate(get_u16(src)?);

                if !no_zeroes {
                    // The server did not negotiate no-zeroes; consume the
                    // legacy padding without inspecting it.
                    skip(src, NBD_ZERO_PAD)?;
                }

                Ok(Frame::ExportAck(ExportAck { size, flags }))
            }
        }
    }

    /// Decodes the body of one option reply according to its reply `code`.
    fn parse_reply_body(
        src: &mut io::Cursor<&[u8]>,
        frame_type: FrameType,
        code: u32,
        length: usize,
    ) -> Result<ReplyBody> {
        if code & NBD_REP_FLAG_ERROR != 0 {
            // Error replies carry an optional human-readable message.
            return Ok(ReplyBody::Error(read_string(src, frame_type, length)?));
        }

        match code {
            NBD_REP_ACK => {
                // Acknowledgements carry no body; tolerate and discard one if
                // a server sends it anyway.
                skip(src, length)?;
                Ok(ReplyBody::Ack)
            }
            NBD_REP_SERVER => {
                if length < 4 {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                // Name length is followed by name, then any bytes after that
                // are free-form metadata.
                let name_length = get_u32(src)? as usize;
                if name_length > length - 4 {
                    return Err(Error::HandshakeProtocol(frame_type));
                }
                let meta_length = length - 4 - name_length;

                let name = read_string(src, frame_type, name_length)?;
                let metadata = read_string(src, frame_type, meta_length)?;

                Ok(ReplyBody::Server(ListedExport { name, metadata }))
            }
            NBD_REP_INFO => {
                if length < 2 {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                let raw = get_u16(src)?;
                let payload = match FromPrimitive::from_u16(raw) {
                    Some(InfoType::Export) => {
                        // Fixed length.
                        if length != 12 {
                            return Err(Error::HandshakeProtocol(frame_type));
                        }

                        let size = get_u64(src)?;
                        let flags = TransmissionFlags::from_bits_truncate(get_u16(src)?);

                        InfoPayload::Export { size, flags }
                    }
                    // length - 2 subtracts the space for the info type,
                    // leaving the string behind.
                    Some(InfoType::Name) => {
                        InfoPayload::Name(read_string(src, frame_type, length - 2)?)
                    }
                    Some(InfoType::Description) => {
                        InfoPayload::Description(read_string(src, frame_type, length - 2)?)
                    }
                    Some(InfoType::BlockSize) => {
                        // Fixed length.
                        if length != 14 {
                            return Err(Error::HandshakeProtocol(frame_type));
                        }

                        let min = get_u32(src)?;
                        let preferred = get_u32(src)?;
                        let max = get_u32(src)?;

                        InfoPayload::BlockSize {
                            min,
                            preferred,
                            max,
                        }
                    }
                    None => {
                        // Servers may send info types newer than this client;
                        // skip them without failing the negotiation.
                        skip(src, length - 2)?;
                        InfoPayload::Unknown(raw)
                    }
                };

                Ok(ReplyBody::Info(payload))
            }
            _ => {
                // An unrecognized success reply; skip its body and let the
                // negotiator decide whether that is acceptable.
                skip(src, length)?;
                Ok(ReplyBody::Unknown)
            }
        }
    }

    /// Writes the current `Frame` out to `dst`. It returns `Some(())` if any
    /// bytes were written to the stream or `None` if not.
    pub(crate) async fn write<S: AsyncWrite + Unpin>(&self, dst: &mut S) -> io::Result<Option<()>> {
        match self {
            Frame::ClientFlags(flags) => {
                dst.write_u32(flags.bits()).await?;
            }
            Frame::OptionRequest(option) => {
                dst.write_u64(IHAVEOPT).await?;
                dst.write_u32(option.code()).await?;

                // Write the option body to a vector first so we can compute
                // its length and prepend that to the body's bytes in the
                // stream.
                let mut buf = vec![];
                match option {
                    OptionRequest::ExportName(name) => {
                        Write::write_all(&mut buf, name.as_bytes())?;
                    }
                    OptionRequest::Go(req) => req.write(&mut buf)?,
                    // No body, only the option header.
                    OptionRequest::Abort
                    | OptionRequest::List
                    | OptionRequest::StartTls
                    | OptionRequest::StructuredReply => {}
                };

                let length = buf.len() as u32;
                dst.write_u32(length).await?;
                if length > 0 {
                    dst.write_all(&buf).await?;
                }
            }
            // Frames a server would write.
            Frame::ServerGreeting(..) | Frame::OptionReply(..) | Frame::ExportAck(..) => {
                return Ok(None)
            }
        }

        // Wrote some data.
        Ok(Some(()))
    }
}

/// Reads and returns a string of size `length`.
fn read_string(src: &mut io::Cursor<&[u8]>, frame_type: FrameType, length: usize) -> Result<String> {
    let mut buf = vec![0u8; length];
    get_exact(src, &mut buf)?;
    String::from_utf8(buf).map_err(|_err| Error::HandshakeProtocol(frame_type))
}


#[cfg(test)]
mod invalid_tests {
    use super::*;

    #[test]
    fn server_greeting_bad_magic() {
        let buf = [b"BADMAGIC".as_slice(), IHAVEOPT_BUF, &[0, 3]].concat();
        let mut src = io::Cursor::new(&buf[..]);

        match Frame::check(&mut src, FrameType::ServerGreeting) {
            Err(Error::UnsupportedMagic(..)) => {}
            res => panic!("expected unsupported magic, got: {res:?}"),
        }
    }

    #[test]
    fn server_greeting_bad_flavor_magic() {
        let buf = [NBDMAGIC_BUF, b"WHATEVER".as_slice(), &[0, 3]].concat();
        let mut src = io::Cursor::new(&buf[..]);

        match Frame::check(&mut src, FrameType::ServerGreeting) {
            Err(Error::UnsupportedMagic(..)) => {}
            res => panic!("expected unsupported magic, got: {res:?}"),
        }
    }

    #[test]
    fn server_greeting_truncated() {
        let buf = [NBDMAGIC_BUF, &IHAVEOPT_BUF[..4]].concat();
        let mut src = io::Cursor::new(&buf[..]);

        match Frame::check(&mut src, FrameType::ServerGreeting) {
            Err(Error::Incomplete) => {}
            res => panic!("expected incomplete, got: {res:?}"),
        }
    }

    #[test]
    fn option_reply_oversized_length() {
        let buf = [
            REPLYMAGIC_BUF,
            &[
                // Go option, NBD_REP_INFO.
                0, 0, 0, 7,
                0, 0, 0, 3,
                // Length beyond any sane option payload.
                0x7f, 0xff, 0xff, 0xff,
            ],
        ]
        .concat();
        let mut src = io::Cursor::new(&buf[..]);

        match Frame::check(&mut src, FrameType::OptionReply) {
            Err(Error::HandshakeProtocol(..)) => {}
            res => panic!("expected handshake protocol error, got: {res:?}"),
        }
    }

    #[test]
    fn option_reply_truncated_body() {
        let buf = [
            REPLYMAGIC_BUF,
            &[
                // Go option, NBD_REP_INFO, 12 byte body, but only 2 present.
                0, 0, 0, 7,
                0, 0, 0, 3,
                0, 0, 0, 12,
                0, 0,
            ],
        ]
        .concat();
        let mut src = io::Cursor::new(&buf[..]);

        match Frame::check(&mut src, FrameType::OptionReply) {
            Err(Error::Incomplete) => {}
            res => panic!("expected incomplete, got: {res:?}"),
        }
    }
}
