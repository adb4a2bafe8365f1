//! Envelope: the `{cmd, body}` message exchanged between client, proxy and worker.
//!
//! Wire layout (big-endian), a 20-byte header followed by the body:
//!
//! ```text
//! magic u16 | version u8 | flags u8 | packet_len u32 | cmd u32 | ret i32 | sn u32 | body...
//! ```
//!
//! `packet_len` covers header and body, which is all a stream decoder needs
//! for framing. The body is opaque until `cmd` has been resolved to a route.

use std::io;

use serde::{Deserialize, Serialize};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const MAGIC: u16 = 0xB0C5;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 20;
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Command id selecting a route.
pub type Cmd = u32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub cmd: Cmd,
    /// 0 on success, negative for framework errors (see [`ErrorCode`]),
    /// positive values are left to applications.
    pub ret: i32,
    /// Client sequence number, echoed on replies.
    pub sn: u32,
    pub flags: u8,
    pub body: Bytes,
}

impl Envelope {
    pub fn new(cmd: Cmd, body: impl Into<Bytes>) -> Self {
        Self {
            cmd,
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_sn(mut self, sn: u32) -> Self {
        self.sn = sn;
        self
    }

    pub fn with_ret(mut self, ret: i32) -> Self {
        self.ret = ret;
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn packet_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    pub fn is_error(&self) -> bool {
        self.ret != 0
    }

    /// Same cmd and sn as `self`, new body, ret reset.
    pub fn reply(&self, body: impl Into<Bytes>) -> Envelope {
        Envelope {
            cmd: self.cmd,
            ret: 0,
            sn: self.sn,
            flags: self.flags,
            body: body.into(),
        }
    }

    /// Structured error reply carrying a JSON [`ErrorBody`].
    pub fn error_reply(&self, code: ErrorCode, message: impl Into<String>) -> Envelope {
        let body = ErrorBody {
            error: code,
            message: message.into(),
        };
        // ErrorBody is two plain fields; serialization cannot fail.
        let json = serde_json::to_vec(&body).unwrap_or_default();
        Envelope {
            cmd: self.cmd,
            ret: code.ret(),
            sn: self.sn,
            flags: self.flags,
            body: Bytes::from(json),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_ret(self.ret)
    }

    /// Parse the body as an [`ErrorBody`] if this is a framework error reply.
    pub fn error_body(&self) -> Option<ErrorBody> {
        self.error_code()?;
        serde_json::from_slice(&self.body).ok()
    }
}

/// Framework error codes carried in `ret`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownCommand,
    HandlerError,
    DecodeError,
    BacklogFull,
    WorkerLost,
    NoSuchGroup,
    Timeout,
    ShuttingDown,
}

impl ErrorCode {
    const ALL: [ErrorCode; 8] = [
        ErrorCode::UnknownCommand,
        ErrorCode::HandlerError,
        ErrorCode::DecodeError,
        ErrorCode::BacklogFull,
        ErrorCode::WorkerLost,
        ErrorCode::NoSuchGroup,
        ErrorCode::Timeout,
        ErrorCode::ShuttingDown,
    ];

    pub fn ret(self) -> i32 {
        match self {
            Self::UnknownCommand => -1,
            Self::HandlerError => -2,
            Self::DecodeError => -3,
            Self::BacklogFull => -4,
            Self::WorkerLost => -5,
            Self::NoSuchGroup => -6,
            Self::Timeout => -7,
            Self::ShuttingDown => -8,
        }
    }

    pub fn from_ret(ret: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.ret() == ret)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownCommand => "unknown_command",
            Self::HandlerError => "handler_error",
            Self::DecodeError => "decode_error",
            Self::BacklogFull => "backlog_full",
            Self::WorkerLost => "worker_lost",
            Self::NoSuchGroup => "no_such_group",
            Self::Timeout => "timeout",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body of a framework error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated envelope: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("bad magic 0x{0:04x}")]
    BadMagic(u16),
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid packet length {0}")]
    BadLength(u32),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy)]
struct Header {
    flags: u8,
    packet_len: u32,
    cmd: Cmd,
    ret: i32,
    sn: u32,
}

fn parse_header(mut buf: &[u8]) -> Result<Header, DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN,
            available: buf.len(),
        });
    }
    let magic = buf.get_u16();
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = buf.get_u8();
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let flags = buf.get_u8();
    let packet_len = buf.get_u32();
    if (packet_len as usize) < HEADER_LEN {
        return Err(DecodeError::BadLength(packet_len));
    }
    Ok(Header {
        flags,
        packet_len,
        cmd: buf.get_u32(),
        ret: buf.get_i32(),
        sn: buf.get_u32(),
    })
}

fn put_envelope(env: &Envelope, dst: &mut BytesMut) {
    // Bodies past 4 GiB produce a length every decoder rejects.
    let packet_len = u32::try_from(env.packet_len()).unwrap_or(u32::MAX);
    dst.reserve(env.packet_len());
    dst.put_u16(MAGIC);
    dst.put_u8(VERSION);
    dst.put_u8(env.flags);
    dst.put_u32(packet_len);
    dst.put_u32(env.cmd);
    dst.put_i32(env.ret);
    dst.put_u32(env.sn);
    dst.put_slice(&env.body);
}

/// Encode an envelope into a standalone buffer.
pub fn pack(env: &Envelope) -> Bytes {
    let mut buf = BytesMut::with_capacity(env.packet_len());
    put_envelope(env, &mut buf);
    buf.freeze()
}

/// Decode exactly one envelope from `buf`.
pub fn unpack(buf: &[u8]) -> Result<Envelope, DecodeError> {
    let header = parse_header(buf)?;
    let len = header.packet_len as usize;
    if buf.len() < len {
        return Err(DecodeError::Truncated {
            needed: len,
            available: buf.len(),
        });
    }
    if buf.len() > len {
        return Err(DecodeError::TrailingBytes(buf.len() - len));
    }
    Ok(Envelope {
        cmd: header.cmd,
        ret: header.ret,
        sn: header.sn,
        flags: header.flags,
        body: Bytes::copy_from_slice(&buf[HEADER_LEN..len]),
    })
}

/// Read `ret` from a packed envelope without decoding the body.
pub fn peek_ret(buf: &[u8]) -> Option<i32> {
    parse_header(buf).ok().map(|h| h.ret)
}

/// Stream codec framing envelopes by their `packet_len`.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_frame: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }
        let header = parse_header(&src[..HEADER_LEN])?;
        let len = header.packet_len as usize;
        if len > self.max_frame {
            return Err(DecodeError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(len).freeze();
        frame.advance(HEADER_LEN);
        Ok(Some(Envelope {
            cmd: header.cmd,
            ret: header.ret,
            sn: header.sn,
            flags: header.flags,
            body: frame,
        }))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&Envelope>>::encode(self, &item, dst)
    }
}

impl Encoder<&Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.packet_len() > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "envelope of {} bytes exceeds limit of {}",
                    item.packet_len(),
                    self.max_frame
                ),
            ));
        }
        put_envelope(item, dst);
        Ok(())
    }
}

/// Raw pass-through of already packed envelopes.
impl Encoder<Bytes> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let env = Envelope::new(7, &b"hello"[..]).with_sn(42).with_flags(3);
        let decoded = unpack(&pack(&env)).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn empty_body_roundtrips() {
        let env = Envelope::new(1, Bytes::new());
        let packed = pack(&env);
        assert_eq!(packed.len(), HEADER_LEN);
        assert_eq!(unpack(&packed).unwrap(), env);
    }

    #[test]
    fn negative_ret_survives() {
        let env = Envelope::new(9, &b"x"[..]).with_ret(-5);
        assert_eq!(unpack(&pack(&env)).unwrap().ret, -5);
    }

    #[test]
    fn unpack_rejects_short_header() {
        let err = unpack(&[0xB0, 0xC5, 1]).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Truncated {
                needed: HEADER_LEN,
                available: 3
            }
        ));
    }

    #[test]
    fn unpack_rejects_truncated_body() {
        let packed = pack(&Envelope::new(1, &b"abcdef"[..]));
        let err = unpack(&packed[..packed.len() - 2]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { needed: 26, .. }));
    }

    #[test]
    fn unpack_rejects_bad_magic() {
        let mut raw = pack(&Envelope::new(1, Bytes::new())).to_vec();
        raw[0] = 0;
        assert!(matches!(unpack(&raw), Err(DecodeError::BadMagic(_))));
    }

    #[test]
    fn unpack_rejects_unknown_version() {
        let mut raw = pack(&Envelope::new(1, Bytes::new())).to_vec();
        raw[2] = 9;
        assert!(matches!(
            unpack(&raw),
            Err(DecodeError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn unpack_rejects_length_below_header() {
        let mut raw = pack(&Envelope::new(1, Bytes::new())).to_vec();
        raw[4..8].copy_from_slice(&4u32.to_be_bytes());
        assert!(matches!(unpack(&raw), Err(DecodeError::BadLength(4))));
    }

    #[test]
    fn unpack_rejects_trailing_bytes() {
        let mut raw = pack(&Envelope::new(1, &b"ab"[..])).to_vec();
        raw.push(0);
        assert!(matches!(unpack(&raw), Err(DecodeError::TrailingBytes(1))));
    }

    #[test]
    fn peek_ret_reads_header_only() {
        let packed = pack(&Envelope::new(3, &b"body"[..]).with_ret(-2));
        assert_eq!(peek_ret(&packed), Some(-2));
        assert_eq!(peek_ret(b"junk"), None);
    }

    #[test]
    fn codec_waits_for_full_frame() {
        let mut codec = EnvelopeCodec::new();
        let packed = pack(&Envelope::new(5, &b"payload"[..]));

        let mut buf = BytesMut::from(&packed[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&packed[10..]);
        let env = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(env.cmd, 5);
        assert_eq!(&env.body[..], b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_splits_back_to_back_frames() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Envelope::new(1, &b"a"[..]), &mut buf).unwrap();
        codec.encode(Envelope::new(2, &b"bb"[..]), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().cmd, 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().cmd, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_rejects_oversized_frame() {
        let mut codec = EnvelopeCodec::new().with_max_frame(32);
        let mut buf = BytesMut::from(&pack(&Envelope::new(1, vec![0u8; 64]))[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(DecodeError::FrameTooLarge { len: 84, max: 32 })
        ));
    }

    #[test]
    fn error_reply_keeps_cmd_and_sn() {
        let req = Envelope::new(7, Bytes::new()).with_sn(11);
        let reply = req.error_reply(ErrorCode::UnknownCommand, "no route for cmd 7");

        assert_eq!(reply.cmd, 7);
        assert_eq!(reply.sn, 11);
        assert_eq!(reply.ret, -1);
        assert_eq!(reply.error_code(), Some(ErrorCode::UnknownCommand));
        insta::assert_json_snapshot!(reply.error_body().unwrap(), @r#"
        {
          "error": "unknown_command",
          "message": "no route for cmd 7"
        }
        "#);
    }

    #[test]
    fn error_codes_map_back_from_ret() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_ret(code.ret()), Some(code));
        }
        assert_eq!(ErrorCode::from_ret(0), None);
        assert_eq!(ErrorCode::from_ret(12), None);
    }

    #[test]
    fn application_ret_has_no_error_body() {
        let env = Envelope::new(1, &b"{}"[..]).with_ret(3);
        assert!(env.is_error());
        assert!(env.error_body().is_none());
    }
}
