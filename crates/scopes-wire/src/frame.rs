//! Request/response frame types
//!
//! Every message exchanged between adapters is a single frame:
//!
//! ```text
//! +--------+--------+-----------------+
//! |  vers  |  kind  |    reserved     |
//! +--------+--------+-----------------+
//! |             body_len              |
//! +-----------------------------------+
//! |            body bytes             |
//! +-----------------------------------+
//! ```
//!
//! A request carries the invocation mode, a correlation id, the target
//! identity, the operation name, and an argument dictionary. A response
//! carries the correlation id and either a success payload or an exception
//! descriptor. Oneway requests never produce a response frame.

use crate::error::{Result, WireError};
use crate::variant::{decode_string, encode_string, Variant, VariantMap};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Default maximum accepted frame size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Invocation mode of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestMode {
    /// Fire-and-forget; the caller gets no response frame
    Oneway = 0,
    /// The caller blocks for a response frame
    Twoway = 1,
}

impl RequestMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Oneway),
            1 => Some(Self::Twoway),
            _ => None,
        }
    }
}

/// Frame discriminator carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Response = 1,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Fixed-size frame header
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub version: u8,
    pub kind: FrameKind,
    pub body_len: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 8;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_u16_le(0); // reserved
        buf.put_u32_le(self.body_len);
    }

    /// Decode a header from the first [`FrameHeader::SIZE`] bytes of `buf`
    /// without consuming them.
    pub fn peek(buf: &[u8]) -> Result<FrameHeader> {
        if buf.len() < Self::SIZE {
            return Err(WireError::UnexpectedEof);
        }
        let version = buf[0];
        if version != WIRE_VERSION {
            return Err(WireError::VersionMismatch {
                expected: WIRE_VERSION,
                got: version,
            });
        }
        let kind = FrameKind::from_u8(buf[1]).ok_or(WireError::UnknownFrameKind(buf[1]))?;
        let body_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(FrameHeader {
            version,
            kind,
            body_len,
        })
    }
}

/// Kind discriminator for exceptions crossing the wire
///
/// The numeric values are part of the protocol; new kinds must be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionKind {
    Unknown = 0,
    Middleware = 1,
    Timeout = 2,
    ObjectNotExist = 3,
    OperationNotExist = 4,
    Resource = 5,
    Logic = 6,
    Registry = 7,
    Config = 8,
}

impl ExceptionKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Middleware),
            2 => Some(Self::Timeout),
            3 => Some(Self::ObjectNotExist),
            4 => Some(Self::OperationNotExist),
            5 => Some(Self::Resource),
            6 => Some(Self::Logic),
            7 => Some(Self::Registry),
            8 => Some(Self::Config),
            _ => None,
        }
    }
}

/// An exception descriptor travelling in a response frame
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionInfo {
    pub kind: ExceptionKind,
    pub message: String,
}

impl ExceptionInfo {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A marshalled invocation
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub mode: RequestMode,
    pub correlation_id: u64,
    pub identity: String,
    pub op_name: String,
    pub args: VariantMap,
}

impl RequestFrame {
    /// Encode header and body into a single buffer
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u8(self.mode as u8);
        body.put_u64_le(self.correlation_id);
        encode_string(&self.identity, &mut body);
        encode_string(&self.op_name, &mut body);
        Variant::Dict(self.args.clone()).encode(&mut body);

        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + body.len());
        FrameHeader {
            version: WIRE_VERSION,
            kind: FrameKind::Request,
            body_len: body.len() as u32,
        }
        .encode(&mut buf);
        buf.put_slice(&body);
        buf.freeze()
    }

    fn decode_body(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 9 {
            return Err(WireError::UnexpectedEof);
        }
        let mode_byte = buf.get_u8();
        let mode = RequestMode::from_u8(mode_byte).ok_or(WireError::UnknownRequestMode(mode_byte))?;
        let correlation_id = buf.get_u64_le();
        let identity = decode_string(buf)?;
        let op_name = decode_string(buf)?;
        let args = match Variant::decode(buf)? {
            Variant::Dict(map) => map,
            _ => return Err(WireError::UnknownTag(0)),
        };
        Ok(RequestFrame {
            mode,
            correlation_id,
            identity,
            op_name,
            args,
        })
    }
}

const STATUS_SUCCESS: u8 = 0;
const STATUS_EXCEPTION: u8 = 1;

/// Outcome of a twoway invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Success(Variant),
    Exception(ExceptionInfo),
}

/// A marshalled invocation result
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub correlation_id: u64,
    pub body: ResponseBody,
}

impl ResponseFrame {
    pub fn success(correlation_id: u64, payload: Variant) -> Self {
        Self {
            correlation_id,
            body: ResponseBody::Success(payload),
        }
    }

    pub fn exception(correlation_id: u64, info: ExceptionInfo) -> Self {
        Self {
            correlation_id,
            body: ResponseBody::Exception(info),
        }
    }

    /// Encode header and body into a single buffer
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u64_le(self.correlation_id);
        match &self.body {
            ResponseBody::Success(payload) => {
                body.put_u8(STATUS_SUCCESS);
                payload.encode(&mut body);
            }
            ResponseBody::Exception(info) => {
                body.put_u8(STATUS_EXCEPTION);
                body.put_u8(info.kind as u8);
                encode_string(&info.message, &mut body);
            }
        }

        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + body.len());
        FrameHeader {
            version: WIRE_VERSION,
            kind: FrameKind::Response,
            body_len: body.len() as u32,
        }
        .encode(&mut buf);
        buf.put_slice(&body);
        buf.freeze()
    }

    fn decode_body(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 9 {
            return Err(WireError::UnexpectedEof);
        }
        let correlation_id = buf.get_u64_le();
        let status = buf.get_u8();
        let body = match status {
            STATUS_SUCCESS => ResponseBody::Success(Variant::decode(buf)?),
            STATUS_EXCEPTION => {
                if buf.remaining() < 1 {
                    return Err(WireError::UnexpectedEof);
                }
                let kind_byte = buf.get_u8();
                let kind = ExceptionKind::from_u8(kind_byte)
                    .ok_or(WireError::UnknownExceptionKind(kind_byte))?;
                let message = decode_string(buf)?;
                ResponseBody::Exception(ExceptionInfo { kind, message })
            }
            other => return Err(WireError::UnknownStatus(other)),
        };
        Ok(ResponseFrame {
            correlation_id,
            body,
        })
    }
}

/// A decoded frame of either kind
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
}

impl Frame {
    /// Decode a complete frame (header plus body)
    pub fn decode(data: &[u8]) -> Result<Frame> {
        let header = FrameHeader::peek(data)?;
        let mut body = &data[FrameHeader::SIZE..];
        if body.len() < header.body_len as usize {
            return Err(WireError::UnexpectedEof);
        }
        match header.kind {
            FrameKind::Request => Ok(Frame::Request(RequestFrame::decode_body(&mut body)?)),
            FrameKind::Response => Ok(Frame::Response(ResponseFrame::decode_body(&mut body)?)),
        }
    }
}
