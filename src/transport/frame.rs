//! Binary frame layout and payload codecs.
//!
//! Every frame is `type (1) | request id (4, big-endian) | payload length
//! (4, big-endian) | payload`. A request id of zero means "none". The
//! minimum valid frame is the bare 9-byte header.
//!
//! Payload layouts:
//!
//! - request: UTF-8 query string (see [`crate::request`])
//! - response: `u16` status, `u16` header length, `key:value\n` header
//!   block, raw body to end of payload
//! - data bin and push: `u8` bin class, `u32` bin id, `u8` completeness,
//!   bin bytes to end of payload
//!
//! All multibyte integers are big-endian; the layout is part of the wire
//! contract and must not change.

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codestream::{BinClass, DataBin};
use crate::error::ProtocolError;
use crate::request::ViewWindowRequest;

/// Fixed frame header length.
pub const FRAME_HEADER_LEN: usize = 9;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Request,
    Response,
    DataBin,
    Ping,
    Pong,
    Control,
    Error,
    Push,
}

impl FrameType {
    pub const fn as_u8(self) -> u8 {
        match self {
            FrameType::Request => 0x01,
            FrameType::Response => 0x02,
            FrameType::DataBin => 0x03,
            FrameType::Ping => 0x04,
            FrameType::Pong => 0x05,
            FrameType::Control => 0x06,
            FrameType::Error => 0x07,
            FrameType::Push => 0x08,
        }
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FrameType::Request),
            0x02 => Some(FrameType::Response),
            0x03 => Some(FrameType::DataBin),
            0x04 => Some(FrameType::Ping),
            0x05 => Some(FrameType::Pong),
            0x06 => Some(FrameType::Control),
            0x07 => Some(FrameType::Error),
            0x08 => Some(FrameType::Push),
            _ => None,
        }
    }
}

/// One wire frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,

    /// Correlation id; zero means none
    pub request_id: u32,

    pub payload: Bytes,

    /// Local receive or construction time; not part of the wire layout
    pub timestamp: Instant,
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.frame_type == other.frame_type
            && self.request_id == other.request_id
            && self.payload == other.payload
    }
}

impl Eq for Frame {}

impl Frame {
    pub fn new(frame_type: FrameType, request_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            request_id,
            payload: payload.into(),
            timestamp: Instant::now(),
        }
    }

    /// A request frame carrying a view-window request.
    pub fn request(request_id: u32, request: &ViewWindowRequest) -> Self {
        Self::new(FrameType::Request, request_id, request.to_query().into_bytes())
    }

    /// A response frame carrying status, headers and body.
    pub fn response(request_id: u32, payload: &ResponsePayload) -> Self {
        Self::new(FrameType::Response, request_id, payload.encode())
    }

    /// A data-bin frame. Data bins are uncorrelated (`request_id` 0).
    pub fn data_bin(bin: &DataBin) -> Self {
        Self::new(FrameType::DataBin, 0, encode_data_bin(bin))
    }

    /// A server-push frame carrying a data bin.
    pub fn push(bin: &DataBin) -> Self {
        Self::new(FrameType::Push, 0, encode_data_bin(bin))
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Ping, 0, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Pong, 0, payload)
    }

    /// An error frame correlated to a request.
    pub fn error(request_id: u32, message: &str) -> Self {
        Self::new(FrameType::Error, request_id, message.as_bytes().to_vec())
    }

    /// Encode to the wire layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(self.frame_type.as_u8());
        buf.put_u32(self.request_id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Fails when the buffer is shorter than the header or than the
    /// declared payload. Trailing bytes beyond the frame are tolerated;
    /// [`encoded_len`](Self::encoded_len) says how much was consumed.
    pub fn decode(buf: &[u8]) -> Result<Frame, ProtocolError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::FrameTooShort {
                required: FRAME_HEADER_LEN,
                actual: buf.len(),
            });
        }
        let frame_type = FrameType::from_u8(buf[0]).ok_or(ProtocolError::UnknownFrameType(buf[0]))?;
        let request_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        if buf.len() < FRAME_HEADER_LEN + length {
            return Err(ProtocolError::TruncatedPayload {
                declared: length,
                available: buf.len() - FRAME_HEADER_LEN,
            });
        }
        Ok(Frame {
            frame_type,
            request_id,
            payload: Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length]),
            timestamp: Instant::now(),
        })
    }

    /// Bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// Decode the payload as a view-window request.
    pub fn decode_request(&self) -> Result<ViewWindowRequest, ProtocolError> {
        let query = std::str::from_utf8(&self.payload).map_err(|e| {
            ProtocolError::InvalidParameter {
                field: "payload",
                message: format!("request payload is not UTF-8: {e}"),
            }
        })?;
        ViewWindowRequest::from_query(query)
    }

    /// Decode the payload as a response.
    pub fn decode_response(&self) -> Result<ResponsePayload, ProtocolError> {
        ResponsePayload::decode(&self.payload)
    }

    /// Decode the payload as a data bin.
    pub fn decode_data_bin(&self) -> Result<DataBin, ProtocolError> {
        decode_data_bin(&self.payload)
    }
}

/// Status, headers and body of one response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePayload {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ResponsePayload {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> Bytes {
        let header_block: String = self
            .headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let header_bytes = header_block.as_bytes();

        let mut buf = BytesMut::with_capacity(4 + header_bytes.len() + self.body.len());
        buf.put_u16(self.status);
        buf.put_u16(header_bytes.len() as u16);
        buf.put_slice(header_bytes);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 4 {
            return Err(ProtocolError::TruncatedPayload {
                declared: 4,
                available: payload.len(),
            });
        }
        let status = u16::from_be_bytes([payload[0], payload[1]]);
        let header_len = u16::from_be_bytes([payload[2], payload[3]]) as usize;
        if payload.len() < 4 + header_len {
            return Err(ProtocolError::TruncatedPayload {
                declared: 4 + header_len,
                available: payload.len(),
            });
        }

        let header_block = std::str::from_utf8(&payload[4..4 + header_len]).map_err(|e| {
            ProtocolError::InvalidParameter {
                field: "headers",
                message: format!("header block is not UTF-8: {e}"),
            }
        })?;
        let headers = header_block
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| match line.split_once(':') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (line.to_string(), String::new()),
            })
            .collect();

        Ok(Self {
            status,
            headers,
            body: Bytes::copy_from_slice(&payload[4 + header_len..]),
        })
    }
}

/// Encode a data-bin payload: class, id, completeness, bytes.
pub fn encode_data_bin(bin: &DataBin) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + bin.len());
    buf.put_u8(bin.class.as_u8());
    buf.put_u32(bin.id);
    buf.put_u8(u8::from(bin.is_complete));
    buf.put_slice(&bin.bytes);
    buf.freeze()
}

/// Decode a data-bin payload.
pub fn decode_data_bin(payload: &[u8]) -> Result<DataBin, ProtocolError> {
    if payload.len() < 6 {
        return Err(ProtocolError::TruncatedPayload {
            declared: 6,
            available: payload.len(),
        });
    }
    let class = BinClass::from_u8(payload[0]).ok_or(ProtocolError::UnknownBinClass(payload[0]))?;
    let id = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let is_complete = payload[5] != 0;

    let mut bin = DataBin::new(class, id, Bytes::copy_from_slice(&payload[6..]));
    bin.is_complete = is_complete;
    Ok(bin)
}
