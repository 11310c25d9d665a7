//! GIOP message framing
//!
//! Every message starts with a 12 byte header:
//!
//! ```text
//! +------+-------+-------+-------+------+-----------+
//! | GIOP | major | minor | flags | type | body size |
//! |  4   |   1   |   1   |   1   |  1   |  4 (u32)  |
//! +------+-------+-------+-------+------+-----------+
//! ```
//!
//! Bit 0 of `flags` is the byte order. Messages are written big-endian and
//! little-endian messages are rejected.

use crate::error::{OrbError, Result};
use crate::giop_version::GiopVersion;
use crate::service_context::{ServiceContextRegistry, ServiceContexts};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const GIOP_MAGIC: [u8; 4] = *b"GIOP";
pub const HEADER_SIZE: usize = 12;

const FLAG_LITTLE_ENDIAN: u8 = 0x01;

/// GIOP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Reply = 1,
    CancelRequest = 2,
    CloseConnection = 5,
    MessageError = 6,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Reply),
            2 => Some(Self::CancelRequest),
            5 => Some(Self::CloseConnection),
            6 => Some(Self::MessageError),
            _ => None,
        }
    }
}

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: GiopVersion,
    pub message_type: MessageType,
    pub body_size: u32,
}

impl MessageHeader {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&GIOP_MAGIC);
        self.version.write(buf);
        buf.put_u8(0);
        buf.put_u8(self.message_type as u8);
        buf.put_u32(self.body_size);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(OrbError::format(format!(
                "GIOP header needs {} bytes, have {}",
                HEADER_SIZE,
                data.len()
            )));
        }
        if data[0..4] != GIOP_MAGIC {
            return Err(OrbError::format(format!(
                "bad GIOP magic {:02x?}",
                &data[0..4]
            )));
        }
        let version = GiopVersion::of(data[4], data[5]);
        if data[6] & FLAG_LITTLE_ENDIAN != 0 {
            return Err(OrbError::format("little-endian GIOP messages are not supported"));
        }
        let message_type = MessageType::from_u8(data[7])
            .ok_or_else(|| OrbError::format(format!("unknown GIOP message type {}", data[7])))?;
        let body_size = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        Ok(Self {
            version,
            message_type,
            body_size,
        })
    }
}

/// Outcome of a request, carried in a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    NoException,
    UserException,
    SystemException,
    LocationForward,
}

impl ReplyStatus {
    pub fn as_u32(self) -> u32 {
        match self {
            ReplyStatus::NoException => 0,
            ReplyStatus::UserException => 1,
            ReplyStatus::SystemException => 2,
            ReplyStatus::LocationForward => 3,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ReplyStatus::NoException),
            1 => Some(ReplyStatus::UserException),
            2 => Some(ReplyStatus::SystemException),
            3 => Some(ReplyStatus::LocationForward),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestMessage {
    pub request_id: u32,
    pub response_expected: bool,
    pub service_contexts: ServiceContexts,
    pub operation: String,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct ReplyMessage {
    pub request_id: u32,
    pub status: ReplyStatus,
    pub service_contexts: ServiceContexts,
    pub body: Bytes,
}

/// A complete GIOP message
#[derive(Debug, Clone)]
pub enum Message {
    Request(RequestMessage),
    Reply(ReplyMessage),
    CancelRequest { request_id: u32 },
    CloseConnection,
    MessageError,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::Reply(_) => MessageType::Reply,
            Message::CancelRequest { .. } => MessageType::CancelRequest,
            Message::CloseConnection => MessageType::CloseConnection,
            Message::MessageError => MessageType::MessageError,
        }
    }

    pub fn request_id(&self) -> Option<u32> {
        match self {
            Message::Request(req) => Some(req.request_id),
            Message::Reply(reply) => Some(reply.request_id),
            Message::CancelRequest { request_id } => Some(*request_id),
            Message::CloseConnection | Message::MessageError => None,
        }
    }

    /// Header plus body
    pub fn encode(&self, version: GiopVersion) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            Message::Request(req) => {
                body.put_u32(req.request_id);
                body.put_u8(u8::from(req.response_expected));
                req.service_contexts.write(&mut body, version);
                put_string(&mut body, &req.operation);
                body.put_slice(&req.body);
            }
            Message::Reply(reply) => {
                body.put_u32(reply.request_id);
                body.put_u32(reply.status.as_u32());
                reply.service_contexts.write(&mut body, version);
                body.put_slice(&reply.body);
            }
            Message::CancelRequest { request_id } => body.put_u32(*request_id),
            Message::CloseConnection | Message::MessageError => {}
        }

        let header = MessageHeader {
            version,
            message_type: self.message_type(),
            body_size: body.len() as u32,
        };
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        header.encode(&mut buf);
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Decode the body that followed `header`.
    pub fn decode_body(
        header: &MessageHeader,
        mut body: Bytes,
        registry: &ServiceContextRegistry,
    ) -> Result<Self> {
        let message = match header.message_type {
            MessageType::Request => {
                let request_id = get_u32(&mut body, "request id")?;
                let response_expected = get_u8(&mut body, "response flag")? != 0;
                let service_contexts = ServiceContexts::read(&mut body, header.version, registry)?;
                let operation = get_string(&mut body)?;
                let payload = body.split_to(body.len());
                Message::Request(RequestMessage {
                    request_id,
                    response_expected,
                    service_contexts,
                    operation,
                    body: payload,
                })
            }
            MessageType::Reply => {
                let request_id = get_u32(&mut body, "request id")?;
                let raw_status = get_u32(&mut body, "reply status")?;
                let status = ReplyStatus::from_u32(raw_status).ok_or_else(|| {
                    OrbError::format(format!("unknown reply status {}", raw_status))
                })?;
                let service_contexts = ServiceContexts::read(&mut body, header.version, registry)?;
                let payload = body.split_to(body.len());
                Message::Reply(ReplyMessage {
                    request_id,
                    status,
                    service_contexts,
                    body: payload,
                })
            }
            MessageType::CancelRequest => Message::CancelRequest {
                request_id: get_u32(&mut body, "request id")?,
            },
            MessageType::CloseConnection => Message::CloseConnection,
            MessageType::MessageError => Message::MessageError,
        };
        if body.has_remaining() {
            return Err(OrbError::format(format!(
                "{} trailing bytes after {:?} message",
                body.remaining(),
                header.message_type
            )));
        }
        Ok(message)
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn get_u8(buf: &mut Bytes, what: &str) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(OrbError::format(format!("truncated {}", what)));
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes, what: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(OrbError::format(format!("truncated {}", what)));
    }
    Ok(buf.get_u32())
}

fn get_octets(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(buf, "octet sequence length")? as usize;
    if buf.remaining() < len {
        return Err(OrbError::format(format!(
            "octet sequence declares {} bytes, have {}",
            len,
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    let raw = get_octets(buf)?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| OrbError::format(format!("operation name is not UTF-8: {}", e)))
}
