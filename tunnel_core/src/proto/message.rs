//! Typed protocol messages and the message codec.
//!
//! A message is the unit carried by one frame. It starts with a type tag,
//! followed by a flow identifier for flow-level types and then a
//! type-specific body. See [`MessageCodec`] for the combined
//! message + frame encoder/decoder used by the session.

use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use tracing::{debug, instrument};

use super::framing::{Decoded, FrameDecoder, FrameEncoder, FrameError};
use crate::tunnel::types::{Endpoint, FlowId};

/// Wire type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Open = 0x01,
    OpenResult = 0x02,
    Data = 0x03,
    Datagram = 0x04,
    Close = 0x05,
    FetchConfiguration = 0x06,
    Configuration = 0x07,
    Suspend = 0x08,
    Resume = 0x09,
}

impl MessageType {
    /// Convert a u8 to a MessageType
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(MessageType::Open),
            0x02 => Ok(MessageType::OpenResult),
            0x03 => Ok(MessageType::Data),
            0x04 => Ok(MessageType::Datagram),
            0x05 => Ok(MessageType::Close),
            0x06 => Ok(MessageType::FetchConfiguration),
            0x07 => Ok(MessageType::Configuration),
            0x08 => Ok(MessageType::Suspend),
            0x09 => Ok(MessageType::Resume),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether messages of this type carry a flow identifier.
    pub fn is_flow_level(self) -> bool {
        !matches!(
            self,
            MessageType::FetchConfiguration | MessageType::Configuration
        )
    }

    fn name(self) -> &'static str {
        match self {
            MessageType::Open => "open",
            MessageType::OpenResult => "open-result",
            MessageType::Data => "data",
            MessageType::Datagram => "datagram",
            MessageType::Close => "close",
            MessageType::FetchConfiguration => "fetch-configuration",
            MessageType::Configuration => "configuration",
            MessageType::Suspend => "suspend",
            MessageType::Resume => "resume",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reason the server gave for declining a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpenResultCode {
    InvalidParameter = 1,
    NoSuchHost = 2,
    ConnectionRefused = 3,
    Timeout = 4,
    InternalError = 5,
}

impl OpenResultCode {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(OpenResultCode::InvalidParameter),
            2 => Ok(OpenResultCode::NoSuchHost),
            3 => Ok(OpenResultCode::ConnectionRefused),
            4 => Ok(OpenResultCode::Timeout),
            5 => Ok(OpenResultCode::InternalError),
            _ => Err(FrameError::InvalidResultCode(value)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for OpenResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OpenResultCode::InvalidParameter => "invalid parameter",
            OpenResultCode::NoSuchHost => "no such host",
            OpenResultCode::ConnectionRefused => "connection refused",
            OpenResultCode::Timeout => "timed out",
            OpenResultCode::InternalError => "internal error",
        };
        f.write_str(text)
    }
}

/// Which half of a flow a close message shuts.
///
/// Always expressed from the sender's point of view: `Write` means the sender
/// will not send any more data on the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CloseMode {
    Write = 1,
    All = 3,
}

impl CloseMode {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(CloseMode::Write),
            3 => Ok(CloseMode::All),
            _ => Err(FrameError::InvalidCloseMode(value)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// One protocol message.
#[derive(Clone, PartialEq, Eq)]
pub enum Message {
    /// Ask the server to open a stream flow to `endpoint`
    Open { flow_id: FlowId, endpoint: Endpoint },
    /// Server's answer to `Open`
    OpenResult {
        flow_id: FlowId,
        result: Result<(), OpenResultCode>,
    },
    /// Stream payload
    Data { flow_id: FlowId, payload: Bytes },
    /// One datagram and the remote endpoint it is to or from
    Datagram {
        flow_id: FlowId,
        endpoint: Endpoint,
        payload: Bytes,
    },
    /// Shut one or both halves of a flow
    Close { flow_id: FlowId, mode: CloseMode },
    /// Ask the peer to stop sending data for a flow
    Suspend { flow_id: FlowId },
    /// Lift a previous `Suspend`
    Resume { flow_id: FlowId },
    /// Ask the server for the session configuration
    FetchConfiguration,
    /// Session configuration, a UTF-8 JSON object; interpreted by
    /// [`TunnelSettings`](super::settings::TunnelSettings)
    Configuration(Bytes),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Open { .. } => MessageType::Open,
            Message::OpenResult { .. } => MessageType::OpenResult,
            Message::Data { .. } => MessageType::Data,
            Message::Datagram { .. } => MessageType::Datagram,
            Message::Close { .. } => MessageType::Close,
            Message::Suspend { .. } => MessageType::Suspend,
            Message::Resume { .. } => MessageType::Resume,
            Message::FetchConfiguration => MessageType::FetchConfiguration,
            Message::Configuration(_) => MessageType::Configuration,
        }
    }

    /// Flow identifier, absent for session-level messages.
    pub fn flow_id(&self) -> Option<FlowId> {
        match self {
            Message::Open { flow_id, .. }
            | Message::OpenResult { flow_id, .. }
            | Message::Data { flow_id, .. }
            | Message::Datagram { flow_id, .. }
            | Message::Close { flow_id, .. }
            | Message::Suspend { flow_id }
            | Message::Resume { flow_id } => Some(*flow_id),
            Message::FetchConfiguration | Message::Configuration(_) => None,
        }
    }

    /// Serialize the message (without framing).
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::with_capacity(16 + self.payload_len());
        buf.push(self.message_type().to_u8());
        if let Some(flow_id) = self.flow_id() {
            if flow_id.get() == 0 {
                return Err(FrameError::ZeroFlowId);
            }
            buf.write_u32::<BigEndian>(flow_id.get())?;
        }

        match self {
            Message::Open { endpoint, .. } => write_endpoint(&mut buf, endpoint)?,
            Message::OpenResult { result, .. } => match result {
                Ok(()) => buf.push(1),
                Err(code) => {
                    buf.push(0);
                    buf.push(code.to_u8());
                }
            },
            Message::Data { payload, .. } => buf.extend_from_slice(payload),
            Message::Datagram {
                endpoint, payload, ..
            } => {
                write_endpoint(&mut buf, endpoint)?;
                buf.extend_from_slice(payload);
            }
            Message::Close { mode, .. } => buf.push(mode.to_u8()),
            Message::Suspend { .. } | Message::Resume { .. } | Message::FetchConfiguration => {}
            Message::Configuration(json) => buf.extend_from_slice(json),
        }
        Ok(buf)
    }

    /// Parse one message (the content of one frame).
    pub fn decode(bytes: &Bytes) -> Result<Self, FrameError> {
        let mut cursor = Cursor::new(&bytes[..]);
        let message_type = MessageType::from_u8(
            cursor
                .read_u8()
                .map_err(|_| FrameError::Truncated("untyped"))?,
        )?;
        let name = message_type.name();

        let flow_id = if message_type.is_flow_level() {
            let raw = cursor
                .read_u32::<BigEndian>()
                .map_err(|_| FrameError::Truncated(name))?;
            if raw == 0 {
                return Err(FrameError::ZeroFlowId);
            }
            FlowId(raw)
        } else {
            FlowId(0)
        };

        let message = match message_type {
            MessageType::Open => {
                let endpoint = read_endpoint(&mut cursor, name)?;
                Message::Open { flow_id, endpoint }
            }
            MessageType::OpenResult => {
                let flag = cursor.read_u8().map_err(|_| FrameError::Truncated(name))?;
                let result = if flag != 0 {
                    Ok(())
                } else {
                    let code = cursor.read_u8().map_err(|_| FrameError::Truncated(name))?;
                    Err(OpenResultCode::from_u8(code)?)
                };
                Message::OpenResult { flow_id, result }
            }
            MessageType::Data => {
                let payload = bytes.slice(cursor.position() as usize..);
                cursor.set_position(bytes.len() as u64);
                Message::Data { flow_id, payload }
            }
            MessageType::Datagram => {
                let endpoint = read_endpoint(&mut cursor, name)?;
                let payload = bytes.slice(cursor.position() as usize..);
                cursor.set_position(bytes.len() as u64);
                Message::Datagram {
                    flow_id,
                    endpoint,
                    payload,
                }
            }
            MessageType::Close => {
                let mode = match cursor.read_u8() {
                    Ok(raw) => CloseMode::from_u8(raw)?,
                    Err(_) => CloseMode::All,
                };
                Message::Close { flow_id, mode }
            }
            MessageType::Suspend => Message::Suspend { flow_id },
            MessageType::Resume => Message::Resume { flow_id },
            MessageType::FetchConfiguration => Message::FetchConfiguration,
            MessageType::Configuration => {
                let json = bytes.slice(cursor.position() as usize..);
                cursor.set_position(bytes.len() as u64);
                Message::Configuration(json)
            }
        };

        let extra = bytes.len() - cursor.position() as usize;
        if extra != 0 {
            return Err(FrameError::TrailingBytes {
                message: name,
                extra,
            });
        }
        Ok(message)
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Data { payload, .. } | Message::Datagram { payload, .. } => payload.len(),
            Message::Configuration(json) => json.len(),
            _ => 0,
        }
    }

    /// Length of the encoded message, excluding the frame around it.
    pub fn encoded_len(&self) -> usize {
        let header = if self.flow_id().is_some() { 5 } else { 1 };
        let body = match self {
            Message::Open { endpoint, .. } => 2 + endpoint.to_string().len(),
            Message::OpenResult { result, .. } => {
                if result.is_ok() {
                    1
                } else {
                    2
                }
            }
            Message::Datagram {
                endpoint, payload, ..
            } => 2 + endpoint.to_string().len() + payload.len(),
            Message::Close { .. } => 1,
            other => other.payload_len(),
        };
        header + body
    }

    /// Check that the message can be encoded into a frame of at most
    /// `max_frame_size` bytes, without encoding it.
    pub fn check_fits(&self, max_frame_size: usize) -> Result<(), FrameError> {
        if self.flow_id().is_some_and(|id| id.get() == 0) {
            return Err(FrameError::ZeroFlowId);
        }
        if let Message::Open { endpoint, .. } | Message::Datagram { endpoint, .. } = self {
            let len = endpoint.to_string().len();
            if len > usize::from(u16::MAX) {
                return Err(FrameError::InvalidEndpoint(format!("{} bytes long", len)));
            }
        }
        let size = self.encoded_len();
        if size > max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size,
                max: max_frame_size,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Message");
        s.field("type", &self.message_type());
        if let Some(flow_id) = self.flow_id() {
            s.field("flow_id", &flow_id.get());
        }
        match self {
            Message::Open { endpoint, .. } => s.field("endpoint", &endpoint.to_string()),
            Message::OpenResult { result, .. } => s.field("result", result),
            Message::Datagram { endpoint, .. } => s.field("endpoint", &endpoint.to_string()),
            Message::Close { mode, .. } => s.field("mode", mode),
            _ => &mut s,
        };
        s.field("payload_len", &self.payload_len()).finish()
    }
}

fn write_endpoint(buf: &mut Vec<u8>, endpoint: &Endpoint) -> Result<(), FrameError> {
    let text = endpoint.to_string();
    let len = u16::try_from(text.len())
        .map_err(|_| FrameError::InvalidEndpoint(format!("{} bytes long", text.len())))?;
    buf.write_u16::<BigEndian>(len)?;
    buf.extend_from_slice(text.as_bytes());
    Ok(())
}

fn read_endpoint(cursor: &mut Cursor<&[u8]>, name: &'static str) -> Result<Endpoint, FrameError> {
    let len = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| FrameError::Truncated(name))? as usize;
    let mut raw = vec![0u8; len];
    cursor
        .read_exact(&mut raw)
        .map_err(|_| FrameError::Truncated(name))?;
    let text = String::from_utf8(raw)
        .map_err(|_| FrameError::InvalidEndpoint("not valid UTF-8".to_string()))?;
    text.parse::<Endpoint>()
        .map_err(|e| FrameError::InvalidEndpoint(e.to_string()))
}

/// Combined message + frame codec.
///
/// `encode` turns a message into wire bytes; `feed` buffers transport bytes
/// and `next_message` yields decoded messages one at a time.
#[derive(Debug)]
pub struct MessageCodec {
    encoder: FrameEncoder,
    decoder: FrameDecoder,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(super::framing::DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        MessageCodec {
            encoder: FrameEncoder::with_max_frame_size(max_frame_size),
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
        }
    }

    /// Largest message (tag, id and body) a frame may carry.
    pub fn max_frame_size(&self) -> usize {
        self.encoder.max_frame_size()
    }

    #[instrument(level = "trace", skip(self, message), fields(message = ?message))]
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, FrameError> {
        self.encoder.encode(&message.encode()?)
    }

    /// Buffer bytes read from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.decoder.push(data);
    }

    /// Decode the next buffered message.
    pub fn next_message(&mut self) -> Result<Decoded<Message>, FrameError> {
        match self.decoder.decode_next()? {
            Decoded::Frame(raw) => {
                let message = Message::decode(&raw)?;
                debug!(message = ?message, "Decoded message");
                Ok(Decoded::Frame(message))
            }
            Decoded::NeedMoreData => Ok(Decoded::NeedMoreData),
        }
    }

    /// Feed `data` and return every message it completes.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Message>, FrameError> {
        self.feed(data);
        let mut messages = Vec::new();
        while let Decoded::Frame(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.decoder.buffered_bytes()
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}
