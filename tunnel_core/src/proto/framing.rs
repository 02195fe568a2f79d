//! Frame layer of the tunnel protocol.
//!
//! Every protocol message travels inside one length-prefixed frame so that a
//! receiver can always find message boundaries in the ordered byte stream,
//! independent of how the transport chunks its reads.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+----------------------------------+
//! |    Magic (1)   |  Version (1)   |         Length (4 bytes)         |
//! +----------------+----------------+----------------------------------+
//! |                     Message (Length bytes)                         |
//! +--------------------------------------------------------------------+
//! |                        Checksum (4 bytes)                          |
//! +--------------------------------------------------------------------+
//! ```
//!
//! - Magic: A fixed byte (0xC0) that marks the beginning of a frame
//! - Version: Protocol version (currently 0x01)
//! - Length: Length of the message in bytes (u32, big-endian), never zero
//! - Message: One encoded [`Message`](super::message::Message)
//! - Checksum: CRC32 of header + message
//!
//! The decoder is resumable: bytes can be fed in arbitrarily small pieces and
//! a frame is only surfaced once it is complete.
//!
//! # Example Usage
//!
//! ```rust
//! use tunnel_core::proto::framing::{Decoded, FrameDecoder, FrameEncoder};
//!
//! let encoder = FrameEncoder::new();
//! let encoded = encoder.encode(b"\x06").unwrap();
//!
//! let mut decoder = FrameDecoder::new();
//! decoder.push(&encoded[..3]);
//! assert!(matches!(decoder.decode_next().unwrap(), Decoded::NeedMoreData));
//! decoder.push(&encoded[3..]);
//! match decoder.decode_next().unwrap() {
//!     Decoded::Frame(message) => assert_eq!(&message[..], b"\x06"),
//!     Decoded::NeedMoreData => unreachable!(),
//! }
//! ```

use std::io::{self, Cursor};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use crc32fast::Hasher;
use thiserror::Error;
use tracing::{debug, error, instrument, trace};

pub const FRAME_MAGIC: u8 = 0xC0;
pub const FRAME_VERSION: u8 = 0x01;
const HEADER_SIZE: usize = 6; // Magic (1) + Version (1) + Length (4)
const CHECKSUM_SIZE: usize = 4;

/// Default upper bound on the message carried by one frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 128 * 1024;

/// Errors that can occur during frame and message encoding/decoding.
///
/// Every decoding error is fatal for the connection it was read from.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Invalid magic byte in frame header
    #[error("Invalid frame magic: expected 0x{expected:02X}, got 0x{actual:02X}")]
    InvalidMagic { expected: u8, actual: u8 },

    /// Unsupported protocol version
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Frame announced an empty message
    #[error("Frame carries an empty message")]
    EmptyFrame,

    /// Frame larger than the configured maximum
    #[error("Frame too large: {size} bytes (max: {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    /// Checksum verification failed
    #[error("Checksum verification failed: expected 0x{expected:08X}, got 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Unknown message type tag
    #[error("Invalid message type: 0x{0:02X}")]
    InvalidMessageType(u8),

    /// Message body ended before a required field
    #[error("Truncated {0} message")]
    Truncated(&'static str),

    /// Message body carried bytes after its last field
    #[error("{extra} trailing bytes after {message} message")]
    TrailingBytes { message: &'static str, extra: usize },

    /// Flow identifier zero is reserved
    #[error("Flow identifier 0 is not valid")]
    ZeroFlowId,

    /// Endpoint field is not a valid `host:port` string
    #[error("Invalid endpoint field: {0}")]
    InvalidEndpoint(String),

    /// Open-result code outside the known set
    #[error("Invalid open result code: {0}")]
    InvalidResultCode(u8),

    /// Close mode outside the known set
    #[error("Invalid close mode: {0}")]
    InvalidCloseMode(u8),

    /// I/O error during encoding/decoding
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of one decoding attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A complete item was decoded
    Frame(T),
    /// The buffered bytes do not yet hold a complete frame
    NeedMoreData,
}

/// Encoder for tunnel frames.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    max_frame_size: usize,
}

impl FrameEncoder {
    /// Create a new frame encoder with the default maximum frame size
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        FrameEncoder { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Wrap one encoded message into a frame
    #[instrument(level = "trace", skip(self, message), fields(message_len = message.len()))]
    pub fn encode(&self, message: &[u8]) -> Result<Vec<u8>, FrameError> {
        if message.is_empty() {
            return Err(FrameError::EmptyFrame);
        }
        if message.len() > self.max_frame_size {
            error!(
                size = message.len(),
                max = self.max_frame_size,
                "Refusing to encode oversized frame"
            );
            return Err(FrameError::FrameTooLarge {
                size: message.len(),
                max: self.max_frame_size,
            });
        }

        let mut buffer = Vec::with_capacity(HEADER_SIZE + message.len() + CHECKSUM_SIZE);
        buffer.push(FRAME_MAGIC);
        buffer.push(FRAME_VERSION);
        buffer.write_u32::<BigEndian>(message.len() as u32)?;
        buffer.extend_from_slice(message);

        let mut hasher = Hasher::new();
        hasher.update(&buffer);
        let checksum = hasher.finalize();
        buffer.write_u32::<BigEndian>(checksum)?;

        trace!(
            message_len = message.len(),
            total_size = buffer.len(),
            checksum = format!("0x{:08X}", checksum),
            "Frame encoded"
        );

        Ok(buffer)
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resumable decoder for tunnel frames.
#[derive(Debug)]
pub struct FrameDecoder {
    /// Bytes received but not yet consumed as a complete frame
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder with the default maximum frame size
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        FrameDecoder {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Append transport bytes to the internal buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        trace!(buffer_len = self.buffer.len(), "Appended data to buffer");
    }

    /// Decode the next complete frame from the buffer, if there is one.
    ///
    /// The header is validated as soon as it is available, so a bad magic byte
    /// or an oversized length is reported before the body arrives.
    pub fn decode_next(&mut self) -> Result<Decoded<Bytes>, FrameError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(Decoded::NeedMoreData);
        }

        if self.buffer[0] != FRAME_MAGIC {
            return Err(FrameError::InvalidMagic {
                expected: FRAME_MAGIC,
                actual: self.buffer[0],
            });
        }

        if self.buffer[1] != FRAME_VERSION {
            return Err(FrameError::UnsupportedVersion(self.buffer[1]));
        }

        let mut cursor = Cursor::new(&self.buffer[2..HEADER_SIZE]);
        let message_len = cursor.read_u32::<BigEndian>()? as usize;

        if message_len == 0 {
            return Err(FrameError::EmptyFrame);
        }
        if message_len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: message_len,
                max: self.max_frame_size,
            });
        }

        let total_size = HEADER_SIZE + message_len + CHECKSUM_SIZE;
        if self.buffer.len() < total_size {
            return Ok(Decoded::NeedMoreData);
        }

        let mut hasher = Hasher::new();
        hasher.update(&self.buffer[..HEADER_SIZE + message_len]);
        let calculated_checksum = hasher.finalize();

        let mut cursor = Cursor::new(&self.buffer[HEADER_SIZE + message_len..total_size]);
        let frame_checksum = cursor.read_u32::<BigEndian>()?;

        if calculated_checksum != frame_checksum {
            return Err(FrameError::ChecksumMismatch {
                expected: frame_checksum,
                actual: calculated_checksum,
            });
        }

        let message = Bytes::copy_from_slice(&self.buffer[HEADER_SIZE..HEADER_SIZE + message_len]);
        self.buffer.drain(..total_size);

        debug!(
            message_len,
            remaining_buffer = self.buffer.len(),
            "Decoded frame"
        );

        Ok(Decoded::Frame(message))
    }

    /// Push `data` and decode every complete frame now available.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        self.push(data);
        let mut frames = Vec::new();
        while let Decoded::Frame(frame) = self.decode_next()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Clear the internal buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Get the number of bytes currently in the buffer
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let encoded = FrameEncoder::new().encode(b"hello").unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + 5 + CHECKSUM_SIZE);
        assert_eq!(encoded[0], FRAME_MAGIC);
        assert_eq!(encoded[1], FRAME_VERSION);
        assert_eq!(&encoded[2..6], &[0, 0, 0, 5]);
        assert_eq!(&encoded[6..11], b"hello");
    }

    #[test]
    fn test_partial_decode() {
        let encoded = FrameEncoder::new().encode(b"Hello, tunnel!").unwrap();

        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&encoded[..4]).unwrap().is_empty());
        assert!(decoder.decode(&encoded[4..10]).unwrap().is_empty());
        assert_eq!(decoder.buffered_bytes(), 10);

        let frames = decoder.decode(&encoded[10..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"Hello, tunnel!");
        assert_eq!(decoder.buffered_bytes(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let encoder = FrameEncoder::new();
        let mut combined = encoder.encode(b"one").unwrap();
        combined.extend(encoder.encode(b"two").unwrap());
        combined.extend(&encoder.encode(b"three").unwrap()[..5]);

        let mut decoder = FrameDecoder::new();
        let frames = decoder.decode(&combined).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        assert_eq!(decoder.buffered_bytes(), 5);
    }

    #[test]
    fn test_oversized_length_rejected_before_body() {
        let mut header = vec![FRAME_MAGIC, FRAME_VERSION];
        header.write_u32::<BigEndian>(1024).unwrap();

        let mut decoder = FrameDecoder::with_max_frame_size(512);
        decoder.push(&header);
        match decoder.decode_next() {
            Err(FrameError::FrameTooLarge { size, max }) => {
                assert_eq!(size, 1024);
                assert_eq!(max, 512);
            }
            other => panic!("Expected FrameTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_encoder_enforces_max() {
        let encoder = FrameEncoder::with_max_frame_size(8);
        assert!(matches!(
            encoder.encode(&[0u8; 9]),
            Err(FrameError::FrameTooLarge { size: 9, max: 8 })
        ));
        assert!(matches!(encoder.encode(&[]), Err(FrameError::EmptyFrame)));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0xAB, FRAME_VERSION, 0, 0, 0, 1]);
        assert!(matches!(
            decoder.decode_next(),
            Err(FrameError::InvalidMagic { actual: 0xAB, .. })
        ));

        let mut decoder = FrameDecoder::new();
        decoder.push(&[FRAME_MAGIC, 0x09, 0, 0, 0, 1]);
        assert!(matches!(
            decoder.decode_next(),
            Err(FrameError::UnsupportedVersion(0x09))
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut encoded = FrameEncoder::new().encode(b"payload").unwrap();
        encoded[7] ^= 0xFF;
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.decode(&encoded),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }
}
