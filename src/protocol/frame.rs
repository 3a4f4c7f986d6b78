//! Binary frame codec for the speech service protocol.
//!
//! Wire layout (all integers big-endian):
//!
//! ```text
//! byte 0   version << 4 | header size (in 4-byte words)
//! byte 1   message type << 4 | flags
//! byte 2   serialization << 4 | compression
//! byte 3   reserved
//! [i32]    sequence        -- only when flags carry a sequence
//! [u32]    error code      -- only for Error frames
//! u32      payload length
//! ...      payload
//! ```
//!
//! Decoding is streaming-safe: a partial frame yields [`Decoded::NeedMore`]
//! instead of an error, so callers can feed bytes as they arrive.

use bytes::{Buf, BytesMut};
use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use std::fmt;
use std::io::{Read, Write};
use thiserror::Error;

use crate::error::DubError;

/// The only protocol version this codec speaks.
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header size nibble written on encode (one 4-byte word).
pub const HEADER_WORDS: u8 = 0b0001;

/// Upper bound on a declared payload length.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

const FIXED_HEADER_LEN: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid header size nibble {0}")]
    InvalidHeaderSize(u8),

    #[error("unknown message type {0:#06b}")]
    UnknownMessageType(u8),

    #[error("unsupported flags {0:#06b}")]
    UnsupportedFlags(u8),

    #[error("unknown serialization {0}")]
    UnknownSerialization(u8),

    #[error("unknown compression {0}")]
    UnknownCompression(u8),

    #[error("declared payload length {declared} exceeds limit {max}")]
    PayloadTooLarge { declared: usize, max: usize },

    #[error("declared frame length {declared} exceeds remaining buffer {available}")]
    Truncated { declared: usize, available: usize },

    #[error("flags require a sequence number but none was set")]
    MissingSequence,

    #[error("payload decompression failed: {0}")]
    Decompress(String),

    #[error("payload compression failed: {0}")]
    Compress(String),

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
}

impl From<FrameError> for DubError {
    fn from(err: FrameError) -> Self {
        DubError::Protocol {
            message: err.to_string(),
        }
    }
}

/// Message type nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    FullClientRequest = 0b0001,
    AudioOnlyRequest = 0b0010,
    FullServerResponse = 0b1001,
    /// Audio from the server; an empty payload is an acknowledgement.
    AudioOnlyServer = 0b1011,
    FrontEndResult = 0b1100,
    Error = 0b1111,
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0b0001 => Ok(MessageType::FullClientRequest),
            0b0010 => Ok(MessageType::AudioOnlyRequest),
            0b1001 => Ok(MessageType::FullServerResponse),
            0b1011 => Ok(MessageType::AudioOnlyServer),
            0b1100 => Ok(MessageType::FrontEndResult),
            0b1111 => Ok(MessageType::Error),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

/// Message-type-specific flags nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const NO_SEQUENCE: Flags = Flags(0b0000);
    pub const POSITIVE_SEQUENCE: Flags = Flags(0b0001);
    pub const LAST_NO_SEQUENCE: Flags = Flags(0b0010);
    pub const NEGATIVE_SEQUENCE: Flags = Flags(0b0011);

    pub fn from_bits(bits: u8) -> Result<Self, FrameError> {
        if bits <= 0b0011 {
            Ok(Flags(bits))
        } else {
            Err(FrameError::UnsupportedFlags(bits))
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// A 4-byte sequence number follows the header.
    pub fn has_sequence(self) -> bool {
        self.0 & 0b0001 != 0
    }

    /// Marks the final packet of a stream.
    pub fn is_last(self) -> bool {
        self.0 & 0b0010 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Serialization {
    #[default]
    Raw = 0b0000,
    Json = 0b0001,
}

impl TryFrom<u8> for Serialization {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0b0000 => Ok(Serialization::Raw),
            0b0001 => Ok(Serialization::Json),
            other => Err(FrameError::UnknownSerialization(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0b0000,
    Gzip = 0b0001,
}

impl TryFrom<u8> for Compression {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0b0000 => Ok(Compression::None),
            0b0001 => Ok(Compression::Gzip),
            other => Err(FrameError::UnknownCompression(other)),
        }
    }
}

/// One decoded protocol frame. `payload` is always uncompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub flags: Flags,
    pub serialization: Serialization,
    pub compression: Compression,
    pub sequence: Option<i32>,
    pub error_code: Option<u32>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(message_type: MessageType, flags: Flags, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            flags,
            serialization: Serialization::Raw,
            compression: Compression::None,
            sequence: None,
            error_code: None,
            payload,
        }
    }

    /// JSON full-client-request carrying session parameters.
    pub fn json_request<T: serde::Serialize>(
        value: &T,
        sequence: i32,
        compression: Compression,
    ) -> Result<Self, DubError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Frame::new(
            MessageType::FullClientRequest,
            Flags::POSITIVE_SEQUENCE,
            payload,
        )
        .with_sequence(sequence)
        .with_serialization(Serialization::Json)
        .with_compression(compression))
    }

    pub fn with_sequence(mut self, sequence: i32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_error_code(mut self, code: u32) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn with_serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Parse the payload as JSON regardless of the serialization nibble.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_slice(&self.payload).map_err(|e| FrameError::InvalidJson(e.to_string()))
    }

    /// Serialize to wire bytes, compressing the payload if requested.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let body = match self.compression {
            Compression::None => std::borrow::Cow::Borrowed(self.payload.as_slice()),
            Compression::Gzip => std::borrow::Cow::Owned(gzip(&self.payload)?),
        };
        if body.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                declared: body.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let mut out = Vec::with_capacity(FIXED_HEADER_LEN + 12 + body.len());
        out.push((PROTOCOL_VERSION << 4) | HEADER_WORDS);
        out.push(((self.message_type as u8) << 4) | self.flags.bits());
        out.push(((self.serialization as u8) << 4) | self.compression as u8);
        out.push(0);

        if self.flags.has_sequence() {
            let sequence = self.sequence.ok_or(FrameError::MissingSequence)?;
            out.extend_from_slice(&sequence.to_be_bytes());
        }
        if self.message_type == MessageType::Error {
            out.extend_from_slice(&self.error_code.unwrap_or(0).to_be_bytes());
        }
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode exactly one frame from a complete message.
    ///
    /// Used with message-oriented transports where each message carries a
    /// whole frame; a short buffer is a format error here, not a wait state.
    pub fn from_bytes(bytes: &[u8]) -> Result<Frame, FrameError> {
        match decode(bytes)? {
            Decoded::Frame { frame, .. } => Ok(frame),
            Decoded::NeedMore { needed } => Err(FrameError::Truncated {
                declared: needed,
                available: bytes.len(),
            }),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame({:?}, flags={:#06b}, seq={:?}, {} bytes)",
            self.message_type,
            self.flags.bits(),
            self.sequence,
            self.payload.len()
        )
    }
}

/// Outcome of a streaming decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame; `consumed` bytes of the input belong to it.
    Frame { frame: Frame, consumed: usize },
    /// The buffer holds a partial frame; at least `needed` bytes are required.
    NeedMore { needed: usize },
}

/// Encode a frame from its parts.
///
/// `sequence` is written only when `flags` carry one.
pub fn encode(
    message_type: MessageType,
    flags: Flags,
    sequence: i32,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let mut frame = Frame::new(message_type, flags, payload.to_vec());
    if flags.has_sequence() {
        frame.sequence = Some(sequence);
    }
    frame.encode()
}

/// Decode the first frame in `buf`, or report how many bytes are missing.
pub fn decode(buf: &[u8]) -> Result<Decoded, FrameError> {
    if buf.len() < FIXED_HEADER_LEN {
        return Ok(Decoded::NeedMore {
            needed: FIXED_HEADER_LEN,
        });
    }

    let version = buf[0] >> 4;
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let header_words = buf[0] & 0x0f;
    if header_words == 0 {
        return Err(FrameError::InvalidHeaderSize(header_words));
    }
    let message_type = MessageType::try_from(buf[1] >> 4)?;
    let flags = Flags::from_bits(buf[1] & 0x0f)?;
    let serialization = Serialization::try_from(buf[2] >> 4)?;
    let compression = Compression::try_from(buf[2] & 0x0f)?;

    // Header words beyond the first are extension bytes we skip.
    let mut cursor = header_words as usize * 4;

    let sequence = if flags.has_sequence() {
        let Some(bytes) = read_word(buf, cursor) else {
            return Ok(Decoded::NeedMore {
                needed: cursor + 4,
            });
        };
        cursor += 4;
        Some(i32::from_be_bytes(bytes))
    } else {
        None
    };

    let error_code = if message_type == MessageType::Error {
        let Some(bytes) = read_word(buf, cursor) else {
            return Ok(Decoded::NeedMore {
                needed: cursor + 4,
            });
        };
        cursor += 4;
        Some(u32::from_be_bytes(bytes))
    } else {
        None
    };

    let Some(len_bytes) = read_word(buf, cursor) else {
        return Ok(Decoded::NeedMore {
            needed: cursor + 4,
        });
    };
    cursor += 4;
    let declared = u32::from_be_bytes(len_bytes) as usize;
    if declared > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            declared,
            max: MAX_PAYLOAD_LEN,
        });
    }

    let total = cursor + declared;
    if buf.len() < total {
        return Ok(Decoded::NeedMore { needed: total });
    }

    let raw = &buf[cursor..total];
    let payload = match compression {
        Compression::None => raw.to_vec(),
        Compression::Gzip => gunzip(raw)?,
    };
    if serialization == Serialization::Json && !payload.is_empty() {
        serde_json::from_slice::<serde::de::IgnoredAny>(&payload)
            .map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    }

    Ok(Decoded::Frame {
        frame: Frame {
            message_type,
            flags,
            serialization,
            compression,
            sequence,
            error_code,
            payload,
        },
        consumed: total,
    })
}

fn read_word(buf: &[u8], at: usize) -> Option<[u8; 4]> {
    buf.get(at..at + 4)?.try_into().ok()
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder
        .write_all(data)
        .map_err(|e| FrameError::Compress(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| FrameError::Compress(e.to_string()))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_PAYLOAD_LEN as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| FrameError::Decompress(e.to_string()))?;
    if out.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            declared: out.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(out)
}

/// Accumulates bytes from a live connection and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode(&self.buf)? {
            Decoded::Frame { frame, consumed } => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            Decoded::NeedMore { .. } => Ok(None),
        }
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> (Frame, usize) {
        match decode(bytes).expect("should decode") {
            Decoded::Frame { frame, consumed } => (frame, consumed),
            Decoded::NeedMore { needed } => panic!("unexpected NeedMore({})", needed),
        }
    }

    #[test]
    fn test_header_layout_matches_wire_format() {
        let bytes = encode(
            MessageType::AudioOnlyRequest,
            Flags::POSITIVE_SEQUENCE,
            7,
            b"abc",
        )
        .unwrap();
        assert_eq!(bytes[0], 0x11, "version 1, one header word");
        assert_eq!(bytes[1], 0x21, "audio-only request, positive sequence");
        assert_eq!(bytes[2], 0x00, "raw, uncompressed");
        assert_eq!(bytes[3], 0x00, "reserved");
        assert_eq!(&bytes[4..8], &7i32.to_be_bytes());
        assert_eq!(&bytes[8..12], &3u32.to_be_bytes());
        assert_eq!(&bytes[12..], b"abc");
    }

    #[test]
    fn test_roundtrip_preserves_all_fields() {
        let cases: Vec<(MessageType, Flags, i32, Vec<u8>)> = vec![
            (MessageType::FullClientRequest, Flags::POSITIVE_SEQUENCE, 1, b"{}".to_vec()),
            (MessageType::AudioOnlyRequest, Flags::NEGATIVE_SEQUENCE, -42, vec![0u8; 3200]),
            (MessageType::AudioOnlyRequest, Flags::NO_SEQUENCE, 0, vec![]),
            (MessageType::AudioOnlyServer, Flags::LAST_NO_SEQUENCE, 0, vec![1, 2, 3]),
            (MessageType::FullServerResponse, Flags::POSITIVE_SEQUENCE, i32::MAX, vec![]),
        ];

        for (message_type, flags, sequence, payload) in cases {
            let bytes = encode(message_type, flags, sequence, &payload).unwrap();
            let (frame, consumed) = decode_one(&bytes);
            assert_eq!(consumed, bytes.len());
            assert_eq!(frame.message_type, message_type);
            assert_eq!(frame.flags, flags);
            assert_eq!(frame.payload, payload);
            if flags.has_sequence() {
                assert_eq!(frame.sequence, Some(sequence));
            } else {
                assert_eq!(frame.sequence, None);
            }
        }
    }

    #[test]
    fn test_zero_length_payload() {
        let bytes = encode(MessageType::AudioOnlyRequest, Flags::NO_SEQUENCE, 0, &[]).unwrap();
        assert_eq!(bytes.len(), 8);
        let (frame, _) = decode_one(&bytes);
        assert_eq!(frame.payload_len(), 0);
    }

    #[test]
    fn test_partial_frame_needs_more_bytes() {
        let bytes = encode(
            MessageType::FullServerResponse,
            Flags::POSITIVE_SEQUENCE,
            3,
            b"hello world",
        )
        .unwrap();

        for cut in 0..bytes.len() {
            match decode(&bytes[..cut]).expect("partial input is never an error") {
                Decoded::NeedMore { needed } => assert!(needed > cut),
                Decoded::Frame { .. } => panic!("decoded a frame from {} bytes", cut),
            }
        }
    }

    #[test]
    fn test_frame_buffer_reassembles_byte_by_byte() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let bytes = encode(
            MessageType::AudioOnlyServer,
            Flags::POSITIVE_SEQUENCE,
            9,
            &payload,
        )
        .unwrap();

        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        for byte in &bytes {
            buffer.push(std::slice::from_ref(byte));
            if let Some(frame) = buffer.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, payload);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_frame_buffer_splits_coalesced_frames_and_keeps_remainder() {
        let first = encode(MessageType::AudioOnlyServer, Flags::NO_SEQUENCE, 0, b"one").unwrap();
        let second = encode(
            MessageType::FullServerResponse,
            Flags::NEGATIVE_SEQUENCE,
            -2,
            b"two",
        )
        .unwrap();
        let mut joined = first.clone();
        joined.extend_from_slice(&second[..5]);

        let mut buffer = FrameBuffer::new();
        buffer.push(&joined);
        let frame = buffer.next_frame().unwrap().expect("first frame complete");
        assert_eq!(frame.payload, b"one");
        assert!(buffer.next_frame().unwrap().is_none());
        assert_eq!(buffer.len(), 5);

        buffer.push(&second[5..]);
        let frame = buffer.next_frame().unwrap().expect("second frame complete");
        assert_eq!(frame.sequence, Some(-2));
        assert!(frame.flags.is_last());
    }

    #[test]
    fn test_gzip_payload_is_inflated_on_decode() {
        let payload = br#"{"text":"hello hello hello hello hello"}"#.to_vec();
        let frame = Frame::new(
            MessageType::FullServerResponse,
            Flags::NO_SEQUENCE,
            payload.clone(),
        )
        .with_serialization(Serialization::Json)
        .with_compression(Compression::Gzip);
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes[2], 0x11, "json + gzip");

        let decoded = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.compression, Compression::Gzip);
        let value: serde_json::Value = decoded.json().unwrap();
        assert_eq!(value["text"], "hello hello hello hello hello");
    }

    #[test]
    fn test_error_frame_carries_code() {
        let frame = Frame::new(
            MessageType::Error,
            Flags::NO_SEQUENCE,
            b"bad signature".to_vec(),
        )
        .with_error_code(45000001);
        let decoded = Frame::from_bytes(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.error_code, Some(45000001));
        assert_eq!(decoded.payload, b"bad signature");
    }

    #[test]
    fn test_unknown_version_is_format_error() {
        let mut bytes = encode(MessageType::AudioOnlyRequest, Flags::NO_SEQUENCE, 0, b"x").unwrap();
        bytes[0] = 0x21;
        assert_eq!(decode(&bytes), Err(FrameError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_unknown_message_type_is_format_error() {
        let mut bytes = encode(MessageType::AudioOnlyRequest, Flags::NO_SEQUENCE, 0, b"x").unwrap();
        bytes[1] = 0x50;
        assert_eq!(decode(&bytes), Err(FrameError::UnknownMessageType(0b0101)));
    }

    #[test]
    fn test_unknown_compression_is_format_error() {
        let mut bytes = encode(MessageType::AudioOnlyRequest, Flags::NO_SEQUENCE, 0, b"x").unwrap();
        bytes[2] = 0x07;
        assert_eq!(decode(&bytes), Err(FrameError::UnknownCompression(7)));
    }

    #[test]
    fn test_strict_decode_rejects_truncated_payload() {
        let bytes =
            encode(MessageType::AudioOnlyRequest, Flags::NO_SEQUENCE, 0, b"abcdef").unwrap();
        let err = Frame::from_bytes(&bytes[..bytes.len() - 2]).unwrap_err();
        assert_eq!(
            err,
            FrameError::Truncated {
                declared: bytes.len(),
                available: bytes.len() - 2,
            }
        );
    }

    #[test]
    fn test_oversized_declared_length_is_rejected_early() {
        let mut bytes = vec![0x11, 0x20, 0x00, 0x00];
        bytes.extend_from_slice(&(MAX_PAYLOAD_LEN as u32 + 1).to_be_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_header_extension_words_are_skipped() {
        let mut bytes = vec![0x12, 0x20, 0x00, 0x00, 0xAA, 0xBB, 0xCC, 0xDD];
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(b"ok");
        let (frame, consumed) = decode_one(&bytes);
        assert_eq!(frame.payload, b"ok");
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_json_serialization_must_parse() {
        let frame = Frame::new(
            MessageType::FullServerResponse,
            Flags::NO_SEQUENCE,
            b"{not json".to_vec(),
        )
        .with_serialization(Serialization::Json);
        let bytes = frame.encode().unwrap();
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(FrameError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_sequence_flag_without_sequence_fails_to_encode() {
        let frame = Frame::new(MessageType::AudioOnlyRequest, Flags::POSITIVE_SEQUENCE, vec![]);
        assert_eq!(frame.encode(), Err(FrameError::MissingSequence));
    }

    #[test]
    fn test_flags_bits() {
        assert!(!Flags::NO_SEQUENCE.has_sequence());
        assert!(Flags::POSITIVE_SEQUENCE.has_sequence());
        assert!(Flags::LAST_NO_SEQUENCE.is_last());
        assert!(!Flags::LAST_NO_SEQUENCE.has_sequence());
        assert!(Flags::NEGATIVE_SEQUENCE.is_last());
        assert!(Flags::NEGATIVE_SEQUENCE.has_sequence());
        assert_eq!(Flags::from_bits(0b0100), Err(FrameError::UnsupportedFlags(4)));
    }

    #[test]
    fn test_frame_error_converts_to_protocol_error() {
        let err: DubError = FrameError::UnsupportedVersion(3).into();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }
}
