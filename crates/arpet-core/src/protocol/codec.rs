//! Binary codec for encoding and decoding anchor-sharing protocol messages.
//!
//! Wire format:
//! ```text
//! [version:1][msg_type:1][reserved:2][payload_len:4][seq:8][timestamp_us:8][payload:N]
//! ```
//! Total header size: 24 bytes. All multi-byte integers are big-endian and
//! `f32` pose cells travel as their IEEE-754 bit patterns.
//!
//! Payloads:
//! ```text
//! ViewCommand         [command:1]
//! SharedCloudAnchors  [count:2] { [object_type:1][id_len:2][id:N][pose:16*4] } * count
//! Reply               [request_seq:8][status:1][reason_len:2][reason:N]
//! Hello               [device_id:16][name_len:2][name:N]
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

use crate::domain::anchor::{CloudAnchor, ObjectType, Pose, POSE_LEN};
use crate::domain::device::DeviceId;
use crate::protocol::messages::{
    Envelope, MessageHeader, MessageType, PetMessage, ReplyStatus, ViewCommand, HEADER_SIZE,
    MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The message type byte in the header is not a recognized value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The protocol version in the header is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The payload could not be parsed (field value out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The encoded payload length field does not match the actual data available.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// The declared payload is larger than [`MAX_PAYLOAD_SIZE`].
    #[error("payload of {0} bytes exceeds the maximum frame size")]
    PayloadTooLarge(usize),

    /// A field does not fit its length prefix.
    #[error("{field} is too long to encode ({len} items/bytes)")]
    FieldTooLong { field: &'static str, len: usize },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`PetMessage`] into a byte vector including the 24-byte header.
///
/// The sequence number is supplied by the caller, normally from a
/// [`crate::protocol::SequenceCounter`].
///
/// # Errors
///
/// Returns [`ProtocolError::FieldTooLong`] when a string or the anchor list
/// does not fit its 16-bit length prefix.
///
/// # Examples
///
/// ```rust
/// use arpet_core::protocol::{encode_message, decode_message};
/// use arpet_core::protocol::messages::{PetMessage, ViewCommand};
///
/// let msg = PetMessage::ViewCommand(ViewCommand::SharedHost);
/// let bytes = encode_message(&msg, 7, 0).unwrap();
/// let (envelope, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(envelope.message, msg);
/// assert_eq!(envelope.sequence_number, 7);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(
    msg: &PetMessage,
    sequence_number: u64,
    timestamp_us: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(msg)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    let payload_len = payload.len() as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(msg.message_type() as u8);
    buf.push(0x00); // reserved
    buf.push(0x00); // reserved
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(&sequence_number.to_be_bytes());
    buf.extend_from_slice(&timestamp_us.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Encodes a [`PetMessage`] using the current system time as the timestamp.
///
/// # Errors
///
/// Same as [`encode_message`].
pub fn encode_message_now(msg: &PetMessage, sequence_number: u64) -> Result<Vec<u8>, ProtocolError> {
    encode_message(msg, sequence_number, current_timestamp_us())
}

/// Microseconds since the Unix epoch, or 0 if the clock is before it.
pub fn current_timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Parses the 24-byte header at the start of `bytes`.
///
/// Stream transports call this after reading [`HEADER_SIZE`] bytes to learn
/// how many payload bytes follow.
///
/// # Errors
///
/// Returns [`ProtocolError`] for short input, a wrong version, an unknown
/// type, or a payload length above [`MAX_PAYLOAD_SIZE`].
pub fn decode_header(bytes: &[u8]) -> Result<MessageHeader, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let type_byte = bytes[1];
    let message_type =
        MessageType::try_from(type_byte).map_err(|_| ProtocolError::UnknownMessageType(type_byte))?;

    // bytes[2..4] are reserved – ignored on decode

    let payload_length = read_u32(bytes, 4)?;
    if payload_length as usize > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload_length as usize));
    }

    Ok(MessageHeader {
        version,
        message_type,
        payload_length,
        sequence_number: read_u64(bytes, 8)?,
        timestamp_us: read_u64(bytes, 16)?,
    })
}

/// Decodes one message from the beginning of `bytes`.
///
/// Returns the decoded [`Envelope`] and the total number of bytes consumed
/// (header + payload), so the caller can advance their read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are malformed.
pub fn decode_message(bytes: &[u8]) -> Result<(Envelope, usize), ProtocolError> {
    let header = decode_header(bytes)?;
    let payload_len = header.payload_length as usize;

    let total_needed = HEADER_SIZE + payload_len;
    if bytes.len() < total_needed {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared: payload_len,
            available: bytes.len() - HEADER_SIZE,
        });
    }

    let payload = &bytes[HEADER_SIZE..total_needed];
    let message = decode_payload(header.message_type, payload)?;
    trace!(
        seq = header.sequence_number,
        kind = ?header.message_type,
        "decoded message"
    );
    Ok((
        Envelope {
            sequence_number: header.sequence_number,
            timestamp_us: header.timestamp_us,
            message,
        },
        total_needed,
    ))
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(msg: &PetMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    match msg {
        PetMessage::ViewCommand(cmd) => buf.push(cmd.code()),
        PetMessage::SharedCloudAnchors(anchors) => encode_anchors(&mut buf, anchors)?,
        PetMessage::Reply {
            request_seq,
            status,
        } => {
            buf.extend_from_slice(&request_seq.to_be_bytes());
            match status {
                ReplyStatus::Ok => {
                    buf.push(0x00);
                    write_length_prefixed_string(&mut buf, "", "reply reason")?;
                }
                ReplyStatus::Failed(reason) => {
                    buf.push(0x01);
                    write_length_prefixed_string(&mut buf, reason, "reply reason")?;
                }
            }
        }
        PetMessage::Hello { device_id, name } => {
            buf.extend_from_slice(device_id.0.as_bytes());
            write_length_prefixed_string(&mut buf, name, "device name")?;
        }
    }
    Ok(buf)
}

fn encode_anchors(buf: &mut Vec<u8>, anchors: &[CloudAnchor]) -> Result<(), ProtocolError> {
    let count = u16::try_from(anchors.len()).map_err(|_| ProtocolError::FieldTooLong {
        field: "anchor list",
        len: anchors.len(),
    })?;
    buf.extend_from_slice(&count.to_be_bytes());
    for anchor in anchors {
        buf.push(anchor.object_type as u8);
        write_length_prefixed_string(buf, &anchor.cloud_id, "cloud id")?;
        for cell in anchor.pose.as_array() {
            buf.extend_from_slice(&cell.to_bits().to_be_bytes());
        }
    }
    Ok(())
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(msg_type: MessageType, payload: &[u8]) -> Result<PetMessage, ProtocolError> {
    match msg_type {
        MessageType::ViewCommand => {
            require_len(payload, 1, "ViewCommand")?;
            Ok(PetMessage::ViewCommand(ViewCommand::from_code(payload[0])))
        }
        MessageType::SharedCloudAnchors => decode_anchors(payload).map(PetMessage::SharedCloudAnchors),
        MessageType::Reply => {
            require_len(payload, 9, "Reply")?;
            let request_seq = read_u64(payload, 0)?;
            let (reason, _) = read_length_prefixed_string(payload, 9)?;
            let status = match payload[8] {
                0x00 => ReplyStatus::Ok,
                0x01 => ReplyStatus::Failed(reason),
                other => {
                    return Err(ProtocolError::MalformedPayload(format!(
                        "unknown reply status: {other}"
                    )))
                }
            };
            Ok(PetMessage::Reply {
                request_seq,
                status,
            })
        }
        MessageType::Hello => {
            require_len(payload, 16, "Hello")?;
            let device_id = DeviceId(read_uuid(payload, 0)?);
            let (name, _) = read_length_prefixed_string(payload, 16)?;
            Ok(PetMessage::Hello { device_id, name })
        }
    }
}

fn decode_anchors(p: &[u8]) -> Result<Vec<CloudAnchor>, ProtocolError> {
    require_len(p, 2, "SharedCloudAnchors")?;
    let count = u16::from_be_bytes([p[0], p[1]]) as usize;
    let mut anchors = Vec::with_capacity(count.min(64));
    let mut offset = 2;
    for _ in 0..count {
        require_len(p, offset + 1, "anchor object type")?;
        let type_byte = p[offset];
        let object_type = ObjectType::try_from(type_byte).map_err(|_| {
            ProtocolError::MalformedPayload(format!("unknown object type: {type_byte}"))
        })?;
        let (cloud_id, next) = read_length_prefixed_string(p, offset + 1)?;
        offset = next;

        require_len(p, offset + POSE_LEN * 4, "anchor pose")?;
        let mut cells = [0f32; POSE_LEN];
        for (i, cell) in cells.iter_mut().enumerate() {
            *cell = f32::from_bits(read_u32(p, offset + i * 4)?);
        }
        offset += POSE_LEN * 4;

        anchors.push(CloudAnchor {
            object_type,
            cloud_id,
            pose: Pose(cells),
        });
    }
    Ok(anchors)
}

// ── Primitive helpers ─────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        return Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, have {}",
            buf.len()
        )));
    }
    Ok(())
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    let bytes: [u8; 4] = buf
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ProtocolError::MalformedPayload(format!("need 4 bytes at offset {offset}")))?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, ProtocolError> {
    let bytes: [u8; 8] = buf
        .get(offset..offset + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ProtocolError::MalformedPayload(format!("need 8 bytes at offset {offset}")))?;
    Ok(u64::from_be_bytes(bytes))
}

fn read_uuid(buf: &[u8], offset: usize) -> Result<Uuid, ProtocolError> {
    let bytes: [u8; 16] = buf
        .get(offset..offset + 16)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| ProtocolError::MalformedPayload(format!("need 16 bytes at offset {offset}")))?;
    Ok(Uuid::from_bytes(bytes))
}

fn write_length_prefixed_string(
    buf: &mut Vec<u8>,
    s: &str,
    field: &'static str,
) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: bytes.len(),
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Reads a 2-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after the string.
fn read_length_prefixed_string(buf: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    if buf.len() < offset + 2 {
        return Err(ProtocolError::MalformedPayload(format!(
            "need 2 bytes for string length at offset {offset}"
        )));
    }
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let start = offset + 2;
    if buf.len() < start + len {
        return Err(ProtocolError::MalformedPayload(format!(
            "string of length {len} at offset {start} exceeds buffer"
        )));
    }
    let s = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
