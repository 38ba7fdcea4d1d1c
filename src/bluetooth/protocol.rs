//! Mesh Binary Protocol
//!
//! Implements the compact manufacturer-data wire format shared by every
//! node in the mesh. Two frame shapes (broadcast and directed) share a
//! fixed six-byte header; everything is big-endian for cross-device
//! interop.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Manufacturer id under which every mesh frame is advertised.
pub const MANUFACTURER_ID: u16 = 0x8888;

/// Maximum total frame size. Legacy BLE advertising leaves roughly 27
/// usable bytes of a 31-byte PDU for application data.
pub const MAX_FRAME_SIZE: usize = 27;

/// Default Time-To-Live for newly originated frames.
pub const DEFAULT_TTL: u8 = 5;

/// Common header: type(1) + ttl(1) + msgIdHash(2) + senderHash(2).
pub const HEADER_SIZE: usize = 6;

/// Fixed broadcast body: timestamp(4) + latitude(4) + longitude(4).
pub const BROADCAST_BODY_SIZE: usize = 12;

/// Fixed directed body: targetHash(2) + timestamp(4).
pub const DIRECTED_BODY_SIZE: usize = 6;

/// Smallest decodable frame (header + directed body).
pub const MIN_FRAME_SIZE: usize = 12;

/// Broadcast text budget after UTF-8 encoding.
pub const MAX_BROADCAST_TEXT: usize = 9;

/// Directed text budget after UTF-8 encoding. The total frame cap still
/// applies, so the longest text that actually fits is
/// `MAX_FRAME_SIZE - HEADER_SIZE - DIRECTED_BODY_SIZE` bytes.
pub const MAX_DIRECTED_TEXT: usize = 17;

/// Wire type codes. Unknown codes fail decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    Announce = 0x01,
    FriendRequest = 0x02,
    Message = 0x04,
    Direct = 0x08,
    Sos = 0x10,
    Ack = 0x20,
}

impl PacketType {
    /// Directed frames carry a target hash; everything else floods blind.
    pub fn is_directed(self) -> bool {
        matches!(self, PacketType::Direct | PacketType::FriendRequest)
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x01 => Ok(PacketType::Announce),
            0x02 => Ok(PacketType::FriendRequest),
            0x04 => Ok(PacketType::Message),
            0x08 => Ok(PacketType::Direct),
            0x10 => Ok(PacketType::Sos),
            0x20 => Ok(PacketType::Ack),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

/// Decode failure taxonomy. Malformed UTF-8 is recoverable: the frame is
/// still produced with lossily decoded text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame too short: {len} bytes, need at least {needed}")]
    TooShort { len: usize, needed: usize },
    #[error("unknown packet type: {0:#04x}")]
    UnknownType(u8),
    #[error("frame text is not valid UTF-8")]
    MalformedUtf8,
}

/// Body variant per frame shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrameBody {
    Broadcast {
        timestamp: u32,
        latitude: Option<f32>,
        longitude: Option<f32>,
        text: String,
    },
    Directed {
        target_hash: u16,
        timestamp: u32,
        text: String,
    },
}

/// One logical mesh frame, decoded or ready to encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshFrame {
    pub packet_type: PacketType,
    pub ttl: u8,
    pub msg_id_hash: u16,
    pub sender_hash: u16,
    pub body: FrameBody,
}

impl MeshFrame {
    /// Build a broadcast-shaped frame (announce / message / sos / ack).
    #[allow(clippy::too_many_arguments)]
    pub fn new_broadcast(
        packet_type: PacketType,
        ttl: u8,
        msg_id_hash: u16,
        sender_hash: u16,
        timestamp: u32,
        latitude: Option<f32>,
        longitude: Option<f32>,
        text: &str,
    ) -> Self {
        Self {
            packet_type,
            ttl,
            msg_id_hash,
            sender_hash,
            body: FrameBody::Broadcast {
                timestamp,
                latitude,
                longitude,
                text: truncate_utf8(text, MAX_BROADCAST_TEXT).to_string(),
            },
        }
    }

    /// Build a directed-shaped frame (direct / friendRequest).
    pub fn new_directed(
        packet_type: PacketType,
        ttl: u8,
        msg_id_hash: u16,
        sender_hash: u16,
        target_hash: u16,
        timestamp: u32,
        text: &str,
    ) -> Self {
        Self {
            packet_type,
            ttl,
            msg_id_hash,
            sender_hash,
            body: FrameBody::Directed {
                target_hash,
                timestamp,
                text: truncate_utf8(text, MAX_DIRECTED_TEXT).to_string(),
            },
        }
    }

    /// Hops already traversed since origination.
    pub fn hop_count(&self) -> u8 {
        DEFAULT_TTL.saturating_sub(self.ttl)
    }

    pub fn text(&self) -> &str {
        match &self.body {
            FrameBody::Broadcast { text, .. } => text,
            FrameBody::Directed { text, .. } => text,
        }
    }

    pub fn timestamp(&self) -> u32 {
        match &self.body {
            FrameBody::Broadcast { timestamp, .. } => *timestamp,
            FrameBody::Directed { timestamp, .. } => *timestamp,
        }
    }

    pub fn target_hash(&self) -> Option<u16> {
        match &self.body {
            FrameBody::Directed { target_hash, .. } => Some(*target_hash),
            FrameBody::Broadcast { .. } => None,
        }
    }

    /// Copy of this frame with TTL decremented, or None when spent.
    pub fn decrement_ttl(&self) -> Option<Self> {
        if self.ttl > 0 {
            let mut relayed = self.clone();
            relayed.ttl -= 1;
            Some(relayed)
        } else {
            None
        }
    }
}

/// Decode result: the frame plus a flag for repaired text.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub frame: MeshFrame,
    pub utf8_error: bool,
}

/// Codec for the mesh wire format.
pub struct MeshCodec;

impl MeshCodec {
    /// Encode a frame to manufacturer-data bytes. Text beyond the per-type
    /// budget was already dropped at construction; the total frame cap is
    /// enforced here by trimming the tail of the text.
    pub fn encode(frame: &MeshFrame) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(MAX_FRAME_SIZE);

        buffer.push(frame.packet_type as u8);
        buffer.push(frame.ttl);
        buffer.extend_from_slice(&frame.msg_id_hash.to_be_bytes());
        buffer.extend_from_slice(&frame.sender_hash.to_be_bytes());

        match &frame.body {
            FrameBody::Broadcast {
                timestamp,
                latitude,
                longitude,
                text,
            } => {
                buffer.extend_from_slice(&timestamp.to_be_bytes());
                buffer.extend_from_slice(&latitude.unwrap_or(f32::NAN).to_be_bytes());
                buffer.extend_from_slice(&longitude.unwrap_or(f32::NAN).to_be_bytes());
                let budget = MAX_FRAME_SIZE - buffer.len();
                buffer.extend_from_slice(truncate_utf8(text, budget).as_bytes());
            }
            FrameBody::Directed {
                target_hash,
                timestamp,
                text,
            } => {
                buffer.extend_from_slice(&target_hash.to_be_bytes());
                buffer.extend_from_slice(&timestamp.to_be_bytes());
                let budget = MAX_FRAME_SIZE - buffer.len();
                buffer.extend_from_slice(truncate_utf8(text, budget).as_bytes());
            }
        }

        buffer
    }

    /// Decode manufacturer-data bytes into a frame. Text damage is
    /// repaired lossily and reported via `utf8_error`; structural damage
    /// fails outright.
    pub fn decode(data: &[u8]) -> Result<DecodedFrame, DecodeError> {
        if data.len() < MIN_FRAME_SIZE {
            return Err(DecodeError::TooShort {
                len: data.len(),
                needed: MIN_FRAME_SIZE,
            });
        }

        let packet_type = PacketType::try_from(data[0])?;
        let ttl = data[1];
        let msg_id_hash = u16::from_be_bytes([data[2], data[3]]);
        let sender_hash = u16::from_be_bytes([data[4], data[5]]);
        let body = &data[HEADER_SIZE..];

        let (fixed, is_directed) = if packet_type.is_directed() {
            (DIRECTED_BODY_SIZE, true)
        } else {
            (BROADCAST_BODY_SIZE, false)
        };

        if body.len() < fixed {
            return Err(DecodeError::TooShort {
                len: data.len(),
                needed: HEADER_SIZE + fixed,
            });
        }

        let (text, utf8_error) = match std::str::from_utf8(&body[fixed..]) {
            Ok(text) => (text.to_string(), false),
            Err(_) => (String::from_utf8_lossy(&body[fixed..]).into_owned(), true),
        };

        let frame_body = if is_directed {
            FrameBody::Directed {
                target_hash: u16::from_be_bytes([body[0], body[1]]),
                timestamp: u32::from_be_bytes([body[2], body[3], body[4], body[5]]),
                text,
            }
        } else {
            let latitude = f32::from_be_bytes([body[4], body[5], body[6], body[7]]);
            let longitude = f32::from_be_bytes([body[8], body[9], body[10], body[11]]);
            FrameBody::Broadcast {
                timestamp: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                latitude: (!latitude.is_nan()).then_some(latitude),
                longitude: (!longitude.is_nan()).then_some(longitude),
                text,
            }
        };

        Ok(DecodedFrame {
            frame: MeshFrame {
                packet_type,
                ttl,
                msg_id_hash,
                sender_hash,
                body: frame_body,
            },
            utf8_error,
        })
    }
}

/// The mesh's fixed 16-bit string hash, iterated over code points:
/// `h = ((h << 5) - h + c) & 0xFFFF`. Produces node hashes, message id
/// hashes, and target hashes alike.
pub fn hash16(input: &str) -> u16 {
    let mut h: u32 = 0;
    for c in input.chars() {
        h = (h << 5).wrapping_sub(h).wrapping_add(c as u32) & 0xFFFF;
    }
    h as u16
}

/// Uniform string key for dedup and relay bookkeeping.
pub fn message_key(msg_id_hash: u16) -> String {
    format!("h:{msg_id_hash:04x}")
}

/// Seconds since the Unix epoch, truncated to the wire's u32.
pub fn now_epoch() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Cut a string at a byte budget without splitting a code point.
pub(crate) fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
