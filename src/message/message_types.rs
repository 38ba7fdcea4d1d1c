//! Message Type Definitions
//!
//! The classified message shape delivered to local subscribers, built
//! from a decoded wire frame plus receive-side context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bluetooth::protocol::{message_key, FrameBody, MeshFrame, PacketType};
use crate::identity::friend_code_of;

/// A mesh frame classified for local delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshMessage {
    /// Uniform dedup key (`h:<msgIdHash>`); stable across relays.
    pub id: String,
    pub message_type: PacketType,
    pub sender_hash: u16,
    /// Sender nickname when the peer table already knows it.
    pub sender_nickname: Option<String>,
    /// Origination time as carried on the wire (epoch seconds).
    pub timestamp: u32,
    pub content: String,
    pub hop_count: u8,
    pub was_relayed: bool,
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
    /// Friend-code rendering of the target hash, directed frames only.
    pub target_friend_code: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl MeshMessage {
    /// Classify a decoded frame for delivery.
    pub fn from_frame(frame: &MeshFrame, sender_nickname: Option<String>) -> Self {
        let hop_count = frame.hop_count();
        let (latitude, longitude) = match &frame.body {
            FrameBody::Broadcast {
                latitude,
                longitude,
                ..
            } => (*latitude, *longitude),
            FrameBody::Directed { .. } => (None, None),
        };

        Self {
            id: message_key(frame.msg_id_hash),
            message_type: frame.packet_type,
            sender_hash: frame.sender_hash,
            sender_nickname,
            timestamp: frame.timestamp(),
            content: frame.text().to_string(),
            hop_count,
            was_relayed: hop_count > 0,
            latitude,
            longitude,
            target_friend_code: frame.target_hash().map(friend_code_of),
            received_at: Utc::now(),
        }
    }

    /// Seconds since this message arrived locally.
    pub fn age_seconds(&self) -> i64 {
        (Utc::now() - self.received_at).num_seconds()
    }

    pub fn is_sos(&self) -> bool {
        self.message_type == PacketType::Sos
    }

    /// Display name for the sender, falling back to the friend code.
    pub fn sender_display_name(&self) -> String {
        match &self.sender_nickname {
            Some(name) if !name.is_empty() => name.clone(),
            _ => friend_code_of(self.sender_hash),
        }
    }
}
