//! Message Log
//!
//! Bounded in-memory log of classified messages. Entries age out after
//! five minutes; a hard cap guards against floods between maintenance
//! passes.

use chrono::{Duration as ChronoDuration, Utc};
use log::debug;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::message_types::MeshMessage;

/// Log entries older than this are pruned.
pub const MESSAGE_RETENTION_SECS: i64 = 300;

/// Hard cap between maintenance passes.
const MAX_LOG_MESSAGES: usize = 500;

/// Bounded in-memory message log.
pub struct MessageLog {
    messages: Arc<RwLock<VecDeque<MeshMessage>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self {
            messages: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    /// Append a delivered message, enforcing the size cap.
    pub async fn append(&self, message: MeshMessage) {
        let mut messages = self.messages.write().await;
        messages.push_back(message);
        while messages.len() > MAX_LOG_MESSAGES {
            messages.pop_front();
        }
    }

    /// Most recent messages, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<MeshMessage> {
        let messages = self.messages.read().await;
        messages.iter().rev().take(limit).cloned().collect()
    }

    /// Messages from one sender, newest first.
    pub async fn from_sender(&self, sender_hash: u16, limit: usize) -> Vec<MeshMessage> {
        let messages = self.messages.read().await;
        messages
            .iter()
            .filter(|message| message.sender_hash == sender_hash)
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Drop messages older than the retention window. Returns how many
    /// went.
    pub async fn prune_expired(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::seconds(MESSAGE_RETENTION_SECS);
        let mut messages = self.messages.write().await;

        let before = messages.len();
        messages.retain(|message| message.received_at >= cutoff);
        let removed = before - messages.len();

        if removed > 0 {
            debug!("pruned {removed} expired messages from the log");
        }
        removed
    }

    pub async fn statistics(&self) -> Value {
        let messages = self.messages.read().await;
        let sos_count = messages.iter().filter(|m| m.is_sos()).count();

        serde_json::json!({
            "total_messages": messages.len(),
            "sos_messages": sos_count,
            "max_messages": MAX_LOG_MESSAGES,
            "retention_secs": MESSAGE_RETENTION_SECS,
        })
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}
