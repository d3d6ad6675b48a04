//! Append-only chat log shared by every participant in a room.

use crate::core::{CausalClock, OpId, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub author: String,
    pub color: String,
    pub text: String,
    pub stamp: OpId,
    /// Sender's wall clock in milliseconds since the Unix epoch.
    pub wall_clock: u64,
}

impl ChatEntry {
    /// Display order: causal stamp first, wall clock between entries that
    /// share a counter, replica id last.
    pub fn order_key(&self) -> (u64, u64, ReplicaId) {
        (self.stamp.counter, self.wall_clock, self.stamp.replica)
    }
}

/// A message about to be appended, before it has a stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub author: String,
    pub color: String,
    pub text: String,
}

impl ChatMessage {
    pub fn new(author: impl Into<String>, color: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            color: color.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("chat message is empty")]
    EmptyMessage,
}

#[derive(Debug, Default, Clone)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
    stamps: HashSet<OpId>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(
        &mut self,
        clock: &mut CausalClock,
        message: ChatMessage,
        wall_clock: u64,
    ) -> Result<ChatEntry, ChatError> {
        let text = message.text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let mut stamp = clock.next_id();
        while self.stamps.contains(&stamp) {
            tracing::error!(%stamp, "chat stamp collision, reissuing");
            stamp = clock.next_id();
        }
        let entry = ChatEntry {
            author: message.author,
            color: message.color,
            text: text.to_string(),
            stamp,
            wall_clock,
        };
        self.insert(entry.clone());
        Ok(entry)
    }

    /// Adds every entry not seen before. Returns how many were new.
    pub fn merge(&mut self, remote: impl IntoIterator<Item = ChatEntry>) -> usize {
        let mut added = 0;
        for entry in remote {
            if self.insert(entry) {
                added += 1;
            }
        }
        added
    }

    pub fn contains(&self, stamp: &OpId) -> bool {
        self.stamps.contains(stamp)
    }

    /// Entries in display order.
    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, entry: ChatEntry) -> bool {
        if !self.stamps.insert(entry.stamp) {
            return false;
        }
        let key = entry.order_key();
        let position = self
            .entries
            .partition_point(|existing| existing.order_key() < key);
        self.entries.insert(position, entry);
        true
    }
}
