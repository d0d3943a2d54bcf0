//! Persistence collaborators
//!
//! The engine never talks to a database directly. It consumes these traits
//! and ships in-memory implementations for development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::{ChannelId, ParticipantId, RoomId};

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String, // nanoid(12)
    pub room_id: RoomId,
    pub sender_id: ParticipantId,
    pub sender_name: String,
    pub sender_avatar: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        room_id: RoomId,
        sender_id: ParticipantId,
        sender_name: impl Into<String>,
        sender_avatar: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: nanoid::nanoid!(12),
            room_id,
            sender_id,
            sender_name: sender_name.into(),
            sender_avatar: sender_avatar.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Chat persistence
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, message: ChatMessage) -> Result<()>;

    /// Messages of a room, oldest first
    async fn messages_in_room(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>>;
}

/// A persisted channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: ChannelId,
    pub name: String,
}

/// A persisted room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: String,
    pub channel_id: ChannelId,
}

/// Channel and room directory, read once when the hub starts
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn channels(&self) -> Result<Vec<ChannelRecord>>;

    async fn rooms_in_channel(&self, channel_id: &ChannelId) -> Result<Vec<RoomRecord>>;
}

/// In-memory [`MessageStore`]
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<HashMap<RoomId, Vec<ChatMessage>>>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.read().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create_message(&self, message: ChatMessage) -> Result<()> {
        self.messages
            .write()
            .entry(message.room_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn messages_in_room(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>> {
        Ok(self
            .messages
            .read()
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory [`ChannelStore`]
#[derive(Default)]
pub struct MemoryChannelStore {
    channels: RwLock<Vec<ChannelRecord>>,
    rooms: RwLock<Vec<RoomRecord>>,
}

impl MemoryChannelStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_channel(&self, channel: ChannelRecord) {
        self.channels.write().push(channel);
    }

    pub fn insert_room(&self, room: RoomRecord) -> Result<()> {
        if !self.channels.read().iter().any(|c| c.id == room.channel_id) {
            return Err(Error::NotFound(format!("channel {}", room.channel_id)));
        }
        self.rooms.write().push(room);
        Ok(())
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn channels(&self) -> Result<Vec<ChannelRecord>> {
        Ok(self.channels.read().clone())
    }

    async fn rooms_in_channel(&self, channel_id: &ChannelId) -> Result<Vec<RoomRecord>> {
        Ok(self
            .rooms
            .read()
            .iter()
            .filter(|room| &room.channel_id == channel_id)
            .cloned()
            .collect())
    }
}
