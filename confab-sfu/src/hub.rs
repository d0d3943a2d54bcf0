//! Hub: the channel and room directory
//!
//! A single lock guards the directory; each room guards its own state.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::room::{Room, RoomContext};
use crate::store::ChannelStore;
use crate::types::{ChannelId, RoomId};

/// A named group of rooms
#[derive(Clone)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub rooms: HashMap<RoomId, Arc<Room>>,
}

impl Channel {
    pub fn new(id: ChannelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            rooms: HashMap::new(),
        }
    }

    fn shutdown(&self) {
        for room in self.rooms.values() {
            room.shutdown();
        }
    }
}

/// Registry of every channel and room served by this process
#[derive(Default)]
pub struct Hub {
    channels: RwLock<HashMap<ChannelId, Channel>>,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every channel and room from `store`, starting one room
    /// coordinator per room record
    pub async fn initialize(store: &dyn ChannelStore, context: RoomContext) -> Result<Self> {
        let hub = Self::new();

        let records = store
            .channels()
            .await
            .map_err(|e| Error::Store(format!("loading channels: {e}")))?;

        for record in records {
            let rooms = match store.rooms_in_channel(&record.id).await {
                Ok(rooms) => rooms,
                Err(e) => {
                    // Stop the rooms of channels loaded so far
                    for id in hub.channel_ids() {
                        hub.remove_channel(&id);
                    }
                    return Err(Error::Store(format!(
                        "loading rooms of channel {}: {e}",
                        record.id
                    )));
                }
            };
            let mut channel = Channel::new(record.id.clone(), record.name);

            for room in rooms {
                let started = Room::start(room.id.clone(), room.name, record.id.clone(), context.clone());
                channel.rooms.insert(room.id, started);
            }

            info!(
                channel_id = %channel.id,
                channel_name = %channel.name,
                rooms = channel.rooms.len(),
                "Channel loaded"
            );
            hub.add_channel(channel);
        }

        Ok(hub)
    }

    /// A snapshot of the channel with its rooms
    #[must_use]
    pub fn get_channel(&self, id: &ChannelId) -> Option<Channel> {
        self.channels.read().get(id).cloned()
    }

    /// Add or replace a channel; rooms of a replaced channel are shut down
    pub fn add_channel(&self, channel: Channel) {
        let previous = self.channels.write().insert(channel.id.clone(), channel);
        if let Some(previous) = previous {
            warn!(channel_id = %previous.id, "Replacing existing channel");
            previous.shutdown();
        }
    }

    pub fn remove_channel(&self, id: &ChannelId) -> Option<Channel> {
        let removed = self.channels.write().remove(id);
        if let Some(channel) = &removed {
            channel.shutdown();
            info!(channel_id = %id, "Channel removed");
        }
        removed
    }

    #[must_use]
    pub fn get_room(&self, channel_id: &ChannelId, room_id: &RoomId) -> Option<Arc<Room>> {
        self.channels
            .read()
            .get(channel_id)
            .and_then(|channel| channel.rooms.get(room_id))
            .cloned()
    }

    /// Add a room to an existing channel, shutting down any room it replaces
    pub fn add_room(&self, channel_id: &ChannelId, room_id: RoomId, room: Arc<Room>) -> Result<()> {
        let previous = {
            let mut channels = self.channels.write();
            let channel = channels
                .get_mut(channel_id)
                .ok_or_else(|| Error::NotFound(format!("channel {channel_id}")))?;
            channel.rooms.insert(room_id.clone(), room)
        };

        if let Some(previous) = previous {
            warn!(channel_id = %channel_id, room_id = %room_id, "Replacing existing room");
            previous.shutdown();
        }
        info!(channel_id = %channel_id, room_id = %room_id, "Room added");
        Ok(())
    }

    pub fn remove_room(&self, channel_id: &ChannelId, room_id: &RoomId) -> Option<Arc<Room>> {
        let removed = self
            .channels
            .write()
            .get_mut(channel_id)
            .and_then(|channel| channel.rooms.remove(room_id));
        if let Some(room) = &removed {
            room.shutdown();
            info!(channel_id = %channel_id, room_id = %room_id, "Room removed");
        }
        removed
    }

    #[must_use]
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.channels.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.channels.read().values().map(|channel| channel.rooms.len()).sum()
    }
}
