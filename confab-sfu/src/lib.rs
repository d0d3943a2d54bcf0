//! Confab SFU (Selective Forwarding Unit)
//!
//! The real-time engine behind Confab rooms: chat relay, presence and
//! WebRTC media forwarding for every participant of a room.
//!
//! ## Architecture
//!
//! - **`Hub`**: Directory of channels and their rooms
//! - **`Room`**: One coordinator task per room, fed by its `EventBus`
//! - **`Participant`**: A connected client with its read and write loops
//! - **`ForwardingTrack`**: Server-side mirror of a published media track
//! - **`MediaPeer`**: Peer connection seam, backed by webrtc-rs in production
//!
//! ## Flow
//!
//! Frames read from a client are published on the room's event bus. The
//! room coordinator consumes registrations, broadcasts and unregistrations
//! in that order of priority, mutates room state under a single lock and
//! then converges every peer connection towards the set of tracks
//! currently published in the room.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use confab_sfu::{Hub, MemoryChannelStore, MemoryMessageStore, RoomContext, RtcPeerFactory, SfuConfig};
//!
//! let config = SfuConfig::default();
//! let peers = Arc::new(RtcPeerFactory::new(&config)?);
//! let context = RoomContext::new(config, peers, Arc::new(MemoryMessageStore::new()));
//! let hub = Hub::initialize(&channels, context).await?;
//!
//! let room = hub.get_room(&channel_id, &room_id).ok_or(...)?;
//! let (participant, handle) = room.join(identity, source, sink);
//! ```

mod config;
mod error;
mod event;
mod hub;
mod message;
mod participant;
mod peer;
mod room;
mod rtc;
mod signaling;
mod store;
mod track;
mod transport;
mod types;

#[cfg(test)]
mod test_helpers;

pub use config::SfuConfig;
pub use error::{Error, Result};
pub use event::{Event, EventBus, EventKind};
pub use hub::{Channel, Hub};
pub use message::{
    frame_type, ChatHistory, ClientMessage, IceCandidate, RoomSnapshot, SdpType,
    ServerMessage, SessionDescription, TrackKind, TrackSnapshot, UserSnapshot,
};
pub use participant::{
    read_loop, write_loop, ConnectionHandle, Identity, MediaFlags, Participant, SendError,
};
pub use peer::{
    ConnectionState, MediaPeer, PeerEvent, PeerEventHandler, PeerFactory, SignalingState,
};
pub use room::{ParticipantInfo, Room, RoomContext, RoomStats};
pub use rtc::{RtcPeer, RtcPeerFactory, RtcRemoteTrack};
pub use signaling::ConvergenceOutcome;
pub use store::{
    ChannelRecord, ChannelStore, ChatMessage, MemoryChannelStore, MemoryMessageStore,
    MessageStore, RoomRecord,
};
pub use track::{spawn_forwarder, ForwardingTrack, RemoteTrack, TrackInfo, TrackRegistry};
pub use transport::{channel_transport, ChannelRemote, ChannelSink, ChannelSource, FrameSink, FrameSource};
pub use types::{ChannelId, ParticipantId, RoomId, SessionId};
