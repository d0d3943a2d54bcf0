//! Peer connection seam
//!
//! The room drives media negotiation through [`MediaPeer`] and obtains new
//! peers from a [`PeerFactory`]. The production implementation wraps
//! webrtc-rs (see [`crate::RtcPeerFactory`]).

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::message::IceCandidate;
use crate::track::{ForwardingTrack, RemoteTrack};
use crate::types::SessionId;

/// Offer/answer state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    New,
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl SignalingState {
    /// A fresh offer may only be created from these states
    #[must_use]
    pub const fn can_offer(self) -> bool {
        matches!(self, Self::New | Self::Stable)
    }

    /// An answer is only meaningful while our offer is outstanding
    #[must_use]
    pub const fn awaits_answer(self) -> bool {
        matches!(self, Self::HaveLocalOffer)
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Transport-level state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Something a peer connection reports asynchronously
pub enum PeerEvent {
    /// A local ICE candidate to trickle to the client
    IceCandidate(IceCandidate),
    /// Media started arriving from the client
    Track(Arc<dyn RemoteTrack>),
    ConnectionState(ConnectionState),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(&c.candidate).finish(),
            Self::Track(t) => f.debug_tuple("Track").field(&t.id()).finish(),
            Self::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
        }
    }
}

/// Callback a peer uses to report [`PeerEvent`]s. Must not block.
pub type PeerEventHandler = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// One participant's media session with the server
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Create an offer, apply it locally and return its SDP
    async fn create_offer(&self) -> Result<String>;

    /// Apply the client's answer to our outstanding offer
    async fn accept_answer(&self, sdp: String) -> Result<()>;

    /// Apply a client-initiated offer and return the local answer SDP
    async fn accept_offer(&self, sdp: String) -> Result<String>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Start sending a forwarding track to this peer
    async fn add_track(&self, track: &ForwardingTrack) -> Result<()>;

    /// Stop sending the track with `track_id`; `false` if it was not sent
    async fn remove_track(&self, track_id: &str) -> Result<bool>;

    /// Ids of the tracks currently sent to this peer
    async fn outbound_track_ids(&self) -> Vec<String>;

    /// Ids of the tracks this peer sends to us
    async fn inbound_track_ids(&self) -> Vec<String>;

    /// Ask every inbound video track for a keyframe
    async fn request_keyframes(&self) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self) -> Result<()>;
}

/// Creates peer connections for joining participants
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_peer(
        &self,
        session: &SessionId,
        events: PeerEventHandler,
    ) -> Result<Arc<dyn MediaPeer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_state_guards() {
        assert!(SignalingState::New.can_offer());
        assert!(SignalingState::Stable.can_offer());
        assert!(!SignalingState::HaveLocalOffer.can_offer());
        assert!(!SignalingState::HaveRemoteOffer.can_offer());
        assert!(!SignalingState::Closed.can_offer());

        assert!(SignalingState::HaveLocalOffer.awaits_answer());
        assert!(!SignalingState::Stable.awaits_answer());
        assert_eq!(SignalingState::HaveLocalOffer.to_string(), "have-local-offer");
    }
}
