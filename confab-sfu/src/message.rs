//! Signaling wire protocol
//!
//! Every frame exchanged with a client is a JSON object tagged by `type`.
//! [`ClientMessage`] covers what clients send, [`ServerMessage`] what the
//! room sends back. Chat frames are relayed verbatim and never re-encoded.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::error::Result;
use crate::store::ChatMessage;
use crate::types::RoomId;

/// Kind of a forwarded media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
    Screen,
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as browsers serialize `RTCSessionDescriptionInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as browsers serialize `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    ChatMessage {
        content: String,
    },

    WebrtcOffer {
        offer: SessionDescription,
    },

    WebrtcAnswer {
        answer: SessionDescription,
    },

    WebrtcIceCandidate {
        candidate: IceCandidate,
    },

    /// Announces what a published stream carries, e.g. marks a video
    /// stream as a screen share
    #[serde(rename_all = "camelCase")]
    TrackMetadata {
        track_id: String,
        track_type: TrackKind,
        stream_id: String,
    },

    /// Microphone/camera/screen toggles; absent flags stay unchanged
    #[serde(alias = "webrtc-tracks", rename_all = "camelCase")]
    PresenceUpdate {
        #[serde(default)]
        is_mic_enabled: Option<bool>,
        #[serde(default)]
        is_video_enabled: Option<bool>,
        #[serde(default)]
        is_screen_enabled: Option<bool>,
    },

    #[serde(rename_all = "camelCase")]
    StopShare {
        track_id: String,
    },
}

impl ClientMessage {
    pub fn decode(frame: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(frame)?)
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Extract the `type` tag of a frame without decoding the rest of it.
///
/// Frames failing this check are not protocol traffic at all.
pub fn frame_type(frame: &[u8]) -> Result<String> {
    let envelope: Envelope = serde_json::from_slice(frame)?;
    Ok(envelope.kind)
}

/// A track as listed in a presence snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub id: String,
    pub kind: TrackKind,
}

/// One participant as listed in a presence snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    pub is_mic_enabled: bool,
    pub is_video_enabled: bool,
    pub is_screen_enabled: bool,
    pub tracks: Vec<TrackSnapshot>,
}

/// Presence snapshot of a whole room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub room_name: String,
    pub users: Vec<UserSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistory {
    pub room_id: RoomId,
    pub messages: Vec<ChatMessage>,
}

/// Messages sent by the room to clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    RoomUpdated {
        payload: RoomSnapshot,
    },

    WebrtcOffer {
        offer: SessionDescription,
        renegotiation: bool,
    },

    WebrtcAnswer {
        answer: SessionDescription,
    },

    WebrtcIceCandidate {
        candidate: IceCandidate,
    },

    ChatHistory {
        payload: ChatHistory,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}
