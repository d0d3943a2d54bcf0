//! Media track forwarding
//!
//! Every inbound media track is mirrored into one local static-RTP track
//! (the forwarding track) that is attached to every other participant's
//! peer connection. A forwarder task copies packets from the inbound track
//! into the forwarding track until the inbound track ends.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::util::marshal::MarshalSize;

use crate::error::Result;
use crate::message::TrackKind;
use crate::types::SessionId;

/// An inbound media track as seen by the room
#[async_trait]
pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> String;

    fn stream_id(&self) -> String;

    fn kind(&self) -> TrackKind;

    fn codec(&self) -> RTCRtpCodecCapability;

    /// Next RTP packet; an error means the track has ended
    async fn read_packet(&self) -> Result<Packet>;
}

#[derive(Default)]
struct ForwardingStats {
    packets: AtomicU64,
    bytes: AtomicU64,
}

/// Server-side mirror of one participant's inbound track
#[derive(Clone)]
pub struct ForwardingTrack {
    owner: SessionId,
    track_id: String,
    stream_id: String,
    kind: TrackKind,
    local: Arc<TrackLocalStaticRTP>,
    stats: Arc<ForwardingStats>,
}

impl ForwardingTrack {
    pub fn new(
        owner: SessionId,
        track_id: impl Into<String>,
        stream_id: impl Into<String>,
        kind: TrackKind,
        codec: RTCRtpCodecCapability,
    ) -> Self {
        let track_id = track_id.into();
        let stream_id = stream_id.into();
        let local = Arc::new(TrackLocalStaticRTP::new(
            codec,
            track_id.clone(),
            stream_id.clone(),
        ));

        Self {
            owner,
            track_id,
            stream_id,
            kind,
            local,
            stats: Arc::new(ForwardingStats::default()),
        }
    }

    #[must_use]
    pub const fn owner(&self) -> &SessionId {
        &self.owner
    }

    #[must_use]
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    /// The local track to attach to subscriber peer connections
    #[must_use]
    pub fn local(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.local)
    }

    /// Whether both handles point at the same forwarding track
    #[must_use]
    pub fn same_track(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.local, &other.local)
    }

    #[must_use]
    pub fn packets_forwarded(&self) -> u64 {
        self.stats.packets.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_forwarded(&self) -> u64 {
        self.stats.bytes.load(Ordering::Relaxed)
    }

    async fn write(&self, packet: &Packet) {
        match self.local.write_rtp(packet).await {
            Ok(_) => {
                let size = packet.header.marshal_size() + packet.payload.len();
                self.stats.packets.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes.fetch_add(size as u64, Ordering::Relaxed);
            }
            // No subscriber bound yet, or one went away mid-write
            Err(e) => debug!(track_id = %self.track_id, error = %e, "RTP write failed"),
        }
    }
}

impl std::fmt::Debug for ForwardingTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingTrack")
            .field("owner", &self.owner)
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// What the room knows about one published stream
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// Present once media actually arrived
    pub forwarding: Option<ForwardingTrack>,
    pub track_id: String,
    pub kind: TrackKind,
}

/// Forwarding tracks of a room keyed by stream id
#[derive(Default)]
pub struct TrackRegistry {
    tracks: RwLock<HashMap<String, ForwardingTrack>>,
}

impl TrackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a track, returning the one it replaced
    pub fn insert(&self, track: ForwardingTrack) -> Option<ForwardingTrack> {
        self.tracks.write().insert(track.stream_id.clone(), track)
    }

    #[must_use]
    pub fn get(&self, stream_id: &str) -> Option<ForwardingTrack> {
        self.tracks.read().get(stream_id).cloned()
    }

    /// Remove `track` unless its slot was already taken over by a newer one
    pub fn remove_if_same(&self, track: &ForwardingTrack) -> bool {
        let mut tracks = self.tracks.write();
        match tracks.get(&track.stream_id) {
            Some(current) if current.same_track(track) => {
                tracks.remove(&track.stream_id);
                true
            }
            _ => false,
        }
    }

    /// Every registered track, for convergence
    #[must_use]
    pub fn tracks(&self) -> Vec<ForwardingTrack> {
        self.tracks.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    pub fn clear(&self) {
        self.tracks.write().clear();
    }
}

/// Copy packets from `remote` into `track` until the remote track ends.
///
/// On exit the track leaves `registry` (unless already replaced) and
/// `on_end` runs so the room can tear down subscribers.
pub fn spawn_forwarder<F>(
    remote: Arc<dyn RemoteTrack>,
    track: ForwardingTrack,
    registry: Arc<TrackRegistry>,
    on_end: F,
) -> JoinHandle<()>
where
    F: FnOnce(ForwardingTrack) + Send + 'static,
{
    tokio::spawn(async move {
        info!(
            owner = %track.owner,
            track_id = %track.track_id,
            stream_id = %track.stream_id,
            kind = ?track.kind,
            "Forwarding track"
        );

        loop {
            match remote.read_packet().await {
                Ok(packet) => track.write(&packet).await,
                Err(e) => {
                    info!(
                        track_id = %track.track_id,
                        error = %e,
                        packets = track.packets_forwarded(),
                        "Inbound track ended"
                    );
                    break;
                }
            }
        }

        registry.remove_if_same(&track);
        on_end(track);
    })
}
