//! Fakes shared by the unit tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::message::{IceCandidate, TrackKind};
use crate::participant::{ConnectionHandle, Identity, Participant};
use crate::peer::{
    ConnectionState, MediaPeer, PeerEvent, PeerEventHandler, PeerFactory, SignalingState,
};
use crate::room::{Room, RoomContext};
use crate::store::{ChatMessage, MemoryMessageStore, MessageStore};
use crate::track::{ForwardingTrack, RemoteTrack};
use crate::transport::{channel_transport, ChannelRemote};
use crate::types::{ChannelId, RoomId, SessionId};

pub(crate) fn participant(id: &str, name: &str) -> (Arc<Participant>, mpsc::Receiver<Bytes>) {
    Participant::new(Identity::new(id, name, ""), 32)
}

pub(crate) fn opus() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        ..Default::default()
    }
}

struct FakePeerState {
    signaling: SignalingState,
    connection: ConnectionState,
    outbound: Vec<String>,
    candidates: Vec<IceCandidate>,
}

/// In-memory [`MediaPeer`] following the offer/answer state machine
pub(crate) struct FakePeer {
    state: Mutex<FakePeerState>,
    offers: AtomicUsize,
    keyframe_requests: AtomicUsize,
    fail_offers: AtomicBool,
}

impl FakePeer {
    fn new(fail_offers: bool) -> Self {
        Self {
            state: Mutex::new(FakePeerState {
                signaling: SignalingState::New,
                connection: ConnectionState::New,
                outbound: Vec::new(),
                candidates: Vec::new(),
            }),
            offers: AtomicUsize::new(0),
            keyframe_requests: AtomicUsize::new(0),
            fail_offers: AtomicBool::new(fail_offers),
        }
    }

    pub(crate) fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub(crate) fn keyframe_requests(&self) -> usize {
        self.keyframe_requests.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn outbound(&self) -> Vec<String> {
        self.state.lock().outbound.clone()
    }

    pub(crate) fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    /// Lose a sender behind the room's back
    pub(crate) fn drop_outbound(&self, track_id: &str) {
        self.state.lock().outbound.retain(|id| id != track_id);
    }

    pub(crate) fn mark_closed(&self) {
        let mut state = self.state.lock();
        state.connection = ConnectionState::Closed;
        state.signaling = SignalingState::Closed;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().connection == ConnectionState::Closed
    }
}

#[async_trait]
impl MediaPeer for FakePeer {
    async fn create_offer(&self) -> Result<String> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("offer rejected".to_string()));
        }
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(Error::InvalidState("closed".to_string()));
        }
        state.signaling = SignalingState::HaveLocalOffer;
        Ok(format!("offer-{n}"))
    }

    async fn accept_answer(&self, _sdp: String) -> Result<()> {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveLocalOffer {
            return Err(Error::InvalidState(state.signaling.to_string()));
        }
        state.signaling = SignalingState::Stable;
        Ok(())
    }

    async fn accept_offer(&self, _sdp: String) -> Result<String> {
        let mut state = self.state.lock();
        if !state.signaling.can_offer() {
            return Err(Error::InvalidState(state.signaling.to_string()));
        }
        state.signaling = SignalingState::Stable;
        Ok("answer".to_string())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.state.lock().candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &ForwardingTrack) -> Result<()> {
        let mut state = self.state.lock();
        if !state.outbound.iter().any(|id| id == track.track_id()) {
            state.outbound.push(track.track_id().to_string());
        }
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let before = state.outbound.len();
        state.outbound.retain(|id| id != track_id);
        Ok(state.outbound.len() != before)
    }

    async fn outbound_track_ids(&self) -> Vec<String> {
        self.outbound()
    }

    async fn inbound_track_ids(&self) -> Vec<String> {
        Vec::new()
    }

    async fn request_keyframes(&self) -> Result<()> {
        self.keyframe_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn close(&self) -> Result<()> {
        self.mark_closed();
        Ok(())
    }
}

/// [`PeerFactory`] handing out [`FakePeer`]s and keeping their handlers
#[derive(Default)]
pub(crate) struct FakePeerFactory {
    peers: Mutex<HashMap<SessionId, (Arc<FakePeer>, PeerEventHandler)>>,
    fail_offers: AtomicBool,
}

impl FakePeerFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make peers created from now on reject offers
    pub(crate) fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn peer(&self, session: &SessionId) -> Option<Arc<FakePeer>> {
        self.peers.lock().get(session).map(|(peer, _)| Arc::clone(peer))
    }

    /// Deliver a peer event as the peer connection of `session` would
    pub(crate) fn emit(&self, session: &SessionId, event: PeerEvent) {
        let handler = self
            .peers
            .lock()
            .get(session)
            .map(|(_, handler)| Arc::clone(handler))
            .expect("no peer for session");
        handler(event);
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create_peer(
        &self,
        session: &SessionId,
        events: PeerEventHandler,
    ) -> Result<Arc<dyn MediaPeer>> {
        let peer = Arc::new(FakePeer::new(self.fail_offers.load(Ordering::SeqCst)));
        self.peers
            .lock()
            .insert(session.clone(), (Arc::clone(&peer), events));
        Ok(peer)
    }
}

/// Remote track fed by a channel; dropping the sender ends the track
pub(crate) struct FakeRemoteTrack {
    id: String,
    stream_id: String,
    kind: TrackKind,
    packets: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
}

impl FakeRemoteTrack {
    pub(crate) fn new(
        id: &str,
        stream_id: &str,
        kind: TrackKind,
    ) -> (Arc<dyn RemoteTrack>, mpsc::Sender<Packet>) {
        let (tx, rx) = mpsc::channel(16);
        let track = Arc::new(Self {
            id: id.to_string(),
            stream_id: stream_id.to_string(),
            kind,
            packets: tokio::sync::Mutex::new(rx),
        });
        (track, tx)
    }
}

#[async_trait]
impl RemoteTrack for FakeRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn stream_id(&self) -> String {
        self.stream_id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        opus()
    }

    async fn read_packet(&self) -> Result<Packet> {
        self.packets
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Transport("track ended".to_string()))
    }
}

/// A message store whose backend is always down
pub(crate) struct FailingMessageStore;

#[async_trait]
impl MessageStore for FailingMessageStore {
    async fn create_message(&self, _message: ChatMessage) -> Result<()> {
        Err(Error::Store("backend unavailable".to_string()))
    }

    async fn messages_in_room(&self, _room_id: &RoomId) -> Result<Vec<ChatMessage>> {
        Err(Error::Store("backend unavailable".to_string()))
    }
}

pub(crate) fn test_config() -> SfuConfig {
    SfuConfig {
        // Keep the ticker out of the way unless a test wants it
        keyframe_interval_ms: 60_000,
        ..SfuConfig::default()
    }
}

pub(crate) fn context_with(
    factory: &Arc<FakePeerFactory>,
    store: Arc<dyn MessageStore>,
    config: SfuConfig,
) -> RoomContext {
    RoomContext::new(config, Arc::clone(factory) as Arc<dyn PeerFactory>, store)
}

pub(crate) fn start_room(factory: &Arc<FakePeerFactory>, config: SfuConfig) -> Arc<Room> {
    start_room_with_store(factory, Arc::new(MemoryMessageStore::new()), config)
}

pub(crate) fn start_room_with_store(
    factory: &Arc<FakePeerFactory>,
    store: Arc<dyn MessageStore>,
    config: SfuConfig,
) -> Arc<Room> {
    Room::start(
        RoomId::from("r1"),
        "General",
        ChannelId::from("c1"),
        context_with(factory, store, config),
    )
}

/// A participant connected to a room through a channel transport
pub(crate) struct Member {
    pub(crate) participant: Arc<Participant>,
    pub(crate) remote: ChannelRemote,
    pub(crate) handle: ConnectionHandle,
}

impl Member {
    /// Send a raw frame as the client
    pub(crate) async fn send(&self, frame: &str) {
        self.remote
            .inbound
            .send(Ok(Bytes::from(frame.to_string())))
            .await
            .unwrap();
    }

    /// Answer the outstanding server offer
    pub(crate) async fn answer(&self) {
        self.send(r#"{"type":"webrtc-answer","answer":{"type":"answer","sdp":"v=0"}}"#)
            .await;
    }

    /// Drop the client side of the transport
    pub(crate) fn disconnect(self) -> Arc<Participant> {
        drop(self.remote);
        self.participant
    }
}

pub(crate) fn join(room: &Room, id: &str, name: &str) -> Member {
    let (source, sink, remote) = channel_transport(64);
    let (participant, handle) = room.join(Identity::new(id, name, ""), source, sink);
    Member {
        participant,
        remote,
        handle,
    }
}

/// Next frame of the given `type`, skipping everything else
pub(crate) async fn next_of_type(rx: &mut mpsc::Receiver<Bytes>, kind: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let frame = rx.recv().await.expect("transport closed");
            let value: Value = serde_json::from_slice(&frame).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind} frame received"))
}

/// Next presence snapshot satisfying `predicate`
pub(crate) async fn snapshot_where<F>(rx: &mut mpsc::Receiver<Bytes>, predicate: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    loop {
        let snapshot = next_of_type(rx, "room-updated").await;
        if predicate(&snapshot) {
            return snapshot;
        }
    }
}

/// Next presence snapshot listing exactly `names`, in order
pub(crate) async fn snapshot_with(rx: &mut mpsc::Receiver<Bytes>, names: &[&str]) -> Value {
    snapshot_where(rx, |snapshot| user_names(snapshot) == names).await
}

/// Track ids listed for the user called `name`
pub(crate) fn user_tracks(snapshot: &Value, name: &str) -> Vec<(String, String)> {
    snapshot["payload"]["users"]
        .as_array()
        .and_then(|users| users.iter().find(|user| user["name"] == name))
        .and_then(|user| user["tracks"].as_array())
        .map(|tracks| {
            tracks
                .iter()
                .map(|track| {
                    (
                        track["id"].as_str().unwrap_or_default().to_string(),
                        track["kind"].as_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn user_names(snapshot: &Value) -> Vec<String> {
    snapshot["payload"]["users"]
        .as_array()
        .map(|users| {
            users
                .iter()
                .filter_map(|user| user["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Assert no frame of `kind` arrives within `window`
pub(crate) async fn assert_none_of_type(rx: &mut mpsc::Receiver<Bytes>, kind: &str, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_) | Ok(None) => return,
            Ok(Some(frame)) => {
                let value: Value = serde_json::from_slice(&frame).unwrap();
                assert_ne!(value["type"], kind, "unexpected {kind} frame: {value}");
            }
        }
    }
}

/// Poll `condition` until it holds, failing after two seconds
pub(crate) async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
