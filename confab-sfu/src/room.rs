//! Room coordinator
//!
//! One event loop per room consumes the Register, Unregister and Broadcast
//! queues of the room's [`EventBus`] and is the only writer of membership.
//! All per-participant state ([`ParticipantInfo`]) lives behind the room
//! guard lock; the [`TrackRegistry`] has its own lock, always taken after
//! the room lock.

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus, EventKind};
use crate::message::{
    ChatHistory, ClientMessage, IceCandidate, RoomSnapshot, SdpType, ServerMessage,
    SessionDescription, TrackKind, TrackSnapshot, UserSnapshot,
};
use crate::participant::{ConnectionHandle, Identity, Participant};
use crate::peer::{ConnectionState, PeerEvent, PeerEventHandler, PeerFactory};
use crate::signaling::{self, ConvergenceOutcome};
use crate::store::{ChatMessage, MessageStore};
use crate::track::{spawn_forwarder, ForwardingTrack, RemoteTrack, TrackInfo, TrackRegistry};
use crate::transport::{FrameSink, FrameSource};
use crate::types::{ChannelId, RoomId, SessionId};

/// Collaborators shared by every room of a hub
#[derive(Clone)]
pub struct RoomContext {
    pub config: Arc<SfuConfig>,
    pub peers: Arc<dyn PeerFactory>,
    pub messages: Arc<dyn MessageStore>,
}

impl RoomContext {
    pub fn new(
        config: SfuConfig,
        peers: Arc<dyn PeerFactory>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            peers,
            messages,
        }
    }
}

/// Room-side view of one participant
#[derive(Debug, Clone, Default)]
pub struct ParticipantInfo {
    /// Peer connection reached the connected state
    pub connected: bool,
    /// Published streams keyed by stream id, in publication order
    pub media_tracks: IndexMap<String, TrackInfo>,
    /// An incremental offer is owed once the outstanding answer arrives
    pub renegotiation_pending: bool,
}

pub(crate) struct Client {
    pub(crate) participant: Arc<Participant>,
    pub(crate) info: ParticipantInfo,
}

#[derive(Default)]
pub(crate) struct RoomState {
    /// Members in join order
    pub(crate) clients: IndexMap<SessionId, Client>,
}

/// Room counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStats {
    pub participants: usize,
    pub published_tracks: usize,
    pub convergence_passes: u64,
    pub deferred_retries: u64,
    pub evictions: u64,
}

#[derive(Default)]
pub(crate) struct StatsInner {
    pub(crate) convergence_passes: AtomicU64,
    pub(crate) deferred_retries: AtomicU64,
    pub(crate) evictions: AtomicU64,
}

pub(crate) struct RoomCore {
    pub(crate) id: RoomId,
    pub(crate) name: String,
    pub(crate) context: RoomContext,
    pub(crate) state: Mutex<RoomState>,
    pub(crate) registry: Arc<TrackRegistry>,
    pub(crate) stats: StatsInner,
    /// A deferred convergence pass is scheduled
    pub(crate) retry_pending: AtomicBool,
    pub(crate) cancel: CancellationToken,
}

/// A running room
pub struct Room {
    id: RoomId,
    name: String,
    channel_id: ChannelId,
    bus: EventBus,
    core: Arc<RoomCore>,
}

impl Room {
    /// Create the room and spawn its event loop and keyframe ticker
    pub fn start(
        id: RoomId,
        name: impl Into<String>,
        channel_id: ChannelId,
        context: RoomContext,
    ) -> Arc<Self> {
        let name = name.into();
        let capacity = context.config.event_queue_capacity;
        let keyframe_interval = context.config.keyframe_interval();

        let bus = EventBus::new();
        let register = bus.subscribe(EventKind::Register, capacity);
        let unregister = bus.subscribe(EventKind::Unregister, capacity);
        let broadcast = bus.subscribe(EventKind::Broadcast, capacity);

        let core = Arc::new(RoomCore {
            id: id.clone(),
            name: name.clone(),
            context,
            state: Mutex::new(RoomState::default()),
            registry: Arc::new(TrackRegistry::new()),
            stats: StatsInner::default(),
            retry_pending: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run(Arc::clone(&core), register, unregister, broadcast));
        tokio::spawn(signaling::keyframe_loop(
            Arc::downgrade(&core),
            keyframe_interval,
            core.cancel.clone(),
        ));

        info!(room_id = %id, channel_id = %channel_id, room_name = %name, "Room started");

        Arc::new(Self {
            id,
            name,
            channel_id,
            bus,
            core,
        })
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Handle for publishing into this room
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Attach a new connection to the room
    pub fn join<S, K>(&self, identity: Identity, source: S, sink: K) -> (Arc<Participant>, ConnectionHandle)
    where
        S: FrameSource,
        K: FrameSink,
    {
        let (participant, outbound) =
            Participant::new(identity, self.core.context.config.outbound_queue_capacity);
        let handle = participant.connect(outbound, source, sink, self.bus.clone());
        (participant, handle)
    }

    pub async fn snapshot(&self) -> RoomSnapshot {
        let state = self.core.state.lock().await;
        self.core.snapshot_of(&state)
    }

    pub async fn participant_count(&self) -> usize {
        self.core.state.lock().await.clients.len()
    }

    pub async fn participant_info(&self, session: &SessionId) -> Option<ParticipantInfo> {
        let state = self.core.state.lock().await;
        state.clients.get(session).map(|client| client.info.clone())
    }

    pub async fn stats(&self) -> RoomStats {
        let participants = self.participant_count().await;
        RoomStats {
            participants,
            published_tracks: self.core.registry.len(),
            convergence_passes: self.core.stats.convergence_passes.load(Ordering::Relaxed),
            deferred_retries: self.core.stats.deferred_retries.load(Ordering::Relaxed),
            evictions: self.core.stats.evictions.load(Ordering::Relaxed),
        }
    }

    /// Run a full convergence pass now
    pub async fn converge(&self) -> ConvergenceOutcome {
        self.core.converge().await
    }

    /// Stop the event loop, the ticker and any deferred pass, then drop
    /// every participant
    pub fn shutdown(&self) {
        if !self.core.cancel.is_cancelled() {
            info!(room_id = %self.id, "Shutting down room");
            self.core.cancel.cancel();
        }
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.core.cancel.is_cancelled()
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.core.cancel.cancel();
    }
}

async fn run(
    core: Arc<RoomCore>,
    mut register: mpsc::Receiver<Event>,
    mut unregister: mpsc::Receiver<Event>,
    mut broadcast: mpsc::Receiver<Event>,
) {
    loop {
        // Registration first so a join is seen before its follow-up traffic
        tokio::select! {
            biased;
            () = core.cancel.cancelled() => break,
            Some(event) = register.recv() => core.handle(event).await,
            Some(event) = broadcast.recv() => core.handle(event).await,
            Some(event) = unregister.recv() => core.handle(event).await,
            else => break,
        }
    }

    core.teardown().await;
}

impl RoomCore {
    async fn handle(self: &Arc<Self>, event: Event) {
        match event {
            Event::Register(participant) => self.register(participant).await,
            Event::Unregister(participant) => self.unregister(&participant).await,
            Event::Broadcast { sender, payload } => self.broadcast(&sender, payload).await,
        }
    }

    async fn register(self: &Arc<Self>, participant: Arc<Participant>) {
        let session = participant.session().clone();
        let mut state = self.state.lock().await;

        if state.clients.contains_key(&session) {
            debug!(room_id = %self.id, session = %session, "Participant already registered");
            return;
        }
        if participant.is_closed() {
            debug!(room_id = %self.id, session = %session, "Participant left before joining");
            return;
        }

        state.clients.insert(
            session.clone(),
            Client {
                participant: Arc::clone(&participant),
                info: ParticipantInfo::default(),
            },
        );
        info!(
            room_id = %self.id,
            session = %session,
            participant = %participant.id(),
            participants = state.clients.len(),
            "Participant joined"
        );

        match self
            .context
            .peers
            .create_peer(&session, self.peer_event_handler(&participant))
            .await
        {
            Ok(peer) => participant.set_peer(peer),
            Err(e) => warn!(
                room_id = %self.id,
                session = %session,
                error = %e,
                "Failed to create peer connection"
            ),
        }

        self.converge_locked(&mut state).await;
        self.send_history(&participant).await;
        self.broadcast_presence(&mut state, None).await;
    }

    async fn unregister(self: &Arc<Self>, participant: &Arc<Participant>) {
        let mut state = self.state.lock().await;

        if self.remove_client(&mut state, participant.session()).await.is_none() {
            // Not a member (never joined, or already evicted)
            participant.close_outbound();
            debug!(room_id = %self.id, session = %participant.session(), "Unregister for non-member");
            return;
        }

        info!(
            room_id = %self.id,
            session = %participant.session(),
            participant = %participant.id(),
            participants = state.clients.len(),
            "Participant left"
        );

        self.broadcast_presence(&mut state, None).await;
        self.converge_locked(&mut state).await;
    }

    async fn broadcast(self: &Arc<Self>, sender: &Arc<Participant>, payload: Bytes) {
        let session = sender.session();
        let message = match ClientMessage::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(room_id = %self.id, session = %session, error = %e, "Dropping malformed message");
                return;
            }
        };

        let mut state = self.state.lock().await;
        if !state.clients.contains_key(session) {
            debug!(room_id = %self.id, session = %session, "Dropping message from non-member");
            return;
        }

        match message {
            ClientMessage::ChatMessage { content } => {
                self.relay_chat(&mut state, sender, content, payload).await;
            }
            ClientMessage::PresenceUpdate {
                is_mic_enabled,
                is_video_enabled,
                is_screen_enabled,
            } => {
                let flags = sender.update_flags(is_mic_enabled, is_video_enabled, is_screen_enabled);
                debug!(room_id = %self.id, session = %session, ?flags, "Presence updated");
                self.broadcast_presence(&mut state, Some(session)).await;
            }
            ClientMessage::TrackMetadata {
                track_id,
                track_type,
                stream_id,
            } => {
                self.apply_track_metadata(&mut state, session, track_id, track_type, stream_id)
                    .await;
                self.broadcast_presence(&mut state, Some(session)).await;
            }
            ClientMessage::StopShare { track_id } => {
                if self.stop_share(&mut state, session, &track_id).await {
                    self.broadcast_presence(&mut state, Some(session)).await;
                } else {
                    debug!(room_id = %self.id, session = %session, track_id = %track_id, "Stop-share for unknown track");
                }
            }
            ClientMessage::WebrtcOffer { offer } => self.handle_offer(sender, offer).await,
            ClientMessage::WebrtcAnswer { answer } => {
                self.handle_answer(&mut state, session, answer).await;
            }
            ClientMessage::WebrtcIceCandidate { candidate } => match self.handle_candidate(sender, candidate).await {
                Ok(()) => {}
                Err(Error::PeerNotReady) => {
                    debug!(room_id = %self.id, session = %session, "Peer connection not initialized, ignoring ICE candidate");
                }
                Err(e) => warn!(room_id = %self.id, session = %session, error = %e, "Failed to add ICE candidate"),
            },
        }
    }

    async fn relay_chat(
        self: &Arc<Self>,
        state: &mut RoomState,
        sender: &Participant,
        content: String,
        payload: Bytes,
    ) {
        let identity = sender.identity();
        let message = ChatMessage::new(
            self.id.clone(),
            identity.id.clone(),
            &identity.name,
            &identity.avatar,
            content,
        );

        // Live delivery does not depend on persistence
        if let Err(e) = self.context.messages.create_message(message).await {
            warn!(room_id = %self.id, session = %sender.session(), error = %e, "Failed to persist chat message");
        }

        let failed = send_to_all(state, &payload, None);
        if !failed.is_empty() {
            self.evict(state, failed).await;
            self.broadcast_presence(state, None).await;
        }
    }

    async fn apply_track_metadata(
        &self,
        state: &mut RoomState,
        owner: &SessionId,
        track_id: String,
        kind: TrackKind,
        stream_id: String,
    ) {
        let Some(client) = state.clients.get(owner) else {
            return;
        };
        // Only placeholders are superseded; a stream with a live forwarder
        // is never torn down by metadata.
        let stale: Vec<String> = client
            .info
            .media_tracks
            .iter()
            .filter(|(stream, info)| {
                **stream != stream_id
                    && info.forwarding.is_none()
                    && (info.kind == kind || info.track_id == track_id)
            })
            .map(|(stream, _)| stream.clone())
            .collect();

        for stream in stale {
            self.remove_track(state, owner, &stream).await;
        }

        if let Some(client) = state.clients.get_mut(owner) {
            debug!(
                room_id = %self.id,
                session = %owner,
                track_id = %track_id,
                stream_id = %stream_id,
                kind = ?kind,
                "Track metadata"
            );
            let info = client
                .info
                .media_tracks
                .entry(stream_id)
                .or_insert_with(|| TrackInfo {
                    forwarding: None,
                    track_id: track_id.clone(),
                    kind,
                });
            info.track_id = track_id;
            info.kind = kind;
        }
    }

    /// Tear down the track named by `track_id` (a track id or a stream id)
    async fn stop_share(&self, state: &mut RoomState, owner: &SessionId, track_id: &str) -> bool {
        let stream_id = state.clients.get(owner).and_then(|client| {
            client
                .info
                .media_tracks
                .iter()
                .find(|(stream, info)| info.track_id == track_id || stream.as_str() == track_id)
                .map(|(stream, _)| stream.clone())
        });

        match stream_id {
            Some(stream_id) => self.remove_track(state, owner, &stream_id).await,
            None => false,
        }
    }

    /// Delete a published stream and detach it from every subscriber
    async fn remove_track(&self, state: &mut RoomState, owner: &SessionId, stream_id: &str) -> bool {
        let Some(info) = state
            .clients
            .get_mut(owner)
            .and_then(|client| client.info.media_tracks.shift_remove(stream_id))
        else {
            return false;
        };

        if let Some(track) = info.forwarding {
            self.registry.remove_if_same(&track);
            let affected = detach_from_subscribers(state, owner, &track).await;
            for session in affected {
                if let Some(client) = state.clients.get_mut(&session) {
                    self.renegotiate(client).await;
                }
            }
        }

        info!(
            room_id = %self.id,
            session = %owner,
            stream_id = %stream_id,
            track_id = %info.track_id,
            "Track removed"
        );
        true
    }

    /// Remove a member with all of its tracks, close its peer connection
    /// and its outbound queue
    async fn remove_client(&self, state: &mut RoomState, session: &SessionId) -> Option<Arc<Participant>> {
        let client = state.clients.shift_remove(session)?;

        for info in client.info.media_tracks.values() {
            if let Some(track) = &info.forwarding {
                self.registry.remove_if_same(track);
                detach_from_subscribers(state, session, track).await;
            }
        }

        if let Some(peer) = client.participant.take_peer() {
            if let Err(e) = peer.close().await {
                debug!(room_id = %self.id, session = %session, error = %e, "Error closing peer connection");
            }
        }
        client.participant.close_outbound();

        Some(client.participant)
    }

    async fn evict(&self, state: &mut RoomState, sessions: Vec<SessionId>) {
        for session in sessions {
            if self.remove_client(state, &session).await.is_some() {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                warn!(room_id = %self.id, session = %session, "Evicted unresponsive participant");
            }
        }
    }

    /// Send the presence snapshot to every member but `exclude`. Members
    /// whose queue is full are evicted and the snapshot is sent again.
    async fn broadcast_presence(self: &Arc<Self>, state: &mut RoomState, exclude: Option<&SessionId>) {
        let mut evicted = false;

        loop {
            let message = ServerMessage::RoomUpdated {
                payload: self.snapshot_of(state),
            };
            let frame = match message.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(room_id = %self.id, error = %e, "Failed to encode presence snapshot");
                    return;
                }
            };

            let failed = send_to_all(state, &frame, exclude);
            if failed.is_empty() {
                break;
            }
            self.evict(state, failed).await;
            evicted = true;
        }

        if evicted {
            self.converge_locked(state).await;
        }
    }

    pub(crate) fn snapshot_of(&self, state: &RoomState) -> RoomSnapshot {
        let users = state
            .clients
            .values()
            .map(|client| {
                let identity = client.participant.identity();
                let flags = client.participant.flags();
                UserSnapshot {
                    id: identity.id.to_string(),
                    name: identity.name.clone(),
                    avatar: identity.avatar.clone(),
                    is_mic_enabled: flags.mic,
                    is_video_enabled: flags.video,
                    is_screen_enabled: flags.screen,
                    tracks: client
                        .info
                        .media_tracks
                        .values()
                        .map(|info| TrackSnapshot {
                            id: info.track_id.clone(),
                            kind: info.kind,
                        })
                        .collect(),
                }
            })
            .collect();

        RoomSnapshot {
            room_id: self.id.clone(),
            room_name: self.name.clone(),
            users,
        }
    }

    async fn send_history(&self, participant: &Participant) {
        if !self.context.config.send_history_on_join {
            return;
        }

        match self.context.messages.messages_in_room(&self.id).await {
            Ok(messages) if messages.is_empty() => {}
            Ok(messages) => {
                let count = messages.len();
                let message = ServerMessage::ChatHistory {
                    payload: ChatHistory {
                        room_id: self.id.clone(),
                        messages,
                    },
                };
                match participant.send_message(&message) {
                    Ok(()) => debug!(room_id = %self.id, session = %participant.session(), count, "Sent chat history"),
                    Err(e) => debug!(room_id = %self.id, session = %participant.session(), error = %e, "Chat history not delivered"),
                }
            }
            Err(e) => warn!(room_id = %self.id, error = %e, "Failed to load chat history"),
        }
    }

    async fn handle_offer(self: &Arc<Self>, sender: &Arc<Participant>, offer: SessionDescription) {
        let session = sender.session();
        if offer.sdp_type != SdpType::Offer {
            warn!(room_id = %self.id, session = %session, sdp_type = ?offer.sdp_type, "Offer with wrong SDP type");
            return;
        }

        let peer = match sender.peer() {
            Some(peer) => peer,
            None => match self
                .context
                .peers
                .create_peer(session, self.peer_event_handler(sender))
                .await
            {
                Ok(peer) => {
                    sender.set_peer(Arc::clone(&peer));
                    peer
                }
                Err(e) => {
                    warn!(room_id = %self.id, session = %session, error = %e, "Failed to create peer connection");
                    return;
                }
            },
        };

        match peer.accept_offer(offer.sdp).await {
            Ok(answer) => {
                let message = ServerMessage::WebrtcAnswer {
                    answer: SessionDescription::answer(answer),
                };
                if let Err(e) = sender.send_message(&message) {
                    debug!(room_id = %self.id, session = %session, error = %e, "Answer not delivered");
                }
            }
            Err(e) => warn!(room_id = %self.id, session = %session, error = %e, "Failed to answer offer"),
        }
    }

    async fn handle_answer(&self, state: &mut RoomState, session: &SessionId, answer: SessionDescription) {
        if answer.sdp_type != SdpType::Answer {
            warn!(room_id = %self.id, session = %session, sdp_type = ?answer.sdp_type, "Answer with wrong SDP type");
            return;
        }
        let Some(client) = state.clients.get_mut(session) else {
            return;
        };
        let Some(peer) = client.participant.peer() else {
            debug!(room_id = %self.id, session = %session, "Answer before peer connection exists");
            return;
        };

        let signaling = peer.signaling_state();
        if !signaling.awaits_answer() {
            warn!(room_id = %self.id, session = %session, state = %signaling, "Unexpected answer");
            return;
        }

        if let Err(e) = peer.accept_answer(answer.sdp).await {
            warn!(room_id = %self.id, session = %session, error = %e, "Failed to apply answer");
            return;
        }
        debug!(room_id = %self.id, session = %session, "Answer applied");

        if client.info.renegotiation_pending {
            self.renegotiate(client).await;
        }
    }

    async fn handle_candidate(&self, sender: &Participant, candidate: IceCandidate) -> Result<()> {
        let peer = sender.peer().ok_or(Error::PeerNotReady)?;
        peer.add_ice_candidate(candidate).await
    }

    /// Callback handed to a participant's peer connection.
    ///
    /// ICE candidates are relayed inline; everything else is handed to a
    /// task that takes the room lock.
    pub(crate) fn peer_event_handler(self: &Arc<Self>, participant: &Arc<Participant>) -> PeerEventHandler {
        let core = Arc::downgrade(self);
        let participant = Arc::downgrade(participant);

        Arc::new(move |event: PeerEvent| match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Some(participant) = participant.upgrade() {
                    relay_candidate(&participant, candidate);
                }
            }
            event => {
                let (Some(core), Some(participant)) = (core.upgrade(), participant.upgrade()) else {
                    return;
                };
                tokio::spawn(async move {
                    core.handle_peer_event(&participant, event).await;
                });
            }
        })
    }

    async fn handle_peer_event(self: &Arc<Self>, participant: &Arc<Participant>, event: PeerEvent) {
        let session = participant.session();
        match event {
            PeerEvent::IceCandidate(candidate) => relay_candidate(participant, candidate),
            PeerEvent::Track(remote) => self.handle_remote_track(participant, remote).await,
            PeerEvent::ConnectionState(connection) => {
                info!(room_id = %self.id, session = %session, state = ?connection, "Peer connection state changed");
                {
                    let mut state = self.state.lock().await;
                    if let Some(client) = state.clients.get_mut(session) {
                        client.info.connected = connection == ConnectionState::Connected;
                    }
                }

                match connection {
                    ConnectionState::Failed => {
                        if let Some(peer) = participant.peer() {
                            if let Err(e) = peer.close().await {
                                debug!(room_id = %self.id, session = %session, error = %e, "Error closing failed peer connection");
                            }
                        }
                    }
                    ConnectionState::Closed => {
                        self.converge().await;
                    }
                    _ => {}
                }
            }
        }
    }

    async fn handle_remote_track(self: &Arc<Self>, participant: &Arc<Participant>, remote: Arc<dyn RemoteTrack>) {
        let owner = participant.session().clone();
        let stream_id = remote.stream_id();
        let track_id = remote.id();
        let mut state = self.state.lock().await;

        let (track, previous) = {
            let Some(client) = state.clients.get_mut(&owner) else {
                debug!(room_id = %self.id, session = %owner, track_id = %track_id, "Track from departed participant ignored");
                return;
            };
            // A kind announced through track metadata wins over the codec kind
            let kind = client
                .info
                .media_tracks
                .get(&stream_id)
                .map_or_else(|| remote.kind(), |info| info.kind);
            let track = ForwardingTrack::new(
                owner.clone(),
                track_id.clone(),
                stream_id.clone(),
                kind,
                remote.codec(),
            );
            let previous = client
                .info
                .media_tracks
                .insert(
                    stream_id.clone(),
                    TrackInfo {
                        forwarding: Some(track.clone()),
                        track_id: track_id.clone(),
                        kind,
                    },
                )
                .and_then(|info| info.forwarding);
            (track, previous)
        };
        self.registry.insert(track.clone());

        if let Some(previous) = &previous {
            detach_from_subscribers(&state, &owner, previous).await;
        }

        for (session, client) in &mut state.clients {
            if *session == owner {
                continue;
            }
            let Some(peer) = client.participant.peer() else {
                continue;
            };
            if let Err(e) = peer.add_track(&track).await {
                warn!(room_id = %self.id, session = %session, track_id = %track_id, error = %e, "Failed to add forwarding track");
                continue;
            }
            self.renegotiate(client).await;
        }

        info!(
            room_id = %self.id,
            session = %owner,
            track_id = %track_id,
            stream_id = %stream_id,
            kind = ?track.kind(),
            "Track published"
        );

        let core = Arc::downgrade(self);
        spawn_forwarder(remote, track, Arc::clone(&self.registry), move |ended| {
            if let Some(core) = core.upgrade() {
                tokio::spawn(async move {
                    core.track_ended(ended).await;
                });
            }
        });

        self.broadcast_presence(&mut state, Some(&owner)).await;
    }

    async fn track_ended(self: &Arc<Self>, track: ForwardingTrack) {
        let owner = track.owner().clone();
        let mut state = self.state.lock().await;

        let current = state
            .clients
            .get(&owner)
            .and_then(|client| client.info.media_tracks.get(track.stream_id()))
            .and_then(|info| info.forwarding.as_ref())
            .is_some_and(|forwarding| forwarding.same_track(&track));
        if !current {
            return;
        }

        self.remove_track(&mut state, &owner, track.stream_id()).await;
        self.broadcast_presence(&mut state, Some(&owner)).await;
    }

    async fn teardown(&self) {
        let mut state = self.state.lock().await;
        let count = state.clients.len();

        for (session, client) in state.clients.drain(..) {
            if let Some(peer) = client.participant.take_peer() {
                if let Err(e) = peer.close().await {
                    debug!(room_id = %self.id, session = %session, error = %e, "Error closing peer connection");
                }
            }
            client.participant.close_outbound();
        }
        self.registry.clear();

        info!(room_id = %self.id, participants = count, "Room closed");
    }
}

fn relay_candidate(participant: &Participant, candidate: IceCandidate) {
    if let Err(e) = participant.send_message(&ServerMessage::WebrtcIceCandidate { candidate }) {
        debug!(session = %participant.session(), error = %e, "ICE candidate not delivered");
    }
}

/// Queue `frame` for every member but `exclude`, returning the members that
/// could not take it
fn send_to_all(state: &RoomState, frame: &Bytes, exclude: Option<&SessionId>) -> Vec<SessionId> {
    state
        .clients
        .iter()
        .filter(|(session, _)| Some(*session) != exclude)
        .filter_map(|(session, client)| {
            client
                .participant
                .send(frame.clone())
                .err()
                .map(|_| session.clone())
        })
        .collect()
}

/// Remove `track` from every peer connection but its owner's, returning
/// the sessions that actually had it
async fn detach_from_subscribers(
    state: &RoomState,
    owner: &SessionId,
    track: &ForwardingTrack,
) -> Vec<SessionId> {
    let mut affected = Vec::new();

    for (session, client) in &state.clients {
        if session == owner {
            continue;
        }
        let Some(peer) = client.participant.peer() else {
            continue;
        };
        match peer.remove_track(track.track_id()).await {
            Ok(true) => affected.push(session.clone()),
            Ok(false) => {}
            Err(e) => warn!(session = %session, track_id = %track.track_id(), error = %e, "Failed to remove forwarding track"),
        }
    }

    affected
}
