//! webrtc-rs backed peers
//!
//! Every peer connection starts with one receive-only audio and one
//! receive-only video transceiver so the client can publish before any
//! other participant is present. Forwarding tracks are added as
//! additional send transceivers during convergence.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::message::{IceCandidate, TrackKind};
use crate::peer::{
    ConnectionState, MediaPeer, PeerEvent, PeerEventHandler, PeerFactory, SignalingState,
};
use crate::track::{ForwardingTrack, RemoteTrack};
use crate::types::SessionId;

/// Size of the scratch buffer used to drain sender RTCP
const RTCP_BUFFER_SIZE: usize = 1500;

/// Builds webrtc-rs peer connections sharing one media engine
pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(config: &SfuConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create_peer(
        &self,
        session: &SessionId,
        events: PeerEventHandler,
    ) -> Result<Arc<dyn MediaPeer>> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration()).await?);

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        let handler = Arc::clone(&events);
        let owner = session.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let handler = Arc::clone(&handler);
            let owner = owner.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => handler(PeerEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!(session = %owner, error = %e, "Failed to serialize ICE candidate"),
                }
            })
        }));

        let handler = Arc::clone(&events);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            handler(PeerEvent::ConnectionState(map_connection_state(state)));
            Box::pin(async {})
        }));

        let handler = Arc::clone(&events);
        let owner = session.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            debug!(
                session = %owner,
                track_id = %track.id(),
                stream_id = %track.stream_id(),
                ssrc = track.ssrc(),
                "Remote track started"
            );
            handler(PeerEvent::Track(Arc::new(RtcRemoteTrack { track })));
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeer {
            session: session.clone(),
            pc,
            negotiated: AtomicBool::new(false),
        }))
    }
}

/// A participant's webrtc-rs peer connection
pub struct RtcPeer {
    session: SessionId,
    pc: Arc<RTCPeerConnection>,
    /// Set once a local description was applied; webrtc-rs reports
    /// `stable` for a fresh connection too
    negotiated: AtomicBool,
}

impl RtcPeer {
    async fn local_sdp(&self) -> Result<String> {
        self.negotiated.store(true, Ordering::Release);
        self.pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| Error::InvalidState("no local description".to_string()))
    }
}

#[async_trait]
impl MediaPeer for RtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.local_sdp().await
    }

    async fn accept_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn accept_offer(&self, sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(offer).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_sdp().await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: &ForwardingTrack) -> Result<()> {
        let sender = self
            .pc
            .add_track(track.local() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Interceptors only see RTCP (NACK, PLI) if somebody reads it
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
            while let Ok((_, _)) = sender.read(&mut buf).await {}
        });
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<bool> {
        for sender in self.pc.get_senders().await {
            let Some(track) = sender.track().await else {
                continue;
            };
            if track.id() == track_id {
                self.pc.remove_track(&sender).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn outbound_track_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                ids.push(track.id().to_string());
            }
        }
        ids
    }

    async fn inbound_track_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for receiver in self.pc.get_receivers().await {
            for track in receiver.tracks().await {
                ids.push(track.id());
            }
        }
        ids
    }

    async fn request_keyframes(&self) -> Result<()> {
        for receiver in self.pc.get_receivers().await {
            for track in receiver.tracks().await {
                if track.kind() != RTPCodecType::Video {
                    continue;
                }
                let pli = PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc: track.ssrc(),
                };
                self.pc.write_rtcp(&[Box::new(pli)]).await?;
            }
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable if !self.negotiated.load(Ordering::Acquire) => {
                SignalingState::New
            }
            RTCSignalingState::Unspecified => SignalingState::New,
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<()> {
        debug!(session = %self.session, "Closing peer connection");
        self.pc.close().await?;
        Ok(())
    }
}

const fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

/// Inbound track of a webrtc-rs peer connection
pub struct RtcRemoteTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteTrack for RtcRemoteTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn stream_id(&self) -> String {
        self.track.stream_id()
    }

    fn kind(&self) -> TrackKind {
        TrackKind::from(self.track.kind())
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        self.track.codec().capability
    }

    async fn read_packet(&self) -> Result<Packet> {
        let (packet, _) = self.track.read_rtp().await?;
        Ok(packet)
    }
}
