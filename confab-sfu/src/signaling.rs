//! Offer/answer orchestration
//!
//! Two ways of bringing peer connections up to date:
//!
//! - **Full convergence** reconciles every peer's outbound senders against
//!   the registry and sends each peer a fresh offer. A pass that trips over
//!   a concurrent change is retried, up to a bounded number of attempts;
//!   after that exactly one deferred pass is scheduled.
//! - **Incremental renegotiation** re-offers a single peer after one of its
//!   tracks was added or removed.
//!
//! The periodic keyframe request also lives here.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::message::{ServerMessage, SessionDescription};
use crate::peer::{ConnectionState, SignalingState};
use crate::room::{Client, RoomCore, RoomState};
use crate::track::ForwardingTrack;

/// Result of a full convergence pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceOutcome {
    /// Every peer was reconciled and offered on the given attempt
    Converged { attempts: usize },
    /// Attempts ran out; a deferred pass is (or already was) scheduled
    Deferred,
}

impl RoomCore {
    pub(crate) async fn converge(self: &Arc<Self>) -> ConvergenceOutcome {
        let mut state = self.state.lock().await;
        self.converge_locked(&mut state).await
    }

    pub(crate) async fn converge_locked(self: &Arc<Self>, state: &mut RoomState) -> ConvergenceOutcome {
        let max_attempts = self.context.config.max_convergence_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.sync_attempt(state).await {
                Ok(()) => {
                    self.stats.convergence_passes.fetch_add(1, Ordering::Relaxed);
                    debug!(room_id = %self.id, attempt, "Peer connections converged");
                    return ConvergenceOutcome::Converged { attempts: attempt };
                }
                Err(e) => {
                    debug!(room_id = %self.id, attempt, error = %e, "Convergence attempt failed");
                }
            }
        }

        warn!(
            room_id = %self.id,
            attempts = max_attempts,
            "Peer connections did not converge, deferring"
        );
        self.schedule_convergence();
        ConvergenceOutcome::Deferred
    }

    /// One reconciliation pass over every member. Any error aborts the pass.
    async fn sync_attempt(&self, state: &mut RoomState) -> Result<()> {
        for (session, client) in &state.clients {
            let Some(peer) = client.participant.peer() else {
                continue;
            };
            if peer.connection_state() == ConnectionState::Closed
                || peer.signaling_state() == SignalingState::Closed
            {
                client.participant.take_peer();
                info!(room_id = %self.id, session = %session, "Detached closed peer connection");
                return Err(Error::InvalidState("peer connection closed".to_string()));
            }
        }

        let tracks = self.registry.tracks();

        for (session, client) in &mut state.clients {
            let Some(peer) = client.participant.peer() else {
                continue;
            };

            // Never echo a participant's own media back to it
            let inbound: HashSet<String> = peer.inbound_track_ids().await.into_iter().collect();
            let desired: HashMap<&str, &ForwardingTrack> = tracks
                .iter()
                .filter(|track| track.owner() != session && !inbound.contains(track.track_id()))
                .map(|track| (track.track_id(), track))
                .collect();

            let current = peer.outbound_track_ids().await;
            for track_id in &current {
                if !desired.contains_key(track_id.as_str()) {
                    peer.remove_track(track_id).await?;
                }
            }
            for (track_id, track) in &desired {
                if !current.iter().any(|id| id == track_id) {
                    peer.add_track(track).await?;
                }
            }

            let renegotiation = peer.signaling_state() != SignalingState::New;
            let sdp = peer.create_offer().await?;
            client.info.renegotiation_pending = false;

            let message = ServerMessage::WebrtcOffer {
                offer: SessionDescription::offer(sdp),
                renegotiation,
            };
            if let Err(e) = client.participant.send_message(&message) {
                debug!(room_id = %self.id, session = %session, error = %e, "Offer not delivered");
            }
        }

        Ok(())
    }

    /// Schedule one deferred pass unless one is already pending
    fn schedule_convergence(self: &Arc<Self>) {
        if self.retry_pending.swap(true, Ordering::AcqRel) {
            debug!(room_id = %self.id, "Deferred convergence already pending");
            return;
        }
        self.stats.deferred_retries.fetch_add(1, Ordering::Relaxed);

        let core = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let delay = self.context.config.convergence_retry_delay();

        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            let Some(core) = core.upgrade() else {
                return;
            };
            core.retry_pending.store(false, Ordering::Release);
            debug!(room_id = %core.id, "Running deferred convergence");
            core.converge().await;
        });
    }

    /// Send a fresh offer to one member, or mark it pending while the
    /// member still owes us an answer
    pub(crate) async fn renegotiate(&self, client: &mut Client) {
        let session = client.participant.session();
        let Some(peer) = client.participant.peer() else {
            return;
        };

        let signaling = peer.signaling_state();
        if signaling.awaits_answer() {
            client.info.renegotiation_pending = true;
            debug!(room_id = %self.id, session = %session, "Renegotiation pending on outstanding answer");
            return;
        }
        if !signaling.can_offer() {
            debug!(room_id = %self.id, session = %session, state = %signaling, "Skipping renegotiation");
            return;
        }

        client.info.renegotiation_pending = false;
        match peer.create_offer().await {
            Ok(sdp) => {
                let message = ServerMessage::WebrtcOffer {
                    offer: SessionDescription::offer(sdp),
                    renegotiation: true,
                };
                if let Err(e) = client.participant.send_message(&message) {
                    debug!(room_id = %self.id, session = %session, error = %e, "Renegotiation offer not delivered");
                }
            }
            Err(e) => warn!(room_id = %self.id, session = %session, error = %e, "Renegotiation failed"),
        }
    }

    async fn request_keyframes(&self) {
        let peers: Vec<_> = {
            let state = self.state.lock().await;
            state
                .clients
                .values()
                .filter_map(|client| client.participant.peer())
                .collect()
        };

        for peer in peers {
            if let Err(e) = peer.request_keyframes().await {
                debug!(room_id = %self.id, error = %e, "Keyframe request failed");
            }
        }
    }
}

/// Ask every inbound video track of the room for a keyframe, once per
/// `period`, until the room is cancelled or gone
pub(crate) async fn keyframe_loop(core: Weak<RoomCore>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(core) = core.upgrade() else {
            break;
        };
        core.request_keyframes().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfig;
    use crate::message::TrackKind;
    use crate::peer::{MediaPeer, PeerEvent};
    use crate::room::Room;
    use crate::test_helpers::{
        join, next_of_type, start_room, wait_until, FakePeerFactory, FakeRemoteTrack, Member,
    };

    #[tokio::test]
    async fn test_join_sends_initial_offer() {
        let factory = FakePeerFactory::new();
        let room = start_room(&factory, SfuConfig::default());
        let mut alice = join(&room, "1", "alice");

        let offer = next_of_type(&mut alice.remote.outbound, "webrtc-offer").await;
        assert_eq!(offer["offer"]["type"], "offer");
        assert_eq!(offer["renegotiation"], false);

        let peer = factory.peer(alice.participant.session()).unwrap();
        assert_eq!(peer.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(room.stats().await.convergence_passes, 1);
    }

    #[tokio::test]
    async fn test_convergence_defers_once_after_max_attempts() {
        let factory = FakePeerFactory::new();
        factory.fail_offers(true);
        let config = SfuConfig {
            convergence_retry_delay_ms: 60_000,
            ..SfuConfig::default()
        };
        let room = start_room(&factory, config);
        let alice = join(&room, "1", "alice");
        wait_until(|| factory.peer(alice.participant.session()).is_some()).await;
        let peer = factory.peer(alice.participant.session()).unwrap();

        // The join pass exhausted its attempts and deferred
        wait_until(|| peer.offers() == 25).await;
        assert_eq!(room.converge().await, ConvergenceOutcome::Deferred);
        assert_eq!(peer.offers(), 50);

        let stats = room.stats().await;
        assert_eq!(stats.deferred_retries, 1);
        assert_eq!(stats.convergence_passes, 0);
    }

    #[tokio::test]
    async fn test_deferred_pass_runs_after_delay() {
        let factory = FakePeerFactory::new();
        factory.fail_offers(true);
        let config = SfuConfig {
            max_convergence_attempts: 3,
            convergence_retry_delay_ms: 200,
            ..SfuConfig::default()
        };
        let room = start_room(&factory, config);
        let mut alice = join(&room, "1", "alice");
        wait_until(|| factory.peer(alice.participant.session()).is_some()).await;
        let peer = factory.peer(alice.participant.session()).unwrap();
        wait_until(|| peer.offers() == 3).await;

        peer.set_fail_offers(false);
        let offer = next_of_type(&mut alice.remote.outbound, "webrtc-offer").await;
        assert_eq!(offer["offer"]["type"], "offer");

        let stats = room.stats().await;
        assert_eq!(stats.deferred_retries, 1);
        assert_eq!(stats.convergence_passes, 1);
    }

    #[tokio::test]
    async fn test_convergence_attaches_missing_tracks() {
        let factory = FakePeerFactory::new();
        let room = start_room(&factory, SfuConfig::default());
        let alice = join(&room, "1", "alice");
        let bob = join(&room, "2", "bob");
        wait_until(|| factory.peer(bob.participant.session()).is_some()).await;

        let (remote, _packets) = FakeRemoteTrack::new("a-mic", "a-stream", TrackKind::Audio);
        factory.emit(alice.participant.session(), PeerEvent::Track(remote));
        let bob_peer = factory.peer(bob.participant.session()).unwrap();
        wait_until(|| bob_peer.outbound().contains(&"a-mic".to_string())).await;

        // Simulate a subscriber that lost its sender, then converge
        bob_peer.drop_outbound("a-mic");
        assert!(matches!(room.converge().await, ConvergenceOutcome::Converged { .. }));
        assert_eq!(bob_peer.outbound(), vec!["a-mic".to_string()]);

        // The publisher never receives its own track
        let alice_peer = factory.peer(alice.participant.session()).unwrap();
        assert!(alice_peer.outbound().is_empty());
    }

    #[tokio::test]
    async fn test_convergence_detaches_closed_peer() {
        let factory = FakePeerFactory::new();
        let room = start_room(&factory, SfuConfig::default());
        let alice = join(&room, "1", "alice");
        wait_until(|| factory.peer(alice.participant.session()).is_some()).await;
        let peer = factory.peer(alice.participant.session()).unwrap();
        wait_until(|| alice.participant.peer().is_some()).await;

        peer.mark_closed();
        let outcome = room.converge().await;
        assert_eq!(outcome, ConvergenceOutcome::Converged { attempts: 2 });
        assert!(alice.participant.peer().is_none());
    }

    #[tokio::test]
    async fn test_renegotiation_waits_for_answer() {
        let factory = FakePeerFactory::new();
        let room = start_room(&factory, SfuConfig::default());
        let alice = join(&room, "1", "alice");
        let mut bob = join(&room, "2", "bob");
        wait_until(|| factory.peer(bob.participant.session()).is_some()).await;
        let bob_peer = factory.peer(bob.participant.session()).unwrap();
        // Bob has not answered the join offer yet
        wait_until(|| bob_peer.signaling_state() == SignalingState::HaveLocalOffer).await;
        let offers_before = bob_peer.offers();

        let (remote, _packets) = FakeRemoteTrack::new("a-cam", "a-stream", TrackKind::Video);
        factory.emit(alice.participant.session(), PeerEvent::Track(remote));
        wait_until(|| bob_peer.outbound().contains(&"a-cam".to_string())).await;
        wait_until_pending(&room, &bob).await;
        assert_eq!(bob_peer.offers(), offers_before);

        // The answer releases the pending renegotiation
        drain(&mut bob.remote.outbound);
        bob.answer().await;
        let offer = next_of_type(&mut bob.remote.outbound, "webrtc-offer").await;
        assert_eq!(offer["renegotiation"], true);
        assert_eq!(bob_peer.offers(), offers_before + 1);
    }

    async fn wait_until_pending(room: &Room, member: &Member) {
        let session = member.participant.session().clone();
        for _ in 0..200 {
            if room
                .participant_info(&session)
                .await
                .is_some_and(|info| info.renegotiation_pending)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("renegotiation never marked pending");
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<bytes::Bytes>) {
        while rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn test_keyframe_ticker_requests_keyframes() {
        let factory = FakePeerFactory::new();
        let config = SfuConfig {
            keyframe_interval_ms: 20,
            ..SfuConfig::default()
        };
        let room = start_room(&factory, config);
        let alice = join(&room, "1", "alice");
        wait_until(|| factory.peer(alice.participant.session()).is_some()).await;
        let peer = factory.peer(alice.participant.session()).unwrap();

        wait_until(|| peer.keyframe_requests() >= 2).await;

        room.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_shutdown = peer.keyframe_requests();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(peer.keyframe_requests(), after_shutdown);
    }
}
