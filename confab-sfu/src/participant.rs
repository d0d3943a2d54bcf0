//! Participant (one connected client)
//!
//! A participant owns the sending half of a bounded outbound queue, its
//! media flags and, once negotiated, its peer connection. It never holds a
//! reference to the room: everything it has to say goes through the room's
//! [`EventBus`].

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::{Event, EventBus};
use crate::message::{frame_type, ServerMessage};
use crate::peer::MediaPeer;
use crate::transport::{FrameSink, FrameSource};
use crate::types::{ParticipantId, SessionId};

/// Authenticated identity handed over by the auth layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: ParticipantId,
    pub name: String,
    #[serde(default)]
    pub avatar: String,
}

impl Identity {
    pub fn new(id: impl Into<ParticipantId>, name: impl Into<String>, avatar: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: avatar.into(),
        }
    }
}

/// Microphone, camera and screen-share toggles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaFlags {
    pub mic: bool,
    pub video: bool,
    pub screen: bool,
}

/// Why a frame could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("outbound queue full")]
    Full,

    #[error("outbound queue closed")]
    Closed,
}

pub struct Participant {
    session: SessionId,
    identity: Identity,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    peer: RwLock<Option<Arc<dyn MediaPeer>>>,
    flags: RwLock<MediaFlags>,
}

impl Participant {
    /// Create a participant and the receiving end of its outbound queue
    #[must_use]
    pub fn new(identity: Identity, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let participant = Arc::new(Self {
            session: SessionId::generate(),
            identity,
            outbound: Mutex::new(Some(tx)),
            peer: RwLock::new(None),
            flags: RwLock::new(MediaFlags::default()),
        });
        (participant, rx)
    }

    #[must_use]
    pub const fn session(&self) -> &SessionId {
        &self.session
    }

    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub const fn id(&self) -> &ParticipantId {
        &self.identity.id
    }

    /// Queue a frame without waiting.
    ///
    /// A full queue means the client stopped reading: the queue is closed on
    /// the spot and [`SendError::Full`] tells the caller to drop the
    /// participant.
    pub fn send(&self, frame: Bytes) -> Result<(), SendError> {
        let mut outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(SendError::Closed);
        };

        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                *outbound = None;
                warn!(
                    session = %self.session,
                    participant = %self.identity.id,
                    "Outbound queue full, closing unresponsive participant"
                );
                Err(SendError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *outbound = None;
                Err(SendError::Closed)
            }
        }
    }

    pub fn send_message(&self, message: &ServerMessage) -> Result<(), SendError> {
        match message.encode() {
            Ok(frame) => self.send(frame),
            Err(e) => {
                warn!(session = %self.session, error = %e, "Failed to encode server message");
                Ok(())
            }
        }
    }

    /// Close the outbound queue. Returns `true` only for the call that
    /// actually closed it.
    pub fn close_outbound(&self) -> bool {
        let closed = self.outbound.lock().take().is_some();
        if closed {
            debug!(session = %self.session, "Outbound queue closed");
        }
        closed
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    #[must_use]
    pub fn peer(&self) -> Option<Arc<dyn MediaPeer>> {
        self.peer.read().clone()
    }

    pub fn set_peer(&self, peer: Arc<dyn MediaPeer>) {
        *self.peer.write() = Some(peer);
    }

    pub fn take_peer(&self) -> Option<Arc<dyn MediaPeer>> {
        self.peer.write().take()
    }

    #[must_use]
    pub fn flags(&self) -> MediaFlags {
        *self.flags.read()
    }

    /// Apply the toggles that are present, leave the rest unchanged
    pub fn update_flags(&self, mic: Option<bool>, video: Option<bool>, screen: Option<bool>) -> MediaFlags {
        let mut flags = self.flags.write();
        if let Some(mic) = mic {
            flags.mic = mic;
        }
        if let Some(video) = video {
            flags.video = video;
        }
        if let Some(screen) = screen {
            flags.screen = screen;
        }
        *flags
    }

    /// Join the room behind `bus` and start both connection loops
    pub fn connect<S, K>(
        self: &Arc<Self>,
        outbound: mpsc::Receiver<Bytes>,
        source: S,
        sink: K,
        bus: EventBus,
    ) -> ConnectionHandle
    where
        S: FrameSource,
        K: FrameSink,
    {
        bus.publish(Event::Register(Arc::clone(self)));

        let write = tokio::spawn(write_loop(self.session.clone(), outbound, sink));
        let read = tokio::spawn(read_loop(Arc::clone(self), source, bus));

        ConnectionHandle { read, write }
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        debug!(session = %self.session, participant = %self.identity.id, "Participant dropped");
    }
}

/// Join handles of a participant's two connection tasks
pub struct ConnectionHandle {
    pub read: JoinHandle<()>,
    pub write: JoinHandle<()>,
}

/// Pump frames from the transport into the room until the transport ends.
///
/// A frame that is not a JSON object with a `type` is fatal for the
/// connection. However the loop ends, the room gets an Unregister.
pub async fn read_loop<S: FrameSource>(participant: Arc<Participant>, mut source: S, bus: EventBus) {
    let session = participant.session().clone();

    loop {
        match source.recv().await {
            Some(Ok(frame)) => {
                if let Err(e) = frame_type(&frame) {
                    warn!(session = %session, error = %e, "Undecodable frame, closing connection");
                    break;
                }
                bus.publish(Event::Broadcast {
                    sender: Arc::clone(&participant),
                    payload: frame,
                });
            }
            Some(Err(e)) => {
                info!(session = %session, error = %e, "Transport read failed");
                break;
            }
            None => {
                info!(session = %session, "Transport closed");
                break;
            }
        }
    }

    bus.publish(Event::Unregister(participant));
}

/// Drain the outbound queue into the transport until the queue is closed
pub async fn write_loop<K: FrameSink>(session: SessionId, mut outbound: mpsc::Receiver<Bytes>, mut sink: K) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!(session = %session, error = %e, "Transport write failed");
            break;
        }
    }
    sink.close().await;
    debug!(session = %session, "Write loop finished");
}
