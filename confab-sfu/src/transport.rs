//! Transport boundary
//!
//! A connection is split into a [`FrameSource`] driven by the participant's
//! read loop and a [`FrameSink`] driven by its write loop. The WebSocket
//! adapter lives in the server binary; [`channel_transport`] provides an
//! in-process pair used by tests and embedders.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Inbound half of a connection
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame, an error for a broken transport, `None` once closed
    async fn recv(&mut self) -> Option<Result<Bytes>>;
}

/// Outbound half of a connection
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Close the connection; the peer's inbound half observes the close
    async fn close(&mut self);
}

/// [`FrameSource`] fed through a channel
pub struct ChannelSource {
    rx: mpsc::Receiver<Result<Bytes>>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await
    }
}

/// [`FrameSink`] draining into a channel
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Transport("sink closed".to_string()))?;
        tx.send(frame)
            .await
            .map_err(|_| Error::Transport("receiver dropped".to_string()))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

/// The remote end of a channel transport
pub struct ChannelRemote {
    /// Frames to deliver to the participant
    pub inbound: mpsc::Sender<Result<Bytes>>,
    /// Frames the participant wrote
    pub outbound: mpsc::Receiver<Bytes>,
}

/// Build an in-process transport with the given buffer size
#[must_use]
pub fn channel_transport(buffer: usize) -> (ChannelSource, ChannelSink, ChannelRemote) {
    let (in_tx, in_rx) = mpsc::channel(buffer);
    let (out_tx, out_rx) = mpsc::channel(buffer);
    (
        ChannelSource { rx: in_rx },
        ChannelSink { tx: Some(out_tx) },
        ChannelRemote {
            inbound: in_tx,
            outbound: out_rx,
        },
    )
}
