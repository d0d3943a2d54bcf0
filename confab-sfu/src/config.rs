//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Capacity of each event bus subscriber queue
    pub event_queue_capacity: usize,
    /// Capacity of each participant's outbound frame queue
    pub outbound_queue_capacity: usize,
    /// Attempts a convergence pass makes before deferring itself
    pub max_convergence_attempts: usize,
    /// Delay before a deferred convergence pass runs (milliseconds)
    pub convergence_retry_delay_ms: u64,
    /// Period of forced keyframe requests (milliseconds)
    pub keyframe_interval_ms: u64,
    /// STUN server URLs handed to every peer connection
    pub ice_servers: Vec<String>,
    /// Send the room's chat history to a participant when it joins
    pub send_history_on_join: bool,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 100,
            outbound_queue_capacity: 20,
            max_convergence_attempts: 25,
            convergence_retry_delay_ms: 3000,
            keyframe_interval_ms: 3000,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            send_history_on_join: true,
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn convergence_retry_delay(&self) -> Duration {
        Duration::from_millis(self.convergence_retry_delay_ms)
    }

    #[must_use]
    pub const fn keyframe_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_interval_ms)
    }
}
