//! Configuration structures for link and replication behavior.

use std::rc::Rc;
use std::time::Duration;

use crate::codec::{FrameCodec, JsonCodec};

/// Configuration shared by a [`LinkManager`](crate::link::LinkManager) and
/// the [`ReplicationNetwork`](crate::network::ReplicationNetwork) above it.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// Timeout for a single link to open
    pub connect_timeout: Duration,

    /// Delay between membership checks while a join settles
    pub join_poll_interval: Duration,

    /// Upper bound on how long `join` waits for membership to settle
    pub join_timeout: Duration,

    /// Bounds of the randomized delay before retrying a round that hit a
    /// busy member.
    pub busy_backoff_min: Duration,
    pub busy_backoff_max: Duration,

    /// How long a staged state may wait for CANCEL or PROMOTE before it is
    /// dropped.
    ///
    /// Set to `Duration::ZERO` to keep staged states until resolved.
    pub stale_stage_timeout: Duration,

    /// Name announced to the host with JOIN
    pub display_name: Option<String>,

    /// Frame serialization for network-backed channels
    pub codec: Rc<dyn FrameCodec>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            join_poll_interval: Duration::from_millis(100),
            join_timeout: Duration::from_secs(30),
            busy_backoff_min: Duration::from_millis(50),
            busy_backoff_max: Duration::from_millis(250),
            stale_stage_timeout: Duration::from_secs(10),
            display_name: None,
            codec: Rc::new(JsonCodec),
        }
    }
}

impl MeshConfig {
    /// Create a configuration for in-process peers.
    pub fn local_network() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            join_poll_interval: Duration::from_millis(5),
            join_timeout: Duration::from_secs(2),
            busy_backoff_min: Duration::from_millis(1),
            busy_backoff_max: Duration::from_millis(10),
            stale_stage_timeout: Duration::from_secs(1),
            display_name: None,
            codec: Rc::new(JsonCodec),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Set the busy retry window. `max` below `min` is raised to `min`.
    pub fn with_busy_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.busy_backoff_min = min;
        self.busy_backoff_max = max.max(min);
        self
    }

    pub fn with_stale_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stale_stage_timeout = timeout;
        self
    }

    pub fn with_codec(mut self, codec: impl FrameCodec) -> Self {
        self.codec = Rc::new(codec);
        self
    }

    /// Draw a back-off delay inside the busy retry window.
    pub(crate) fn busy_backoff(&self) -> Duration {
        let min = self.busy_backoff_min.as_micros() as u64;
        let max = (self.busy_backoff_max.as_micros() as u64).max(min);
        Duration::from_micros(rand::Rng::gen_range(&mut rand::thread_rng(), min..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_backoff_stays_in_window() {
        let config = MeshConfig::default()
            .with_busy_backoff(Duration::from_millis(10), Duration::from_millis(20));
        for _ in 0..100 {
            let delay = config.busy_backoff();
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_inverted_backoff_window_collapses() {
        let config = MeshConfig::default()
            .with_busy_backoff(Duration::from_millis(30), Duration::from_millis(5));
        assert_eq!(config.busy_backoff(), Duration::from_millis(30));
    }

    #[test]
    fn test_local_network_is_tighter_than_default() {
        let local = MeshConfig::local_network();
        let default = MeshConfig::default();
        assert!(local.connect_timeout < default.connect_timeout);
        assert!(local.join_timeout < default.join_timeout);
        assert!(local.display_name.is_none());
    }
}
