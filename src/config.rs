/// Engine configuration.
///
/// Everything here has a sensible default; `HubConfig::default()` is the
/// zero-configuration path. The fan-out cap is the one knob operators tend to
/// touch: it bounds how many series or datastreams a single join-style
/// observation query may touch before failing fast.
use serde::{Deserialize, Serialize};

/// Configuration shared by every store in a hub instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Maximum number of series/datastreams a single join-style query may
    /// fan out across. Exceeding this fails with
    /// [`HubError::FanOutExceeded`](crate::error::HubError::FanOutExceeded)
    /// rather than truncating results.
    pub max_join_fanout: usize,

    /// Capacity of each per-topic event broadcast channel. Slow subscribers
    /// that fall more than this many events behind observe a lag error.
    pub event_channel_capacity: usize,

    /// Number of entries a lazy range scan fetches per lock acquisition.
    pub scan_batch_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_join_fanout: 1000,
            event_channel_capacity: 256,
            scan_batch_size: 256,
        }
    }
}

impl HubConfig {
    /// Override the join fan-out cap.
    pub fn with_max_join_fanout(mut self, cap: usize) -> Self {
        self.max_join_fanout = cap;
        self
    }

    /// Override the event channel capacity.
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }
}
