//! Engine configuration. Defaults follow the PairDrop web client; chunk and
//! partition sizes must match on both sides.

use std::time::Duration;

use crate::protocol::{CHUNK_SIZE, PARTITION_SIZE};

/// Default folder received files are saved under.
pub const DEFAULT_SAVE_LOCATION: &str = "PeerDrop";

#[derive(Debug, Clone)]
pub struct Config {
    pub chunk_size: usize,
    pub partition_size: usize,
    /// Stop queueing chunks while the channel holds more than this many bytes.
    pub max_buffered_amount: usize,
    /// Resume once the channel buffer drains to this level.
    pub buffered_low_water_mark: usize,
    pub drain_poll_interval: Duration,
    /// Wait for accept/reject; expiry counts as a rejection.
    pub response_timeout: Duration,
    /// Wait for the data channel to open before sending.
    pub channel_open_timeout: Duration,
    /// Minimum batch progress delta (fraction) between receiver progress reports.
    pub progress_step: f64,
    pub save_location: String,
    /// Name candidates tried when saving before giving up.
    pub max_save_attempts: u32,
    /// Secrets of paired devices' rooms, re-joined on every relay connect.
    pub room_secrets: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            partition_size: PARTITION_SIZE,
            max_buffered_amount: 1024 * 1024,
            buffered_low_water_mark: 512 * 1024,
            drain_poll_interval: Duration::from_millis(50),
            response_timeout: Duration::from_secs(60),
            channel_open_timeout: Duration::from_secs(120),
            progress_step: 0.005,
            save_location: DEFAULT_SAVE_LOCATION.to_string(),
            max_save_attempts: 100,
            room_secrets: Vec::new(),
        }
    }
}
