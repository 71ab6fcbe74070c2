//! Configuration system.
//!
//! Loads client configuration from JSON strings (file IO left to the app).
//! Every field has a default so partial documents are accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens when the head leaves the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Boundary {
    /// Leaving the grid kills the player.
    #[default]
    Walls,
    /// The head re-enters from the opposite edge.
    Wrap,
}

/// Root client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Display name sent with lobby commands.
    #[serde(default = "default_player_name")]
    pub player_name: String,
    #[serde(default = "default_grid_size")]
    pub grid_width: i32,
    #[serde(default = "default_grid_size")]
    pub grid_height: i32,
    /// Duration of one simulation step in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default)]
    pub boundary: Boundary,
    /// Render frames per second.
    #[serde(default = "default_frame_hz")]
    pub frame_hz: u32,
    /// Reconnect attempts before giving up.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubles per attempt.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Snapshots kept for interpolation.
    #[serde(default = "default_interp_buffer")]
    pub interp_buffer: usize,
    /// Head divergence (cells, per axis) tolerated before a hard correction.
    #[serde(default = "default_reconcile_tolerance")]
    pub reconcile_tolerance: f32,
    /// Ticks a predicted pickup may stay unconfirmed while the consumable is still listed.
    #[serde(default = "default_pickup_grace_ticks")]
    pub pickup_grace_ticks: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_player_name() -> String {
    "Player".to_string()
}

fn default_grid_size() -> i32 {
    20
}

fn default_tick_ms() -> u64 {
    500
}

fn default_frame_hz() -> u32 {
    60
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_interp_buffer() -> usize {
    3
}

fn default_reconcile_tolerance() -> f32 {
    2.0
}

fn default_pickup_grace_ticks() -> u64 {
    3
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            player_name: default_player_name(),
            grid_width: default_grid_size(),
            grid_height: default_grid_size(),
            tick_ms: default_tick_ms(),
            boundary: Boundary::default(),
            frame_hz: default_frame_hz(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_base_ms: default_reconnect_base_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            interp_buffer: default_interp_buffer(),
            reconcile_tolerance: default_reconcile_tolerance(),
            pickup_grace_ticks: default_pickup_grace_ticks(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ClientConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_hz.max(1) as f64)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}
