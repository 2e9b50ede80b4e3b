//! Configuration system.
//!
//! Loads replication settings from JSON strings (file IO left to the binaries).

use serde::{Deserialize, Serialize};

/// What happens to a client's objects when it disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Ownership moves to the server; the objects live on.
    #[default]
    Orphan,
    /// The objects are destroyed on every peer.
    Destroy,
}

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Fixed tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Requests handled per client per tick; the rest wait for later ticks.
    #[serde(default = "default_max_client_requests_per_tick")]
    pub max_client_requests_per_tick: usize,
    /// Requests a client may have waiting; one more drops the client.
    #[serde(default = "default_max_pending_requests")]
    pub max_pending_requests: usize,
    /// Bounded per-client outbound queue, in frames.
    #[serde(default = "default_outbound_queue_frames")]
    pub outbound_queue_frames: usize,
    #[serde(default)]
    pub disconnect_policy: DisconnectPolicy,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_tick_hz() -> u32 {
    30
}

fn default_max_client_requests_per_tick() -> usize {
    32
}

fn default_max_pending_requests() -> usize {
    256
}

fn default_outbound_queue_frames() -> usize {
    256
}

fn default_player_name() -> String {
    "Player".to_string()
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            max_client_requests_per_tick: default_max_client_requests_per_tick(),
            max_pending_requests: default_max_pending_requests(),
            outbound_queue_frames: default_outbound_queue_frames(),
            disconnect_policy: DisconnectPolicy::default(),
            player_name: default_player_name(),
        }
    }
}

impl NetConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let cfg = NetConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg.tick_hz, 30);
        assert_eq!(cfg.max_client_requests_per_tick, 32);
        assert_eq!(cfg.max_pending_requests, 256);
        assert_eq!(cfg.disconnect_policy, DisconnectPolicy::Orphan);
    }

    #[test]
    fn policy_parses_snake_case() {
        let cfg = NetConfig::from_json_str(
            r#"{"server_addr": "0.0.0.0:7000", "disconnect_policy": "destroy"}"#,
        )
        .unwrap();
        assert_eq!(cfg.server_addr, "0.0.0.0:7000");
        assert_eq!(cfg.disconnect_policy, DisconnectPolicy::Destroy);
        assert!(NetConfig::from_json_str(r#"{"disconnect_policy": "explode"}"#).is_err());
    }
}
