use crate::error::CallError;
use crate::ice::IceServer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables shared by the call and conference managers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Unanswered-ring window before a call auto-cancels.
    pub ring_timeout_secs: u64,
    /// Conference size cap, self included.
    pub max_participants: usize,
    /// ICE server cache lifetime when the source does not report one.
    pub ice_cache_ttl_secs: u64,
    /// Send bitrate cap applied to every peer connection.
    pub max_bitrate_kbps: u32,
    /// Duration timer period.
    pub duration_tick_ms: u64,
    /// Used when the ICE source fails and nothing is cached.
    pub fallback_ice_servers: Vec<IceServer>,
    pub ice_servers_url: Option<String>,
    pub room_service_url: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 30,
            max_participants: 10,
            ice_cache_ttl_secs: 3600,
            max_bitrate_kbps: 1500,
            duration_tick_ms: 1000,
            fallback_ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            ice_servers_url: None,
            room_service_url: None,
        }
    }
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self, CallError> {
        serde_json::from_str(json).map_err(|e| CallError::Parse(format!("config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CallError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CallError::Parse(format!("config {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn ice_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.ice_cache_ttl_secs)
    }

    pub fn duration_tick(&self) -> Duration {
        Duration::from_millis(self.duration_tick_ms)
    }
}
