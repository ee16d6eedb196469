use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Configuration for sharing room emits across processes
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Unique identifier for this process
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Logical channel carrying room emits between processes
    #[serde(default = "default_routing_channel")]
    pub routing_channel: String,
    /// Key prefix of the shared room membership sets
    #[serde(default = "default_membership_prefix")]
    pub membership_prefix: String,
    /// Membership TTL in seconds (should be > heartbeat interval)
    #[serde(default = "default_membership_ttl")]
    pub membership_ttl_seconds: u64,
}

fn default_server_id() -> String {
    format!("relay-{}", Uuid::new_v4().simple())
}

fn default_routing_channel() -> String {
    "gateway-room-emit".to_string()
}

fn default_membership_prefix() -> String {
    "relay:rooms".to_string()
}

fn default_membership_ttl() -> u64 {
    90
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_id: default_server_id(),
            routing_channel: default_routing_channel(),
            membership_prefix: default_membership_prefix(),
            membership_ttl_seconds: default_membership_ttl(),
        }
    }
}

/// A room emit routed through the transport to every other process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomEmit {
    /// Server id of the emitting process
    pub origin: String,
    pub room: String,
    pub event: String,
    pub data: Value,
}

#[derive(Debug, Clone, Error)]
pub enum SessionShareError {
    #[error("Membership store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Session sharing is disabled")]
    Disabled,
}
