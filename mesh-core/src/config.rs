//! Node configuration (§4.6, §9). `mesh-core` itself never touches the
//! filesystem; `mesh-cli` loads a `toml` file and turns it into this struct.

use std::time::Duration;

use crate::device::OFFLINE_AFTER;
use crate::election::{ELECTION_TIMEOUT, PRIMARY_LOSS_GRACE};
use crate::transport::{HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY};

/// Default interval between `tsnet:getPeers` polls and discovery announces.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);
/// Default TCP port the sidecar listens on for incoming dials.
pub const DEFAULT_MESH_PORT: u16 = 52742;

/// Everything a [`crate::node::MeshNode`] needs to start, gathered in one
/// place so the embedding application only has one thing to construct and
/// hand over.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This device's stable identifier (the `id` segment of its hostname).
    pub device_id: String,
    /// This device's declared type (the `type` segment of its hostname).
    pub device_type: String,
    /// Hostname prefix devices in this mesh share, e.g. `"myapp"`.
    pub hostname_prefix: String,
    /// Path to the sidecar binary the overlay client spawns.
    pub sidecar_path: String,
    /// Directory the sidecar persists its own state under.
    pub state_dir: String,
    /// Overlay network auth key, if the sidecar requires one to join.
    pub auth_key: Option<String>,
    /// Whether this device has been manually pinned as primary by the user.
    pub user_designated_primary: bool,
    /// TCP port this device's sidecar listens on.
    pub mesh_port: u16,

    pub announce_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub election_timeout: Duration,
    pub primary_loss_grace: Duration,
    pub offline_after: Duration,
}

impl NodeConfig {
    /// A config with every tunable at its spec-mandated default, needing
    /// only the identity and sidecar fields filled in.
    pub fn new(
        device_id: impl Into<String>,
        device_type: impl Into<String>,
        hostname_prefix: impl Into<String>,
        sidecar_path: impl Into<String>,
        state_dir: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: device_type.into(),
            hostname_prefix: hostname_prefix.into(),
            sidecar_path: sidecar_path.into(),
            state_dir: state_dir.into(),
            auth_key: None,
            user_designated_primary: false,
            mesh_port: DEFAULT_MESH_PORT,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            initial_reconnect_delay: INITIAL_RECONNECT_DELAY,
            max_reconnect_delay: MAX_RECONNECT_DELAY,
            election_timeout: ELECTION_TIMEOUT,
            primary_loss_grace: PRIMARY_LOSS_GRACE,
            offline_after: OFFLINE_AFTER,
        }
    }

    pub fn hostname(&self) -> String {
        format!("{}-{}-{}", self.hostname_prefix, self.device_type, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_follows_the_convention() {
        let config = NodeConfig::new("a1b2", "desktop", "myapp", "/bin/sidecar", "/tmp/state");
        assert_eq!(config.hostname(), "myapp-desktop-a1b2");
    }
}
