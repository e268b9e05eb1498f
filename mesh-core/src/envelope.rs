//! The wire envelope shared by every frame on every connection (§3, §4.1).

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved namespace carrying control-plane traffic.
pub const MESH_NAMESPACE: &str = "mesh";

/// `{namespace, type, payload}` unit transmitted per frame.
///
/// `payload` is kept as a [`serde_json::Value`] at this layer so the codec
/// can serialize the whole envelope uniformly regardless of format; callers
/// that need a concrete payload type convert via `serde_json::from_value`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub namespace: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Envelope {
    pub fn new(
        namespace: impl Into<String>,
        msg_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            msg_type: msg_type.into(),
            payload,
            timestamp: Some(now_millis()),
        }
    }

    pub fn is_mesh(&self) -> bool {
        self.namespace == MESH_NAMESPACE
    }

    /// A well-formed envelope has non-empty `namespace` and `type`.
    pub fn is_well_formed(&self) -> bool {
        !self.namespace.is_empty() && !self.msg_type.is_empty()
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
