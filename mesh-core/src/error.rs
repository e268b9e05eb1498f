//! Typed error enums for each component family (§7 of the design).
//!
//! Each enum is a closed set mirroring the error kinds named in the spec.
//! Components return these directly; only the embedding application (e.g.
//! `mesh-cli`) converts them into `anyhow::Error` at its boundary.

use thiserror::Error;

/// Errors raised by the wire codec (C1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload length {len} exceeds the 16 MiB frame limit")]
    MessageTooLarge { len: usize },

    #[error("envelope is missing a non-empty namespace or type")]
    InvalidEnvelope,

    #[error("frame is compressed but no decompressor is configured")]
    CompressedFrameRequiresAsyncPath,

    #[error("failed to serialize envelope: {0}")]
    Encode(String),

    #[error("failed to deserialize envelope: {0}")]
    Decode(String),
}

/// Errors raised by the overlay client (C2).
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("sidecar did not reach state=running within the startup timeout")]
    StartupTimeout,

    #[error("sidecar reported state=error during startup: {0}")]
    StartupError(String),

    #[error("failed to spawn sidecar process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("sidecar process exited unexpectedly")]
    ProcessExited,

    #[error("overlay client has already been stopped")]
    Stopped,
}

/// Errors raised by the connection transport (C3).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("dial to device {device_id} timed out")]
    DialTimeout { device_id: String },

    #[error("dial to device {device_id} failed: {reason}")]
    DialError { device_id: String, reason: String },

    #[error("connection {connection_id} missed its heartbeat deadline")]
    HeartbeatTimeout { connection_id: String },

    #[error("send buffer full on connection {connection_id}")]
    SendBufferFull { connection_id: String },

    #[error("connection {connection_id} is unknown")]
    UnknownConnection { connection_id: String },

    #[error("connection {connection_id} is not connected")]
    NotConnected { connection_id: String },
}

/// Errors raised by the mesh node (C6).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("control-plane payload for message type {message_type} failed validation: {reason}")]
    InvalidControlPayload {
        message_type: String,
        reason: String,
    },

    #[error("secondary device received a route:{kind} it is not authorized to serve")]
    UnauthorizedRoute { kind: String },
}

/// Errors raised by the store sync adapter (C8).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync message referenced unknown store {store_id}")]
    UnknownStore { store_id: String },
}
