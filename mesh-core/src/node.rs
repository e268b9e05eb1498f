//! Mesh node (C6) — the composition root wiring the overlay client,
//! transport, device table, election coordinator, message bus, and sync
//! adapter into one running node (§4.6, §9).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{info, warn};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, OutboundSink};
use crate::codec::Codec;
use crate::config::NodeConfig;
use crate::device::{Device, DeviceEvent, DeviceRole, DeviceStatus, DeviceTable};
use crate::election::{Candidate, Election, ElectionEvent, ElectionState};
use crate::envelope::{Envelope, MESH_NAMESPACE};
use crate::error::{MeshError, OverlayError};
use crate::overlay::{Overlay, OverlayEvent};
use crate::sync::SyncAdapter;
use crate::transport::{Transport, TransportEvent};

const MSG_DEVICE_ANNOUNCE: &str = "device:announce";
const MSG_DEVICE_GOODBYE: &str = "device:goodbye";
const MSG_DEVICE_LIST: &str = "device:list";
const MSG_ELECTION_START: &str = "election:start";
const MSG_ELECTION_CANDIDATE: &str = "election:candidate";
const MSG_ELECTION_RESULT: &str = "election:result";
const MSG_ROUTE_MESSAGE: &str = "route:message";
const MSG_ROUTE_BROADCAST: &str = "route:broadcast";

#[derive(serde::Serialize, serde::Deserialize)]
struct ElectionResult {
    primary_id: String,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct DeviceListSeed {
    primary_id: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct RouteMessagePayload {
    target_device_id: String,
    envelope: Envelope,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct RouteBroadcastPayload {
    envelope: Envelope,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A running mesh participant. Construct with [`MeshNode::new`], then call
/// [`MeshNode::start`] to spawn the sidecar and begin processing.
pub struct MeshNode {
    config: NodeConfig,
    overlay: Arc<dyn Overlay>,
    transport: Arc<Transport>,
    devices: Arc<DeviceTable>,
    election: Arc<Election>,
    bus: Bus,
    sync: Arc<SyncAdapter>,
    started_at_millis: u64,
    cancel: CancellationToken,
}

impl MeshNode {
    pub fn new(config: NodeConfig, overlay: Arc<dyn Overlay>) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let codec = Codec::new();
        let transport = Transport::new(overlay.clone(), codec, cancel.child_token());
        let devices = Arc::new(DeviceTable::new(config.hostname_prefix.clone()));
        let election = Arc::new(Election::new(cancel.child_token()));
        let bus = Bus::new();
        let sync = Arc::new(SyncAdapter::new(bus.clone(), config.device_id.clone()));
        let started_at_millis = now_millis();

        let node = Arc::new(Self {
            config,
            overlay,
            transport,
            devices,
            election,
            bus,
            sync,
            started_at_millis,
            cancel,
        });

        node.bus.attach_outbound(node.clone() as Arc<dyn OutboundSink>);
        node.devices.announce(node.self_device(DeviceStatus::Online));
        node.clone().spawn_overlay_listener();
        node.clone().spawn_transport_listener();
        node.clone().spawn_device_listener();
        node.clone().spawn_election_listener();
        node.clone().spawn_announce_loop();
        node
    }

    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn sync(&self) -> &Arc<SyncAdapter> {
        &self.sync
    }

    pub fn election(&self) -> &Arc<Election> {
        &self.election
    }

    /// Forces an immediate `tsnet:getPeers` poll instead of waiting for the
    /// next announce-interval tick. Mainly useful for tests that don't want
    /// to wait out the real interval.
    pub async fn refresh_peers(&self) {
        self.overlay.get_peers().await;
    }

    fn is_primary(&self) -> bool {
        self.devices.primary_id().as_deref() == Some(self.config.device_id.as_str())
    }

    fn self_device(&self, status: DeviceStatus) -> Device {
        Device {
            id: self.config.device_id.clone(),
            device_type: self.config.device_type.clone(),
            name: String::new(),
            hostname: self.config.hostname(),
            dns_name: None,
            ip: None,
            role: if self.is_primary() { Some(DeviceRole::Primary) } else { None },
            status,
            capabilities: HashSet::new(),
            metadata: HashMap::new(),
            user_designated_primary: self.config.user_designated_primary,
            started_at_millis: self.started_at_millis,
            last_seen_millis: now_millis(),
            os: None,
        }
    }

    fn self_candidate(&self) -> Candidate {
        Candidate {
            id: self.config.device_id.clone(),
            user_designated_primary: self.config.user_designated_primary,
            uptime_millis: now_millis().saturating_sub(self.started_at_millis),
        }
    }

    /// Spawns the sidecar and waits for it to report `state=running`.
    pub async fn start(self: &Arc<Self>) -> Result<(), OverlayError> {
        self.overlay
            .start(
                self.config.hostname(),
                self.config.state_dir.clone(),
                self.config.auth_key.clone(),
                None,
                Some(self.config.hostname_prefix.clone()),
            )
            .await?;
        info!("node: started as {}", self.config.hostname());
        self.election.handle_no_primary_on_startup(self.self_candidate());
        self.sync.start();
        Ok(())
    }

    pub async fn shutdown(&self) {
        let goodbye = Envelope::new(MESH_NAMESPACE, MSG_DEVICE_GOODBYE, Value::Null);
        self.broadcast(&goodbye).await;
        self.sync.dispose();
        self.devices.mark_offline(&self.config.device_id);
        self.election.reset();
        self.cancel.cancel();
        self.overlay.stop().await;
    }

    /// Sends a control-plane envelope directly to a specific connected
    /// device. Never routed through the primary — used only for mesh-
    /// namespace gossip, which must work even before a primary is known.
    pub async fn send(&self, device_id: &str, envelope: &Envelope) -> Result<(), crate::error::TransportError> {
        self.transport.send(device_id, envelope).await
    }

    /// Sends a control-plane envelope directly to every connected device.
    /// See [`MeshNode::send`] for why this bypasses routing.
    pub async fn broadcast(&self, envelope: &Envelope) {
        for device in self.devices.list() {
            if device.id == self.config.device_id || !device.online() {
                continue;
            }
            let _ = self.transport.send(&device.id, envelope).await;
        }
    }

    /// Sends application-level `envelope` to `target_id` (§4.6's routing
    /// algorithm): loopback if we're the target, a direct connection if one
    /// exists, otherwise wrapped in `route:message` to the primary if we're
    /// a secondary. Returns whether delivery was attempted successfully.
    pub async fn send_envelope(&self, target_id: &str, envelope: &Envelope) -> bool {
        if target_id == self.config.device_id {
            self.bus.dispatch(envelope);
            return true;
        }
        if self.transport.send(target_id, envelope).await.is_ok() {
            return true;
        }
        if self.is_primary() {
            return false;
        }
        let Some(primary_id) = self.devices.primary_id() else {
            return false;
        };
        let wrapped = Envelope::new(
            MESH_NAMESPACE,
            MSG_ROUTE_MESSAGE,
            serde_json::to_value(RouteMessagePayload {
                target_device_id: target_id.to_string(),
                envelope: envelope.clone(),
            })
            .unwrap_or(Value::Null),
        );
        self.transport.send(&primary_id, &wrapped).await.is_ok()
    }

    /// Sends application-level `envelope` to every reachable device (§4.6):
    /// the primary fans it out directly (plus loopback), a secondary wraps
    /// it in `route:broadcast` to the primary.
    pub async fn broadcast_envelope(&self, envelope: &Envelope) {
        self.bus.dispatch(envelope);
        if self.is_primary() {
            for device in self.devices.list() {
                if device.id == self.config.device_id || !device.online() {
                    continue;
                }
                let _ = self.transport.send(&device.id, envelope).await;
            }
            return;
        }
        let Some(primary_id) = self.devices.primary_id() else {
            warn!("node: broadcast_envelope with no known primary, dropping");
            return;
        };
        let wrapped = Envelope::new(
            MESH_NAMESPACE,
            MSG_ROUTE_BROADCAST,
            serde_json::to_value(RouteBroadcastPayload { envelope: envelope.clone() }).unwrap_or(Value::Null),
        );
        let _ = self.transport.send(&primary_id, &wrapped).await;
    }

    async fn broadcast_election_start(&self) {
        let envelope = Envelope::new(MESH_NAMESPACE, MSG_ELECTION_START, Value::Null);
        self.broadcast(&envelope).await;
    }

    async fn broadcast_candidate(&self) {
        let envelope = Envelope::new(
            MESH_NAMESPACE,
            MSG_ELECTION_CANDIDATE,
            serde_json::to_value(self.self_candidate()).unwrap_or(Value::Null),
        );
        self.broadcast(&envelope).await;
    }

    fn spawn_overlay_listener(self: Arc<Self>) {
        let mut events = self.overlay.subscribe();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => self.handle_overlay_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("node: dropped {n} overlay events (lagged)");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    async fn handle_overlay_event(self: &Arc<Self>, event: OverlayEvent) {
        if let OverlayEvent::Peers { peers } = event {
            for peer in peers {
                let Some(device_id) = self.devices.device_id_from_hostname(&peer.hostname) else {
                    continue;
                };
                if device_id == self.config.device_id {
                    continue;
                }
                let Some(device_type) = self.devices.device_type_from_hostname(&peer.hostname) else {
                    continue;
                };
                let existing = self.devices.get(&device_id);
                self.devices.announce(Device {
                    id: device_id.clone(),
                    device_type,
                    name: existing.as_ref().map(|d| d.name.clone()).unwrap_or_default(),
                    hostname: peer.hostname.clone(),
                    dns_name: peer.dns_name.clone(),
                    ip: peer.tailscale_ips.first().cloned(),
                    role: existing.as_ref().and_then(|d| d.role),
                    status: if peer.online { DeviceStatus::Online } else { DeviceStatus::Offline },
                    capabilities: existing.as_ref().map(|d| d.capabilities.clone()).unwrap_or_default(),
                    metadata: existing.as_ref().map(|d| d.metadata.clone()).unwrap_or_default(),
                    user_designated_primary: existing.as_ref().map(|d| d.user_designated_primary).unwrap_or(false),
                    started_at_millis: existing.as_ref().map(|d| d.started_at_millis).unwrap_or(0),
                    last_seen_millis: now_millis(),
                    os: peer.os.clone(),
                });
                if peer.online {
                    self.transport
                        .connect(&device_id, &peer.hostname, peer.dns_name.as_deref(), self.config.mesh_port)
                        .await;
                }
            }
        }
    }

    fn spawn_transport_listener(self: Arc<Self>) {
        let mut events = self.transport.subscribe();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => self.handle_transport_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("node: dropped {n} transport events (lagged)");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected { connection_id, device_id } => {
                let Some(device_id) = device_id else {
                    // Inbound connection awaiting its own device:announce.
                    return;
                };
                info!("node: connected to {device_id}");
                let announce = Envelope::new(
                    MESH_NAMESPACE,
                    MSG_DEVICE_ANNOUNCE,
                    serde_json::to_value(self.self_device(DeviceStatus::Online)).unwrap_or(Value::Null),
                );
                let _ = self.transport.send_to_connection(&connection_id, &announce).await;

                // A primary seeds every new connection with itself so a late
                // joiner doesn't sit without one until the next periodic
                // announce (§9's noted gap).
                if self.is_primary() {
                    let seed = Envelope::new(
                        MESH_NAMESPACE,
                        MSG_DEVICE_LIST,
                        serde_json::to_value(DeviceListSeed {
                            primary_id: Some(self.config.device_id.clone()),
                        })
                        .unwrap_or(Value::Null),
                    );
                    let _ = self.transport.send_to_connection(&connection_id, &seed).await;
                }

                // A device that joins mid-round needs our candidacy too,
                // since the initial broadcast reached nobody connected yet.
                if self.election.state() != ElectionState::Idle {
                    let candidacy = Envelope::new(
                        MESH_NAMESPACE,
                        MSG_ELECTION_CANDIDATE,
                        serde_json::to_value(self.self_candidate()).unwrap_or(Value::Null),
                    );
                    let _ = self.transport.send_to_connection(&connection_id, &candidacy).await;
                }
            }
            TransportEvent::Disconnected { device_id, .. } => {
                if let Some(device_id) = device_id {
                    info!("node: disconnected from {device_id}");
                    self.devices.mark_offline(&device_id);
                }
            }
            TransportEvent::Message { connection_id, device_id, envelope } => {
                self.handle_mesh_message(&connection_id, device_id, envelope).await;
            }
        }
    }

    async fn handle_mesh_message(self: &Arc<Self>, connection_id: &str, device_id: Option<String>, envelope: Envelope) {
        if !envelope.is_mesh() {
            self.bus.dispatch(&envelope);
            return;
        }

        match envelope.msg_type.as_str() {
            MSG_DEVICE_ANNOUNCE => match serde_json::from_value::<Device>(envelope.payload.clone()) {
                Ok(device) => {
                    if device_id.is_none() {
                        // First word from a freshly-accepted inbound
                        // connection: bind it, then answer with our own
                        // announce (the outbound-dialer side of this
                        // exchange already happened on TransportEvent::Connected).
                        self.transport.bind_device(connection_id, &device.id);
                        let reply = Envelope::new(
                            MESH_NAMESPACE,
                            MSG_DEVICE_ANNOUNCE,
                            serde_json::to_value(self.self_device(DeviceStatus::Online)).unwrap_or(Value::Null),
                        );
                        let _ = self.transport.send_to_connection(connection_id, &reply).await;
                    }
                    self.devices.announce(device);
                }
                Err(e) => warn_invalid_payload(MSG_DEVICE_ANNOUNCE, &e),
            },
            MSG_DEVICE_GOODBYE => {
                if let Some(device_id) = &device_id {
                    self.devices.mark_offline(device_id);
                }
            }
            MSG_DEVICE_LIST => match serde_json::from_value::<DeviceListSeed>(envelope.payload.clone()) {
                Ok(seed) => {
                    self.devices.set_primary(seed.primary_id);
                }
                Err(e) => warn_invalid_payload(MSG_DEVICE_LIST, &e),
            },
            MSG_ELECTION_START => {
                self.election.handle_election_start(self.self_candidate());
            }
            MSG_ELECTION_CANDIDATE => match serde_json::from_value::<Candidate>(envelope.payload.clone()) {
                Ok(candidate) => self.election.receive_candidate(candidate),
                Err(e) => warn_invalid_payload(MSG_ELECTION_CANDIDATE, &e),
            },
            MSG_ELECTION_RESULT => match serde_json::from_value::<ElectionResult>(envelope.payload.clone()) {
                Ok(result) => {
                    // Adopting an inbound result also serves as an ack and
                    // cancels any round of our own still in flight (§4.5).
                    self.devices.set_primary(Some(result.primary_id));
                    self.election.reset();
                }
                Err(e) => warn_invalid_payload(MSG_ELECTION_RESULT, &e),
            },
            MSG_ROUTE_MESSAGE => {
                if !self.is_primary() {
                    let err = MeshError::UnauthorizedRoute { kind: "message".to_string() };
                    warn!("node: {err}");
                    return;
                }
                match serde_json::from_value::<RouteMessagePayload>(envelope.payload.clone()) {
                    Ok(payload) => {
                        let _ = self.send_envelope(&payload.target_device_id, &payload.envelope).await;
                    }
                    Err(e) => warn_invalid_payload(MSG_ROUTE_MESSAGE, &e),
                }
            }
            MSG_ROUTE_BROADCAST => {
                if !self.is_primary() {
                    let err = MeshError::UnauthorizedRoute { kind: "broadcast".to_string() };
                    warn!("node: {err}");
                    return;
                }
                match serde_json::from_value::<RouteBroadcastPayload>(envelope.payload.clone()) {
                    Ok(payload) => self.broadcast_envelope(&payload.envelope).await,
                    Err(e) => warn_invalid_payload(MSG_ROUTE_BROADCAST, &e),
                }
            }
            _ => self.bus.dispatch(&envelope),
        }
    }

    fn spawn_device_listener(self: Arc<Self>) {
        let mut events = self.devices.subscribe();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(DeviceEvent::DeviceOffline { id }) => {
                            let this = self.clone();
                            let offline_id = id.clone();
                            tokio::spawn(async move { this.sync.handle_device_offline(&offline_id).await; });

                            let was_primary = self.devices.primary_id().as_deref() == Some(id.as_str());
                            if was_primary {
                                info!("node: primary {id} went offline");
                                let this = self.clone();
                                self.election.handle_primary_lost(move || this.self_candidate());
                            }
                        }
                        Ok(DeviceEvent::DeviceDiscovered(device)) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.sync.handle_device_discovered(&device.id).await; });
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    fn spawn_election_listener(self: Arc<Self>) {
        let mut events = self.election.subscribe();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ElectionEvent::Decided { winner_id }) => {
                            let we_won = winner_id == self.config.device_id;
                            self.devices.set_primary(Some(winner_id.clone()));
                            self.election.reset();
                            if we_won {
                                let result = Envelope::new(
                                    MESH_NAMESPACE,
                                    MSG_ELECTION_RESULT,
                                    serde_json::to_value(ElectionResult { primary_id: winner_id })
                                        .unwrap_or(Value::Null),
                                );
                                self.broadcast(&result).await;
                            }
                        }
                        Ok(ElectionEvent::NoEligibleCandidate) => {
                            self.election.reset();
                        }
                        Ok(ElectionEvent::RoundStarted) => {
                            self.broadcast_election_start().await;
                            self.broadcast_candidate().await;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    fn spawn_announce_loop(self: Arc<Self>) {
        let cancel = self.cancel.child_token();
        let interval = self.config.announce_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.overlay.get_peers().await,
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }
}

fn warn_invalid_payload(message_type: &str, error: &serde_json::Error) {
    let err = MeshError::InvalidControlPayload {
        message_type: message_type.to_string(),
        reason: error.to_string(),
    };
    warn!("node: {err}");
}

#[async_trait]
impl OutboundSink for MeshNode {
    async fn send_envelope(&self, target_id: &str, envelope: &Envelope) -> bool {
        MeshNode::send_envelope(self, target_id, envelope).await
    }

    async fn broadcast_envelope(&self, envelope: &Envelope) {
        MeshNode::broadcast_envelope(self, envelope).await
    }
}
