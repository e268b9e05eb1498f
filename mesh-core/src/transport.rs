//! Connection transport (C3) — owns the per-device connection pool,
//! heartbeats, and reconnect backoff on top of the overlay client
//! (§4.3, modeled on the LAN peer session / reconnect loop).
//!
//! Connections are named by a deterministic scheme (§4.3): `dial:<deviceId>`
//! for outgoing rows, `incoming:<sidecar-id>` for accepted ones. Because both
//! halves of that scheme are recoverable from the raw ids the overlay events
//! carry, no separate raw-id lookup table is needed — the key is always
//! recomputed, not stored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::{Codec, Format};
use crate::envelope::{Envelope, MESH_NAMESPACE};
use crate::error::TransportError;
use crate::overlay::{Overlay, OverlayEvent};

/// Interval between heartbeat pings on an idle connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2000);
/// How long without traffic before a connection is considered dead.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(5000);
/// Initial reconnect delay.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

const HEARTBEAT_TYPE: &str = "ping";
const HEARTBEAT_ACK_TYPE: &str = "pong";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionKind {
    /// We dialed this device.
    Outbound,
    /// This device dialed us.
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

struct Connection {
    /// The bare id the overlay itself uses: the device id for an outbound
    /// row, the sidecar-assigned connection id for an inbound one.
    raw_id: String,
    /// Set once the remote identifies itself. Immutable after binding (§3) —
    /// always `Some` already for outbound rows, since we dialed knowing it.
    device_id: Option<String>,
    kind: ConnectionKind,
    state: ConnectionState,
    recv_buf: Vec<u8>,
    last_seen: Instant,
    dial_target: Option<DialTarget>,
}

#[derive(Clone)]
struct DialTarget {
    hostname: String,
    dns_name: Option<String>,
    port: u16,
}

struct ReconnectEntry {
    attempt: u32,
    handle: JoinHandle<()>,
}

/// Events the transport surfaces to the mesh node. `device_id` is `None` for
/// an inbound connection that hasn't announced itself yet.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected {
        connection_id: String,
        device_id: Option<String>,
    },
    Disconnected {
        connection_id: String,
        device_id: Option<String>,
    },
    Message {
        connection_id: String,
        device_id: Option<String>,
        envelope: Envelope,
    },
}

fn dial_key(device_id: &str) -> String {
    format!("dial:{device_id}")
}

fn incoming_key(sidecar_id: &str) -> String {
    format!("incoming:{sidecar_id}")
}

fn next_backoff(attempt: u32) -> Duration {
    let millis = INITIAL_RECONNECT_DELAY.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(millis.min(MAX_RECONNECT_DELAY.as_millis() as u64))
}

/// Owns every connection to other mesh devices.
///
/// Outbound connections (ones this transport dialed) are kept alive by an
/// exponential-backoff reconnect loop; inbound connections (accepted by the
/// sidecar on our behalf) are not reconnected — the remote end owns that
/// decision.
pub struct Transport {
    overlay: Arc<dyn Overlay>,
    codec: Codec,
    connections: RwLock<HashMap<String, Connection>>,
    /// `deviceId -> connectionId`, 1:1 for every currently-bound row (§3).
    device_index: RwLock<HashMap<String, String>>,
    reconnects: Mutex<HashMap<String, ReconnectEntry>>,
    events: broadcast::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl Transport {
    pub fn new(overlay: Arc<dyn Overlay>, codec: Codec, cancel: CancellationToken) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let transport = Arc::new(Self {
            overlay,
            codec,
            connections: RwLock::new(HashMap::new()),
            device_index: RwLock::new(HashMap::new()),
            reconnects: Mutex::new(HashMap::new()),
            events,
            cancel,
        });
        transport.clone().spawn_event_loop();
        transport.clone().spawn_heartbeat_loop();
        transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Dial a device directly known by hostname/port (§4.3 connect flow).
    /// Idempotent: a `connecting` or already-`connected` row for this device
    /// is left untouched and no new `tsnet:dial` is issued (§8 idempotence
    /// law: "Calling `connect(id, ...)` twice on an already-connected peer
    /// ... issues no new `tsnet:dial`").
    pub async fn connect(&self, device_id: &str, hostname: &str, dns_name: Option<&str>, port: u16) {
        let connection_id = dial_key(device_id);
        {
            let conns = self.connections.read();
            if let Some(existing) = conns.get(&connection_id) {
                if existing.state != ConnectionState::Disconnected {
                    return;
                }
            }
        }
        {
            let mut conns = self.connections.write();
            conns.insert(
                connection_id.clone(),
                Connection {
                    raw_id: device_id.to_string(),
                    device_id: Some(device_id.to_string()),
                    kind: ConnectionKind::Outbound,
                    state: ConnectionState::Connecting,
                    recv_buf: Vec::new(),
                    last_seen: Instant::now(),
                    dial_target: Some(DialTarget {
                        hostname: hostname.to_string(),
                        dns_name: dns_name.map(str::to_string),
                        port,
                    }),
                },
            );
            self.device_index.write().insert(device_id.to_string(), connection_id);
        }
        self.overlay.dial(device_id, hostname, dns_name, port).await;
    }

    pub async fn disconnect(&self, device_id: &str) {
        self.cancel_reconnect(device_id);
        self.connections.write().remove(&dial_key(device_id));
        self.device_index.write().remove(device_id);
        self.overlay.dial_close(device_id).await;
    }

    /// Binds an inbound connection to the device id it just announced.
    /// A no-op if the connection is already bound to the same id; logs and
    /// refuses if it's bound to a different one — `deviceId` is immutable
    /// once set per connection (§3).
    pub fn bind_device(&self, connection_id: &str, device_id: &str) {
        let mut conns = self.connections.write();
        let Some(conn) = conns.get_mut(connection_id) else {
            debug!("transport: bind_device for unknown connection {connection_id}, dropping");
            return;
        };
        match &conn.device_id {
            Some(existing) if existing == device_id => {}
            Some(existing) => {
                warn!(
                    "transport: refusing to rebind {connection_id} from {existing} to {device_id}"
                );
            }
            None => {
                conn.device_id = Some(device_id.to_string());
                self.device_index.write().insert(device_id.to_string(), connection_id.to_string());
                info!("transport: bound {connection_id} to device {device_id}");
            }
        }
    }

    /// Encode and send `envelope` to `device_id`. Fails fast if the device
    /// has no live, bound connection; callers that want "send or queue"
    /// semantics build that on top.
    pub async fn send(&self, device_id: &str, envelope: &Envelope) -> Result<(), TransportError> {
        let connection_id = self.device_index.read().get(device_id).cloned();
        let Some(connection_id) = connection_id else {
            return Err(TransportError::NotConnected {
                connection_id: device_id.to_string(),
            });
        };
        self.send_to_connection(&connection_id, envelope).await
    }

    /// Encode and send `envelope` directly on a connection, regardless of
    /// whether it has a bound device id yet (used for the initial
    /// `device:announce` on a just-accepted connection, and for heartbeats).
    pub async fn send_to_connection(&self, connection_id: &str, envelope: &Envelope) -> Result<(), TransportError> {
        let (raw_id, kind, connected) = {
            let conns = self.connections.read();
            match conns.get(connection_id) {
                Some(conn) => (conn.raw_id.clone(), conn.kind, conn.state == ConnectionState::Connected),
                None => {
                    return Err(TransportError::UnknownConnection {
                        connection_id: connection_id.to_string(),
                    })
                }
            }
        };
        if !connected {
            return Err(TransportError::NotConnected {
                connection_id: connection_id.to_string(),
            });
        }
        let frame = self
            .codec
            .encode(envelope, Format::Json)
            .map_err(|_| TransportError::SendBufferFull {
                connection_id: connection_id.to_string(),
            })?;
        let encoded = BASE64.encode(frame);
        match kind {
            ConnectionKind::Outbound => self.overlay.dial_message(&raw_id, encoded).await,
            ConnectionKind::Inbound => self.overlay.ws_message(&raw_id, encoded).await,
        }
        Ok(())
    }

    fn cancel_reconnect(&self, device_id: &str) {
        if let Some(entry) = self.reconnects.lock().remove(device_id) {
            entry.handle.abort();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, device_id: &str) {
        let target = {
            let conns = self.connections.read();
            conns.get(&dial_key(device_id)).and_then(|c| c.dial_target.clone())
        };
        let Some(target) = target else {
            return;
        };

        let attempt = {
            let mut reconnects = self.reconnects.lock();
            let attempt = reconnects
                .get(device_id)
                .map(|e| e.attempt + 1)
                .unwrap_or(1);
            attempt
        };
        let delay = next_backoff(attempt);
        info!("transport: reconnecting to {device_id} in {delay:?} (attempt {attempt})");

        let this = self.clone();
        let device_id_owned = device_id.to_string();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    this.overlay
                        .dial(&device_id_owned, &target.hostname, target.dns_name.as_deref(), target.port)
                        .await;
                }
                _ = cancel.cancelled() => {}
            }
        });

        self.reconnects
            .lock()
            .insert(device_id.to_string(), ReconnectEntry { attempt, handle });
    }

    fn spawn_heartbeat_loop(self: Arc<Self>) {
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_heartbeat_pass().await,
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    async fn run_heartbeat_pass(self: &Arc<Self>) {
        let now = Instant::now();
        let (stale, due): (Vec<String>, Vec<String>) = {
            let conns = self.connections.read();
            let mut stale = Vec::new();
            let mut due = Vec::new();
            for (id, conn) in conns.iter() {
                if conn.state != ConnectionState::Connected {
                    continue;
                }
                if now.duration_since(conn.last_seen) > HEARTBEAT_TIMEOUT {
                    stale.push(id.clone());
                } else {
                    due.push(id.clone());
                }
            }
            (stale, due)
        };

        for connection_id in stale {
            warn!("transport: heartbeat timeout on {connection_id}");
            self.handle_disconnect(&connection_id).await;
        }

        let ping = Envelope::new(MESH_NAMESPACE, HEARTBEAT_TYPE, serde_json::json!({}));
        for connection_id in due {
            let _ = self.send_to_connection(&connection_id, &ping).await;
        }
    }

    fn spawn_event_loop(self: Arc<Self>) {
        let mut events = self.overlay.subscribe();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Ok(event) => self.handle_overlay_event(event).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("transport: dropped {n} overlay events (lagged)");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    async fn handle_overlay_event(self: &Arc<Self>, event: OverlayEvent) {
        match event {
            OverlayEvent::DialConnected { device_id } => self.handle_connected(&device_id).await,
            OverlayEvent::DialMessage { device_id, data } => {
                self.handle_inbound_bytes(&dial_key(&device_id), &data).await
            }
            OverlayEvent::DialDisconnect { device_id, .. } => {
                self.handle_disconnect(&dial_key(&device_id)).await
            }
            OverlayEvent::DialError { device_id, error } => {
                debug!("transport: dial error for {device_id}: {error}");
                self.handle_disconnect(&dial_key(&device_id)).await
            }
            OverlayEvent::WsConnect { connection_id, .. } => self.handle_inbound_connect(&connection_id),
            OverlayEvent::WsMessage { connection_id, data } => {
                self.handle_inbound_bytes(&incoming_key(&connection_id), &data).await
            }
            OverlayEvent::WsDisconnect { connection_id, .. } => {
                self.handle_disconnect(&incoming_key(&connection_id)).await
            }
            _ => {}
        }
    }

    async fn handle_connected(self: &Arc<Self>, device_id: &str) {
        self.cancel_reconnect(device_id);
        self.reconnects.lock().remove(device_id);
        let connection_id = dial_key(device_id);
        {
            let mut conns = self.connections.write();
            let entry = conns.entry(connection_id.clone()).or_insert_with(|| Connection {
                raw_id: device_id.to_string(),
                device_id: Some(device_id.to_string()),
                kind: ConnectionKind::Outbound,
                state: ConnectionState::Connecting,
                recv_buf: Vec::new(),
                last_seen: Instant::now(),
                dial_target: None,
            });
            entry.state = ConnectionState::Connected;
            entry.last_seen = Instant::now();
        }
        self.device_index.write().insert(device_id.to_string(), connection_id.clone());
        let _ = self.events.send(TransportEvent::Connected {
            connection_id,
            device_id: Some(device_id.to_string()),
        });
    }

    fn handle_inbound_connect(&self, sidecar_id: &str) {
        let connection_id = incoming_key(sidecar_id);
        self.connections.write().insert(
            connection_id.clone(),
            Connection {
                raw_id: sidecar_id.to_string(),
                device_id: None,
                kind: ConnectionKind::Inbound,
                state: ConnectionState::Connected,
                recv_buf: Vec::new(),
                last_seen: Instant::now(),
                dial_target: None,
            },
        );
        let _ = self.events.send(TransportEvent::Connected {
            connection_id,
            device_id: None,
        });
    }

    async fn handle_inbound_bytes(&self, connection_id: &str, data: &str) {
        let Ok(bytes) = BASE64.decode(data) else {
            debug!("transport: non-base64 payload from {connection_id}, dropping");
            return;
        };

        let mut conns = self.connections.write();
        let Some(conn) = conns.get_mut(connection_id) else {
            debug!("transport: bytes from unknown connection {connection_id}, dropping");
            return;
        };
        conn.recv_buf.extend_from_slice(&bytes);
        conn.last_seen = Instant::now();

        let decoded = match self.codec.decode_all(&conn.recv_buf) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("transport: framing error from {connection_id}: {e}");
                conn.recv_buf.clear();
                return;
            }
        };
        if decoded.is_empty() {
            return;
        }
        let consumed: usize = decoded.iter().map(|d| d.consumed).sum();
        conn.recv_buf.drain(..consumed);
        let device_id = conn.device_id.clone();
        drop(conns);

        for d in decoded {
            if d.envelope.is_mesh() && d.envelope.msg_type == HEARTBEAT_TYPE {
                let pong = Envelope::new(MESH_NAMESPACE, HEARTBEAT_ACK_TYPE, serde_json::json!({}));
                let _ = self.send_to_connection(connection_id, &pong).await;
                continue;
            }
            if d.envelope.is_mesh() && d.envelope.msg_type == HEARTBEAT_ACK_TYPE {
                continue;
            }
            let _ = self.events.send(TransportEvent::Message {
                connection_id: connection_id.to_string(),
                device_id: device_id.clone(),
                envelope: d.envelope,
            });
        }
    }

    async fn handle_disconnect(self: &Arc<Self>, connection_id: &str) {
        let (was_outbound, device_id) = {
            let mut conns = self.connections.write();
            match conns.remove(connection_id) {
                Some(conn) => (conn.kind == ConnectionKind::Outbound, conn.device_id),
                None => (false, None),
            }
        };
        if let Some(device_id) = &device_id {
            self.device_index.write().remove(device_id);
        }
        let _ = self.events.send(TransportEvent::Disconnected {
            connection_id: connection_id.to_string(),
            device_id: device_id.clone(),
        });
        if was_outbound {
            if let Some(device_id) = device_id {
                self.schedule_reconnect(&device_id);
            }
        }
    }
}
