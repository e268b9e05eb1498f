//! Overlay client (C2) — spawns and talks to the sidecar process over
//! line-delimited JSON on stdin/stdout (§4.2, §6).

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::timeout;

use crate::error::OverlayError;

/// How long `start()` waits for `state=running` before giving up.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `stop()` waits for a graceful exit before force-killing.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SidecarState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// A peer reported by `tsnet:peers`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlayPeer {
    pub id: String,
    pub hostname: String,
    #[serde(default, rename = "dnsName")]
    pub dns_name: Option<String>,
    #[serde(default, rename = "tailscaleIPs")]
    pub tailscale_ips: Vec<String>,
    pub online: bool,
    #[serde(default)]
    pub os: Option<String>,
}

/// Commands sent to the sidecar (stdin), one JSON object per line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", content = "data", rename_all_fields = "camelCase")]
pub enum OverlayCommand {
    #[serde(rename = "tsnet:start")]
    Start {
        hostname: String,
        state_dir: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth_key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        static_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hostname_prefix: Option<String>,
    },
    #[serde(rename = "tsnet:stop")]
    Stop,
    #[serde(rename = "tsnet:wsMessage")]
    WsMessage { connection_id: String, data: String },
    #[serde(rename = "tsnet:getPeers")]
    GetPeers,
    #[serde(rename = "tsnet:dial")]
    Dial {
        device_id: String,
        hostname: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        dns_name: Option<String>,
        port: u16,
    },
    #[serde(rename = "tsnet:dialClose")]
    DialClose { device_id: String },
    #[serde(rename = "tsnet:dialMessage")]
    DialMessage { device_id: String, data: String },
}

/// Events received from the sidecar (stdout), one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum OverlayEvent {
    #[serde(rename = "tsnet:status")]
    Status {
        state: SidecarState,
        #[serde(default)]
        hostname: Option<String>,
        #[serde(default)]
        dns_name: Option<String>,
        #[serde(default)]
        ip: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "tsnet:authRequired")]
    AuthRequired { auth_url: String },
    #[serde(rename = "tsnet:peers")]
    Peers { peers: Vec<OverlayPeer> },
    #[serde(rename = "tsnet:wsConnect")]
    WsConnect {
        connection_id: String,
        #[serde(default)]
        remote_addr: Option<String>,
    },
    #[serde(rename = "tsnet:wsMessage")]
    WsMessage { connection_id: String, data: String },
    #[serde(rename = "tsnet:wsDisconnect")]
    WsDisconnect {
        connection_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "tsnet:dialConnected")]
    DialConnected { device_id: String },
    #[serde(rename = "tsnet:dialMessage")]
    DialMessage { device_id: String, data: String },
    #[serde(rename = "tsnet:dialDisconnect")]
    DialDisconnect {
        device_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "tsnet:dialError")]
    DialError { device_id: String, error: String },
    #[serde(rename = "tsnet:error")]
    Error { message: String },
}

/// The external collaborator interface the mesh core consumes (§4.2).
///
/// `SidecarOverlay` is the production implementation (spawns a real child
/// process); tests substitute an in-process fake that never touches the
/// network, per the "fake overlay transport" note in §8.
#[async_trait]
pub trait Overlay: Send + Sync {
    async fn start(
        &self,
        hostname: String,
        state_dir: String,
        auth_key: Option<String>,
        static_path: Option<String>,
        hostname_prefix: Option<String>,
    ) -> Result<(), OverlayError>;

    async fn stop(&self);

    async fn dial(&self, device_id: &str, hostname: &str, dns_name: Option<&str>, port: u16);

    async fn dial_close(&self, device_id: &str);

    async fn dial_message(&self, device_id: &str, data: String);

    async fn ws_message(&self, connection_id: &str, data: String);

    async fn get_peers(&self);

    fn subscribe(&self) -> broadcast::Receiver<OverlayEvent>;

    fn status(&self) -> SidecarState;
}

/// Spawns the sidecar binary and speaks line-delimited JSON with it.
pub struct SidecarOverlay {
    binary_path: String,
    command_tx: mpsc::UnboundedSender<OverlayCommand>,
    events: broadcast::Sender<OverlayEvent>,
    state: Arc<Mutex<SidecarState>>,
    running_notify: Arc<Notify>,
    error_notify: Arc<Notify>,
    child: Mutex<Option<Child>>,
    stopped: AtomicBool,
}

impl SidecarOverlay {
    pub fn new(binary_path: impl Into<String>) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);

        Arc::new(Self {
            binary_path: binary_path.into(),
            command_tx,
            events,
            state: Arc::new(Mutex::new(SidecarState::Stopped)),
            running_notify: Arc::new(Notify::new()),
            error_notify: Arc::new(Notify::new()),
            child: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
        .also_spawn_writer(command_rx)
    }

    fn send_command(&self, command: OverlayCommand) {
        if self.command_tx.send(command).is_err() {
            warn!("overlay: command dropped, writer task is gone");
        }
    }
}

/// Small extension trait so `new()` can spawn the writer task after the
/// `Arc` exists, without a separate two-step construction API.
trait AlsoSpawnWriter {
    fn also_spawn_writer(self, command_rx: mpsc::UnboundedReceiver<OverlayCommand>) -> Self;
}

impl AlsoSpawnWriter for Arc<SidecarOverlay> {
    fn also_spawn_writer(self, mut command_rx: mpsc::UnboundedReceiver<OverlayCommand>) -> Self {
        let this = self.clone();
        tokio::spawn(async move {
            // The child process and its stdin writer are installed lazily by
            // `start()`. Until then, queued commands simply wait.
            let mut stdin_holder: Option<tokio::process::ChildStdin> = None;
            loop {
                let Some(command) = command_rx.recv().await else {
                    break;
                };
                if stdin_holder.is_none() {
                    stdin_holder = this.child.lock().as_mut().and_then(|c| c.stdin.take());
                }
                let Some(stdin) = stdin_holder.as_mut() else {
                    warn!("overlay: no sidecar stdin yet, dropping command");
                    continue;
                };
                let line = match serde_json::to_string(&command) {
                    Ok(l) => l,
                    Err(e) => {
                        error!("overlay: failed to encode command: {e}");
                        continue;
                    }
                };
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    error!("overlay: failed to write command: {e}");
                    continue;
                }
                let _ = stdin.write_all(b"\n").await;
                let _ = stdin.flush().await;
            }
        });
        self
    }
}

#[async_trait]
impl Overlay for SidecarOverlay {
    async fn start(
        &self,
        hostname: String,
        state_dir: String,
        auth_key: Option<String>,
        static_path: Option<String>,
        hostname_prefix: Option<String>,
    ) -> Result<(), OverlayError> {
        *self.state.lock() = SidecarState::Starting;

        let mut child = Command::new(&self.binary_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        *self.child.lock() = Some(child);

        let events_tx = self.events.clone();
        let state = self.state.clone();
        let running_notify = self.running_notify.clone();
        let error_notify = self.error_notify.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<OverlayEvent>(&line) {
                            Ok(event) => {
                                if let OverlayEvent::Status { state: s, .. } = &event {
                                    *state.lock() = *s;
                                    match s {
                                        SidecarState::Running => running_notify.notify_waiters(),
                                        SidecarState::Error => error_notify.notify_waiters(),
                                        _ => {}
                                    }
                                }
                                let _ = events_tx.send(event);
                            }
                            Err(e) => debug!("overlay: unparseable event line: {line} ({e})"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("overlay: error reading sidecar stdout: {e}");
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "sidecar", "{line}");
            }
        });

        self.send_command(OverlayCommand::Start {
            hostname,
            state_dir,
            auth_key,
            static_path,
            hostname_prefix,
        });

        let wait_running = self.running_notify.notified();
        let wait_error = self.error_notify.notified();

        tokio::select! {
            _ = timeout(STARTUP_TIMEOUT, wait_running) => {
                if *self.state.lock() == SidecarState::Running {
                    info!("overlay: sidecar reached state=running");
                    Ok(())
                } else {
                    Err(OverlayError::StartupTimeout)
                }
            }
            _ = wait_error => {
                Err(OverlayError::StartupError("sidecar reported state=error".into()))
            }
        }
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = SidecarState::Stopping;
        self.send_command(OverlayCommand::Stop);

        let child = self.child.lock().take();
        if let Some(mut child) = child {
            let waited = timeout(SHUTDOWN_GRACE, child.wait()).await;
            if waited.is_err() {
                warn!("overlay: sidecar did not exit within the grace period, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        *self.state.lock() = SidecarState::Stopped;
    }

    async fn dial(&self, device_id: &str, hostname: &str, dns_name: Option<&str>, port: u16) {
        self.send_command(OverlayCommand::Dial {
            device_id: device_id.to_string(),
            hostname: hostname.to_string(),
            dns_name: dns_name.map(str::to_string),
            port,
        });
    }

    async fn dial_close(&self, device_id: &str) {
        self.send_command(OverlayCommand::DialClose {
            device_id: device_id.to_string(),
        });
    }

    async fn dial_message(&self, device_id: &str, data: String) {
        self.send_command(OverlayCommand::DialMessage {
            device_id: device_id.to_string(),
            data,
        });
    }

    async fn ws_message(&self, connection_id: &str, data: String) {
        self.send_command(OverlayCommand::WsMessage {
            connection_id: connection_id.to_string(),
            data,
        });
    }

    async fn get_peers(&self) {
        self.send_command(OverlayCommand::GetPeers);
    }

    fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    fn status(&self) -> SidecarState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_command_serializes_to_tagged_shape() {
        let cmd = OverlayCommand::Start {
            hostname: "myapp-desktop-abc".into(),
            state_dir: "/tmp/state".into(),
            auth_key: None,
            static_path: None,
            hostname_prefix: Some("myapp".into()),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["command"], "tsnet:start");
        assert_eq!(json["data"]["hostname"], "myapp-desktop-abc");
        assert_eq!(json["data"]["hostnamePrefix"], "myapp");
        assert!(json["data"].get("authKey").is_none());
    }

    #[test]
    fn peers_event_round_trips() {
        let line = r#"{"event":"tsnet:peers","data":{"peers":[{"id":"dev-a","hostname":"myapp-desktop-dev-a","dnsName":null,"tailscaleIPs":["100.1.1.1"],"online":true,"os":"linux"}]}}"#;
        let event: OverlayEvent = serde_json::from_str(line).unwrap();
        match event {
            OverlayEvent::Peers { peers } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].id, "dev-a");
                assert!(peers[0].online);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn status_event_parses_running_state() {
        let line = r#"{"event":"tsnet:status","data":{"state":"running","hostname":"h","dnsName":"h.ts.net","ip":"100.0.0.1"}}"#;
        let event: OverlayEvent = serde_json::from_str(line).unwrap();
        match event {
            OverlayEvent::Status { state, ip, .. } => {
                assert_eq!(state, SidecarState::Running);
                assert_eq!(ip.as_deref(), Some("100.0.0.1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
