//! Device table (C4) — hostname-derived identity and presence tracking
//! (§3, §4.4).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// How long a device may go unseen before it is dropped from the table.
pub const OFFLINE_AFTER: Duration = Duration::from_secs(90);

/// A device's role in the logical star (§3). `None` means undefined — no
/// election has ever concluded and assigned this device a side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Connecting,
}

/// A device as tracked by the local node (§3's full `Device` attribute set).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub name: String,
    pub hostname: String,
    #[serde(default, rename = "dnsName")]
    pub dns_name: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub role: Option<DeviceRole>,
    pub status: DeviceStatus,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub user_designated_primary: bool,
    /// Epoch millis this device started up, used to rank election uptime.
    #[serde(default)]
    pub started_at_millis: u64,
    #[serde(default)]
    pub last_seen_millis: u64,
    #[serde(default)]
    pub os: Option<String>,
}

impl Device {
    pub fn online(&self) -> bool {
        self.status == DeviceStatus::Online
    }

    pub fn uptime_millis(&self, now_millis: u64) -> u64 {
        now_millis.saturating_sub(self.started_at_millis)
    }
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    DeviceDiscovered(Device),
    DeviceUpdated(Device),
    DeviceOffline { id: String },
    PrimaryChanged { id: Option<String> },
}

/// Parses a hostname of the shape `{prefix}-{type}-{id}` (§4.4).
///
/// `id` is permitted to contain hyphens (it usually doesn't, but the
/// convention only reserves the first two hyphen-delimited segments), so the
/// pattern greedily captures everything after `type` as `id`.
fn hostname_pattern(prefix: &str) -> Regex {
    // `prefix` is operator-controlled configuration, not attacker input, but
    // escape it anyway since it becomes part of a regex literal.
    let escaped = regex::escape(prefix);
    Regex::new(&format!(r"^{escaped}-([^-]+)-(.+)$")).expect("hostname pattern is well-formed")
}

static DEFAULT_PREFIX_PATTERN: Lazy<Regex> = Lazy::new(|| hostname_pattern("mesh"));

/// Splits a hostname into `(device_type, device_id)` under `prefix`.
pub fn parse_hostname(prefix: &str, hostname: &str) -> Option<(String, String)> {
    let pattern = if prefix == "mesh" {
        DEFAULT_PREFIX_PATTERN.clone()
    } else {
        hostname_pattern(prefix)
    };
    let caps = pattern.captures(hostname)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// Tracks every known device and the designated primary, if any.
///
/// `primaryId` is maintained as an invariant: it only ever names a device
/// that is both present in the table and currently online (§3).
pub struct DeviceTable {
    prefix: String,
    devices: RwLock<HashMap<String, Device>>,
    primary_id: RwLock<Option<String>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl DeviceTable {
    pub fn new(prefix: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            prefix: prefix.into(),
            devices: RwLock::new(HashMap::new()),
            primary_id: RwLock::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Parses `hostname` under the configured prefix and returns the device
    /// type it encodes, if the hostname matches the convention.
    pub fn device_type_from_hostname(&self, hostname: &str) -> Option<String> {
        parse_hostname(&self.prefix, hostname).map(|(device_type, _)| device_type)
    }

    pub fn device_id_from_hostname(&self, hostname: &str) -> Option<String> {
        parse_hostname(&self.prefix, hostname).map(|(_, id)| id)
    }

    /// Records or refreshes a device sighting, emitting `DeviceDiscovered`
    /// for a brand-new id or `DeviceUpdated` for a changed existing one.
    ///
    /// `dnsName` is preserved from the previous entry whenever the incoming
    /// one is empty (§4.4) — peer-list sightings and bare announces often
    /// don't carry it, and a device that has it shouldn't lose it.
    pub fn announce(&self, mut device: Device) {
        let mut devices = self.devices.write();
        let previous = devices.get(&device.id).cloned();
        if device.dns_name.is_none() {
            device.dns_name = previous.as_ref().and_then(|d| d.dns_name.clone());
        }

        let is_new = previous.is_none();
        let changed = previous.as_ref().map(|d| d != &device).unwrap_or(true);
        devices.insert(device.id.clone(), device.clone());
        drop(devices);

        if is_new {
            let _ = self.events.send(DeviceEvent::DeviceDiscovered(device));
        } else if changed {
            let _ = self.events.send(DeviceEvent::DeviceUpdated(device));
        }
    }

    /// Marks a device offline and clears it from the primary slot if it
    /// held it.
    pub fn mark_offline(&self, id: &str) {
        let existed = {
            let mut devices = self.devices.write();
            if let Some(device) = devices.get_mut(id) {
                device.status = DeviceStatus::Offline;
                true
            } else {
                false
            }
        };
        if !existed {
            return;
        }
        let _ = self.events.send(DeviceEvent::DeviceOffline { id: id.to_string() });

        let mut primary = self.primary_id.write();
        if primary.as_deref() == Some(id) {
            *primary = None;
            drop(primary);
            let _ = self.events.send(DeviceEvent::PrimaryChanged { id: None });
        }
    }

    pub fn list(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.devices.read().get(id).cloned()
    }

    pub fn primary_id(&self) -> Option<String> {
        self.primary_id.read().clone()
    }

    /// Sets the primary, provided `id` names a known, online device (or
    /// `None`, clearing it). Propagates `role` onto every device in the
    /// table: the named primary gets `Primary`, every other known device
    /// gets `Secondary`, and `None` clears every role back to undefined
    /// (§4.4 "device list from primary"). Returns `false` and leaves state
    /// untouched if the invariant would be violated.
    pub fn set_primary(&self, id: Option<String>) -> bool {
        if let Some(ref id) = id {
            let devices = self.devices.read();
            match devices.get(id) {
                Some(device) if device.online() => {}
                _ => return false,
            }
        }

        {
            let mut devices = self.devices.write();
            for (device_id, device) in devices.iter_mut() {
                device.role = match &id {
                    Some(primary_id) if device_id == primary_id => Some(DeviceRole::Primary),
                    Some(_) => Some(DeviceRole::Secondary),
                    None => None,
                };
            }
        }

        let mut primary = self.primary_id.write();
        if *primary == id {
            return true;
        }
        *primary = id.clone();
        drop(primary);
        let _ = self.events.send(DeviceEvent::PrimaryChanged { id });
        true
    }

    /// Drops any device not seen within [`OFFLINE_AFTER`] of `now_millis`.
    pub fn prune_stale(&self, now_millis: u64) {
        let stale_ids: Vec<String> = {
            let devices = self.devices.read();
            devices
                .values()
                .filter(|d| {
                    d.online()
                        && now_millis.saturating_sub(d.last_seen_millis)
                            > OFFLINE_AFTER.as_millis() as u64
                })
                .map(|d| d.id.clone())
                .collect()
        };
        for id in stale_ids {
            self.mark_offline(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_conventional_hostname() {
        let parsed = parse_hostname("myapp", "myapp-desktop-a1b2");
        assert_eq!(parsed, Some(("desktop".to_string(), "a1b2".to_string())));
    }

    #[test]
    fn id_segment_may_contain_hyphens() {
        let parsed = parse_hostname("myapp", "myapp-mobile-a1-b2-c3");
        assert_eq!(parsed, Some(("mobile".to_string(), "a1-b2-c3".to_string())));
    }

    #[test]
    fn rejects_hostname_with_wrong_prefix() {
        assert_eq!(parse_hostname("myapp", "other-desktop-a1"), None);
    }

    #[test]
    fn rejects_hostname_missing_id_segment() {
        assert_eq!(parse_hostname("myapp", "myapp-desktop"), None);
    }

    fn sample_device(id: &str, status: DeviceStatus) -> Device {
        Device {
            id: id.to_string(),
            device_type: "desktop".to_string(),
            name: String::new(),
            hostname: format!("myapp-desktop-{id}"),
            dns_name: None,
            ip: None,
            role: None,
            status,
            capabilities: HashSet::new(),
            metadata: HashMap::new(),
            user_designated_primary: false,
            started_at_millis: 0,
            last_seen_millis: 1000,
            os: None,
        }
    }

    #[test]
    fn announce_emits_discovered_then_updated() {
        let table = DeviceTable::new("myapp");
        let mut events = table.subscribe();

        table.announce(sample_device("a", DeviceStatus::Online));
        match events.try_recv().unwrap() {
            DeviceEvent::DeviceDiscovered(d) => assert_eq!(d.id, "a"),
            other => panic!("unexpected: {other:?}"),
        }

        let mut updated = sample_device("a", DeviceStatus::Online);
        updated.last_seen_millis = 2000;
        table.announce(updated);
        match events.try_recv().unwrap() {
            DeviceEvent::DeviceUpdated(d) => assert_eq!(d.last_seen_millis, 2000),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn announce_preserves_dns_name_when_new_entry_omits_it() {
        let table = DeviceTable::new("myapp");
        let mut first = sample_device("a", DeviceStatus::Online);
        first.dns_name = Some("a.ts.net".to_string());
        table.announce(first);

        let mut bare = sample_device("a", DeviceStatus::Online);
        bare.last_seen_millis = 2000;
        assert!(bare.dns_name.is_none());
        table.announce(bare);

        assert_eq!(table.get("a").unwrap().dns_name.as_deref(), Some("a.ts.net"));
    }

    #[test]
    fn primary_must_be_known_and_online() {
        let table = DeviceTable::new("myapp");
        assert!(!table.set_primary(Some("a".to_string())));

        table.announce(sample_device("a", DeviceStatus::Offline));
        assert!(!table.set_primary(Some("a".to_string())));

        table.announce(sample_device("a", DeviceStatus::Online));
        assert!(table.set_primary(Some("a".to_string())));
        assert_eq!(table.primary_id(), Some("a".to_string()));
    }

    #[test]
    fn set_primary_propagates_role_to_every_device() {
        let table = DeviceTable::new("myapp");
        table.announce(sample_device("a", DeviceStatus::Online));
        table.announce(sample_device("b", DeviceStatus::Online));

        assert!(table.set_primary(Some("a".to_string())));
        assert_eq!(table.get("a").unwrap().role, Some(DeviceRole::Primary));
        assert_eq!(table.get("b").unwrap().role, Some(DeviceRole::Secondary));

        assert!(table.set_primary(None));
        assert_eq!(table.get("a").unwrap().role, None);
        assert_eq!(table.get("b").unwrap().role, None);
    }

    #[test]
    fn going_offline_clears_primary() {
        let table = DeviceTable::new("myapp");
        table.announce(sample_device("a", DeviceStatus::Online));
        assert!(table.set_primary(Some("a".to_string())));

        table.mark_offline("a");
        assert_eq!(table.primary_id(), None);
    }
}
