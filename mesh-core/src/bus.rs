//! Message bus (C7) — namespace-keyed publish/subscribe for local
//! consumers of mesh traffic (§4.7).
//!
//! Dispatch is synchronous and sequential: `dispatch` calls every matching
//! subscriber in registration order on the caller's task, and a panicking
//! subscriber is isolated (caught, logged) rather than taking down the
//! others or the dispatcher. Outbound traffic (`publish`/`broadcast`) is
//! separate: it forwards to whatever [`OutboundSink`] the mesh node attached
//! after construction, since the node doesn't exist yet when the bus itself
//! is built (§4.6/§4.7's C6-atop-C7 layering).

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, warn};
use parking_lot::RwLock;
use serde_json::Value;

use crate::envelope::Envelope;

pub type Subscriber = Box<dyn Fn(&Envelope) + Send + Sync>;

/// The mesh node's outward-facing routing surface, as seen by the bus.
/// Implemented by [`crate::node::MeshNode`] and attached via
/// [`Bus::attach_outbound`] once the node exists.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send_envelope(&self, target_id: &str, envelope: &Envelope) -> bool;
    async fn broadcast_envelope(&self, envelope: &Envelope);
}

struct Entry {
    id: u64,
    namespace: Option<String>,
    callback: Subscriber,
}

/// Unsubscribes automatically when dropped, so callers never have to
/// remember to call an explicit `unsubscribe`.
#[must_use = "dropping this immediately unsubscribes"]
pub struct Subscription {
    id: u64,
    bus: Arc<BusInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.entries.write().retain(|e| e.id != self.id);
    }
}

struct BusInner {
    entries: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
    outbound: RwLock<Option<Arc<dyn OutboundSink>>>,
}

/// Cloneable handle to the bus; all clones share the same subscriber list.
#[derive(Clone)]
pub struct Bus(Arc<BusInner>);

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self(Arc::new(BusInner {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            outbound: RwLock::new(None),
        }))
    }

    /// Wires up the outward routing surface. Called once, after the mesh
    /// node is constructed (the bus is built first, so this can't happen at
    /// `Bus::new` time).
    pub fn attach_outbound(&self, sink: Arc<dyn OutboundSink>) {
        *self.0.outbound.write() = Some(sink);
    }

    /// Subscribes to every envelope regardless of namespace.
    pub fn subscribe_all(&self, callback: impl Fn(&Envelope) + Send + Sync + 'static) -> Subscription {
        self.subscribe_inner(None, callback)
    }

    /// Subscribes to envelopes whose `namespace` equals `namespace`.
    pub fn subscribe(
        &self,
        namespace: impl Into<String>,
        callback: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_inner(Some(namespace.into()), callback)
    }

    fn subscribe_inner(
        &self,
        namespace: Option<String>,
        callback: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        self.0.entries.write().push(Entry {
            id,
            namespace,
            callback: Box::new(callback),
        });
        Subscription {
            id,
            bus: self.0.clone(),
        }
    }

    /// Delivers `envelope` to every matching subscriber, in registration
    /// order, on the calling task. A subscriber that panics is caught and
    /// logged; it does not stop delivery to subsequent subscribers.
    pub fn dispatch(&self, envelope: &Envelope) {
        // IDs are snapshotted up front rather than holding one read guard
        // across the whole dispatch: a callback may itself subscribe or
        // unsubscribe, which would deadlock against a held `RwLock` guard.
        let ids: Vec<u64> = self.0.entries.read().iter().map(|e| e.id).collect();
        for id in ids {
            let matched = {
                let entries = self.0.entries.read();
                entries.iter().find(|e| e.id == id).map(|e| match &e.namespace {
                    Some(ns) => ns == &envelope.namespace,
                    None => true,
                })
            };
            let Some(true) = matched else { continue };

            let entries = self.0.entries.read();
            let Some(entry) = entries.iter().find(|e| e.id == id) else {
                continue;
            };
            let callback = &entry.callback;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(envelope))) {
                drop(entries);
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".to_string());
                error!("bus: subscriber panicked: {message}");
            }
        }
    }

    /// Sends `payload` to one device on `ns`/`type` (§4.7). Returns `false`
    /// if no outbound sink is attached yet or the target isn't reachable.
    pub async fn publish(&self, target_id: &str, ns: impl Into<String>, msg_type: impl Into<String>, payload: Value) -> bool {
        let sink = self.0.outbound.read().clone();
        let Some(sink) = sink else {
            warn!("bus: publish with no outbound sink attached, dropping");
            return false;
        };
        let envelope = Envelope::new(ns, msg_type, payload);
        sink.send_envelope(target_id, &envelope).await
    }

    /// Sends `payload` to every reachable device on `ns`/`type` (§4.7).
    pub async fn broadcast(&self, ns: impl Into<String>, msg_type: impl Into<String>, payload: Value) {
        let sink = self.0.outbound.read().clone();
        let Some(sink) = sink else {
            warn!("bus: broadcast with no outbound sink attached, dropping");
            return;
        };
        let envelope = Envelope::new(ns, msg_type, payload);
        sink.broadcast_envelope(&envelope).await;
    }

    pub fn subscriber_count(&self) -> usize {
        self.0.entries.read().len()
    }
}
