//! Channel registry: the single source of truth mapping channel name to the
//! live subscription entry.
//!
//! The registry enforces at-most-one transport join per channel name. Several
//! consumers may bind handlers to the same channel; the first binding triggers
//! the transport join and the last detach triggers the leave. Callers hold
//! opaque [`BindingId`]s rather than poking at name-keyed shared state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use parlor_shared::{ChannelEvent, EventKind, Topic};
use tracing::{debug, warn};

/// Opaque handle to one (event, handler) binding on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(u64);

pub(crate) type Handler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

struct Binding {
    id: u64,
    event: EventKind,
    handler: Handler,
}

struct ChannelEntry {
    topic: Topic,
    bindings: Vec<Binding>,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<String, ChannelEntry>,
    /// Binding id → owning channel name, for detach lookups.
    owners: HashMap<u64, String>,
    next_id: u64,
}

pub(crate) struct ChannelRegistry {
    inner: Mutex<Inner>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Bind `handler` for `event` on the topic's channel. Returns the binding
    /// id and whether this was the first binding (i.e. a transport-level join
    /// is required). Re-attaching to an already-registered channel augments
    /// the existing entry; it never produces a second join.
    pub fn attach(&self, topic: &Topic, event: EventKind, handler: Handler) -> (BindingId, bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        let name = topic.name();

        inner.owners.insert(id, name.clone());
        let entry = inner.channels.entry(name).or_insert_with(|| ChannelEntry {
            topic: topic.clone(),
            bindings: Vec::new(),
        });
        let first = entry.bindings.is_empty();
        entry.bindings.push(Binding { id, event, handler });

        (BindingId(id), first)
    }

    /// Remove one binding. Returns the channel name if the entry became empty
    /// and was removed (the caller owes a transport leave). Unknown ids are a
    /// no-op.
    pub fn detach(&self, id: BindingId) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        let name = inner.owners.remove(&id.0)?;

        let entry = inner.channels.get_mut(&name)?;
        entry.bindings.retain(|b| b.id != id.0);
        if entry.bindings.is_empty() {
            inner.channels.remove(&name);
            return Some(name);
        }
        None
    }

    /// Drop a whole channel entry regardless of how many bindings remain.
    /// Returns whether an entry existed. Unknown names are a no-op.
    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.channels.remove(name) {
            Some(entry) => {
                for binding in &entry.bindings {
                    inner.owners.remove(&binding.id);
                }
                true
            }
            None => false,
        }
    }

    /// Remove every entry, returning the channel names so the caller can
    /// issue transport leaves. Used on logout.
    pub fn clear(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.owners.clear();
        inner.channels.drain().map(|(name, _)| name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().channels.contains_key(name)
    }

    /// Snapshot of registered topics, for resubscribing after a reconnect.
    pub fn topics(&self) -> Vec<Topic> {
        let inner = self.inner.lock().unwrap();
        inner.channels.values().map(|e| e.topic.clone()).collect()
    }

    /// Decode and deliver a broadcast to every binding attached for its event
    /// name. Events for unknown channels, unknown event names, or bindings
    /// detached in the meantime are dropped silently (late deliveries racing
    /// an unmount are expected).
    pub fn dispatch(&self, channel: &str, event: &str, payload: &serde_json::Value) {
        let Some(kind) = EventKind::parse(event) else {
            debug!(channel, event, "dropping event with unknown name");
            return;
        };

        let handlers: Vec<Handler> = {
            let inner = self.inner.lock().unwrap();
            let Some(entry) = inner.channels.get(channel) else {
                debug!(channel, event, "dropping event for unregistered channel");
                return;
            };
            entry
                .bindings
                .iter()
                .filter(|b| b.event == kind)
                .map(|b| b.handler.clone())
                .collect()
        };

        if handlers.is_empty() {
            return;
        }

        let decoded = match ChannelEvent::decode(kind, payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(channel, event, "failed to decode event payload: {e}");
                return;
            }
        };

        // Handlers run outside the lock so they may subscribe/unsubscribe.
        for handler in handlers {
            handler(decoded.clone());
        }
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.inner.lock().unwrap().channels.len()
    }
}
