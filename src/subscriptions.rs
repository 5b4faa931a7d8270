//! The key-indexed subscription registry.
//!
//! Maps each subscribed key to the notification sinks of the sessions
//! watching it. A single mutex protects the whole registry; [`find`]
//! returns a snapshot copy so fan-out never writes to a pipe while the
//! registry is locked.
//!
//! [`find`]: SubscriptionRegistry::find

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::common::{encode_event_field, DELETED_MARKER};

/// The write end of one session's notification pipe.
///
/// An event is a pair of fixed-width frames: the key, then the value (or
/// the `DELETED` marker). The sink's own mutex keeps the pair contiguous
/// when several jobs notify the same session at once.
pub struct NotificationSink {
    id: usize,
    stream: Mutex<File>,
}

impl NotificationSink {
    /// Wraps the write end of a session's notification pipe.
    pub fn new(id: usize, stream: File) -> Self {
        Self {
            id,
            stream: Mutex::new(stream),
        }
    }

    /// The owning session's slot id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Writes one change event; `None` means the key was deleted.
    pub fn send_event(&self, key: &str, value: Option<&str>) -> io::Result<()> {
        let key_frame = encode_event_field(key);
        let value_frame = encode_event_field(value.unwrap_or(DELETED_MARKER));
        let mut stream = self.stream.lock().unwrap();
        stream.write_all(&key_frame)?;
        stream.write_all(&value_frame)?;
        stream.flush()
    }
}

/// Key -> subscriber sinks, shared by the session handlers and fan-out.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<HashMap<String, Vec<Arc<NotificationSink>>>>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a sink to a key. Idempotent per `(key, sink id)`; new
    /// sinks are prepended.
    pub fn add(&self, key: &str, sink: Arc<NotificationSink>) {
        let mut inner = self.inner.lock().unwrap();
        let sinks = inner.entry(key.to_owned()).or_default();
        if sinks.iter().any(|s| s.id == sink.id) {
            return;
        }
        sinks.insert(0, sink);
    }

    /// Removes one sink's subscription to a key. No-op if absent.
    pub fn remove(&self, key: &str, sink_id: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sinks) = inner.get_mut(key) {
            if let Some(pos) = sinks.iter().position(|s| s.id == sink_id) {
                sinks.remove(pos);
            }
            if sinks.is_empty() {
                inner.remove(key);
            }
        }
    }

    /// Drops every subscription to a key. Invoked when the key is deleted
    /// from the store.
    pub fn remove_key(&self, key: &str) {
        self.inner.lock().unwrap().remove(key);
    }

    /// Returns a snapshot of the key's subscribers. The registry lock is
    /// released before the caller touches any sink.
    pub fn find(&self, key: &str) -> Vec<Arc<NotificationSink>> {
        self.inner
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Purges the whole registry. The control-signal path.
    pub fn cleanup(&self) {
        self.inner.lock().unwrap().clear();
    }

    /// Number of keys with at least one subscriber.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether no key has subscribers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
