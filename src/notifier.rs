//! Change-notification fan-out.
//!
//! After a job commits a WRITE or DELETE, the runner hands the affected
//! keys here. Fan-out resolves the subscribers from the registry snapshot
//! and pushes a framed event to each sink. A sink whose pipe write fails
//! marks its session for teardown; other sessions and the job itself are
//! unaffected.

use std::sync::Arc;

use log::{debug, error};

use crate::server::SessionTable;
use crate::subscriptions::SubscriptionRegistry;

/// Fans out store mutations to subscribed sessions.
pub struct Notifier {
    registry: Arc<SubscriptionRegistry>,
    sessions: Arc<SessionTable>,
}

impl Notifier {
    /// Creates a fan-out bound to a registry and the session table it
    /// tears broken sessions out of.
    pub fn new(registry: Arc<SubscriptionRegistry>, sessions: Arc<SessionTable>) -> Self {
        Self { registry, sessions }
    }

    /// The registry this fan-out resolves subscribers from.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Notifies subscribers of `key` that it now holds `value`.
    pub fn notify_write(&self, key: &str, value: &str) {
        self.fan_out(key, Some(value));
    }

    /// Notifies subscribers of `key` that it was deleted.
    pub fn notify_delete(&self, key: &str) {
        self.fan_out(key, None);
    }

    fn fan_out(&self, key: &str, value: Option<&str>) {
        for sink in self.registry.find(key) {
            debug!("notifying session {} about {key}", sink.id());
            if let Err(e) = sink.send_event(key, value) {
                error!(
                    "notification write to session {} failed, dropping it: {e}",
                    sink.id()
                );
                self.sessions.drop_session(sink.id());
            }
        }
    }
}
