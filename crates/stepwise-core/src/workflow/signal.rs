//! Wake-up channel for durable waits, keyed by `(execution_id, step_id)`.
//!
//! The hub carries no payloads. Signals are persisted through the checkpoint
//! manager first and the hub only tells a waiting driver to go and read them,
//! so a notification sent while nobody waits is never lost: `Notify` keeps one
//! permit for the next waiter.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Default)]
pub struct SignalHub {
    slots: DashMap<(Uuid, String), Arc<Notify>>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, execution_id: Uuid, step_id: &str) -> Arc<Notify> {
        self.slots
            .entry((execution_id, step_id.to_string()))
            .or_default()
            .value()
            .clone()
    }

    /// Wake the driver waiting on this step, or the next one to wait.
    pub fn notify(&self, execution_id: Uuid, step_id: &str) {
        self.slot(execution_id, step_id).notify_one();
    }

    /// Handle to await the next notification for this step.
    pub fn subscribe(&self, execution_id: Uuid, step_id: &str) -> Arc<Notify> {
        self.slot(execution_id, step_id)
    }

    /// Drop every slot of a finished execution.
    pub fn clear(&self, execution_id: Uuid) {
        self.slots.retain(|(id, _), _| *id != execution_id);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl std::fmt::Debug for SignalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHub")
            .field("slots", &self.slots.len())
            .finish()
    }
}
