//! Lifecycle event fan-out.
//!
//! Every `WorkflowEvent` the scheduler emits goes through one `EventBus`
//! shared by all executions of an engine. Subscribers filter by
//! `execution_id` themselves. A subscriber that falls more than `capacity`
//! events behind sees `RecvError::Lagged` and skips ahead; the scheduler
//! never blocks on slow consumers.

use stepwise_types::event::WorkflowEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// `capacity` is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: WorkflowEvent) {
        tracing::trace!(
            execution_id = %event.execution_id(),
            step_id = event.step_id(),
            "publishing workflow event"
        );
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
