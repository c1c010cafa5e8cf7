use stackgate_schema::EnvironmentId;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

/// Broadcasts "environment changed" events to every live subscriber.
///
/// Each subscriber gets its own unbounded queue, so `notify` never blocks on
/// a slow consumer. Subscribers whose receiver was dropped are pruned on the
/// next notification. Events are delivered to each subscriber in emission
/// order.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    subscribers: Mutex<Vec<Sender<EnvironmentId>>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EnvironmentId> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn notify(&self, id: EnvironmentId) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(id).is_ok());
        tracing::trace!(env_id = %id, subscribers = subscribers.len(), "change notification");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
