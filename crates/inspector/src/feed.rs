use schema::InspectionOutcome;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// Fan-out of completed inspections to live subscribers.
///
/// Slow subscribers lag and skip events; publishers never wait.
#[derive(Debug, Clone)]
pub struct LiveFeed {
    tx: broadcast::Sender<Arc<InspectionOutcome>>,
}

impl LiveFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers received the outcome.
    pub fn publish(&self, outcome: Arc<InspectionOutcome>) -> usize {
        self.tx.send(outcome).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<InspectionOutcome>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LiveFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}
