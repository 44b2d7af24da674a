//! Hands completed outcomes to the store worker, the live feed and the status.

use crate::feed::LiveFeed;
use crate::metrics::InspectorMetrics;
use crate::status::ServiceStatus;
use crate::store::ResultStore;
use schema::InspectionOutcome;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_STORE_QUEUE: usize = 1024;

/// Persists outcomes in arrival order until every sender is dropped.
///
/// A failed inspection insert skips its detections; either failure is logged
/// and counted, never retried.
pub fn spawn_store_worker(
    store: Arc<dyn ResultStore>,
    status: ServiceStatus,
    mut rx: mpsc::Receiver<Arc<InspectionOutcome>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outcome) = rx.recv().await {
            let id = match store.insert_inspection(&outcome).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::error!(line = %outcome.line, error = %e, "Failed to store inspection");
                    status.record_store_error();
                    continue;
                }
            };

            if let Err(e) = store.insert_detections(id, &outcome.detections).await {
                tracing::error!(
                    line = %outcome.line,
                    inspection_id = %id,
                    error = %e,
                    "Failed to store detections"
                );
                status.record_store_error();
                continue;
            }

            tracing::debug!(
                line = %outcome.line,
                inspection_id = %id,
                detections = outcome.detections.len(),
                "Inspection stored"
            );
        }
        tracing::debug!("Store worker stopped");
    })
}

#[derive(Clone)]
pub struct OutcomeDispatcher {
    store_tx: mpsc::Sender<Arc<InspectionOutcome>>,
    feed: LiveFeed,
    status: ServiceStatus,
    metrics: InspectorMetrics,
}

impl OutcomeDispatcher {
    pub fn new(
        store_tx: mpsc::Sender<Arc<InspectionOutcome>>,
        feed: LiveFeed,
        status: ServiceStatus,
        metrics: InspectorMetrics,
    ) -> Self {
        Self {
            store_tx,
            feed,
            status,
            metrics,
        }
    }

    /// Fire-and-forget fan-out. Each sink is attempted regardless of the others.
    pub fn dispatch(&self, outcome: InspectionOutcome) -> Arc<InspectionOutcome> {
        let outcome = Arc::new(outcome);

        if let Err(e) = self.store_tx.try_send(Arc::clone(&outcome)) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "worker stopped",
            };
            tracing::warn!(line = %outcome.line, reason, "Inspection not queued for storage");
            self.status.record_store_error();
        }

        let receivers = self.feed.publish(Arc::clone(&outcome));
        tracing::trace!(receivers, "Outcome published");

        self.status.record_inspection(Arc::clone(&outcome));
        self.metrics.record_inspection(outcome.result);

        outcome
    }
}
