//! Matches consecutive images of one inspection line into TOP/SIDE pairs.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, PartialEq, Eq)]
pub enum PairResult {
    /// The image is now the pending first half of a pair.
    Stored,
    /// The image completed a pair. `first` was stored earlier and is the TOP view;
    /// `first_captured_at` is when it arrived.
    Paired {
        first: Vec<u8>,
        first_captured_at: DateTime<Local>,
        second: Vec<u8>,
    },
}

/// A first image that waited longer than the pairing timeout and was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairExpired {
    pub line: String,
    pub waited: Duration,
    pub image_bytes: usize,
}

#[derive(Debug)]
struct PendingImage {
    bytes: Vec<u8>,
    stored_at: Instant,
    captured_at: DateTime<Local>,
}

/// Holds at most one unmatched image for a single line.
///
/// The slot lock is held only for the store-or-pair decision.
#[derive(Debug)]
pub struct PairingCoordinator {
    line: String,
    timeout: Duration,
    slot: Mutex<Option<PendingImage>>,
    expired_tx: Option<mpsc::UnboundedSender<PairExpired>>,
}

impl PairingCoordinator {
    pub fn new(
        line: impl Into<String>,
        timeout: Duration,
        expired_tx: Option<mpsc::UnboundedSender<PairExpired>>,
    ) -> Self {
        Self {
            line: line.into(),
            timeout,
            slot: Mutex::new(None),
            expired_tx,
        }
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn offer(&self, image: Vec<u8>) -> PairResult {
        let now = Instant::now();
        let (result, expired) = {
            let mut slot = self.lock();
            let expired = self.take_if_stale(&mut slot, now);
            match slot.take() {
                Some(first) => (
                    PairResult::Paired {
                        first: first.bytes,
                        first_captured_at: first.captured_at,
                        second: image,
                    },
                    expired,
                ),
                None => {
                    *slot = Some(PendingImage {
                        bytes: image,
                        stored_at: now,
                        captured_at: Local::now(),
                    });
                    (PairResult::Stored, expired)
                }
            }
        };

        if let Some(event) = expired {
            self.report(event);
        }
        result
    }

    /// Clears the slot when its image is older than the timeout.
    pub fn expire_stale(&self) -> Option<PairExpired> {
        let expired = {
            let mut slot = self.lock();
            self.take_if_stale(&mut slot, Instant::now())
        };
        if let Some(event) = &expired {
            self.report(event.clone());
        }
        expired
    }

    pub fn has_pending(&self) -> bool {
        self.lock().is_some()
    }

    /// Sweeps the slot periodically until `shutdown` flips to `true`.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.expire_stale();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(line = %self.line, "Pairing sweeper stopped");
        })
    }

    fn take_if_stale(
        &self,
        slot: &mut Option<PendingImage>,
        now: Instant,
    ) -> Option<PairExpired> {
        let waited = now.saturating_duration_since(slot.as_ref()?.stored_at);
        if waited < self.timeout {
            return None;
        }
        slot.take().map(|stale| PairExpired {
            line: self.line.clone(),
            waited,
            image_bytes: stale.bytes.len(),
        })
    }

    fn report(&self, event: PairExpired) {
        tracing::warn!(
            line = %event.line,
            waited_ms = event.waited.as_millis() as u64,
            bytes = event.image_bytes,
            "Pending image expired without a partner"
        );
        if let Some(tx) = &self.expired_tx {
            // A closed receiver only means nobody is watching anymore.
            let _ = tx.send(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingImage>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One coordinator per configured line.
#[derive(Debug, Default)]
pub struct PairingRegistry {
    lines: HashMap<String, Arc<PairingCoordinator>>,
}

impl PairingRegistry {
    pub fn new<'a>(
        line_ids: impl IntoIterator<Item = &'a str>,
        timeout: Duration,
        expired_tx: Option<mpsc::UnboundedSender<PairExpired>>,
    ) -> Self {
        let lines = line_ids
            .into_iter()
            .map(|id| {
                (
                    id.to_string(),
                    Arc::new(PairingCoordinator::new(id, timeout, expired_tx.clone())),
                )
            })
            .collect();
        Self { lines }
    }

    pub fn get(&self, line: &str) -> Option<Arc<PairingCoordinator>> {
        self.lines.get(line).cloned()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn spawn_sweepers(
        &self,
        period: Duration,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.lines
            .values()
            .map(|coordinator| Arc::clone(coordinator).spawn_sweeper(period, shutdown.clone()))
            .collect()
    }
}
