//! Live service status read by the dashboard.

use chrono::{DateTime, Local};
use schema::{InspectionOutcome, InspectionResult};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub const RECENT_CAPACITY: usize = 2000;
pub const DEFAULT_RECENT_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Starting,
    Listening,
    Faulted,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineStatus {
    pub state: ListenerState,
    pub bound: Option<SocketAddr>,
    pub last_client: Option<SocketAddr>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerStatus {
    pub alive: bool,
    pub last_error: Option<String>,
    #[serde(with = "optional_timestamp")]
    pub checked_at: Option<DateTime<Local>>,
}

#[derive(Debug, Default)]
struct Counters {
    frames: AtomicU64,
    normal: AtomicU64,
    defect: AtomicU64,
    anomaly: AtomicU64,
    error: AtomicU64,
    pairs_expired: AtomicU64,
    frame_errors: AtomicU64,
    bridge_errors: AtomicU64,
    store_errors: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub frames: u64,
    pub inspections: BTreeMap<&'static str, u64>,
    pub pairs_expired: u64,
    pub frame_errors: u64,
    pub bridge_errors: u64,
    pub store_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub lines: BTreeMap<String, LineStatus>,
    pub peer: PeerStatus,
    pub counters: CounterSnapshot,
}

#[derive(Debug, Default)]
struct Inner {
    lines: BTreeMap<String, LineStatus>,
    peer: PeerStatus,
    recent: VecDeque<Arc<InspectionOutcome>>,
}

/// Shared, internally synchronized status. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ServiceStatus {
    inner: Arc<Mutex<Inner>>,
    counters: Arc<Counters>,
}

impl ServiceStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_line(&self, line: &str) {
        self.lock().lines.insert(
            line.to_string(),
            LineStatus {
                state: ListenerState::Starting,
                bound: None,
                last_client: None,
                last_error: None,
            },
        );
    }

    pub fn mark_listening(&self, line: &str, bound: SocketAddr) {
        self.update_line(line, |status| {
            status.state = ListenerState::Listening;
            status.bound = Some(bound);
        });
    }

    pub fn mark_faulted(&self, line: &str, error: impl Into<String>) {
        let error = error.into();
        self.update_line(line, |status| {
            status.state = ListenerState::Faulted;
            status.last_error = Some(error);
        });
    }

    pub fn mark_stopped(&self, line: &str) {
        self.update_line(line, |status| status.state = ListenerState::Stopped);
    }

    /// Records an accepted client. A faulted listener that accepts again is healthy.
    pub fn record_client(&self, line: &str, client: SocketAddr) {
        self.update_line(line, |status| {
            status.last_client = Some(client);
            if status.state == ListenerState::Faulted {
                status.state = ListenerState::Listening;
            }
        });
    }

    pub fn set_peer_alive(&self, alive: bool, error: Option<String>) {
        let mut inner = self.lock();
        inner.peer.alive = alive;
        inner.peer.checked_at = Some(Local::now());
        if error.is_some() || alive {
            inner.peer.last_error = error;
        }
    }

    pub fn peer(&self) -> PeerStatus {
        self.lock().peer.clone()
    }

    pub fn record_frame(&self) {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_error(&self) {
        self.counters.frame_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bridge_error(&self) {
        self.counters.bridge_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired_pair(&self) {
        self.counters.pairs_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts the outcome and keeps it at the front of the recent ring.
    pub fn record_inspection(&self, outcome: Arc<InspectionOutcome>) {
        self.result_counter(outcome.result)
            .fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock();
        inner.recent.push_front(outcome);
        inner.recent.truncate(RECENT_CAPACITY);
    }

    /// Most recent outcomes, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Arc<InspectionOutcome>> {
        self.lock().recent.iter().take(limit).cloned().collect()
    }

    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.counters;
        CounterSnapshot {
            frames: c.frames.load(Ordering::Relaxed),
            inspections: InspectionResult::ALL
                .into_iter()
                .map(|r| (r.as_str(), self.result_counter(r).load(Ordering::Relaxed)))
                .collect(),
            pairs_expired: c.pairs_expired.load(Ordering::Relaxed),
            frame_errors: c.frame_errors.load(Ordering::Relaxed),
            bridge_errors: c.bridge_errors.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let counters = self.counters();
        let inner = self.lock();
        StatusSnapshot {
            lines: inner.lines.clone(),
            peer: inner.peer.clone(),
            counters,
        }
    }

    pub fn line(&self, line: &str) -> Option<LineStatus> {
        self.lock().lines.get(line).cloned()
    }

    fn result_counter(&self, result: InspectionResult) -> &AtomicU64 {
        match result {
            InspectionResult::Normal => &self.counters.normal,
            InspectionResult::Defect => &self.counters.defect,
            InspectionResult::Anomaly => &self.counters.anomaly,
            InspectionResult::Error => &self.counters.error,
        }
    }

    fn update_line(&self, line: &str, apply: impl FnOnce(&mut LineStatus)) {
        match self.lock().lines.get_mut(line) {
            Some(status) => apply(status),
            None => tracing::debug!(line, "Status update for unregistered line"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

mod optional_timestamp {
    use chrono::{DateTime, Local};
    use serde::Serializer;

    pub fn serialize<S>(value: &Option<DateTime<Local>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(at) => serializer.serialize_some(&schema::timestamp::format(at)),
            None => serializer.serialize_none(),
        }
    }
}
