pub mod archive;
pub mod config;
pub mod dispatch;
pub mod feed;
pub mod health;
pub mod listener;
pub mod metrics;
pub mod mqtt_notifier;
pub mod pairing;
pub mod service;
pub mod session;
pub mod status;
pub mod store;
pub mod verdict;
pub mod ws;

pub use config::{InspectorConfig, LineConfig, LineMode};
pub use feed::LiveFeed;
pub use pairing::{PairResult, PairingCoordinator, PairingRegistry};
pub use service::{InspectorService, RunningService};
pub use status::ServiceStatus;
pub use store::{InspectionId, JsonlStore, MemoryStore, ResultStore, StoreError};
pub use verdict::{Interpretation, VerdictInterpreter, VerdictPolicy};
