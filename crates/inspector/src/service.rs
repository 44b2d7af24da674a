use crate::archive::CaptureArchive;
use crate::config::InspectorConfig;
use crate::dispatch::{DEFAULT_STORE_QUEUE, OutcomeDispatcher, spawn_store_worker};
use crate::feed::LiveFeed;
use crate::health::spawn_health_probe;
use crate::listener::LineListener;
use crate::metrics::InspectorMetrics;
use crate::mqtt_notifier::MqttNotifier;
use crate::pairing::{PairExpired, PairingRegistry};
use crate::session::{LineContext, SessionLimits};
use crate::status::ServiceStatus;
use crate::store::{JsonlStore, MemoryStore, ResultStore};
use crate::verdict::VerdictInterpreter;
use crate::ws::{self, DashboardState};
use anyhow::{Context, Result};
use bridge::InferenceClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct InspectorService {
    config: InspectorConfig,
    store: Arc<dyn ResultStore>,
}

impl InspectorService {
    /// Picks the result store from the configuration: a JSON-lines log when
    /// `result_log_path` is set, memory otherwise.
    pub async fn build(config: InspectorConfig) -> Result<Self> {
        let store: Arc<dyn ResultStore> = match &config.result_log_path {
            Some(path) => Arc::new(
                JsonlStore::open(path)
                    .await
                    .context("Failed to open result log")?,
            ),
            None => {
                let store = MemoryStore::new();
                tracing::info!(
                    capacity = store.capacity(),
                    "RESULT_LOG_PATH not set, keeping recent results in memory"
                );
                Arc::new(store)
            }
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: InspectorConfig, store: Arc<dyn ResultStore>) -> Self {
        Self { config, store }
    }

    /// Binds every line and starts the background tasks.
    pub async fn start(self) -> Result<RunningService> {
        let config = self.config;
        let status = ServiceStatus::new();
        let feed = LiveFeed::default();
        let metrics = InspectorMetrics::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let registry = PairingRegistry::new(
            config.lines.iter().map(|line| line.id.as_str()),
            config.pairing_timeout,
            Some(expired_tx),
        );
        tasks.extend(registry.spawn_sweepers(
            config.pairing_timeout.min(MAX_SWEEP_PERIOD),
            &shutdown_rx,
        ));
        tasks.push(spawn_expiry_monitor(
            expired_rx,
            status.clone(),
            metrics.clone(),
            shutdown_rx.clone(),
        ));

        let (store_tx, store_rx) = mpsc::channel(DEFAULT_STORE_QUEUE);
        let store_worker = spawn_store_worker(self.store, status.clone(), store_rx);
        let dispatcher = OutcomeDispatcher::new(store_tx, feed.clone(), status.clone(), metrics.clone());

        let client = InferenceClient::new(config.inference_addr.clone(), config.inference_timeout);
        let interpreter = VerdictInterpreter::new(config.verdict_policy);
        let archive = config.capture_dir.clone().map(CaptureArchive::new);
        let limits = SessionLimits {
            max_frame_bytes: config.max_frame_bytes,
            read_timeout: config.read_timeout,
        };

        let mut line_addrs = Vec::with_capacity(config.lines.len());
        for line in &config.lines {
            let pairing = registry
                .get(&line.id)
                .with_context(|| format!("No pairing slot for line {}", line.id))?;
            status.register_line(&line.id);

            let ctx = LineContext {
                line: line.id.clone(),
                mode: line.mode,
                pairing,
                client: client.clone(),
                interpreter,
                archive: archive.clone(),
                dispatcher: dispatcher.clone(),
                status: status.clone(),
                metrics: metrics.clone(),
                limits,
            };

            let listener = LineListener::bind(line.addr, ctx, config.accept_backoff)
                .await
                .with_context(|| format!("Failed to bind line {} on {}", line.id, line.addr))?;
            line_addrs.push((line.id.clone(), listener.local_addr()?));
            tasks.push(listener.spawn(shutdown_rx.clone()));
        }
        drop(dispatcher);

        tasks.push(spawn_health_probe(
            client,
            status.clone(),
            config.health_interval,
            shutdown_rx.clone(),
        ));

        if let Some(addr) = config.dashboard_addr {
            let state = DashboardState {
                status: status.clone(),
                feed: feed.clone(),
            };
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = ws::run_server(addr, state, shutdown).await {
                    tracing::error!(error = %e, "Dashboard server failed");
                }
            }));
        }

        if let Some(mqtt) = &config.mqtt {
            let notifier = MqttNotifier::new(mqtt)?;
            tasks.push(notifier.spawn_forwarder(feed.subscribe(), shutdown_rx.clone()));
        }

        tracing::info!(
            lines = line_addrs.len(),
            inference = %config.inference_addr,
            policy = ?config.verdict_policy,
            archive = ?config.capture_dir,
            "Inspector started"
        );

        Ok(RunningService {
            line_addrs,
            status,
            feed,
            shutdown_tx,
            tasks,
            store_worker,
        })
    }

    /// Serves until Ctrl-C or SIGTERM, then shuts down.
    pub async fn run(self) -> Result<()> {
        let running = self.start().await?;
        shutdown_signal().await;
        tracing::info!("Shutdown requested");
        running.shutdown().await;
        Ok(())
    }
}

/// Handles to a started service.
pub struct RunningService {
    line_addrs: Vec<(String, SocketAddr)>,
    status: ServiceStatus,
    feed: LiveFeed,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    store_worker: JoinHandle<()>,
}

impl RunningService {
    /// Address a line actually bound, useful when configured with port 0.
    pub fn line_addr(&self, line: &str) -> Option<SocketAddr> {
        self.line_addrs
            .iter()
            .find(|(id, _)| id == line)
            .map(|(_, addr)| *addr)
    }

    pub fn status(&self) -> &ServiceStatus {
        &self.status
    }

    pub fn feed(&self) -> &LiveFeed {
        &self.feed
    }

    /// Stops accepting, waits for background tasks and lets the store worker
    /// drain what is already queued.
    pub async fn shutdown(self) {
        // Receivers may already be gone when tasks ended on their own.
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Background task ended abnormally"),
                Err(_) => {
                    tracing::warn!("Background task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, self.store_worker)
            .await
            .is_err()
        {
            tracing::warn!("Store worker still busy at shutdown, pending results dropped");
        }
        tracing::info!("Inspector stopped");
    }
}

fn spawn_expiry_monitor(
    mut expired_rx: mpsc::UnboundedReceiver<PairExpired>,
    status: ServiceStatus,
    metrics: InspectorMetrics,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = expired_rx.recv() => match event {
                    Some(_) => {
                        status.record_expired_pair();
                        metrics.record_expired_pair();
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
