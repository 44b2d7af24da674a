use crate::status::ServiceStatus;
use bridge::InferenceClient;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Probes the inference peer once and records the answer. Returns liveness.
pub async fn probe_once(client: &InferenceClient, status: &ServiceStatus) -> bool {
    let was_alive = status.peer().alive;
    match client.health_check().await {
        Ok(()) => {
            if !was_alive {
                tracing::info!(peer = %client.addr(), "Inference peer is up");
            }
            status.set_peer_alive(true, None);
            true
        }
        Err(e) => {
            if was_alive {
                tracing::warn!(peer = %client.addr(), error = %e, "Inference peer is down");
            } else {
                tracing::debug!(peer = %client.addr(), error = %e, "Inference peer still down");
            }
            status.set_peer_alive(false, Some(e.to_string()));
            false
        }
    }
}

/// Probes every `interval` until `shutdown` flips to `true`.
pub fn spawn_health_probe(
    client: InferenceClient,
    status: ServiceStatus,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    probe_once(&client, &status).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Health probe stopped");
    })
}
