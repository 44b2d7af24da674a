use crate::config::MqttConfig;
use anyhow::{Context, Result};
use rumqttc::{Client, ConnectionError, Event, MqttOptions, Packet, QoS};
use schema::InspectionOutcome;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Serialize)]
pub struct InspectionNotification<'a> {
    pub device_id: &'a str,
    pub line: &'a str,
    pub timestamp: String,
    pub result: &'static str,
    pub reason: &'a str,
    pub detections: usize,
    pub event_type: &'static str,
}

impl<'a> InspectionNotification<'a> {
    pub fn new(device_id: &'a str, outcome: &'a InspectionOutcome) -> Self {
        Self {
            device_id,
            line: &outcome.line,
            timestamp: outcome.timestamp.to_rfc3339(),
            result: outcome.result.as_str(),
            reason: &outcome.reason,
            detections: outcome.detections.len(),
            event_type: "inspection_completed",
        }
    }
}

pub struct MqttNotifier {
    client: Client,
    topic: String,
    device_id: String,
    connected: Arc<AtomicBool>,
}

impl MqttNotifier {
    pub fn new(config: &MqttConfig) -> Result<Self> {
        let client_id = format!("inspector-{}", config.device_id);
        let mut mqtt_options =
            MqttOptions::new(client_id, config.broker_host.as_str(), config.broker_port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(true);

        let (client, mut connection) = Client::new(mqtt_options, 64);
        let connected = Arc::new(AtomicBool::new(false));
        let connected_clone = Arc::clone(&connected);

        std::thread::Builder::new()
            .name("mqtt-connection".to_string())
            .spawn(move || {
                let mut reconnect_attempts = 0u32;

                loop {
                    for notification in connection.iter() {
                        match notification {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                connected_clone.store(true, Ordering::Release);
                                reconnect_attempts = 0;
                                tracing::info!("MQTT connected to broker");
                            }
                            Ok(Event::Incoming(Packet::PingResp)) => {
                                tracing::trace!("MQTT ping response received");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                connected_clone.store(false, Ordering::Release);
                                match &e {
                                    ConnectionError::Io(_) | ConnectionError::NetworkTimeout => {
                                        reconnect_attempts = reconnect_attempts.saturating_add(1);
                                        let backoff = calculate_backoff(reconnect_attempts);
                                        tracing::warn!(
                                            error = %e,
                                            attempt = reconnect_attempts,
                                            backoff_ms = backoff.as_millis() as u64,
                                            "MQTT connection lost, reconnecting"
                                        );
                                        std::thread::sleep(backoff);
                                    }
                                    _ => {
                                        tracing::error!(error = %e, "MQTT error");
                                    }
                                }
                            }
                        }
                    }

                    // Iterating again makes rumqttc reconnect.
                    connected_clone.store(false, Ordering::Release);
                    reconnect_attempts = reconnect_attempts.saturating_add(1);
                    let backoff = calculate_backoff(reconnect_attempts);
                    tracing::warn!(
                        attempt = reconnect_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "MQTT connection closed, attempting reconnect"
                    );
                    std::thread::sleep(backoff);
                }
            })
            .context("Failed to spawn MQTT connection thread")?;

        tracing::info!(
            broker = %format!("{}:{}", config.broker_host, config.broker_port),
            topic = %config.topic,
            device_id = %config.device_id,
            "MQTT notifier initialized"
        );

        Ok(Self {
            client,
            topic: config.topic.clone(),
            device_id: config.device_id.clone(),
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queues one outcome for publishing without blocking the caller.
    pub fn notify(&self, outcome: &InspectionOutcome) -> Result<()> {
        let notification = InspectionNotification::new(&self.device_id, outcome);
        let payload = serde_json::to_vec(&notification)
            .context("Failed to serialize inspection notification")?;

        self.client
            .try_publish(&self.topic, QoS::AtLeastOnce, false, payload)
            .context("Failed to queue MQTT message")?;

        tracing::debug!(
            line = %outcome.line,
            result = %outcome.result,
            connected = self.is_connected(),
            "Inspection notification queued"
        );
        Ok(())
    }

    /// Forwards every live-feed outcome to the broker until shutdown.
    pub fn spawn_forwarder(
        self,
        mut feed: broadcast::Receiver<Arc<InspectionOutcome>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = feed.recv() => match received {
                        Ok(outcome) => {
                            if let Err(e) = self.notify(&outcome) {
                                tracing::error!(error = %e, "Failed to send MQTT notification");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "MQTT forwarder lagging, outcomes skipped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("MQTT forwarder stopped");
        })
    }
}

/// Exponential backoff with jitter, capped at 30 seconds.
fn calculate_backoff(attempt: u32) -> Duration {
    const BASE_MS: u64 = 100;
    const MAX_MS: u64 = 30_000;

    let exp_backoff = BASE_MS.saturating_mul(2u64.saturating_pow(attempt.min(10)));
    let capped = exp_backoff.min(MAX_MS);

    let jitter = (capped / 10).max(1);
    let jittered = capped.saturating_add(fastrand::u64(0..jitter));

    Duration::from_millis(jittered)
}
