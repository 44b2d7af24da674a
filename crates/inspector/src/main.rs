use common::{TelemetryGuard, setup_logging};
use inspector::{InspectorConfig, InspectorService};

const DEFAULT_LOG_DIRECTIVES: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = InspectorConfig::from_env()?;

    // TelemetryGuard installs the subscriber itself; plain logging only without OTLP.
    let _telemetry = match config.otel_endpoint.as_deref() {
        Some(endpoint) => Some(TelemetryGuard::init(
            "inspector",
            endpoint,
            config.environment,
            DEFAULT_LOG_DIRECTIVES,
        )?),
        None => {
            setup_logging(config.environment, DEFAULT_LOG_DIRECTIVES);
            None
        }
    };

    tracing::info!(environment = %config.environment, "Inspector starting with config: {:?}", config);

    let service = InspectorService::build(config).await?;
    service.run().await
}
