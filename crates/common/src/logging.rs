use crate::config::Environment;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global tracing subscriber: pretty output in development, JSON in
/// production.
///
/// `RUST_LOG` wins when set; otherwise `default_directives` applies
/// (e.g. `"info"` or `"inspector=debug,bridge=info"`).
///
/// Used when no OTLP endpoint is configured; `TelemetryGuard::init` installs its
/// own subscriber with the same formatting.
pub fn setup_logging(environment: Environment, default_directives: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match environment {
        Environment::Production => registry
            .with(tracing_subscriber::fmt::layer().json().with_level(true))
            .try_init(),
        Environment::Development => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_ansi(true))
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("Tracing subscriber already installed: {}", e);
    }
}
