use crate::verdict::VerdictPolicy;
use common::Environment;
use schema::Camera;
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LINES: &str = "line-1=0.0.0.0:9000";
pub const DEFAULT_INFERENCE_ADDR: &str = "127.0.0.1:8009";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid line spec `{spec}`: {reason}")]
    InvalidLine { spec: String, reason: String },

    #[error("Line `{0}` is configured twice")]
    DuplicateLine(String),

    #[error("Two lines listen on {0}")]
    DuplicateAddress(SocketAddr),

    #[error("At least one line must be configured")]
    NoLines,

    #[error("Invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// How a line turns frames into inspections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    /// Two consecutive frames form a TOP/SIDE pair.
    Dual,
    /// Every frame is a complete inspection from one camera.
    Single(Camera),
}

impl fmt::Display for LineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineMode::Dual => f.write_str("dual"),
            LineMode::Single(camera) => write!(f, "single:{camera}"),
        }
    }
}

/// One inspection line: `id=addr` or `id=addr=single:<camera>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineConfig {
    pub id: String,
    pub addr: SocketAddr,
    pub mode: LineMode,
}

impl FromStr for LineConfig {
    type Err = ConfigError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidLine {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = spec.trim().splitn(3, '=');
        let id = parts.next().unwrap_or_default().trim();
        let addr = parts
            .next()
            .ok_or_else(|| invalid("expected `id=addr`"))?
            .trim();

        if id.is_empty() {
            return Err(invalid("empty line id"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("line id may only contain letters, digits, `-` and `_`"));
        }

        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|e| invalid(&format!("bad address: {e}")))?;

        let mode = match parts.next().map(str::trim) {
            None | Some("dual") => LineMode::Dual,
            Some(mode) => {
                let camera = mode
                    .strip_prefix("single:")
                    .ok_or_else(|| invalid("mode must be `dual` or `single:<camera>`"))?;
                LineMode::Single(camera.parse::<Camera>().map_err(|e| invalid(&format!("{e}")))?)
            }
        };

        Ok(Self {
            id: id.to_string(),
            addr,
            mode,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub topic: String,
    pub device_id: String,
}

#[derive(Debug, Clone)]
pub struct InspectorConfig {
    pub environment: Environment,
    pub lines: Vec<LineConfig>,
    pub inference_addr: String,
    pub max_frame_bytes: usize,
    pub pairing_timeout: Duration,
    pub read_timeout: Duration,
    pub inference_timeout: Duration,
    pub accept_backoff: Duration,
    pub health_interval: Duration,
    pub capture_dir: Option<PathBuf>,
    pub result_log_path: Option<PathBuf>,
    pub dashboard_addr: Option<SocketAddr>,
    pub verdict_policy: VerdictPolicy,
    pub mqtt: Option<MqttConfig>,
    pub otel_endpoint: Option<String>,
}

impl InspectorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source; unset or blank keys
    /// take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment: Environment = get("ENVIRONMENT")
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let lines = parse_lines(&get("LINES").unwrap_or_else(|| DEFAULT_LINES.to_string()))?;

        let inference_addr =
            get("INFERENCE_ADDR").unwrap_or_else(|| DEFAULT_INFERENCE_ADDR.to_string());

        let max_frame_bytes = parse_or(&get, "MAX_FRAME_BYTES", bridge::protocol::DEFAULT_MAX_FRAME_LEN)?;
        if max_frame_bytes == 0 || max_frame_bytes > i32::MAX as usize {
            return Err(ConfigError::InvalidValue {
                key: "MAX_FRAME_BYTES",
                value: max_frame_bytes.to_string(),
                reason: format!("must be between 1 and {}", i32::MAX),
            });
        }

        let verdict_policy = match get("VERDICT_POLICY") {
            Some(raw) => raw.parse::<VerdictPolicy>().map_err(|e| {
                ConfigError::InvalidValue {
                    key: "VERDICT_POLICY",
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?,
            None => VerdictPolicy::default(),
        };

        let dashboard_addr = get("DASHBOARD_ADDR")
            .map(|raw| {
                raw.parse::<SocketAddr>()
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "DASHBOARD_ADDR",
                        value: raw.clone(),
                        reason: e.to_string(),
                    })
            })
            .transpose()?;

        let mqtt = match get("MQTT_BROKER_HOST") {
            Some(broker_host) => Some(MqttConfig {
                broker_host,
                broker_port: parse_or(&get, "MQTT_BROKER_PORT", 1883)?,
                topic: get("MQTT_TOPIC").unwrap_or_else(|| "inspector/results".to_string()),
                device_id: get("MQTT_DEVICE_ID").unwrap_or_else(|| "unknown".to_string()),
            }),
            None => None,
        };

        Ok(Self {
            environment,
            lines,
            inference_addr,
            max_frame_bytes,
            pairing_timeout: millis_or(&get, "PAIRING_TIMEOUT_MS", 10_000)?,
            read_timeout: millis_or(&get, "READ_TIMEOUT_MS", 30_000)?,
            inference_timeout: millis_or(&get, "INFERENCE_TIMEOUT_MS", 20_000)?,
            accept_backoff: millis_or(&get, "ACCEPT_BACKOFF_MS", 400)?,
            health_interval: millis_or(&get, "HEALTH_INTERVAL_MS", 5_000)?,
            capture_dir: get("CAPTURE_DIR").map(PathBuf::from),
            result_log_path: get("RESULT_LOG_PATH").map(PathBuf::from),
            dashboard_addr,
            verdict_policy,
            mqtt,
            otel_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }
}

/// Comma-separated line specs. Ids and listen addresses must be unique.
pub fn parse_lines(raw: &str) -> Result<Vec<LineConfig>, ConfigError> {
    let lines = raw
        .split(',')
        .map(str::trim)
        .filter(|spec| !spec.is_empty())
        .map(LineConfig::from_str)
        .collect::<Result<Vec<_>, _>>()?;

    if lines.is_empty() {
        return Err(ConfigError::NoLines);
    }

    let mut ids = HashSet::new();
    let mut addrs = HashSet::new();
    for line in &lines {
        if !ids.insert(line.id.as_str()) {
            return Err(ConfigError::DuplicateLine(line.id.clone()));
        }
        // Port 0 asks the OS for a fresh port, so it can repeat.
        if line.addr.port() != 0 && !addrs.insert(line.addr) {
            return Err(ConfigError::DuplicateAddress(line.addr));
        }
    }
    Ok(lines)
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, key: &'static str, default_ms: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<InspectorConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        InspectorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.environment, Environment::Development);
        assert_eq!(cfg.lines.len(), 1);
        assert_eq!(cfg.lines[0].id, "line-1");
        assert_eq!(cfg.lines[0].addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(cfg.lines[0].mode, LineMode::Dual);
        assert_eq!(cfg.inference_addr, "127.0.0.1:8009");
        assert_eq!(cfg.max_frame_bytes, 100_000_000);
        assert_eq!(cfg.pairing_timeout, Duration::from_secs(10));
        assert_eq!(cfg.read_timeout, Duration::from_secs(30));
        assert_eq!(cfg.inference_timeout, Duration::from_secs(20));
        assert_eq!(cfg.accept_backoff, Duration::from_millis(400));
        assert_eq!(cfg.health_interval, Duration::from_secs(5));
        assert_eq!(cfg.verdict_policy, VerdictPolicy::PeerVerdict);
        assert!(cfg.capture_dir.is_none());
        assert!(cfg.result_log_path.is_none());
        assert!(cfg.dashboard_addr.is_none());
        assert!(cfg.mqtt.is_none());
        assert!(cfg.otel_endpoint.is_none());
    }

    #[test]
    fn overrides_are_read() {
        let cfg = config(&[
            ("ENVIRONMENT", "prod"),
            ("LINES", "a=127.0.0.1:7000, b=127.0.0.1:7001=single:side"),
            ("INFERENCE_ADDR", "10.0.0.5:8009"),
            ("PAIRING_TIMEOUT_MS", "2500"),
            ("VERDICT_POLICY", "any-detection"),
            ("CAPTURE_DIR", "/var/captures"),
            ("DASHBOARD_ADDR", "0.0.0.0:8080"),
            ("MQTT_BROKER_HOST", "mosquitto"),
            ("MQTT_TOPIC", "plant/line"),
        ])
        .unwrap();

        assert_eq!(cfg.environment, Environment::Production);
        assert_eq!(cfg.lines[1].mode, LineMode::Single(Camera::Side));
        assert_eq!(cfg.inference_addr, "10.0.0.5:8009");
        assert_eq!(cfg.pairing_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.verdict_policy, VerdictPolicy::AnyDetectionIsDefect);
        assert_eq!(cfg.capture_dir, Some(PathBuf::from("/var/captures")));
        assert_eq!(cfg.dashboard_addr, Some("0.0.0.0:8080".parse().unwrap()));

        let mqtt = cfg.mqtt.unwrap();
        assert_eq!(mqtt.broker_port, 1883);
        assert_eq!(mqtt.topic, "plant/line");
        assert_eq!(mqtt.device_id, "unknown");
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = config(&[("CAPTURE_DIR", "  "), ("READ_TIMEOUT_MS", "")]).unwrap();
        assert!(cfg.capture_dir.is_none());
        assert_eq!(cfg.read_timeout, Duration::from_secs(30));
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = config(&[("READ_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "READ_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn frame_limit_must_fit_the_length_prefix() {
        assert!(config(&[("MAX_FRAME_BYTES", "0")]).is_err());
        assert!(config(&[("MAX_FRAME_BYTES", "4294967296")]).is_err());
        assert_eq!(
            config(&[("MAX_FRAME_BYTES", "1024")]).unwrap().max_frame_bytes,
            1024
        );
    }

    #[test]
    fn unknown_policy_is_an_error() {
        assert!(config(&[("VERDICT_POLICY", "strictest")]).is_err());
    }

    #[test]
    fn line_spec_errors() {
        for spec in [
            "line-1",
            "=127.0.0.1:1",
            "line 1=127.0.0.1:1",
            "line-1=localhost",
            "line-1=127.0.0.1:1=single:bottom",
            "line-1=127.0.0.1:1=triple",
        ] {
            assert!(
                matches!(spec.parse::<LineConfig>(), Err(ConfigError::InvalidLine { .. })),
                "spec: {spec}"
            );
        }
    }

    #[test]
    fn duplicate_lines_are_rejected() {
        assert_eq!(
            parse_lines("a=127.0.0.1:1,a=127.0.0.1:2"),
            Err(ConfigError::DuplicateLine("a".to_string()))
        );
        assert_eq!(
            parse_lines("a=127.0.0.1:1,b=127.0.0.1:1"),
            Err(ConfigError::DuplicateAddress("127.0.0.1:1".parse().unwrap()))
        );
        assert!(parse_lines("a=127.0.0.1:0,b=127.0.0.1:0").is_ok());
        assert_eq!(parse_lines(" , "), Err(ConfigError::NoLines));
    }

    #[test]
    fn line_mode_display() {
        assert_eq!(LineMode::Dual.to_string(), "dual");
        assert_eq!(LineMode::Single(Camera::Top).to_string(), "single:top");
    }
}
