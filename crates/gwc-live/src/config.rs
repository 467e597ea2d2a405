use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:18789";
pub const SNAPSHOT_PATH: &str = "/api/status";
pub const METRIC_STREAM_PATH: &str = "/api/metrics/stream";
pub const PAIRING_STREAM_PATH: &str = "/api/channels/login";
pub const ACTION_PATH: &str = "/api/setup";
pub const HEALTH_PATH: &str = "/api/health";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} must not be empty")]
    Empty { key: &'static str },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleConfig {
    pub gateway_url: String,
    pub snapshot_path: String,
    pub metric_stream_path: String,
    pub pairing_stream_path: String,
    pub action_path: String,
    pub health_path: String,
    pub poll_interval: Duration,
    pub approval_poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_misses: u32,
    pub key_debounce: Duration,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub suspend_metrics_when_hidden: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            snapshot_path: SNAPSHOT_PATH.to_string(),
            metric_stream_path: METRIC_STREAM_PATH.to_string(),
            pairing_stream_path: PAIRING_STREAM_PATH.to_string(),
            action_path: ACTION_PATH.to_string(),
            health_path: HEALTH_PATH.to_string(),
            poll_interval: Duration::from_millis(8_000),
            approval_poll_interval: Duration::from_millis(4_000),
            heartbeat_interval: Duration::from_millis(5_000),
            heartbeat_misses: 2,
            key_debounce: Duration::from_millis(600),
            request_timeout: Duration::from_millis(10_000),
            reconnect_delay: Duration::from_millis(3_000),
            suspend_metrics_when_hidden: true,
        }
    }
}

impl ConsoleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves configuration from an arbitrary key lookup; unset keys keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup("GWC_GATEWAY_URL") {
            config.set_gateway_url(&value)?;
        }
        if let Some(value) = lookup("GWC_POLL_INTERVAL_MS") {
            config.poll_interval = parse_millis("GWC_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("GWC_APPROVAL_POLL_MS") {
            config.approval_poll_interval = parse_millis("GWC_APPROVAL_POLL_MS", &value)?;
        }
        if let Some(value) = lookup("GWC_HEARTBEAT_MS") {
            config.heartbeat_interval = parse_millis("GWC_HEARTBEAT_MS", &value)?;
        }
        if let Some(value) = lookup("GWC_KEY_DEBOUNCE_MS") {
            config.key_debounce = parse_millis("GWC_KEY_DEBOUNCE_MS", &value)?;
        }
        if let Some(value) = lookup("GWC_REQUEST_TIMEOUT_MS") {
            config.request_timeout = parse_millis("GWC_REQUEST_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("GWC_RECONNECT_MS") {
            config.reconnect_delay = parse_millis("GWC_RECONNECT_MS", &value)?;
        }
        if let Some(value) = lookup("GWC_SUSPEND_METRICS") {
            config.suspend_metrics_when_hidden =
                parse_bool_flag(&value).ok_or(ConfigError::InvalidValue {
                    key: "GWC_SUSPEND_METRICS",
                    value,
                })?;
        }
        Ok(config)
    }

    pub fn set_gateway_url(&mut self, value: &str) -> Result<(), ConfigError> {
        let normalized = value.trim().trim_end_matches('/');
        if normalized.is_empty() {
            return Err(ConfigError::Empty {
                key: "GWC_GATEWAY_URL",
            });
        }
        if !(normalized.starts_with("http://") || normalized.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "GWC_GATEWAY_URL",
                value: value.to_string(),
            });
        }
        self.gateway_url = normalized.to_string();
        Ok(())
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.gateway_url, path)
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ConsoleConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config, ConsoleConfig::default());
        assert_eq!(config.poll_interval, Duration::from_secs(8));
        assert_eq!(
            config.endpoint(SNAPSHOT_PATH),
            "http://127.0.0.1:18789/api/status"
        );
    }

    #[test]
    fn overrides_are_parsed_and_url_normalized() {
        let config = ConsoleConfig::from_lookup(lookup(&[
            ("GWC_GATEWAY_URL", " https://gw.local:9000/ "),
            ("GWC_APPROVAL_POLL_MS", "2500"),
            ("GWC_SUSPEND_METRICS", "off"),
        ]))
        .expect("config");
        assert_eq!(config.gateway_url, "https://gw.local:9000");
        assert_eq!(config.approval_poll_interval, Duration::from_millis(2500));
        assert!(!config.suspend_metrics_when_hidden);
    }

    #[test]
    fn invalid_values_name_the_key() {
        let err = ConsoleConfig::from_lookup(lookup(&[("GWC_HEARTBEAT_MS", "soon")]))
            .expect_err("invalid");
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "GWC_HEARTBEAT_MS",
                value: "soon".to_string(),
            }
        );

        let err = ConsoleConfig::from_lookup(lookup(&[("GWC_POLL_INTERVAL_MS", "0")]))
            .expect_err("zero interval");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "GWC_POLL_INTERVAL_MS",
                ..
            }
        ));

        let err = ConsoleConfig::from_lookup(lookup(&[("GWC_GATEWAY_URL", "  / ")]))
            .expect_err("empty url");
        assert_eq!(
            err,
            ConfigError::Empty {
                key: "GWC_GATEWAY_URL"
            }
        );
    }

    #[test]
    fn bool_flags() {
        assert_eq!(parse_bool_flag(" YES "), Some(true));
        assert_eq!(parse_bool_flag("0"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
    }
}
