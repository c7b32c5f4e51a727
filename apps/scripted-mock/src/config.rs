use std::{
    env,
    net::{AddrParseError, IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use thiserror::Error;

use crate::script::ScriptLimits;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_SPEC_PATH: &str = "/config.json";
const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_SCRIPT_MAX_OPERATIONS: u64 = 0;
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

/// Log line format selected by `MOCK_LOG_FORMAT`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "text" | "plain" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub spec_path: PathBuf,
    pub max_body_bytes: usize,
    pub script_max_operations: u64,
    pub http_timeout: Duration,
    pub log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid PORT value '{0}'")]
    InvalidPort(String),
    #[error("invalid MOCK_BIND_HOST value '{value}': {source}")]
    InvalidBindHost {
        value: String,
        source: AddrParseError,
    },
    #[error("invalid MOCK_MAX_BODY_BYTES: {0}")]
    InvalidMaxBodyBytes(String),
    #[error("invalid MOCK_SCRIPT_MAX_OPERATIONS: {0}")]
    InvalidScriptMaxOperations(String),
    #[error("invalid MOCK_HTTP_TIMEOUT_MS: {0}")]
    InvalidHttpTimeoutMs(String),
    #[error("invalid MOCK_LOG_FORMAT value '{0}': expected text or json")]
    InvalidLogFormat(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = match read("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(raw))?,
            None => DEFAULT_PORT,
        };
        let host_raw = read("MOCK_BIND_HOST").unwrap_or_else(|| DEFAULT_BIND_HOST.to_string());
        let host = host_raw
            .parse::<IpAddr>()
            .map_err(|source| ConfigError::InvalidBindHost {
                value: host_raw.clone(),
                source,
            })?;

        let spec_path = read("MOCK_SPEC_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SPEC_PATH));

        let max_body_bytes = match read("MOCK_MAX_BODY_BYTES") {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|error| ConfigError::InvalidMaxBodyBytes(error.to_string()))?
                .max(1),
            None => DEFAULT_MAX_BODY_BYTES,
        };
        let script_max_operations = match read("MOCK_SCRIPT_MAX_OPERATIONS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|error| ConfigError::InvalidScriptMaxOperations(error.to_string()))?,
            None => DEFAULT_SCRIPT_MAX_OPERATIONS,
        };
        let http_timeout_ms = match read("MOCK_HTTP_TIMEOUT_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|error| ConfigError::InvalidHttpTimeoutMs(error.to_string()))?
                .max(1),
            None => DEFAULT_HTTP_TIMEOUT_MS,
        };
        let log_format = match read("MOCK_LOG_FORMAT") {
            Some(raw) => LogFormat::parse(&raw).ok_or(ConfigError::InvalidLogFormat(raw))?,
            None => LogFormat::default(),
        };

        Ok(Self {
            bind_addr: SocketAddr::new(host, port),
            spec_path,
            max_body_bytes,
            script_max_operations,
            http_timeout: Duration::from_millis(http_timeout_ms),
            log_format,
        })
    }

    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            spec_path: PathBuf::from(DEFAULT_SPEC_PATH),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            script_max_operations: DEFAULT_SCRIPT_MAX_OPERATIONS,
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            log_format: LogFormat::Text,
        }
    }

    #[must_use]
    pub fn script_limits(&self) -> ScriptLimits {
        ScriptLimits {
            max_operations: self.script_max_operations,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let values = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_lookup(|key| values.get(key).cloned())
    }

    #[test]
    fn defaults_listen_on_8080_and_read_config_json() {
        let config = from_pairs(&[]).expect("defaults");
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 8080)));
        assert_eq!(config.spec_path, PathBuf::from("/config.json"));
        assert_eq!(config.max_body_bytes, 2 * 1024 * 1024);
        assert_eq!(config.script_limits().max_operations, 0);
        assert_eq!(config.http_timeout, Duration::from_secs(10));
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn port_and_overrides_are_applied() {
        let config = from_pairs(&[
            ("PORT", "9090"),
            ("MOCK_BIND_HOST", "127.0.0.1"),
            ("MOCK_SPEC_PATH", "/etc/mock/spec.json"),
            ("MOCK_MAX_BODY_BYTES", "1024"),
            ("MOCK_SCRIPT_MAX_OPERATIONS", "50000"),
            ("MOCK_HTTP_TIMEOUT_MS", "250"),
            ("MOCK_LOG_FORMAT", "JSON"),
        ])
        .expect("overrides");
        assert_eq!(config.bind_addr, SocketAddr::from(([127, 0, 0, 1], 9090)));
        assert_eq!(config.spec_path, PathBuf::from("/etc/mock/spec.json"));
        assert_eq!(config.max_body_bytes, 1024);
        assert_eq!(config.script_max_operations, 50_000);
        assert_eq!(config.http_timeout, Duration::from_millis(250));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = from_pairs(&[("PORT", "  "), ("MOCK_SPEC_PATH", "")]).expect("blank");
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.spec_path, PathBuf::from("/config.json"));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let port = from_pairs(&[("PORT", "http")]).expect_err("bad port");
        assert!(port.to_string().contains("PORT"));
        assert!(from_pairs(&[("PORT", "70000")]).is_err());
        assert!(matches!(
            from_pairs(&[("MOCK_BIND_HOST", "localhost")]),
            Err(ConfigError::InvalidBindHost { .. })
        ));
        assert!(matches!(
            from_pairs(&[("MOCK_MAX_BODY_BYTES", "-1")]),
            Err(ConfigError::InvalidMaxBodyBytes(_))
        ));
        assert!(matches!(
            from_pairs(&[("MOCK_SCRIPT_MAX_OPERATIONS", "lots")]),
            Err(ConfigError::InvalidScriptMaxOperations(_))
        ));
        assert!(matches!(
            from_pairs(&[("MOCK_HTTP_TIMEOUT_MS", "soon")]),
            Err(ConfigError::InvalidHttpTimeoutMs(_))
        ));
        assert!(matches!(
            from_pairs(&[("MOCK_LOG_FORMAT", "xml")]),
            Err(ConfigError::InvalidLogFormat(_))
        ));
    }
}
