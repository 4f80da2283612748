//! Configuration module for the rt_service filter
//!
//! Configuration comes from the Envoy plugin configuration, not from files.

use log::LevelFilter;
use serde::Deserialize;

/// Filter configuration loaded from Envoy plugin configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct FilterConfig {
    /// Keep `<script>` match progress across segments of a direction
    #[serde(default)]
    pub carry_marker_state: bool,

    /// Log level: trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit the counter snapshot when a connection closes
    #[serde(default = "default_emit_stats_on_close")]
    pub emit_stats_on_close: bool,

    /// Close both sides after injecting data with reset flags
    #[serde(default = "default_reset_on_send_data")]
    pub reset_on_send_data: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_emit_stats_on_close() -> bool {
    true
}

fn default_reset_on_send_data() -> bool {
    true
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            carry_marker_state: false,
            log_level: default_log_level(),
            emit_stats_on_close: default_emit_stats_on_close(),
            reset_on_send_data: default_reset_on_send_data(),
        }
    }
}

impl FilterConfig {
    /// Parse configuration from JSON bytes (from Envoy plugin configuration)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config_str = std::str::from_utf8(bytes)
            .map_err(|e| ConfigError::InvalidUtf8(e.to_string()))?;

        let config: FilterConfig = serde_json::from_str(config_str)
            .map_err(|e| ConfigError::InvalidJson(e.to_string()))?;

        if config.level_filter().is_none() {
            return Err(ConfigError::InvalidLogLevel(config.log_level));
        }
        Ok(config)
    }

    /// Parsed `log_level`, None if unrecognized
    pub fn level_filter(&self) -> Option<LevelFilter> {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => Some(LevelFilter::Trace),
            "debug" => Some(LevelFilter::Debug),
            "info" => Some(LevelFilter::Info),
            "warn" => Some(LevelFilter::Warn),
            "error" => Some(LevelFilter::Error),
            _ => None,
        }
    }
}

/// Configuration parsing errors
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    InvalidUtf8(String),
    InvalidJson(String),
    InvalidLogLevel(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidUtf8(e) => write!(f, "Invalid UTF-8: {}", e),
            ConfigError::InvalidJson(e) => write!(f, "Invalid JSON: {}", e),
            ConfigError::InvalidLogLevel(level) => write!(f, "Invalid log level: {}", level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FilterConfig::default();
        assert!(!config.carry_marker_state);
        assert!(config.emit_stats_on_close);
        assert!(config.reset_on_send_data);
        assert_eq!(config.level_filter(), Some(LevelFilter::Info));
    }

    #[test]
    fn test_parse_config() {
        let json = r#"{"carry_marker_state": true, "log_level": "DEBUG"}"#;
        let config = FilterConfig::from_bytes(json.as_bytes()).unwrap();
        assert!(config.carry_marker_state);
        assert_eq!(config.level_filter(), Some(LevelFilter::Debug));
        assert!(config.emit_stats_on_close);
    }

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = FilterConfig::from_bytes(b"{}").unwrap();
        assert_eq!(config, FilterConfig::default());
    }

    #[test]
    fn test_invalid_json() {
        let err = FilterConfig::from_bytes(b"{not json").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJson(_)));
    }

    #[test]
    fn test_invalid_utf8() {
        let err = FilterConfig::from_bytes(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUtf8(_)));
    }

    #[test]
    fn test_invalid_log_level() {
        let err = FilterConfig::from_bytes(br#"{"log_level": "loud"}"#).unwrap_err();
        assert_eq!(err, ConfigError::InvalidLogLevel("loud".to_string()));
        assert_eq!(err.to_string(), "Invalid log level: loud");
    }
}
