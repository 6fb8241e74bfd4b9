use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_GUARD_MARGIN: usize = 200;

/// Acquisition and streaming configuration
///
/// Every knob is an explicit parameter; nothing is read from the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Sampling rate of the source in Hz
    pub sampling_rate: f64,
    /// Number of channels acquired per sample
    pub num_channels: usize,
    /// Nominal visible window in seconds
    pub window_seconds: f64,
    /// Extra samples retained beyond the nominal window
    pub guard_margin: usize,
    /// Upper bound on a single source pull, and on stop latency
    pub poll_interval_ms: u64,
    pub host: String,
    pub port: u16,
    /// Data message cadence of the server relay
    pub batches_per_second: f64,
    /// First delay between session open attempts
    pub retry_delay_ms: u64,
    /// Back-off ceiling for session open attempts
    pub max_retry_delay_ms: u64,
    /// Per-connection outbound queue depth
    pub outbound_queue_capacity: usize,
    /// Client re-enters `Connecting` after a failure or disconnect
    pub reconnect: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 250.0,
            num_channels: 8,
            window_seconds: 4.0,
            guard_margin: DEFAULT_GUARD_MARGIN,
            poll_interval_ms: 50,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            batches_per_second: 10.0,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 10_000,
            outbound_queue_capacity: 1024,
            reconnect: false,
        }
    }
}

impl StreamConfig {
    /// Reject values that would make the window or the loops degenerate
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sampling_rate.is_finite() && self.sampling_rate > 0.0) {
            return Err(ConfigError::InvalidValue(format!(
                "sampling_rate must be positive, got {}",
                self.sampling_rate
            )));
        }
        if !(self.window_seconds.is_finite() && self.window_seconds > 0.0) {
            return Err(ConfigError::InvalidValue(format!(
                "window_seconds must be positive, got {}",
                self.window_seconds
            )));
        }
        if self.num_channels == 0 {
            return Err(ConfigError::InvalidValue(
                "num_channels must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if !(self.batches_per_second.is_finite() && self.batches_per_second > 0.0) {
            return Err(ConfigError::InvalidValue(format!(
                "batches_per_second must be positive, got {}",
                self.batches_per_second
            )));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "outbound_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue("host must not be empty".to_string()));
        }
        Ok(())
    }

    /// Samples held by the sliding window: nominal window plus guard margin
    pub fn window_capacity(&self) -> usize {
        (self.window_seconds * self.sampling_rate).ceil() as usize + self.guard_margin
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn relay_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.batches_per_second)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(StreamConfig::default().validate().is_ok());
    }

    #[test]
    fn test_window_capacity_includes_guard_margin() {
        let config = StreamConfig {
            sampling_rate: 250.0,
            window_seconds: 4.0,
            guard_margin: 200,
            ..Default::default()
        };
        assert_eq!(config.window_capacity(), 1200);

        let no_margin = StreamConfig {
            guard_margin: 0,
            ..config
        };
        assert_eq!(no_margin.window_capacity(), 1000);
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        let config = StreamConfig {
            sampling_rate: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_rejects_zero_channels() {
        let config = StreamConfig {
            num_channels: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: StreamConfig =
            serde_json::from_str(r#"{"port": 9000, "guard_margin": 50}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.guard_margin, 50);
        assert_eq!(config.sampling_rate, 250.0);
    }

    #[test]
    fn test_relay_interval() {
        let config = StreamConfig {
            batches_per_second: 20.0,
            ..Default::default()
        };
        assert_eq!(config.relay_interval(), Duration::from_millis(50));
    }
}
