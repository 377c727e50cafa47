//! Connection manager and fallback configuration.
//!
//! Every timing knob is supplied from outside, durations are carried as `*_secs`
//! floating point seconds so config files stay readable.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Error when load or validate config
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum ConfigError {
    /// config file can't be read
    #[snafu(display("read config file {path} failed: {source}"))]
    ReadFile {
        /// file path
        path: String,
        /// source error
        source: std::io::Error,
    },

    /// config content is not valid json of the expected shape
    #[snafu(display("parse config failed: {source}"))]
    Parse {
        /// source error
        source: serde_json::Error,
    },

    /// a field has an unusable value
    #[snafu(display("invalid config field {field}: {reason}"))]
    Invalid {
        /// field name
        field: &'static str,
        /// why it is invalid
        reason: String,
    },
}

/// Degraded delivery strategy used when the persistent channel is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackMode {
    /// poll the status endpoint periodically
    Polling,
    /// deliver accumulated events in batches
    BatchUpdates,
    /// only report when the analysis is done
    CompletionOnly,
    /// no delivery at all, only a notice
    Offline,
}

impl FallbackMode {
    /// short name, same as the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::BatchUpdates => "batch-updates",
            Self::CompletionOnly => "completion-only",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// token bucket size and refill rate per session
    pub max_events_per_second: u32,
    /// liveness check period, zero disables the heartbeat
    pub heartbeat_interval_secs: f64,
    /// hard upper bound of a connection lifetime
    pub max_session_duration_secs: f64,
    /// reserved
    pub buffer_size: usize,
    /// how long a send may wait for a rate limiter token
    pub rate_limit_timeout_secs: f64,
    /// how long a disconnected session record is kept
    pub record_retention_secs: f64,
    /// how often the housekeeping task reaps records
    pub reap_interval_secs: f64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_events_per_second: 10,
            heartbeat_interval_secs: 30.0,
            max_session_duration_secs: 3600.0,
            buffer_size: 100,
            rate_limit_timeout_secs: 1.0,
            record_retention_secs: 1800.0,
            reap_interval_secs: 300.0,
        }
    }
}

impl StreamingConfig {
    /// heartbeat period, `None` if disabled
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0.0)
            .then(|| secs(self.heartbeat_interval_secs))
    }

    /// a connection without activity for longer than this is stale
    pub fn liveness_window(&self) -> Option<Duration> {
        self.heartbeat_interval().map(|interval| interval * 3)
    }

    /// max connection lifetime
    pub fn max_session_duration(&self) -> Duration {
        positive_secs(self.max_session_duration_secs)
    }

    /// rate limiter acquire timeout
    pub fn rate_limit_timeout(&self) -> Duration {
        secs(self.rate_limit_timeout_secs)
    }

    /// record retention after disconnect
    pub fn record_retention(&self) -> Duration {
        secs(self.record_retention_secs)
    }

    /// housekeeping period
    pub fn reap_interval(&self) -> Duration {
        positive_secs(self.reap_interval_secs)
    }

    /// Check all fields are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.max_events_per_second > 0,
            error::Invalid {
                field: "max_events_per_second",
                reason: "must be greater than zero",
            }
        );

        check_secs("heartbeat_interval_secs", self.heartbeat_interval_secs)?;
        check_positive_secs("max_session_duration_secs", self.max_session_duration_secs)?;
        check_secs("rate_limit_timeout_secs", self.rate_limit_timeout_secs)?;
        check_secs("record_retention_secs", self.record_retention_secs)?;
        check_positive_secs("reap_interval_secs", self.reap_interval_secs)?;

        Ok(())
    }
}

/// Fallback manager settings, immutable once the manager is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// mode activated when none is requested explicitly
    pub primary_mode: FallbackMode,
    /// polling loop period
    pub polling_interval_secs: f64,
    /// polling loop stops after this long
    pub max_polling_duration_secs: f64,
    /// events per batch
    pub batch_size: usize,
    /// a partial batch is flushed this often
    pub batch_interval_secs: f64,
    /// graceful reconnection attempts
    pub max_retry_attempts: u32,
    /// first reconnection backoff delay
    pub retry_delay_secs: f64,
    /// backoff multiplier
    pub retry_backoff: f64,
    /// show the degraded mode notice to users
    pub show_fallback_notice: bool,
    /// degraded mode notice text
    pub fallback_message: String,
    /// availability probe timeout
    pub connection_timeout_secs: f64,
    /// probe latency above this means degraded
    pub slow_connection_threshold_secs: f64,
    /// default availability probe target, e.g. `ws://127.0.0.1:8000/ws`
    pub probe_target: Option<String>,
    /// spacing of simulated events
    pub simulated_event_delay_secs: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            primary_mode: FallbackMode::Polling,
            polling_interval_secs: 2.0,
            max_polling_duration_secs: 300.0,
            batch_size: 10,
            batch_interval_secs: 5.0,
            max_retry_attempts: 3,
            retry_delay_secs: 1.0,
            retry_backoff: 2.0,
            show_fallback_notice: true,
            fallback_message: "Real-time updates unavailable. Checking for updates regularly..."
                .to_string(),
            connection_timeout_secs: 10.0,
            slow_connection_threshold_secs: 5.0,
            probe_target: None,
            simulated_event_delay_secs: 0.1,
        }
    }
}

impl FallbackConfig {
    /// polling loop period
    pub fn polling_interval(&self) -> Duration {
        positive_secs(self.polling_interval_secs)
    }

    /// polling loop lifetime
    pub fn max_polling_duration(&self) -> Duration {
        secs(self.max_polling_duration_secs)
    }

    /// batch flush period
    pub fn batch_interval(&self) -> Duration {
        positive_secs(self.batch_interval_secs)
    }

    /// probe timeout
    pub fn connection_timeout(&self) -> Duration {
        positive_secs(self.connection_timeout_secs)
    }

    /// degraded latency threshold
    pub fn slow_connection_threshold(&self) -> Duration {
        secs(self.slow_connection_threshold_secs)
    }

    /// spacing of simulated events
    pub fn simulated_event_delay(&self) -> Duration {
        secs(self.simulated_event_delay_secs)
    }

    /// delay after the `attempt`-th (0-based) failed reconnection attempt
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        secs(self.retry_delay_secs * self.retry_backoff.powi(exponent))
    }

    /// Check all fields are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive_secs("polling_interval_secs", self.polling_interval_secs)?;
        check_secs("max_polling_duration_secs", self.max_polling_duration_secs)?;
        ensure!(
            self.batch_size > 0,
            error::Invalid {
                field: "batch_size",
                reason: "must be greater than zero",
            }
        );
        check_positive_secs("batch_interval_secs", self.batch_interval_secs)?;
        check_secs("retry_delay_secs", self.retry_delay_secs)?;
        ensure!(
            self.retry_backoff.is_finite() && self.retry_backoff >= 1.0,
            error::Invalid {
                field: "retry_backoff",
                reason: format!("{} is less than 1", self.retry_backoff),
            }
        );
        check_positive_secs("connection_timeout_secs", self.connection_timeout_secs)?;
        check_secs(
            "slow_connection_threshold_secs",
            self.slow_connection_threshold_secs,
        )?;
        check_secs(
            "simulated_event_delay_secs",
            self.simulated_event_delay_secs,
        )?;

        Ok(())
    }
}

/// Full configuration of both managers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// connection manager part
    pub streaming: StreamingConfig,
    /// fallback manager part
    pub fallback: FallbackConfig,
}

impl Config {
    /// Parse and validate a json document, missing fields take defaults
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s).context(error::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a json config file
    pub async fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            tokio::fs::read_to_string(path)
                .await
                .with_context(|_| error::ReadFile {
                    path: path.display().to_string(),
                })?;

        log::debug!("Loaded config file {}", path.display());

        Self::from_json_str(&content)
    }

    /// Check all fields are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.streaming.validate()?;
        self.fallback.validate()
    }
}

/// longest accepted duration, 30 years
const MAX_SECS: f64 = 30.0 * 365.0 * 86400.0;

/// seconds to duration, out of range values are clamped into `0..=MAX_SECS`
fn secs(value: f64) -> Duration {
    if value.is_nan() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(value.clamp(0.0, MAX_SECS))
}

/// like [`secs`] but never zero, for periods and deadlines
fn positive_secs(value: f64) -> Duration {
    secs(value).max(Duration::from_millis(1))
}

fn check_secs(field: &'static str, value: f64) -> Result<(), ConfigError> {
    ensure!(
        (0.0..=MAX_SECS).contains(&value),
        error::Invalid {
            field,
            reason: format!("{value} is not a number of seconds in 0..={MAX_SECS}"),
        }
    );
    Ok(())
}

fn check_positive_secs(field: &'static str, value: f64) -> Result<(), ConfigError> {
    ensure!(
        value > 0.0 && value <= MAX_SECS,
        error::Invalid {
            field,
            reason: format!("{value} is not a positive number of seconds up to {MAX_SECS}"),
        }
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config = Config::from_json_str(
            &json!({
                "streaming": { "max_events_per_second": 1, "heartbeat_interval_secs": 0 },
                "fallback": { "primary_mode": "completion-only", "retry_backoff": 3 },
            })
            .to_string(),
        )
        .unwrap();

        assert_eq!(config.streaming.max_events_per_second, 1);
        assert!(config.streaming.heartbeat_interval().is_none());
        assert_eq!(config.streaming.buffer_size, 100);
        assert_eq!(config.fallback.primary_mode, FallbackMode::CompletionOnly);
        assert_eq!(config.fallback.polling_interval(), Duration::from_secs(2));
        assert!(config.fallback.show_fallback_notice);
    }

    #[test]
    fn test_config_rejects_zero_rate() {
        let err = Config::from_json_str(
            &json!({ "streaming": { "max_events_per_second": 0 } }).to_string(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "max_events_per_second",
                ..
            }
        ));
    }

    #[test]
    fn test_config_rejects_shrinking_backoff() {
        let err =
            Config::from_json_str(&json!({ "fallback": { "retry_backoff": 0.5 } }).to_string())
                .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "retry_backoff",
                ..
            }
        ));
    }

    #[test]
    fn test_config_rejects_unknown_mode() {
        let err = Config::from_json_str(
            &json!({ "fallback": { "primary_mode": "carrier-pigeon" } }).to_string(),
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_config_rejects_unrepresentable_duration() {
        let err = Config::from_json_str(
            &json!({ "streaming": { "max_session_duration_secs": 1e20 } }).to_string(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "max_session_duration_secs",
                ..
            }
        ));
    }

    #[test]
    fn test_unvalidated_durations_are_clamped() {
        let streaming = StreamingConfig {
            max_session_duration_secs: 1e20,
            rate_limit_timeout_secs: -1.0,
            reap_interval_secs: 0.0,
            heartbeat_interval_secs: f64::INFINITY,
            ..Default::default()
        };
        let fallback = FallbackConfig {
            retry_delay_secs: 1.0,
            retry_backoff: 1e300,
            batch_interval_secs: f64::NAN,
            ..Default::default()
        };

        assert_eq!(
            streaming.max_session_duration(),
            Duration::from_secs_f64(MAX_SECS)
        );
        assert_eq!(streaming.rate_limit_timeout(), Duration::ZERO);
        assert_eq!(streaming.reap_interval(), Duration::from_millis(1));
        assert_eq!(
            streaming.liveness_window(),
            Some(Duration::from_secs_f64(MAX_SECS) * 3)
        );
        assert_eq!(fallback.retry_delay(3), Duration::from_secs_f64(MAX_SECS));
        assert_eq!(fallback.batch_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_retry_delay_backoff() {
        let config = FallbackConfig {
            retry_delay_secs: 0.5,
            retry_backoff: 2.0,
            ..Default::default()
        };

        assert_eq!(config.retry_delay(0), Duration::from_millis(500));
        assert_eq!(config.retry_delay(1), Duration::from_secs(1));
        assert_eq!(config.retry_delay(2), Duration::from_secs(2));
    }

    #[test]
    fn test_liveness_window_is_three_intervals() {
        let config = StreamingConfig {
            heartbeat_interval_secs: 2.0,
            ..Default::default()
        };

        assert_eq!(config.liveness_window(), Some(Duration::from_secs(6)));
    }
}
