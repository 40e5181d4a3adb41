//! Runtime configuration for the hub, its sessions, and the stock coordinator.
//!
//! Every value has a default. [`RealtimeConfig::from_env`] overrides the
//! defaults from `WS_*` and `STOCK_*` environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Settings shared by the hub and every session it tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Capacity of each session's outbound queue.
    pub queue_capacity: usize,
    /// Upper bound on a single write to the transport.
    pub write_wait: Duration,
    /// How long a session may go without receiving any frame.
    pub pong_wait: Duration,
    /// Interval between heartbeat pings. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            queue_capacity: 256,
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            max_message_size: 512,
        }
    }
}

/// Settings for batch stock updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockConfig {
    /// Size of the worker pool used for one batch.
    pub workers: usize,
    /// Deadline for a single unit of work. `None` waits indefinitely.
    pub job_timeout: Option<Duration>,
    /// Stock level at or below which a decrement raises a stock alert.
    pub low_stock_threshold: i64,
}

impl Default for StockConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            job_timeout: Some(Duration::from_secs(5)),
            low_stock_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub hub: HubConfig,
    pub stock: StockConfig,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Parse { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl RealtimeConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup. Missing keys keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let hub = &mut config.hub;
        let stock = &mut config.stock;

        if let Some(v) = parse(&lookup, "WS_QUEUE_CAPACITY")? {
            hub.queue_capacity = v;
        }
        if let Some(secs) = parse(&lookup, "WS_WRITE_WAIT_SECS")? {
            hub.write_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "WS_PONG_WAIT_SECS")? {
            hub.pong_wait = Duration::from_secs(secs);
            hub.ping_period = hub.pong_wait * 9 / 10;
        }
        if let Some(secs) = parse(&lookup, "WS_PING_PERIOD_SECS")? {
            hub.ping_period = Duration::from_secs(secs);
        }
        if let Some(v) = parse(&lookup, "WS_MAX_MESSAGE_SIZE")? {
            hub.max_message_size = v;
        }

        if let Some(v) = parse(&lookup, "STOCK_WORKERS")? {
            stock.workers = v;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "STOCK_JOB_TIMEOUT_MS")? {
            // 0 disables the deadline.
            stock.job_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(v) = parse(&lookup, "STOCK_LOW_THRESHOLD")? {
            stock.low_stock_threshold = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.queue_capacity == 0 {
            return Err(ConfigError::Invalid("WS_QUEUE_CAPACITY must be positive".into()));
        }
        if self.hub.ping_period.is_zero() || self.hub.ping_period >= self.hub.pong_wait {
            return Err(ConfigError::Invalid(
                "ping period must be non-zero and shorter than pong wait".into(),
            ));
        }
        if self.stock.workers == 0 {
            return Err(ConfigError::Invalid("STOCK_WORKERS must be positive".into()));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { key, value: raw }),
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
    fn test_defaults() {
        let config = RealtimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RealtimeConfig::default());
        assert_eq!(config.hub.ping_period, Duration::from_secs(54));
        assert_eq!(config.stock.workers, 10);
    }

    #[test]
    fn test_pong_wait_rescales_ping_period() {
        let config = RealtimeConfig::from_lookup(lookup(&[("WS_PONG_WAIT_SECS", "20")])).unwrap();
        assert_eq!(config.hub.pong_wait, Duration::from_secs(20));
        assert_eq!(config.hub.ping_period, Duration::from_secs(18));
    }

    #[test]
    fn test_zero_job_timeout_disables_deadline() {
        let config =
            RealtimeConfig::from_lookup(lookup(&[("STOCK_JOB_TIMEOUT_MS", "0")])).unwrap();
        assert_eq!(config.stock.job_timeout, None);
    }

    #[test]
    fn test_parse_error_names_key() {
        let err = RealtimeConfig::from_lookup(lookup(&[("STOCK_WORKERS", "many")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Parse {
                key: "STOCK_WORKERS",
                value: "many".into()
            }
        );
    }

    #[test]
    fn test_ping_period_must_be_shorter_than_pong_wait() {
        let err = RealtimeConfig::from_lookup(lookup(&[
            ("WS_PONG_WAIT_SECS", "10"),
            ("WS_PING_PERIOD_SECS", "10"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
