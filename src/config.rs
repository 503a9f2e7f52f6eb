// ============================================================================
// Runtime Configuration
// ============================================================================
//
// Read once at startup from environment variables. Unset optional variables
// take their defaults; a set but unparsable value is a startup error.
//
// DATABASE_URL unset  -> in-memory event store
// KAFKA_BROKERS unset -> in-memory broker
//
// ============================================================================

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::outbox::OutboxPublisherConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}={value:?} is not a valid value: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub kafka_brokers: Option<String>,
    pub kafka_consumer_group: String,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_max_attempts: u32,
    pub outbox_retention: Duration,
    pub transaction_timeout: Duration,
    pub metrics_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 10,
            kafka_brokers: None,
            kafka_consumer_group: "es-runtime".to_string(),
            outbox_poll_interval: Duration::from_millis(500),
            outbox_batch_size: 100,
            outbox_max_attempts: 5,
            outbox_retention: Duration::from_secs(3600),
            transaction_timeout: Duration::from_millis(5000),
            metrics_port: 9090,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            value,
            reason: e.to_string(),
        }),
    }
}

fn positive<T: PartialEq + Default>(name: &'static str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::MustBePositive(name));
    }
    Ok(value)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            database_url: non_empty(lookup("DATABASE_URL")),
            database_max_connections: positive(
                "DATABASE_MAX_CONNECTIONS",
                parse(&lookup, "DATABASE_MAX_CONNECTIONS", defaults.database_max_connections)?,
            )?,
            kafka_brokers: non_empty(lookup("KAFKA_BROKERS")),
            kafka_consumer_group: non_empty(lookup("KAFKA_CONSUMER_GROUP"))
                .unwrap_or(defaults.kafka_consumer_group),
            outbox_poll_interval: Duration::from_millis(positive(
                "OUTBOX_POLL_INTERVAL_MS",
                parse(&lookup, "OUTBOX_POLL_INTERVAL_MS", 500u64)?,
            )?),
            outbox_batch_size: positive(
                "OUTBOX_BATCH_SIZE",
                parse(&lookup, "OUTBOX_BATCH_SIZE", defaults.outbox_batch_size)?,
            )?,
            outbox_max_attempts: positive(
                "OUTBOX_MAX_ATTEMPTS",
                parse(&lookup, "OUTBOX_MAX_ATTEMPTS", defaults.outbox_max_attempts)?,
            )?,
            outbox_retention: Duration::from_secs(parse(&lookup, "OUTBOX_RETENTION_SECS", 3600u64)?),
            transaction_timeout: Duration::from_millis(positive(
                "TRANSACTION_TIMEOUT_MS",
                parse(&lookup, "TRANSACTION_TIMEOUT_MS", 5000u64)?,
            )?),
            metrics_port: parse(&lookup, "METRICS_PORT", defaults.metrics_port)?,
        })
    }

    pub fn publisher_config(&self) -> OutboxPublisherConfig {
        OutboxPublisherConfig {
            poll_interval: self.outbox_poll_interval,
            batch_size: self.outbox_batch_size,
            max_attempts: self.outbox_max_attempts,
            retention: self.outbox_retention,
            ..Default::default()
        }
    }
}
