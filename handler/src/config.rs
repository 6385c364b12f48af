//! Handler configuration.
//!
//! Loaded from environment variables (after `.env`, if present). Every value
//! has a default except the ones that name where messages come from.

use booking_relay_core::sink::KeyToken;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid or incomplete configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("{0} must be set")]
    Missing(&'static str),

    /// A variable is set but cannot be used
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        /// Variable name
        var: &'static str,
        /// Value found
        value: String,
        /// What was expected
        reason: String,
    },
}

/// Where messages are received from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    /// Kafka-compatible stream with consumer-group offsets.
    Stream {
        /// Bootstrap servers, comma-separated
        brokers: String,
        /// Topic carrying booking envelopes
        topic: String,
        /// Consumer group shared by relay instances
        consumer_group: String,
        /// Dead-letter topic; defaults to `<topic>.dead-letter`
        dead_letter_topic: Option<String>,
    },
    /// Topic/subscription tables in `PostgreSQL`.
    Topic {
        /// Database holding the topic tables
        database_url: String,
        /// Topic name
        topic: String,
        /// Subscription this relay drains
        subscription: String,
        /// Lease length for a received message
        lock_duration: Duration,
    },
}

/// Where records are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkConfig {
    /// Files under `root/<container>`
    Filesystem {
        /// Root directory
        root: PathBuf,
    },
    /// Rows of `stored_records`
    Postgres {
        /// Database holding the records table
        database_url: String,
    },
}

/// Full handler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Message source
    pub backend: BackendConfig,
    /// Deliveries before a message is dead-lettered
    pub max_delivery_count: u32,
    /// Record destination
    pub sink: SinkConfig,
    /// Container (directory or logical bucket) name
    pub container: String,
    /// Leading key segments
    pub key_prefix: String,
    /// Last key segment strategy
    pub key_token: KeyToken,
    /// Messages requested per receive
    pub batch_size: usize,
    /// Longest wait for a batch
    pub max_wait: Duration,
    /// Messages handled at once
    pub max_concurrency: usize,
    /// Prometheus listener; metrics are off when unset
    pub metrics_addr: Option<SocketAddr>,
    /// Grace period for in-flight messages on shutdown
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value
    /// does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup`.
    ///
    /// Empty values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value
    /// does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let backend = match env.or("RELAY_BACKEND", "stream").as_str() {
            "stream" => BackendConfig::Stream {
                brokers: env.or("KAFKA_BROKERS", "localhost:9092"),
                topic: env.required("KAFKA_TOPIC")?,
                consumer_group: env.required("KAFKA_CONSUMER_GROUP")?,
                dead_letter_topic: env.get("KAFKA_DEAD_LETTER_TOPIC"),
            },
            "topic" => BackendConfig::Topic {
                database_url: env.required("DATABASE_URL")?,
                topic: env.required("RELAY_TOPIC")?,
                subscription: env.required("RELAY_SUBSCRIPTION")?,
                lock_duration: Duration::from_millis(env.parsed("RELAY_LOCK_DURATION_MS", 30_000)?),
            },
            other => {
                return Err(ConfigError::Invalid {
                    var: "RELAY_BACKEND",
                    value: other.to_string(),
                    reason: "expected `stream` or `topic`".to_string(),
                });
            },
        };

        let sink = match env.or("SINK_KIND", "filesystem").as_str() {
            "filesystem" => SinkConfig::Filesystem {
                root: PathBuf::from(env.or("SINK_ROOT", "./data")),
            },
            "postgres" => SinkConfig::Postgres {
                database_url: env.required("DATABASE_URL")?,
            },
            other => {
                return Err(ConfigError::Invalid {
                    var: "SINK_KIND",
                    value: other.to_string(),
                    reason: "expected `filesystem` or `postgres`".to_string(),
                });
            },
        };

        // Stream message ids are offsets, which repeat if the topic is recreated.
        let default_token = match backend {
            BackendConfig::Stream { .. } => "random",
            BackendConfig::Topic { .. } => "message-id",
        };
        let key_token = match env.or("RELAY_KEY_TOKEN", default_token).as_str() {
            "message-id" => KeyToken::MessageId,
            "random" => KeyToken::Random,
            other => {
                return Err(ConfigError::Invalid {
                    var: "RELAY_KEY_TOKEN",
                    value: other.to_string(),
                    reason: "expected `message-id` or `random`".to_string(),
                });
            },
        };

        let max_delivery_count: u32 = env.parsed("RELAY_MAX_DELIVERY_COUNT", 10)?;
        if max_delivery_count == 0 {
            return Err(ConfigError::Invalid {
                var: "RELAY_MAX_DELIVERY_COUNT",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let metrics_addr = match env.get("METRICS_ADDR") {
            Some(raw) => Some(raw.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
                var: "METRICS_ADDR",
                value: raw.clone(),
                reason: format!("{e}"),
            })?),
            None => None,
        };

        Ok(Self {
            backend,
            max_delivery_count,
            sink,
            container: env.or("SINK_CONTAINER", "booking-events"),
            key_prefix: env.or("RELAY_KEY_PREFIX", "bookings"),
            key_token,
            batch_size: env.parsed("RELAY_BATCH_SIZE", 16)?,
            max_wait: Duration::from_millis(env.parsed("RELAY_MAX_WAIT_MS", 1_000)?),
            max_concurrency: env.parsed("RELAY_MAX_CONCURRENCY", 8)?,
            metrics_addr,
            shutdown_timeout: Duration::from_secs(env.parsed("SHUTDOWN_TIMEOUT_SECS", 30)?),
        })
    }

    /// Database URL, if any part of the configuration uses `PostgreSQL`.
    #[must_use]
    pub fn database_url(&self) -> Option<&str> {
        match (&self.backend, &self.sink) {
            (BackendConfig::Topic { database_url, .. }, _)
            | (_, SinkConfig::Postgres { database_url }) => Some(database_url),
            _ => None,
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, var: &str, default: &str) -> String {
        self.get(var).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing(var))
    }

    fn parsed<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }
}
