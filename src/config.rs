// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Process configuration loaded from environment variables. Defaults reproduce
//! the reference deployment: exchange, queue and routing key names, a 30 s
//! delay queue TTL and a 24 h idempotency retention window.

use crate::errors::ConfigError;
use std::{env, net::SocketAddr, str::FromStr, time::Duration};

/// Application identity, used as the AMQP connection name.
#[derive(Debug, Clone)]
pub struct AppConfigs {
    pub name: String,
}

/// RabbitMQ connection parameters.
#[derive(Debug, Clone)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl RabbitMQConfigs {
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

/// Redis connection parameters for the idempotency ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfigs {
    pub redis_url: String,
    pub key_prefix: String,
    pub ttl: Duration,
}

/// Names and arguments of the exchange/queue/binding graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfigs {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub queue: String,
    pub dead_letter_queue: String,
    pub delay_queue: String,
    pub routing_key: String,
    pub dead_letter_routing_key: String,
    pub delay_routing_key: String,
    pub delay_ttl_ms: u32,
}

impl Default for TopologyConfigs {
    fn default() -> Self {
        Self {
            exchange: "normal_exchange".to_owned(),
            dead_letter_exchange: "dead_letter_exchange".to_owned(),
            queue: "normal_queue".to_owned(),
            dead_letter_queue: "dead_letter_queue".to_owned(),
            delay_queue: "ttl_queue".to_owned(),
            routing_key: "normal_routing_key".to_owned(),
            dead_letter_routing_key: "dead_letter_routing_key".to_owned(),
            delay_routing_key: "ttl_routing_key".to_owned(),
            delay_ttl_ms: 30_000,
        }
    }
}

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfigs {
    pub prefetch: u16,
    pub timeout: Duration,
    /// Bound applied when the broker reports `x-delivery-count`.
    pub max_deliveries: Option<i64>,
    /// Duration of the reference simulated business step.
    pub work: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct LogConfigs {
    pub level: String,
    pub format: LogFormat,
}

/// Complete process configuration.
#[derive(Debug, Clone)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub ledger: LedgerConfigs,
    pub topology: TopologyConfigs,
    pub consumer: ConsumerConfigs,
    pub http_addr: SocketAddr,
    pub log: LogConfigs,
}

impl Default for Configs {
    fn default() -> Self {
        Self {
            app: AppConfigs {
                name: "rabbitmq-reliable".to_owned(),
            },
            rabbitmq: RabbitMQConfigs {
                host: "localhost".to_owned(),
                port: 5672,
                user: "guest".to_owned(),
                password: "guest".to_owned(),
                vhost: String::new(),
            },
            ledger: LedgerConfigs {
                redis_url: "redis://127.0.0.1:6379".to_owned(),
                key_prefix: "mq:idempotency".to_owned(),
                ttl: Duration::from_secs(24 * 60 * 60),
            },
            topology: TopologyConfigs::default(),
            consumer: ConsumerConfigs {
                prefetch: 10,
                timeout: Duration::from_secs(30),
                max_deliveries: None,
                work: Duration::from_millis(1000),
            },
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log: LogConfigs {
                level: "info".to_owned(),
                format: LogFormat::Pretty,
            },
        }
    }
}

impl Configs {
    /// Loads configuration from the environment (and a `.env` file when present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Configs::default();

        override_string(&lookup, "APP_NAME", &mut cfg.app.name);

        override_string(&lookup, "RABBITMQ_HOST", &mut cfg.rabbitmq.host);
        override_parsed(&lookup, "RABBITMQ_PORT", &mut cfg.rabbitmq.port)?;
        override_string(&lookup, "RABBITMQ_USER", &mut cfg.rabbitmq.user);
        override_string(&lookup, "RABBITMQ_PASSWORD", &mut cfg.rabbitmq.password);
        override_string(&lookup, "RABBITMQ_VHOST", &mut cfg.rabbitmq.vhost);

        override_string(&lookup, "REDIS_URL", &mut cfg.ledger.redis_url);
        override_string(&lookup, "LEDGER_KEY_PREFIX", &mut cfg.ledger.key_prefix);
        let mut ttl_secs = cfg.ledger.ttl.as_secs();
        override_parsed(&lookup, "LEDGER_TTL_SECS", &mut ttl_secs)?;
        cfg.ledger.ttl = Duration::from_secs(ttl_secs);

        let topology = &mut cfg.topology;
        override_string(&lookup, "TOPOLOGY_EXCHANGE", &mut topology.exchange);
        override_string(
            &lookup,
            "TOPOLOGY_DEAD_LETTER_EXCHANGE",
            &mut topology.dead_letter_exchange,
        );
        override_string(&lookup, "TOPOLOGY_QUEUE", &mut topology.queue);
        override_string(
            &lookup,
            "TOPOLOGY_DEAD_LETTER_QUEUE",
            &mut topology.dead_letter_queue,
        );
        override_string(&lookup, "TOPOLOGY_DELAY_QUEUE", &mut topology.delay_queue);
        override_string(&lookup, "TOPOLOGY_ROUTING_KEY", &mut topology.routing_key);
        override_string(
            &lookup,
            "TOPOLOGY_DEAD_LETTER_ROUTING_KEY",
            &mut topology.dead_letter_routing_key,
        );
        override_string(
            &lookup,
            "TOPOLOGY_DELAY_ROUTING_KEY",
            &mut topology.delay_routing_key,
        );
        override_parsed(&lookup, "TOPOLOGY_DELAY_TTL_MS", &mut topology.delay_ttl_ms)?;

        override_parsed(&lookup, "CONSUMER_PREFETCH", &mut cfg.consumer.prefetch)?;
        let mut timeout_ms = u64::try_from(cfg.consumer.timeout.as_millis()).unwrap_or(u64::MAX);
        override_parsed(&lookup, "CONSUMER_TIMEOUT_MS", &mut timeout_ms)?;
        cfg.consumer.timeout = Duration::from_millis(timeout_ms);
        if let Some(raw) = lookup("CONSUMER_MAX_DELIVERIES") {
            cfg.consumer.max_deliveries = Some(parse("CONSUMER_MAX_DELIVERIES", &raw)?);
        }
        let mut work_ms = u64::try_from(cfg.consumer.work.as_millis()).unwrap_or(u64::MAX);
        override_parsed(&lookup, "HANDLER_WORK_MS", &mut work_ms)?;
        cfg.consumer.work = Duration::from_millis(work_ms);

        override_parsed(&lookup, "HTTP_ADDR", &mut cfg.http_addr)?;

        override_string(&lookup, "LOG_LEVEL", &mut cfg.log.level);
        if let Some(raw) = lookup("LOG_FORMAT") {
            cfg.log.format = match raw.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" => LogFormat::Pretty,
                _ => return Err(ConfigError::Invalid("LOG_FORMAT", raw)),
            };
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks cross-field policies.
    ///
    /// The ledger must outlive the redelivery horizon, whose lower bound here is
    /// the delay queue TTL; a shorter retention window reopens the duplicate
    /// processing race for deferred messages.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let delay = Duration::from_millis(u64::from(self.topology.delay_ttl_ms));
        if self.ledger.ttl < delay {
            return Err(ConfigError::Policy(format!(
                "ledger ttl {:?} is shorter than the delay queue ttl {:?}",
                self.ledger.ttl, delay
            )));
        }

        if self.ledger.ttl.as_secs() == 0 {
            return Err(ConfigError::Policy(
                "ledger ttl must be at least one second".to_owned(),
            ));
        }

        if self.consumer.prefetch == 0 {
            return Err(ConfigError::Policy(
                "consumer prefetch must be greater than zero".to_owned(),
            ));
        }

        if self.consumer.timeout.is_zero() {
            return Err(ConfigError::Policy(
                "consumer timeout must be greater than zero".to_owned(),
            ));
        }

        if matches!(self.consumer.max_deliveries, Some(max) if max < 1) {
            return Err(ConfigError::Policy(
                "consumer max deliveries must be at least one".to_owned(),
            ));
        }

        Ok(())
    }
}

fn override_string<F>(lookup: &F, key: &'static str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key) {
        *target = value;
    }
}

fn override_parsed<F, T>(lookup: &F, key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = parse(key, &raw)?;
    }
    Ok(())
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid(key, format!("{raw}: {e}")))
}
