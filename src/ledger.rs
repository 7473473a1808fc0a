// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Idempotency Ledger
//!
//! A shared Redis map from message id to a completion marker with bounded
//! retention. An entry's presence is enough to skip a redelivered message;
//! its absence proves nothing once the retention window has elapsed.
//!
//! The claim is a single `SET key 1 NX EX ttl`, the only synchronisation point
//! between concurrent deliveries of the same id, across process instances.

use crate::{config::LedgerConfigs, errors::LedgerError};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, cmd};
use std::time::Duration;
use tracing::debug;

/// Value stored for every claimed or completed id.
pub const LEDGER_MARKER: &str = "1";

/// Store recording units of work that were claimed or completed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Atomically records `id` unless present. Returns `true` when the id was
    /// already recorded, i.e. the delivery is a duplicate.
    async fn try_claim(&self, id: &str) -> Result<bool, LedgerError>;

    /// Unconditionally records `id` as complete, refreshing its retention.
    async fn mark_complete(&self, id: &str) -> Result<(), LedgerError>;

    /// Forgets `id` so a redelivery after a failed attempt is processed again.
    async fn release(&self, id: &str) -> Result<(), LedgerError>;
}

/// Redis-backed ledger.
#[derive(Clone)]
pub struct RedisLedger {
    conn: ConnectionManager,
    prefix: String,
    ttl: Duration,
}

impl RedisLedger {
    /// Connects to the configured Redis server. The connection manager
    /// reconnects on its own after transient failures.
    pub async fn connect(cfg: &LedgerConfigs) -> Result<Self, LedgerError> {
        let client = redis::Client::open(cfg.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, &cfg.key_prefix, cfg.ttl))
    }

    pub fn new(conn: ConnectionManager, prefix: &str, ttl: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.to_owned(),
            ttl,
        }
    }

    pub fn key(&self, id: &str) -> String {
        ledger_key(&self.prefix, id)
    }
}

/// Formats the ledger key for `id`: `<prefix>:<id>`.
pub fn ledger_key(prefix: &str, id: &str) -> String {
    format!("{}:{}", prefix.trim_end_matches(':'), id)
}

#[async_trait]
impl Ledger for RedisLedger {
    async fn try_claim(&self, id: &str) -> Result<bool, LedgerError> {
        let key = self.key(id);
        let mut conn = self.conn.clone();

        // SET NX replies OK when the key was written and nil when it existed
        let reply: Option<String> = cmd("SET")
            .arg(&key)
            .arg(LEDGER_MARKER)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        let duplicate = reply.is_none();
        debug!(key = %key, duplicate, "ledger claim");
        Ok(duplicate)
    }

    async fn mark_complete(&self, id: &str) -> Result<(), LedgerError> {
        let key = self.key(id);
        let mut conn = self.conn.clone();

        let _: String = cmd("SET")
            .arg(&key)
            .arg(LEDGER_MARKER)
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        debug!(key = %key, ttl_secs = self.ttl.as_secs(), "message marked as processed");
        Ok(())
    }

    async fn release(&self, id: &str) -> Result<(), LedgerError> {
        let key = self.key(id);
        let mut conn = self.conn.clone();

        let removed: i64 = cmd("DEL").arg(&key).query_async(&mut conn).await?;

        debug!(key = %key, removed, "ledger claim released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        assert_eq!(ledger_key("mq:idempotency", "abc"), "mq:idempotency:abc");
    }

    #[test]
    fn test_key_format_tolerates_trailing_separator() {
        assert_eq!(ledger_key("mq:idempotency:", "abc"), "mq:idempotency:abc");
    }
}
