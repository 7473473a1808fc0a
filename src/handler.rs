// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The business step run by the consumer state machine, plus the reference
//! handlers the service ships with.

use crate::{delivery::Origin, errors::HandlerError};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{error, info};

/// A unit of work handed to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub from: String,
    pub message_id: Option<String>,
    pub origin: Origin,
    pub data: Vec<u8>,
}

impl ConsumerMessage {
    pub fn new(from: &str, message_id: Option<&str>, origin: Origin, data: &[u8]) -> Self {
        Self {
            from: from.to_owned(),
            message_id: message_id.map(str::to_owned),
            origin,
            data: data.to_vec(),
        }
    }

    /// Decodes the JSON payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.data).map_err(|e| HandlerError::Failed(e.to_string()))
    }

    /// Human readable form of the payload: the string itself for JSON
    /// strings, the raw text otherwise.
    pub fn text(&self) -> String {
        match serde_json::from_slice::<serde_json::Value>(&self.data) {
            Ok(serde_json::Value::String(s)) => s,
            Ok(value) => value.to_string(),
            Err(_) => String::from_utf8_lossy(&self.data).into_owned(),
        }
    }
}

/// Business processing for consumed messages.
///
/// Handlers of idempotent listeners must still tolerate being run twice for
/// the same message: a crash between the business effect and the ledger write,
/// or an unavailable ledger, lets a redelivery through.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Reference business step: holds the message for a fixed amount of time to
/// simulate work.
pub struct SimulatedWork {
    duration: Duration,
}

impl SimulatedWork {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl ConsumerHandler for SimulatedWork {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        let content = msg.text();
        info!(queue = %msg.from, origin = msg.origin.as_str(), content = %content, "message received");

        tokio::time::sleep(self.duration).await;

        info!(content = %content, "message processed");
        Ok(())
    }
}

/// Terminal handler for dead-lettered messages: records the arrival.
pub struct DeadLetterLogger;

#[async_trait]
impl ConsumerHandler for DeadLetterLogger {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        error!(
            queue = %msg.from,
            message_id = msg.message_id.as_deref().unwrap_or_default(),
            content = %msg.text(),
            "dead letter received"
        );
        Ok(())
    }
}
