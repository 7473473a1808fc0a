// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries
//!
//! What the consumer state machine sees of a broker delivery: an [`Envelope`]
//! with the metadata extracted from the AMQP properties, and a
//! [`DeliveryGuard`] owning the acknowledgement handle.
//!
//! A guard must be resolved exactly once. When one is dropped unresolved
//! (panic, cancelled task) it resolves itself with the listener's failure
//! disposition, so no delivery is left holding a prefetch slot. A ledger claim
//! held by the guard is released first, so the redelivery is processed again
//! instead of being acknowledged as a duplicate.

use crate::{errors::AmqpError, ledger::Ledger};
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable},
};
use std::{fmt, sync::Arc};
use tokio::runtime::Handle;
use tracing::{error, warn};

/// Header recording the broker's dead-letter history
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Queue field of an x-death entry
pub const AMQP_HEADERS_QUEUE: &str = "queue";
/// Reason field of an x-death entry
pub const AMQP_HEADERS_REASON: &str = "reason";
/// Delivery attempt counter set by quorum queues
pub const AMQP_HEADERS_DELIVERY_COUNT: &str = "x-delivery-count";
/// Publishing path tag set by the producer
pub const AMQP_HEADERS_ORIGIN: &str = "x-origin";

/// How a delivery is resolved on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// `basic.ack`
    Ack,
    /// `basic.nack` with requeue, the broker redelivers
    Requeue,
    /// `basic.nack` without requeue, the broker dead-letters or discards
    Drop,
    /// `basic.reject` without requeue
    Reject,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Ack => write!(f, "ack"),
            Disposition::Requeue => write!(f, "requeue"),
            Disposition::Drop => write!(f, "drop"),
            Disposition::Reject => write!(f, "reject"),
        }
    }
}

/// The publishing path a message came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Published with the primary routing key.
    Primary,
    /// Published into the delay queue.
    Delayed,
    Unknown,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Primary => "primary",
            Origin::Delayed => "delayed",
            Origin::Unknown => "unknown",
        }
    }

    fn parse(value: &str) -> Origin {
        match value {
            "primary" => Origin::Primary,
            "delayed" => Origin::Delayed,
            _ => Origin::Unknown,
        }
    }
}

/// Resolves a delivery on the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Settle: Send + Sync {
    async fn settle(&self, disposition: Disposition) -> Result<(), AmqpError>;
}

#[async_trait]
impl Settle for Acker {
    async fn settle(&self, disposition: Disposition) -> Result<(), AmqpError> {
        match disposition {
            Disposition::Ack => self
                .ack(BasicAckOptions { multiple: false })
                .await
                .map(|_| ())
                .map_err(|err| {
                    error!(error = err.to_string(), "error whiling ack msg");
                    AmqpError::AckMessageError
                }),
            Disposition::Requeue | Disposition::Drop => self
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: disposition == Disposition::Requeue,
                })
                .await
                .map(|_| ())
                .map_err(|err| {
                    error!(error = err.to_string(), "error whiling nack msg");
                    AmqpError::NackMessageError
                }),
            Disposition::Reject => self
                .reject(BasicRejectOptions { requeue: false })
                .await
                .map(|_| ())
                .map_err(|err| {
                    error!(error = err.to_string(), "error whiling reject msg");
                    AmqpError::RejectMessageError
                }),
        }
    }
}

/// Single-use owner of a delivery's acknowledgement handle.
pub struct DeliveryGuard {
    settle: Option<Box<dyn Settle>>,
    fallback: Disposition,
    claim: Option<(Arc<dyn Ledger>, String)>,
}

impl DeliveryGuard {
    /// `fallback` is applied if the guard is dropped without being resolved.
    pub fn new<S>(settle: S, fallback: Disposition) -> Self
    where
        S: Settle + 'static,
    {
        Self {
            settle: Some(Box::new(settle)),
            fallback,
            claim: None,
        }
    }

    /// Ties the ledger claim on `id` to the guard: it is released if the
    /// guard is dropped unresolved.
    pub fn hold_claim(&mut self, ledger: Arc<dyn Ledger>, id: &str) {
        self.claim = Some((ledger, id.to_owned()));
    }

    /// Resolves the delivery. Consumes the guard, so a second resolution is
    /// impossible.
    pub async fn resolve(mut self, disposition: Disposition) -> Result<(), AmqpError> {
        self.claim = None;
        match self.settle.take() {
            Some(settle) => settle.settle(disposition).await,
            None => Ok(()),
        }
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        let Some(settle) = self.settle.take() else {
            return;
        };

        let fallback = self.fallback;
        let claim = self.claim.take();
        warn!(disposition = %fallback, "delivery dropped unresolved, applying fallback");

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some((ledger, id)) = claim {
                        if let Err(err) = ledger.release(&id).await {
                            error!(message_id = %id, error = err.to_string(), "error releasing dropped claim");
                        }
                    }
                    if let Err(err) = settle.settle(fallback).await {
                        error!(error = err.to_string(), "error resolving dropped delivery");
                    }
                });
            }
            Err(_) => error!("no runtime available, delivery left unresolved"),
        }
    }
}

/// Message metadata and body as seen by the consumer state machine.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_id: Option<String>,
    pub origin: Origin,
    /// Broker-reported delivery attempts, when the queue type tracks them.
    pub delivery_count: Option<i64>,
    pub redelivered: bool,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: AMQPProperties,
}

impl Envelope {
    /// Extracts the envelope from a lapin delivery. `delay_queue` is the name
    /// of the TTL queue, used to recognise expired deferred messages.
    pub fn from_delivery(delivery: &Delivery, delay_queue: &str) -> Envelope {
        Envelope::from_parts(
            delivery.properties.clone(),
            delivery.data.clone(),
            delivery.redelivered,
            delivery.routing_key.as_str(),
            delay_queue,
        )
    }

    pub fn from_parts(
        properties: AMQPProperties,
        data: Vec<u8>,
        redelivered: bool,
        routing_key: &str,
        delay_queue: &str,
    ) -> Envelope {
        let headers = properties.headers().clone().unwrap_or_default();

        let message_id = properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string())
            .filter(|id| !id.is_empty());

        Envelope {
            message_id,
            origin: extract_origin(&headers, delay_queue),
            delivery_count: headers
                .inner()
                .get(AMQP_HEADERS_DELIVERY_COUNT)
                .and_then(as_i64),
            redelivered,
            routing_key: routing_key.to_owned(),
            data,
            properties,
        }
    }
}

/// Determines where a message entered the graph.
///
/// The broker's own dead-letter history wins: an `x-death` entry naming the
/// delay queue marks a deferred message whose TTL expired. Without history the
/// producer's `x-origin` tag is used.
fn extract_origin(headers: &FieldTable, delay_queue: &str) -> Origin {
    let first_death = headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first())
        .and_then(|value| value.as_field_table());

    if let Some(death) = first_death {
        let queue = death.inner().get(AMQP_HEADERS_QUEUE).and_then(as_string);
        return match queue {
            Some(queue) if queue == delay_queue => Origin::Delayed,
            Some(_) => Origin::Primary,
            None => Origin::Unknown,
        };
    }

    headers
        .inner()
        .get(AMQP_HEADERS_ORIGIN)
        .and_then(as_string)
        .map(|origin| Origin::parse(&origin))
        .unwrap_or(Origin::Unknown)
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        _ => None,
    }
}

fn as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}
