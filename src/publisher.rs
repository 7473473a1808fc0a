// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes units of work to the primary exchange, either on the primary
//! routing key or on the delay queue binding.
//!
//! Publishing has a split contract. `publish` returns as soon as the local
//! client accepted the frame, with a [`PublishReceipt`]; the broker's verdict
//! (confirmed, returned as unroutable, nacked) arrives later on the receipt's
//! `outcome` channel and is always logged, whether or not anyone listens.

use crate::{config::TopologyConfigs, delivery::AMQP_HEADERS_ORIGIN, errors::AmqpError, otel};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::{Confirmation, PublisherConfirm},
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying the caller's advisory delay, in milliseconds
pub const AMQP_HEADERS_DELAY_HINT: &str = "x-delay-hint";
/// Persistent delivery mode
const PERSISTENT: u8 = 2;

/// Where a message is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Primary exchange, primary routing key.
    Primary,
    /// Primary exchange, delay queue routing key.
    Delayed,
}

impl Route {
    fn origin(&self) -> &'static str {
        match self {
            Route::Primary => "primary",
            Route::Delayed => "delayed",
        }
    }
}

/// A unit of work ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub route: Route,
    pub data: Vec<u8>,
    /// Requested delay. Advisory only: the delay queue's TTL applies.
    pub delay_hint: Option<Duration>,
}

impl PublishMessage {
    pub fn primary<T>(payload: &T) -> Result<Self, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self {
            route: Route::Primary,
            data: encode(payload)?,
            delay_hint: None,
        })
    }

    pub fn delayed<T>(payload: &T, delay_hint: Duration) -> Result<Self, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self {
            route: Route::Delayed,
            data: encode(payload)?,
            delay_hint: Some(delay_hint),
        })
    }
}

/// Milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(payload).map_err(|err| {
        error!(error = err.to_string(), "error serializing payload");
        AmqpError::SerializePayloadError
    })
}

/// Broker verdict on a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Confirmed,
    /// Accepted by the broker but no queue was bound for the routing key.
    Returned {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    Nacked,
    /// The confirmation could not be obtained.
    Unknown(String),
}

/// Result of a locally accepted publish.
#[derive(Debug)]
pub struct PublishReceipt {
    pub message_id: String,
    pub outcome: oneshot::Receiver<PublishOutcome>,
}

/// Publishes units of work.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<PublishReceipt, AmqpError>;
}

/// The producer operations, available on every [`Publisher`].
#[async_trait]
pub trait PublisherExt: Publisher {
    /// Publishes `payload` to the primary queue under a fresh message id.
    async fn send<T>(&self, payload: &T) -> Result<PublishReceipt, AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publish(&Context::current(), &PublishMessage::primary(payload)?)
            .await
    }

    /// Publishes `payload` to the delay queue under a fresh message id. The
    /// message reaches the dead-letter queue once the queue TTL expires,
    /// whatever `delay_hint` says.
    async fn send_delayed<T>(
        &self,
        payload: &T,
        delay_hint: Duration,
    ) -> Result<PublishReceipt, AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publish(
            &Context::current(),
            &PublishMessage::delayed(payload, delay_hint)?,
        )
        .await
    }
}

impl<P: Publisher + ?Sized> PublisherExt for P {}

/// RabbitMQ implementation of the Publisher trait.
///
/// The channel must be in confirm mode, see
/// [`new_amqp_channels`](crate::channel::new_amqp_channels).
pub struct RabbitMQPublisher {
    channel: Arc<Channel>,
    exchange: String,
    routing_key: String,
    delay_routing_key: String,
    delay_ttl: Duration,
}

impl RabbitMQPublisher {
    pub fn new(channel: Arc<Channel>, cfg: &TopologyConfigs) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            channel,
            exchange: cfg.exchange.clone(),
            routing_key: cfg.routing_key.clone(),
            delay_routing_key: cfg.delay_routing_key.clone(),
            delay_ttl: Duration::from_millis(u64::from(cfg.delay_ttl_ms)),
        })
    }

    fn routing_key(&self, route: Route) -> &str {
        match route {
            Route::Primary => &self.routing_key,
            Route::Delayed => &self.delay_routing_key,
        }
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<PublishReceipt, AmqpError> {
        let message_id = Uuid::new_v4().to_string();
        let routing_key = self.routing_key(msg.route).to_owned();

        if let Some(hint) = msg.delay_hint {
            if hint != self.delay_ttl {
                warn!(
                    message_id = %message_id,
                    delay_hint_ms = millis(hint),
                    queue_ttl_ms = millis(self.delay_ttl),
                    "delay hint is advisory, the delay queue ttl applies"
                );
            }
        }

        let confirm = match self
            .channel
            .basic_publish(
                &self.exchange,
                &routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: true,
                },
                &msg.data,
                properties(ctx, &message_id, msg),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            Ok(confirm) => Ok(confirm),
        }?;

        info!(
            message_id = %message_id,
            exchange = %self.exchange,
            routing_key = %routing_key,
            delay_hint_ms = msg.delay_hint.map(millis),
            "message published"
        );

        let (tx, rx) = oneshot::channel();
        tokio::spawn(watch_confirmation(message_id.clone(), confirm, tx));

        Ok(PublishReceipt {
            message_id,
            outcome: rx,
        })
    }
}

/// Builds the AMQP properties: message and correlation id, JSON content type,
/// persistent delivery, origin tag, delay hint and trace context headers.
pub(crate) fn properties(ctx: &Context, message_id: &str, msg: &PublishMessage) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject(ctx, &mut headers);

    headers.insert(
        ShortString::from(AMQP_HEADERS_ORIGIN),
        AMQPValue::LongString(LongString::from(msg.route.origin())),
    );

    if let Some(hint) = msg.delay_hint {
        headers.insert(
            ShortString::from(AMQP_HEADERS_DELAY_HINT),
            AMQPValue::LongLongInt(LongLongInt::try_from(hint.as_millis()).unwrap_or(i64::MAX)),
        );
    }

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(message_id))
        .with_correlation_id(ShortString::from(message_id))
        .with_delivery_mode(PERSISTENT)
        .with_headers(FieldTable::from(headers))
}

async fn watch_confirmation(
    message_id: String,
    confirm: PublisherConfirm,
    tx: oneshot::Sender<PublishOutcome>,
) {
    let outcome = classify(confirm.await);

    match &outcome {
        PublishOutcome::Confirmed => info!(message_id = %message_id, "message confirmed"),
        PublishOutcome::Returned {
            reply_code,
            reply_text,
            exchange,
            routing_key,
        } => error!(
            message_id = %message_id,
            reply_code,
            reply_text = %reply_text,
            exchange = %exchange,
            routing_key = %routing_key,
            "message returned"
        ),
        PublishOutcome::Nacked => error!(message_id = %message_id, "message nacked by broker"),
        PublishOutcome::Unknown(cause) => {
            error!(message_id = %message_id, cause = %cause, "message confirmation failed")
        }
    }

    // the caller may have dropped the receipt
    let _ = tx.send(outcome);
}

pub(crate) fn classify(confirmation: Result<Confirmation, lapin::Error>) -> PublishOutcome {
    match confirmation {
        Ok(Confirmation::Ack(None)) => PublishOutcome::Confirmed,
        Ok(Confirmation::Ack(Some(returned))) => PublishOutcome::Returned {
            reply_code: returned.reply_code,
            reply_text: returned.reply_text.to_string(),
            exchange: returned.delivery.exchange.to_string(),
            routing_key: returned.delivery.routing_key.to_string(),
        },
        Ok(Confirmation::Nack(_)) => PublishOutcome::Nacked,
        Ok(Confirmation::NotRequested) => {
            PublishOutcome::Unknown("publisher confirms not enabled".to_owned())
        }
        Err(err) => PublishOutcome::Unknown(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header<'a>(props: &'a BasicProperties, key: &str) -> Option<&'a AMQPValue> {
        props
            .headers()
            .as_ref()
            .and_then(|h| h.inner().get(key))
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(30)), 30_000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_payload_is_json_encoded() {
        let msg = PublishMessage::primary("order-42").unwrap();
        assert_eq!(msg.data, b"\"order-42\"".to_vec());
        assert_eq!(msg.route, Route::Primary);
        assert_eq!(msg.delay_hint, None);
    }

    #[test]
    fn test_properties_carry_id_in_metadata() {
        let msg = PublishMessage::primary("order-42").unwrap();
        let props = properties(&Context::new(), "abc", &msg);

        assert_eq!(props.message_id().as_ref().map(|s| s.as_str()), Some("abc"));
        assert_eq!(props.correlation_id().as_ref().map(|s| s.as_str()), Some("abc"));
        assert_eq!(
            props.content_type().as_ref().map(|s| s.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(*props.delivery_mode(), Some(PERSISTENT));
        assert_eq!(
            header(&props, AMQP_HEADERS_ORIGIN),
            Some(&AMQPValue::LongString(LongString::from("primary")))
        );
        assert_eq!(header(&props, AMQP_HEADERS_DELAY_HINT), None);
    }

    #[test]
    fn test_delayed_properties() {
        let msg = PublishMessage::delayed("late-job", Duration::from_millis(5000)).unwrap();
        let props = properties(&Context::new(), "abc", &msg);

        assert_eq!(msg.route, Route::Delayed);
        assert_eq!(
            header(&props, AMQP_HEADERS_ORIGIN),
            Some(&AMQPValue::LongString(LongString::from("delayed")))
        );
        assert_eq!(
            header(&props, AMQP_HEADERS_DELAY_HINT),
            Some(&AMQPValue::LongLongInt(5000))
        );
    }

    #[test]
    fn test_confirmation_classification() {
        assert_eq!(
            classify(Ok(Confirmation::Ack(None))),
            PublishOutcome::Confirmed
        );
        assert_eq!(classify(Ok(Confirmation::Nack(None))), PublishOutcome::Nacked);
        assert!(matches!(
            classify(Ok(Confirmation::NotRequested)),
            PublishOutcome::Unknown(_)
        ));
        assert!(matches!(
            classify(Err(lapin::Error::ChannelsLimitReached)),
            PublishOutcome::Unknown(_)
        ));
    }

    #[tokio::test]
    async fn test_receipt_outcome_channel() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|_, msg| msg.route == Route::Primary && msg.data == b"\"order-42\"")
            .times(1)
            .returning(|_, _| {
            let (tx, rx) = oneshot::channel();
            tx.send(PublishOutcome::Confirmed).unwrap();
            Ok(PublishReceipt {
                message_id: "abc".to_owned(),
                outcome: rx,
            })
        });

        let receipt = publisher.send("order-42").await.unwrap();

        assert_eq!(receipt.message_id, "abc");
        assert_eq!(receipt.outcome.await.unwrap(), PublishOutcome::Confirmed);
    }
}
