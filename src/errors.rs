// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! One error enum per concern: broker operations (`AmqpError`), the idempotency
//! ledger (`LedgerError`), business processing (`HandlerError`) and process
//! configuration (`ConfigError`).

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant names the broker operation that failed. Declaration errors carry
/// the broker's reply so an incompatible redefinition (`PRECONDITION_FAILED`)
/// is visible in the startup failure.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error switching a channel into publisher-confirm mode
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error declaring an exchange
    #[error("failure to declare exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue
    #[error("failure to declare queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// A primary or delay queue was defined without a dead-letter target
    #[error("queue `{0}` must declare a dead-letter exchange and routing key")]
    MissingDeadLetterError(String),

    /// A delay queue was defined without a message TTL
    #[error("delay queue `{0}` must declare a message ttl")]
    MissingTtlError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to create consumer for queue `{0}`")]
    ConsumerDeclarationError(String),
}

/// Errors raised by the idempotency ledger store.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
}

/// Business processing failures. Both variants drive the failure transition.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandlerError {
    #[error("processing failed: {0}")]
    Failed(String),

    #[error("processing timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for `{0}`: {1}")]
    Invalid(&'static str, String),

    #[error("invalid configuration: {0}")]
    Policy(String),
}
