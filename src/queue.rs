// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queues and queue bindings of the routing topology. Every queue carries a
//! [`QueueRole`]: primary and delay queues must route failed or expired
//! messages to a dead-letter exchange, dead-letter queues are terminal.

use crate::{
    errors::AmqpError,
    topology::{
        AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
        AMQP_HEADERS_MESSAGE_TTL,
    },
};
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
};
use std::collections::BTreeMap;

/// Position of a queue in the delivery graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueRole {
    /// Work queue consumed with idempotent retry semantics.
    #[default]
    Primary,
    /// Holding queue whose message expiry reroutes to the dead-letter exchange.
    Delay,
    /// Terminal queue, no further dead-lettering.
    DeadLetter,
}

/// Dead-letter target of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) role: QueueRole,
    pub(crate) durable: bool,
    pub(crate) ttl: Option<u32>,
    pub(crate) dead_letter: Option<DeadLetterTarget>,
}

impl QueueDefinition {
    /// Creates a non-durable primary queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn dead_letter_target(&self) -> Option<&DeadLetterTarget> {
        self.dead_letter.as_ref()
    }

    pub fn with_role(mut self, role: QueueRole) -> Self {
        self.role = role;
        self
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the message time-to-live in milliseconds. Expired messages are
    /// dead-lettered when a target is configured.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Routes rejected and expired messages to `exchange` with `routing_key`.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter = Some(DeadLetterTarget {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        self
    }

    /// Enforces the role invariants: primary and delay queues must never let
    /// the broker silently drop a failed or expired message, and a delay queue
    /// has no consumer so its messages must expire.
    pub fn validate(&self) -> Result<(), AmqpError> {
        match (self.role, &self.dead_letter, self.ttl) {
            (QueueRole::Primary | QueueRole::Delay, None, _) => {
                Err(AmqpError::MissingDeadLetterError(self.name.clone()))
            }
            (QueueRole::Delay, _, None) => Err(AmqpError::MissingTtlError(self.name.clone())),
            _ => Ok(()),
        }
    }

    /// Broker arguments for `queue.declare`.
    pub fn arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = BTreeMap::new();

        if let Some(target) = &self.dead_letter {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(target.exchange.clone())),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(target.routing_key.clone())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(i32::try_from(ttl).unwrap_or(i32::MAX))),
            );
        }

        args
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: self.durable,
            exclusive: false,
            auto_delete: false,
            nowait: false,
        }
    }

    pub(crate) fn field_table(&self) -> FieldTable {
        FieldTable::from(self.arguments())
    }
}

/// Binding of a queue to an exchange under a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue`; exchange and routing key default to empty.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
