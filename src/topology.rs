// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the exchange/queue/binding graph the delivery pipeline
//! runs on:
//!
//! ```text
//! normal_exchange --normal_routing_key--> normal_queue --(dlx)--+
//!                 --ttl_routing_key-----> ttl_queue ----(ttl)---+
//!                                                               v
//! dead_letter_exchange --dead_letter_routing_key--> dead_letter_queue
//! ```
//!
//! Declarations are idempotent on the broker: installing an unchanged graph
//! again is a no-op, while a conflicting redefinition is refused by the broker
//! and surfaces as an error that must abort startup.

use crate::{
    config::TopologyConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueRole},
};
use async_trait::async_trait;
use lapin::{options::QueueBindOptions, types::FieldTable, Channel};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Queue argument naming the exchange that receives dead-lettered messages
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument holding the message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Interface for topology management.
#[async_trait]
pub trait Topology {
    /// Declares the topology on the broker.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Broker-independent description of the exchange/queue/binding graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyGraph {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl TopologyGraph {
    /// The primary / delay / dead-letter graph.
    pub fn reliable_delivery(cfg: &TopologyConfigs) -> TopologyGraph {
        let primary_exchange = ExchangeDefinition::new(&cfg.exchange).durable();
        let dead_letter_exchange = ExchangeDefinition::new(&cfg.dead_letter_exchange).durable();

        let primary = QueueDefinition::new(&cfg.queue)
            .with_role(QueueRole::Primary)
            .durable()
            .dead_letter(&cfg.dead_letter_exchange, &cfg.dead_letter_routing_key);
        let dead_letter = QueueDefinition::new(&cfg.dead_letter_queue)
            .with_role(QueueRole::DeadLetter)
            .durable();
        let delay = QueueDefinition::new(&cfg.delay_queue)
            .with_role(QueueRole::Delay)
            .durable()
            .dead_letter(&cfg.dead_letter_exchange, &cfg.dead_letter_routing_key)
            .ttl(cfg.delay_ttl_ms);

        TopologyGraph {
            exchanges: vec![primary_exchange, dead_letter_exchange],
            queues: vec![primary, dead_letter, delay],
            bindings: vec![
                QueueBinding::new(&cfg.queue)
                    .exchange(&cfg.exchange)
                    .routing_key(&cfg.routing_key),
                QueueBinding::new(&cfg.dead_letter_queue)
                    .exchange(&cfg.dead_letter_exchange)
                    .routing_key(&cfg.dead_letter_routing_key),
                QueueBinding::new(&cfg.delay_queue)
                    .exchange(&cfg.exchange)
                    .routing_key(&cfg.delay_routing_key),
            ],
        }
    }

    pub fn queue_named(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Checks the graph before anything is sent to the broker: queue role
    /// invariants hold, and every dead-letter target and binding refers to a
    /// declared exchange and queue.
    pub fn validate(&self) -> Result<(), AmqpError> {
        let has_exchange = |name: &str| self.exchanges.iter().any(|e| e.name == name);

        for queue in &self.queues {
            queue.validate()?;

            if let Some(target) = queue.dead_letter_target() {
                if !has_exchange(&target.exchange) {
                    return Err(AmqpError::MissingDeadLetterError(queue.name.clone()));
                }
            }
        }

        for binding in &self.bindings {
            if !has_exchange(&binding.exchange_name)
                || self.queue_named(&binding.queue_name).is_none()
            {
                return Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ));
            }
        }

        Ok(())
    }
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    channel: Arc<Channel>,
    pub(crate) graph: TopologyGraph,
}

impl AmqpTopology {
    pub fn new(channel: Arc<Channel>, graph: TopologyGraph) -> AmqpTopology {
        AmqpTopology { channel, graph }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    /// Validates the graph, then declares exchanges, queues and bindings in
    /// that order. The first failure aborts the installation.
    async fn install(&self) -> Result<(), AmqpError> {
        self.graph.validate()?;
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await?;

        info!(
            exchanges = self.graph.exchanges.len(),
            queues = self.graph.queues.len(),
            bindings = self.graph.bindings.len(),
            "topology installed"
        );
        Ok(())
    }
}

impl AmqpTopology {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.graph.exchanges {
            debug!("creating exchange: {}", exch.name);

            match self
                .channel
                .exchange_declare(
                    &exch.name,
                    exch.kind(),
                    exch.declare_options(),
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = %exch.name,
                        "error to declare the exchange"
                    );
                    Err(AmqpError::DeclareExchangeError(
                        exch.name.clone(),
                        err.to_string(),
                    ))
                }
                _ => Ok(()),
            }?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.graph.queues {
            debug!(role = ?def.role, "creating queue: {}", def.name);

            match self
                .channel
                .queue_declare(&def.name, def.declare_options(), def.field_table())
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = %def.name,
                        "error to declare the queue"
                    );
                    Err(AmqpError::DeclareQueueError(
                        def.name.clone(),
                        err.to_string(),
                    ))
                }
                _ => {
                    debug!("queue: {} was created", def.name);
                    Ok(())
                }
            }?;
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.graph.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            match self
                .channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");

                    Err(AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    ))
                }
                _ => Ok(()),
            }?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{AMQPValue, LongString, ShortString};

    #[test]
    fn test_reference_graph_is_valid() {
        let graph = TopologyGraph::reliable_delivery(&TopologyConfigs::default());

        assert!(graph.validate().is_ok());
        assert_eq!(graph.exchanges.len(), 2);
        assert_eq!(graph.queues.len(), 3);
        assert_eq!(graph.bindings.len(), 3);
    }

    #[test]
    fn test_delay_queue_is_bound_to_primary_exchange() {
        let cfg = TopologyConfigs::default();
        let graph = TopologyGraph::reliable_delivery(&cfg);

        let binding = graph
            .bindings
            .iter()
            .find(|b| b.queue_name == cfg.delay_queue)
            .unwrap();
        assert_eq!(binding.exchange_name, "normal_exchange");
        assert_eq!(binding.routing_key, "ttl_routing_key");

        let delay = graph.queue_named("ttl_queue").unwrap();
        assert_eq!(delay.role, QueueRole::Delay);
        assert_eq!(delay.ttl, Some(30_000));
        assert_eq!(
            delay
                .arguments()
                .get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from(
                "dead_letter_routing_key"
            )))
        );
    }

    #[test]
    fn test_primary_and_delay_share_dead_letter_target() {
        let graph = TopologyGraph::reliable_delivery(&TopologyConfigs::default());

        let primary = graph.queue_named("normal_queue").unwrap();
        let delay = graph.queue_named("ttl_queue").unwrap();
        assert_eq!(primary.dead_letter_target(), delay.dead_letter_target());

        let dlq = graph.queue_named("dead_letter_queue").unwrap();
        assert!(dlq.dead_letter_target().is_none());
    }

    #[test]
    fn test_same_config_builds_identical_graph() {
        let cfg = TopologyConfigs::default();
        assert_eq!(
            TopologyGraph::reliable_delivery(&cfg),
            TopologyGraph::reliable_delivery(&cfg)
        );
    }

    #[test]
    fn test_dead_letter_exchange_must_be_declared() {
        let mut graph = TopologyGraph::reliable_delivery(&TopologyConfigs::default());
        graph.exchanges.retain(|e| e.name != "dead_letter_exchange");

        assert_eq!(
            graph.validate(),
            Err(AmqpError::MissingDeadLetterError("normal_queue".to_owned()))
        );
    }

    #[test]
    fn test_binding_to_unknown_queue_is_rejected() {
        let mut graph = TopologyGraph::reliable_delivery(&TopologyConfigs::default());
        graph.bindings.push(
            QueueBinding::new("missing_queue")
                .exchange("normal_exchange")
                .routing_key("k"),
        );

        assert_eq!(
            graph.validate(),
            Err(AmqpError::BindingExchangeToQueueError(
                "normal_exchange".to_owned(),
                "missing_queue".to_owned()
            ))
        );
    }
}
