// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Attaches one consumer per registered queue and feeds every delivery through
//! the consumer state machine in its own task. Deliveries in flight per channel
//! are bounded by the `basic.qos` prefetch, so a slow handler on one queue does
//! not starve the others.
//!
//! The dead-letter queue receives both exhausted primary messages and expired
//! deferred messages; a single consumer there picks the listener semantics
//! per message from its origin.

use crate::{
    config::Configs,
    consumer::{Consumer, ListenerKind},
    delivery::{DeliveryGuard, Envelope},
    errors::AmqpError,
    handler::ConsumerHandler,
};
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use opentelemetry::global;
use std::{collections::HashMap, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Handlers attached to a queue.
#[derive(Clone)]
pub enum ListenerRoute {
    /// Idempotent listener with retry on failure.
    Primary(Arc<dyn ConsumerHandler>),
    /// Dead-letter queue shared by the terminal and the delay-overflow paths.
    DeadLetter {
        terminal: Arc<dyn ConsumerHandler>,
        delayed: Arc<dyn ConsumerHandler>,
    },
}

impl ListenerRoute {
    /// Picks the listener semantics and handler for a delivery.
    pub fn resolve(&self, envelope: &Envelope) -> (ListenerKind, Arc<dyn ConsumerHandler>) {
        match self {
            ListenerRoute::Primary(handler) => (ListenerKind::Primary, handler.clone()),
            ListenerRoute::DeadLetter { terminal, delayed } => {
                match ListenerKind::for_dead_letter(envelope) {
                    ListenerKind::DelayOverflow => (ListenerKind::DelayOverflow, delayed.clone()),
                    kind => (kind, terminal.clone()),
                }
            }
        }
    }
}

/// Consumes the registered queues.
pub struct RabbitMQDispatcher {
    channel: Arc<Channel>,
    consumer: Arc<Consumer>,
    app_name: String,
    delay_queue: String,
    prefetch: u16,
    pub(crate) routes: HashMap<String, ListenerRoute>,
}

impl RabbitMQDispatcher {
    pub fn new(channel: Arc<Channel>, consumer: Consumer, cfg: &Configs) -> Self {
        RabbitMQDispatcher {
            channel,
            consumer: Arc::new(consumer),
            app_name: cfg.app.name.clone(),
            delay_queue: cfg.topology.delay_queue.clone(),
            prefetch: cfg.consumer.prefetch,
            routes: HashMap::default(),
        }
    }

    /// Registers the listener for a queue, replacing any previous one.
    pub fn register(mut self, queue: &str, route: ListenerRoute) -> Self {
        self.routes.insert(queue.to_owned(), route);
        self
    }

    /// Creates the broker consumers and spawns one task per queue.
    ///
    /// Consumer creation errors are returned before any task is spawned, so
    /// callers can refuse to start without a working consumer set.
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>, AmqpError> {
        if self.routes.is_empty() {
            error!("no listener registered");
            return Err(AmqpError::ConsumerDeclarationError(String::new()));
        }

        if let Err(err) = self
            .channel
            .basic_qos(self.prefetch, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }

        let mut consumers = Vec::with_capacity(self.routes.len());
        for queue in self.routes.keys() {
            let consumer = match self
                .channel
                .basic_consume(
                    queue,
                    &format!("{}-{}", self.app_name, queue),
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: false,
                        exclusive: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), queue = %queue, "failure to create the consumer");
                    Err(AmqpError::ConsumerDeclarationError(queue.clone()))
                }
                Ok(c) => Ok(c),
            }?;

            consumers.push((queue.clone(), consumer));
        }

        let mut spawns = Vec::with_capacity(consumers.len());
        for (queue, mut consumer) in consumers {
            let Some(route) = self.routes.get(&queue).cloned() else {
                continue;
            };
            let state_machine = self.consumer.clone();
            let delay_queue = self.delay_queue.clone();

            info!(queue = %queue, "consuming");

            spawns.push(tokio::spawn(async move {
                while let Some(result) = consumer.next().await {
                    match result {
                        Ok(delivery) => {
                            let envelope = Envelope::from_delivery(&delivery, &delay_queue);
                            let (kind, handler) = route.resolve(&envelope);
                            let guard =
                                DeliveryGuard::new(delivery.acker.clone(), kind.failure_disposition());
                            let state_machine = state_machine.clone();
                            let queue = queue.clone();

                            tokio::spawn(async move {
                                if let Err(err) = state_machine
                                    .consume(
                                        &global::tracer("amqp consumer"),
                                        &queue,
                                        kind,
                                        handler.as_ref(),
                                        &envelope,
                                        guard,
                                    )
                                    .await
                                {
                                    error!(error = err.to_string(), "error consume msg");
                                }
                            });
                        }

                        Err(err) => error!(error = err.to_string(), "errors consume msg"),
                    }
                }

                info!(queue = %queue, "consumer stream closed");
            }));
        }

        Ok(spawns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        delivery::Origin,
        handler::{DeadLetterLogger, SimulatedWork},
    };
    use lapin::BasicProperties;
    use std::time::Duration;

    fn envelope(origin: Origin) -> Envelope {
        let mut env = Envelope::from_parts(
            BasicProperties::default(),
            vec![],
            false,
            "dead_letter_routing_key",
            "ttl_queue",
        );
        env.origin = origin;
        env
    }

    #[test]
    fn test_primary_route() {
        let route = ListenerRoute::Primary(Arc::new(SimulatedWork::new(Duration::ZERO)));
        let (kind, _) = route.resolve(&envelope(Origin::Delayed));
        assert_eq!(kind, ListenerKind::Primary);
    }

    #[test]
    fn test_dead_letter_route_splits_by_origin() {
        let delayed: Arc<dyn ConsumerHandler> = Arc::new(SimulatedWork::new(Duration::ZERO));
        let terminal: Arc<dyn ConsumerHandler> = Arc::new(DeadLetterLogger);
        let route = ListenerRoute::DeadLetter {
            terminal: terminal.clone(),
            delayed: delayed.clone(),
        };

        let (kind, handler) = route.resolve(&envelope(Origin::Delayed));
        assert_eq!(kind, ListenerKind::DelayOverflow);
        assert!(Arc::ptr_eq(&handler, &delayed));

        let (kind, handler) = route.resolve(&envelope(Origin::Primary));
        assert_eq!(kind, ListenerKind::DeadLetter);
        assert!(Arc::ptr_eq(&handler, &terminal));
    }
}
