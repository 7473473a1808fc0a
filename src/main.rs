// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_reliable::{
    channel::new_amqp_channels,
    config::{Configs, LogConfigs, LogFormat},
    consumer::Consumer,
    dispatcher::{ListenerRoute, RabbitMQDispatcher},
    handler::{DeadLetterLogger, SimulatedWork},
    http,
    ledger::RedisLedger,
    publisher::RabbitMQPublisher,
    topology::{AmqpTopology, Topology, TopologyGraph},
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(cfg: &LogConfigs) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let registry = tracing_subscriber::registry().with(filter);

    match cfg.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = err.to_string(), "failure to listen for shutdown signal");
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Configs::from_env()?;
    init_tracing(&cfg.log);

    info!(app = %cfg.app.name, "starting");

    let ledger = Arc::new(RedisLedger::connect(&cfg.ledger).await?);
    info!("ledger connected");

    let channels = new_amqp_channels(&cfg).await?;

    AmqpTopology::new(
        channels.consumer.clone(),
        TopologyGraph::reliable_delivery(&cfg.topology),
    )
    .install()
    .await?;

    let publisher = RabbitMQPublisher::new(channels.publisher.clone(), &cfg.topology);

    let work = Arc::new(SimulatedWork::new(cfg.consumer.work));
    let dispatcher = RabbitMQDispatcher::new(
        channels.consumer.clone(),
        Consumer::new(ledger, &cfg.consumer),
        &cfg,
    )
    .register(&cfg.topology.queue, ListenerRoute::Primary(work.clone()))
    .register(
        &cfg.topology.dead_letter_queue,
        ListenerRoute::DeadLetter {
            terminal: Arc::new(DeadLetterLogger),
            delayed: work,
        },
    );
    let consumers = dispatcher.start().await?;

    let listener = tokio::net::TcpListener::bind(cfg.http_addr).await?;
    info!(addr = %cfg.http_addr, "http server listening");

    axum::serve(listener, http::router(publisher))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for consumer in consumers {
        consumer.abort();
    }

    if let Err(err) = channels.connection.close(200, "shutdown").await {
        error!(error = err.to_string(), "failure to close amqp connection");
    }

    info!("stopped");
    Ok(())
}
