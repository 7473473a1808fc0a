// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of the AMQP connection and its channels.
//! Consumers and publishers get separate channels: acknowledgement handles are
//! scoped to the consuming channel, while the publishing channel runs in
//! publisher-confirm mode.

use crate::{config::Configs, errors::AmqpError};
use lapin::{
    options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// An open connection with one channel for consuming and one for publishing.
pub struct AmqpChannels {
    pub connection: Arc<Connection>,
    pub consumer: Arc<Channel>,
    pub publisher: Arc<Channel>,
}

/// Connects to RabbitMQ and opens the consumer and publisher channels.
///
/// The publisher channel is switched to confirm mode so every publish yields
/// an asynchronous broker confirmation.
///
/// # Example
/// ```ignore
/// let channels = new_amqp_channels(&cfg).await?;
/// ```
pub async fn new_amqp_channels(cfg: &Configs) -> Result<AmqpChannels, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app.name.clone()));

    let conn = match Connection::connect(&cfg.rabbitmq.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    let consumer = create_channel(&conn).await?;
    let publisher = create_channel(&conn).await?;

    if let Err(err) = publisher
        .confirm_select(ConfirmSelectOptions { nowait: false })
        .await
    {
        error!(error = err.to_string(), "error to enable publisher confirms");
        return Err(AmqpError::ConfirmSelectError);
    }
    debug!("publisher confirms enabled");

    Ok(AmqpChannels {
        connection: Arc::new(conn),
        consumer: Arc::new(consumer),
        publisher: Arc::new(publisher),
    })
}

async fn create_channel(conn: &Connection) -> Result<Channel, AmqpError> {
    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!(id = c.id(), "channel created");
            Ok(c)
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}
