// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # HTTP Endpoints
//!
//! Thin HTTP front for the producer. Responses report local acceptance only:
//! broker-side outcomes (unroutable, nacked) show up in the logs, not here.

use crate::publisher::{Publisher, PublisherExt};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{error, info};

#[derive(Clone)]
pub struct HttpState {
    publisher: Arc<dyn Publisher>,
}

#[derive(Debug, Deserialize)]
pub struct DelayedQuery {
    #[serde(rename = "delayTime")]
    pub delay_time: u64,
}

pub fn router(publisher: Arc<dyn Publisher>) -> Router {
    Router::new()
        .route("/api/message/send", post(send))
        .route("/api/message/send/delayed", post(send_delayed))
        .route("/health", get(health))
        .with_state(HttpState { publisher })
}

async fn send(
    State(state): State<HttpState>,
    body: String,
) -> Result<&'static str, (StatusCode, String)> {
    match state.publisher.send(body.as_str()).await {
        Ok(receipt) => {
            info!(message_id = %receipt.message_id, content = %body, "message sent to primary queue");
            Ok("message sent")
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to send message");
            Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
        }
    }
}

async fn send_delayed(
    State(state): State<HttpState>,
    Query(query): Query<DelayedQuery>,
    body: String,
) -> Result<&'static str, (StatusCode, String)> {
    let hint = Duration::from_millis(query.delay_time);

    match state.publisher.send_delayed(body.as_str(), hint).await {
        Ok(receipt) => {
            info!(
                message_id = %receipt.message_id,
                content = %body,
                delay_time_ms = query.delay_time,
                "message sent to delay queue"
            );
            Ok("delayed message sent")
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to send delayed message");
            Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
        }
    }
}

async fn health() -> &'static str {
    "ok"
}
