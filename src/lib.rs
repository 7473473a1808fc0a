// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod http;
pub mod ledger;
pub mod publisher;
pub mod queue;
pub mod topology;
