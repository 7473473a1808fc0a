// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Carries the OpenTelemetry context through AMQP message headers so a
//! delivery's consumer span joins the trace of the request that published it.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Header map adapter implementing the OpenTelemetry `Injector` and `Extractor` traits.
pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the propagation fields of `ctx` into outgoing headers.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderCarrier::new(headers))
    });
}

/// Starts a consumer span for a delivery, parented on the context found in
/// its headers.
pub(crate) fn new_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderCarrier::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
