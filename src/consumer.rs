// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer State Machine
//!
//! Drives each delivery through `received -> {duplicate | processed | failed}`.
//!
//! Idempotent listeners (primary queue, expired deferred messages) claim the
//! message id in the ledger before running the handler, record completion
//! before acknowledging, and release the claim when processing fails so the
//! redelivery is not mistaken for a duplicate. The terminal dead-letter
//! listener skips the ledger and never retries.

use crate::{
    config::ConsumerConfigs,
    delivery::{DeliveryGuard, Disposition, Envelope, Origin},
    errors::{AmqpError, HandlerError},
    handler::{ConsumerHandler, ConsumerMessage},
    ledger::Ledger,
    otel,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

/// Listener semantics applied to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Primary queue: idempotent, requeue on failure.
    Primary,
    /// Dead-lettered after exhausting the primary path: terminal, no ledger.
    DeadLetter,
    /// Deferred message whose delay expired: idempotent, reject on failure.
    DelayOverflow,
}

impl ListenerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerKind::Primary => "primary",
            ListenerKind::DeadLetter => "dead-letter",
            ListenerKind::DelayOverflow => "delay-overflow",
        }
    }

    pub fn is_idempotent(&self) -> bool {
        !matches!(self, ListenerKind::DeadLetter)
    }

    /// Resolution applied when processing fails.
    pub fn failure_disposition(&self) -> Disposition {
        match self {
            ListenerKind::Primary => Disposition::Requeue,
            ListenerKind::DeadLetter => Disposition::Drop,
            ListenerKind::DelayOverflow => Disposition::Reject,
        }
    }

    /// Picks the semantics for a message arriving on the dead-letter queue.
    /// Both expired deferred messages and exhausted primary messages land
    /// there; only the former get the idempotent treatment.
    pub fn for_dead_letter(envelope: &Envelope) -> ListenerKind {
        match envelope.origin {
            Origin::Delayed => ListenerKind::DelayOverflow,
            _ => ListenerKind::DeadLetter,
        }
    }
}

/// Terminal state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Already completed within the retention window, acknowledged untouched.
    Duplicate,
    Processed,
    Failed,
}

/// Runs the per-delivery state machine against a shared ledger.
pub struct Consumer {
    ledger: Arc<dyn Ledger>,
    timeout: Duration,
    max_deliveries: Option<i64>,
}

impl Consumer {
    pub fn new(ledger: Arc<dyn Ledger>, cfg: &ConsumerConfigs) -> Self {
        Self {
            ledger,
            timeout: cfg.timeout,
            max_deliveries: cfg.max_deliveries,
        }
    }

    /// Processes one delivery and resolves its guard.
    ///
    /// Ledger failures never block a delivery: a failed claim is treated as
    /// "not a duplicate", failed writes are logged. Only a failure to resolve
    /// the delivery on the broker is returned as an error.
    pub async fn consume(
        &self,
        tracer: &BoxedTracer,
        queue: &str,
        kind: ListenerKind,
        handler: &dyn ConsumerHandler,
        envelope: &Envelope,
        mut guard: DeliveryGuard,
    ) -> Result<Outcome, AmqpError> {
        let (ctx, mut span) = otel::new_span(&envelope.properties, tracer, kind.as_str());
        let message_id = envelope.message_id.as_deref();

        debug!(
            queue,
            listener = kind.as_str(),
            message_id = message_id.unwrap_or_default(),
            routing_key = %envelope.routing_key,
            redelivered = envelope.redelivered,
            "received"
        );

        let mut claimed = false;
        if kind.is_idempotent() {
            match message_id {
                None => {
                    warn!(
                        queue,
                        listener = kind.as_str(),
                        "message without id, processing without idempotency guard"
                    );
                }
                Some(id) => match self.ledger.try_claim(id).await {
                    Ok(true) => {
                        info!(message_id = id, listener = kind.as_str(), "message already processed");
                        return match guard.resolve(Disposition::Ack).await {
                            Ok(()) => {
                                span.set_status(Status::Ok);
                                Ok(Outcome::Duplicate)
                            }
                            Err(e) => {
                                span.record_error(&e);
                                span.set_status(Status::Error {
                                    description: Cow::from("error to ack msg"),
                                });
                                Err(e)
                            }
                        };
                    }
                    Ok(false) => {
                        claimed = true;
                        guard.hold_claim(self.ledger.clone(), id);
                    }
                    Err(e) => {
                        warn!(
                            message_id = id,
                            error = e.to_string(),
                            "ledger unavailable, assuming message not processed"
                        );
                    }
                },
            }
        }

        let msg = ConsumerMessage::new(queue, message_id, envelope.origin, &envelope.data);
        let exec = AssertUnwindSafe(async { handler.exec(&ctx, &msg).await }).catch_unwind();
        let result = match tokio::time::timeout(self.timeout, exec).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HandlerError::Failed("handler panicked".to_owned())),
            Err(_) => Err(HandlerError::Timeout(self.timeout)),
        };

        match result {
            Ok(()) => {
                if kind.is_idempotent() {
                    if let Some(id) = message_id {
                        if let Err(e) = self.ledger.mark_complete(id).await {
                            warn!(
                                message_id = id,
                                error = e.to_string(),
                                "failed to mark message as processed"
                            );
                        }
                    }
                }

                debug!("message successfully processed");
                match guard.resolve(Disposition::Ack).await {
                    Ok(()) => {
                        span.set_status(Status::Ok);
                        Ok(Outcome::Processed)
                    }
                    Err(e) => {
                        span.record_error(&e);
                        span.set_status(Status::Error {
                            description: Cow::from("error to ack msg"),
                        });
                        Err(e)
                    }
                }
            }
            Err(handler_err) => {
                if claimed {
                    if let Some(id) = message_id {
                        if let Err(e) = self.ledger.release(id).await {
                            warn!(
                                message_id = id,
                                error = e.to_string(),
                                "failed to release ledger claim"
                            );
                        }
                    }
                }

                let disposition = self.failure_disposition(kind, envelope);
                error!(
                    queue,
                    listener = kind.as_str(),
                    message_id = message_id.unwrap_or_default(),
                    error = handler_err.to_string(),
                    disposition = %disposition,
                    "error whiling handling msg"
                );
                span.record_error(&handler_err);

                match guard.resolve(disposition).await {
                    Ok(()) => {
                        span.set_status(Status::Error {
                            description: Cow::from(handler_err.to_string()),
                        });
                        Ok(Outcome::Failed)
                    }
                    Err(e) => {
                        span.record_error(&e);
                        span.set_status(Status::Error {
                            description: Cow::from("error to resolve msg"),
                        });
                        Err(e)
                    }
                }
            }
        }
    }

    /// The listener's failure disposition, except that a primary message
    /// which reached the configured delivery bound is dropped so the broker
    /// dead-letters it instead of requeueing forever.
    pub fn failure_disposition(&self, kind: ListenerKind, envelope: &Envelope) -> Disposition {
        match (kind, self.max_deliveries, envelope.delivery_count) {
            (ListenerKind::Primary, Some(max), Some(count)) if count + 1 >= max => {
                warn!(count, max, "too many attempts, dead-lettering");
                Disposition::Drop
            }
            _ => kind.failure_disposition(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        delivery::{Settle, AMQP_HEADERS_DELIVERY_COUNT},
        errors::LedgerError,
        handler::MockConsumerHandler,
        ledger::MockLedger,
    };
    use async_trait::async_trait;
    use lapin::{
        types::{AMQPValue, FieldTable, ShortString},
        BasicProperties,
    };
    use opentelemetry::global;
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    };

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Disposition>>>);

    impl Recorder {
        fn resolved(&self) -> Vec<Disposition> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Settle for Recorder {
        async fn settle(&self, disposition: Disposition) -> Result<(), AmqpError> {
            self.0.lock().unwrap().push(disposition);
            Ok(())
        }
    }

    fn cfg() -> ConsumerConfigs {
        ConsumerConfigs {
            prefetch: 1,
            timeout: Duration::from_millis(200),
            max_deliveries: None,
            work: Duration::ZERO,
        }
    }

    fn envelope(id: Option<&str>) -> Envelope {
        let mut props = BasicProperties::default();
        if let Some(id) = id {
            props = props.with_message_id(ShortString::from(id));
        }
        Envelope::from_parts(props, b"\"order-42\"".to_vec(), false, "rk", "ttl_queue")
    }

    fn succeeding(times: usize) -> MockConsumerHandler {
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().times(times).returning(|_, _| Ok(()));
        handler
    }

    fn failing() -> MockConsumerHandler {
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(|_, _| Err(HandlerError::Failed("boom".to_owned())));
        handler
    }

    async fn run(
        consumer: &Consumer,
        kind: ListenerKind,
        handler: &dyn ConsumerHandler,
        envelope: &Envelope,
    ) -> (Outcome, Vec<Disposition>) {
        let recorder = Recorder::default();
        let guard = DeliveryGuard::new(recorder.clone(), kind.failure_disposition());
        let outcome = consumer
            .consume(&global::tracer("test"), "normal_queue", kind, handler, envelope, guard)
            .await
            .unwrap();
        (outcome, recorder.resolved())
    }

    #[tokio::test]
    async fn test_success_marks_complete_then_acks() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_try_claim()
            .withf(|id| id == "abc")
            .times(1)
            .returning(|_| Ok(false));
        ledger
            .expect_mark_complete()
            .withf(|id| id == "abc")
            .times(1)
            .returning(|_| Ok(()));
        ledger.expect_release().never();

        let consumer = Consumer::new(Arc::new(ledger), &cfg());
        let (outcome, resolved) =
            run(&consumer, ListenerKind::Primary, &succeeding(1), &envelope(Some("abc"))).await;

        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(resolved, vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_duplicate_is_acked_without_processing() {
        let mut ledger = MockLedger::new();
        ledger.expect_try_claim().times(1).returning(|_| Ok(true));
        ledger.expect_mark_complete().never();

        let consumer = Consumer::new(Arc::new(ledger), &cfg());
        let (outcome, resolved) =
            run(&consumer, ListenerKind::Primary, &succeeding(0), &envelope(Some("abc"))).await;

        assert_eq!(outcome, Outcome::Duplicate);
        assert_eq!(resolved, vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_primary_failure_releases_claim_and_requeues() {
        let mut ledger = MockLedger::new();
        ledger.expect_try_claim().times(1).returning(|_| Ok(false));
        ledger.expect_mark_complete().never();
        ledger
            .expect_release()
            .withf(|id| id == "abc")
            .times(1)
            .returning(|_| Ok(()));

        let consumer = Consumer::new(Arc::new(ledger), &cfg());
        let (outcome, resolved) =
            run(&consumer, ListenerKind::Primary, &failing(), &envelope(Some("abc"))).await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(resolved, vec![Disposition::Requeue]);
    }

    #[tokio::test]
    async fn test_handler_panic_releases_claim_and_requeues() {
        let mut ledger = MockLedger::new();
        ledger.expect_try_claim().times(1).returning(|_| Ok(false));
        ledger.expect_mark_complete().never();
        ledger
            .expect_release()
            .withf(|id| id == "abc")
            .times(1)
            .returning(|_| Ok(()));

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(|_, _| -> Result<(), HandlerError> { panic!("boom") });

        let consumer = Consumer::new(Arc::new(ledger), &cfg());
        let (outcome, resolved) =
            run(&consumer, ListenerKind::Primary, &handler, &envelope(Some("abc"))).await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(resolved, vec![Disposition::Requeue]);
    }

    #[tokio::test]
    async fn test_delay_overflow_failure_rejects() {
        let mut ledger = MockLedger::new();
        ledger.expect_try_claim().times(1).returning(|_| Ok(false));
        ledger.expect_release().times(1).returning(|_| Ok(()));

        let consumer = Consumer::new(Arc::new(ledger), &cfg());
        let (outcome, resolved) = run(
            &consumer,
            ListenerKind::DelayOverflow,
            &failing(),
            &envelope(Some("abc")),
        )
        .await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(resolved, vec![Disposition::Reject]);
    }

    #[tokio::test]
    async fn test_dead_letter_skips_ledger() {
        let mut ledger = MockLedger::new();
        ledger.expect_try_claim().never();
        ledger.expect_mark_complete().never();
        ledger.expect_release().never();
        let consumer = Consumer::new(Arc::new(ledger), &cfg());

        let (outcome, resolved) = run(
            &consumer,
            ListenerKind::DeadLetter,
            &succeeding(1),
            &envelope(Some("abc")),
        )
        .await;
        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(resolved, vec![Disposition::Ack]);

        let (outcome, resolved) = run(
            &consumer,
            ListenerKind::DeadLetter,
            &failing(),
            &envelope(Some("abc")),
        )
        .await;
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(resolved, vec![Disposition::Drop]);
    }

    #[tokio::test]
    async fn test_missing_id_processes_without_ledger() {
        let mut ledger = MockLedger::new();
        ledger.expect_try_claim().never();
        ledger.expect_mark_complete().never();

        let consumer = Consumer::new(Arc::new(ledger), &cfg());
        let (outcome, resolved) =
            run(&consumer, ListenerKind::Primary, &succeeding(1), &envelope(None)).await;

        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(resolved, vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_unavailable_ledger_fails_open() {
        let mut ledger = MockLedger::new();
        ledger.expect_try_claim().times(1).returning(|_| {
            Err(LedgerError::Unavailable(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        });
        ledger.expect_mark_complete().times(1).returning(|_| Ok(()));

        let consumer = Consumer::new(Arc::new(ledger), &cfg());
        let (outcome, resolved) =
            run(&consumer, ListenerKind::Primary, &succeeding(1), &envelope(Some("abc"))).await;

        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(resolved, vec![Disposition::Ack]);
    }

    #[tokio::test]
    async fn test_unavailable_ledger_does_not_release_on_failure() {
        let mut ledger = MockLedger::new();
        ledger.expect_try_claim().times(1).returning(|_| {
            Err(LedgerError::Unavailable(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        });
        ledger.expect_release().never();

        let consumer = Consumer::new(Arc::new(ledger), &cfg());
        let (outcome, resolved) =
            run(&consumer, ListenerKind::Primary, &failing(), &envelope(Some("abc"))).await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(resolved, vec![Disposition::Requeue]);
    }

    struct Stuck;

    #[async_trait]
    impl ConsumerHandler for Stuck {
        async fn exec(
            &self,
            _ctx: &opentelemetry::Context,
            _msg: &ConsumerMessage,
        ) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let mut ledger = MockLedger::new();
        ledger.expect_try_claim().times(1).returning(|_| Ok(false));
        ledger.expect_release().times(1).returning(|_| Ok(()));
        ledger.expect_mark_complete().never();

        let consumer = Consumer::new(Arc::new(ledger), &cfg());
        let (outcome, resolved) =
            run(&consumer, ListenerKind::Primary, &Stuck, &envelope(Some("abc"))).await;

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(resolved, vec![Disposition::Requeue]);
    }

    #[test]
    fn test_delivery_bound_drops_primary() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_DELIVERY_COUNT),
            AMQPValue::LongLongInt(4),
        );
        let props = BasicProperties::default().with_headers(FieldTable::from(headers));
        let env = Envelope::from_parts(props, vec![], true, "rk", "ttl_queue");

        let bounded = Consumer::new(
            Arc::new(MockLedger::new()),
            &ConsumerConfigs {
                max_deliveries: Some(5),
                ..cfg()
            },
        );
        let unbounded = Consumer::new(Arc::new(MockLedger::new()), &cfg());

        assert_eq!(
            bounded.failure_disposition(ListenerKind::Primary, &env),
            Disposition::Drop
        );
        assert_eq!(
            unbounded.failure_disposition(ListenerKind::Primary, &env),
            Disposition::Requeue
        );
        assert_eq!(
            bounded.failure_disposition(ListenerKind::DelayOverflow, &env),
            Disposition::Reject
        );
    }

    #[test]
    fn test_dead_letter_queue_routing_by_origin() {
        let mut env = envelope(Some("abc"));

        env.origin = Origin::Delayed;
        assert_eq!(ListenerKind::for_dead_letter(&env), ListenerKind::DelayOverflow);

        env.origin = Origin::Primary;
        assert_eq!(ListenerKind::for_dead_letter(&env), ListenerKind::DeadLetter);

        env.origin = Origin::Unknown;
        assert_eq!(ListenerKind::for_dead_letter(&env), ListenerKind::DeadLetter);
    }
}
