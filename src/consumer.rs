// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A [`Consumer`] owns one channel and one broker-level consumer for a single message
//! type. Starting it declares its topology, sets the channel prefetch and launches
//! exactly `concurrency_limit` workers sharing the delivery stream. Every delivery is
//! deserialized, wrapped in a [`MessageConsumeContext`] and pushed through the
//! pipelines into each handler in turn, with bounded retry. The outcome settles the
//! delivery: ack on success, nack with requeue once retries are exhausted, nack
//! without requeue (dead-lettering) when the payload cannot be decoded.
//!
//! A consumer heals itself: it listens for reconnect notifications from the
//! [`Connection`] and opens a fresh session after every successful redial, unless it
//! was stopped. A channel closed by the broker while the connection stays up is
//! reopened by the worker that sees its delivery stream end.

use crate::{
    broker::{AmqpChannel, ConsumeOptions, DeliveryStream, InboundDelivery},
    connection::Connection,
    consumer_configuration::ConsumerConfiguration,
    context::MessageConsumeContext,
    errors::AmqpError,
    message::{Message, MessageNotification, MessageObserver},
    otel,
    pipeline::{self, ConsumerHandler},
    serializer::MessageSerializer,
    topology::{AmqpTopology, Topology},
};
use async_trait::async_trait;
use futures_util::{future::join_all, StreamExt};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use parking_lot::{Mutex, RwLock};
use std::{
    any::Any,
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch, Semaphore,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Object-safe view of a consumer, used by the bus to manage consumers of any type.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    fn name(&self) -> &str;

    fn message_type(&self) -> &str;

    async fn start(&self) -> Result<(), AmqpError>;

    async fn stop(&self) -> Result<(), AmqpError>;

    /// Registers an observer notified after every acknowledged delivery.
    fn is_consumed(&self, observer: MessageObserver);

    fn as_any(&self) -> &dyn Any;
}

/// Consumer runtime for messages of type `M`. Clones share the same runtime.
pub struct Consumer<M: Message> {
    inner: Arc<ConsumerInner<M>>,
}

impl<M: Message> Clone for Consumer<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

type Handlers<M> = Arc<[Arc<dyn ConsumerHandler<M>>]>;

struct ConsumerInner<M: Message> {
    config: ConsumerConfiguration<M>,
    connection: Arc<Connection>,
    serializer: Arc<dyn MessageSerializer>,
    tracer: BoxedTracer,
    handlers: RwLock<Vec<Arc<dyn ConsumerHandler<M>>>>,
    observers: RwLock<Vec<MessageObserver>>,
    state: Mutex<ConsumerState>,
    halted: AtomicBool,
    session: tokio::sync::Mutex<Option<ConsumerSession>>,
    gate: Semaphore,
    reconnect_listener: Mutex<Option<JoinHandle<()>>>,
}

/// Broker resources of one start cycle.
struct ConsumerSession {
    channel: Arc<dyn AmqpChannel>,
    consumer_tag: String,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

enum Settlement {
    Ack,
    Requeue,
    Reject,
}

impl<M: Message> Consumer<M> {
    pub fn new(
        config: ConsumerConfiguration<M>,
        connection: Arc<Connection>,
        serializer: Arc<dyn MessageSerializer>,
    ) -> Self {
        let handlers = config.handlers().to_vec();
        let gate = Semaphore::new(config.concurrency_limit());

        Self {
            inner: Arc::new(ConsumerInner {
                config,
                connection,
                serializer,
                tracer: otel::tracer(),
                handlers: RwLock::new(handlers),
                observers: RwLock::new(vec![]),
                state: Mutex::new(ConsumerState::Created),
                halted: AtomicBool::new(false),
                session: tokio::sync::Mutex::new(None),
                gate,
                reconnect_listener: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.config.name()
    }

    pub fn message_type(&self) -> &str {
        self.inner.config.message_type()
    }

    pub fn configuration(&self) -> &ConsumerConfiguration<M> {
        &self.inner.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.lock()
    }

    /// Deliveries currently being handled.
    pub fn in_flight(&self) -> usize {
        self.inner.config.concurrency_limit() - self.inner.gate.available_permits()
    }

    /// Adds a handler. Running sessions keep their handler list; the handler is
    /// picked up by the next start, including restarts after a reconnect.
    pub fn connect_handler(&self, handler: Arc<dyn ConsumerHandler<M>>) {
        self.inner.handlers.write().push(handler);
    }

    pub fn is_consumed(&self, observer: MessageObserver) {
        self.inner.observers.write().push(observer);
    }

    /// Declares the topology and starts consuming. Starting a running consumer is a no-op.
    pub async fn start(&self) -> Result<(), AmqpError> {
        self.inner.start().await
    }

    /// Cancels consumption and returns once no delivery is in flight.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        self.inner.stop().await
    }
}

#[async_trait]
impl<M: Message> BusConsumer for Consumer<M> {
    fn name(&self) -> &str {
        Consumer::name(self)
    }

    fn message_type(&self) -> &str {
        Consumer::message_type(self)
    }

    async fn start(&self) -> Result<(), AmqpError> {
        Consumer::start(self).await
    }

    async fn stop(&self) -> Result<(), AmqpError> {
        Consumer::stop(self).await
    }

    fn is_consumed(&self, observer: MessageObserver) {
        Consumer::is_consumed(self, observer)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<M: Message> ConsumerInner<M> {
    fn name(&self) -> &str {
        self.config.name()
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock() = state;
    }

    async fn start(self: &Arc<Self>) -> Result<(), AmqpError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            debug!(consumer = self.name(), "consumer already running");
            return Ok(());
        }

        self.halted.store(false, Ordering::SeqCst);
        self.listen_reconnects();
        self.open_into(&mut session).await
    }

    /// Replaces the session after a redial; the previous channel died with the connection.
    async fn restart(self: &Arc<Self>) -> Result<(), AmqpError> {
        let mut session = self.session.lock().await;
        if self.halted.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.replace_session(&mut session).await
    }

    /// Reopens the session when the broker closed its channel but kept the connection.
    async fn recover(self: &Arc<Self>) -> Result<(), AmqpError> {
        let mut session = self.session.lock().await;
        if self.halted.load(Ordering::SeqCst) || !self.connection.is_connected() {
            return Ok(());
        }
        if session.as_ref().is_some_and(|s| s.channel.is_open()) {
            return Ok(());
        }

        warn!(consumer = self.name(), "consumer channel lost, reopening it");
        self.replace_session(&mut session).await
    }

    async fn replace_session(
        self: &Arc<Self>,
        session: &mut Option<ConsumerSession>,
    ) -> Result<(), AmqpError> {
        if let Some(stale) = session.take() {
            if let Err(err) = self.close_session(stale).await {
                debug!(
                    consumer = self.name(),
                    error = err.to_string(),
                    "stale session closed with errors"
                );
            }
        }

        self.open_into(session).await
    }

    async fn open_into(self: &Arc<Self>, slot: &mut Option<ConsumerSession>) -> Result<(), AmqpError> {
        self.set_state(ConsumerState::Starting);

        match self.open_session().await {
            Ok(session) => {
                *slot = Some(session);
                self.set_state(ConsumerState::Running);
                info!(
                    consumer = self.name(),
                    queue = self.config.queue().name(),
                    workers = self.config.concurrency_limit(),
                    "consumer started"
                );
                Ok(())
            }
            Err(err) => {
                self.set_state(ConsumerState::Stopped);
                error!(
                    consumer = self.name(),
                    error = err.to_string(),
                    "failure to start consumer"
                );
                Err(err)
            }
        }
    }

    fn listen_reconnects(self: &Arc<Self>) {
        let mut listener = self.reconnect_listener.lock();
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let reconnects = self.connection.subscribe_reconnects();
        *listener = Some(tokio::spawn(reconnect_loop(
            Arc::downgrade(self),
            reconnects,
        )));
    }

    async fn open_session(self: &Arc<Self>) -> Result<ConsumerSession, AmqpError> {
        let channel = self.connection.channel().await?;
        let consumer_tag = format!("{}-{}", self.name(), Uuid::new_v4());

        let deliveries = match self.declare_and_consume(&channel, &consumer_tag).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = close_err.to_string(), "failure to close channel");
                }
                return Err(err);
            }
        };

        // Workers share the stream, so it must keep yielding `None` once it has ended.
        let deliveries: DeliveryStream = deliveries.fuse().boxed();
        let deliveries = Arc::new(tokio::sync::Mutex::new(deliveries));
        let handlers: Handlers<M> = self.handlers.read().clone().into();
        let (shutdown, _) = watch::channel(false);

        let workers = (0..self.config.concurrency_limit())
            .map(|worker| {
                tokio::spawn(run_worker(
                    self.clone(),
                    worker,
                    deliveries.clone(),
                    channel.on_close(),
                    shutdown.subscribe(),
                    handlers.clone(),
                ))
            })
            .collect();

        Ok(ConsumerSession {
            channel,
            consumer_tag,
            shutdown,
            workers,
        })
    }

    async fn declare_and_consume(
        &self,
        channel: &Arc<dyn AmqpChannel>,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        channel.basic_qos(self.config.effective_prefetch()).await?;

        AmqpTopology::new(channel.clone())
            .exchange(self.config.exchange())
            .queue(self.config.queue())
            .queue_binding(self.config.binding())
            .install()
            .await?;

        channel
            .basic_consume(
                self.config.queue().name(),
                consumer_tag,
                ConsumeOptions {
                    no_local: self.config.no_local(),
                    no_ack: self.config.auto_ack(),
                    exclusive: self.config.exclusive(),
                    no_wait: self.config.no_wait(),
                },
            )
            .await
    }

    async fn stop(self: &Arc<Self>) -> Result<(), AmqpError> {
        self.halted.store(true, Ordering::SeqCst);

        // A restart in progress owns the session lock; the listener is aborted only
        // once it can no longer be holding a half-replaced session.
        let mut slot = self.session.lock().await;
        if let Some(listener) = self.reconnect_listener.lock().take() {
            listener.abort();
        }

        let result = match slot.take() {
            Some(session) => {
                self.set_state(ConsumerState::Stopping);
                self.close_session(session).await
            }
            None => {
                self.drain().await;
                Ok(())
            }
        };

        self.set_state(ConsumerState::Stopped);
        info!(consumer = self.name(), "consumer stopped");

        result
    }

    /// Waits until every in-flight delivery has been settled.
    async fn drain(&self) {
        let limit = self.config.concurrency_limit() as u32;
        if self.gate.acquire_many(limit).await.is_err() {
            warn!(consumer = self.name(), "in-flight gate closed while draining");
        }
    }

    async fn close_session(&self, session: ConsumerSession) -> Result<(), AmqpError> {
        let ConsumerSession {
            channel,
            consumer_tag,
            shutdown,
            workers,
        } = session;

        let _ = shutdown.send(true);
        let mut outcome = Ok(());

        if channel.is_open() {
            if let Err(err) = channel.basic_cancel(&consumer_tag).await {
                warn!(
                    consumer = self.name(),
                    error = err.to_string(),
                    "failure to cancel consumer"
                );
                outcome = Err(AmqpError::ConsumerCancelError(err.to_string()));
            }
        }

        for joined in join_all(workers).await {
            if let Err(err) = joined {
                error!(
                    consumer = self.name(),
                    error = err.to_string(),
                    "consumer worker aborted"
                );
            }
        }

        // Deliveries are settled on the channel they arrived on, so it closes only
        // after the gate is fully drained.
        self.drain().await;

        if channel.is_open() {
            if let Err(err) = channel.close().await {
                outcome = outcome.and(Err(AmqpError::ConsumerStopError(err.to_string())));
            }
        }

        outcome
    }

    async fn handle_received(
        self: &Arc<Self>,
        delivery: InboundDelivery,
        handlers: &[Arc<dyn ConsumerHandler<M>>],
        shutdown: &watch::Receiver<bool>,
    ) {
        let Ok(_permit) = self.gate.acquire().await else {
            return;
        };

        let message_type = delivery
            .properties
            .message_type
            .clone()
            .filter(|kind| !kind.is_empty())
            .unwrap_or_else(|| self.config.message_type().to_owned());

        let (ctx, mut span) =
            otel::new_span(&delivery.properties.headers, &self.tracer, &message_type);

        debug!(
            consumer = self.name(),
            message_type = %message_type,
            delivery_tag = delivery.delivery_tag,
            exchange = %delivery.exchange,
            "message received"
        );

        let message = match self.decode(&delivery, &message_type) {
            Ok(message) => message,
            Err(err) => {
                error!(
                    consumer = self.name(),
                    delivery_tag = delivery.delivery_tag,
                    error = err.to_string(),
                    "failure to decode message, rejecting it"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to decode message"),
                });
                let _ = self.settle(&delivery, Settlement::Reject).await;
                return;
            }
        };

        let context = MessageConsumeContext::from_delivery(message, &message_type, &delivery);

        match self.dispatch(&ctx, &context, handlers, shutdown).await {
            Ok(()) => match self.settle(&delivery, Settlement::Ack).await {
                Ok(()) => {
                    span.set_status(Status::Ok);
                    self.notify(&context);
                }
                Err(err) => {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("failure to ack message"),
                    });
                }
            },
            Err(err) => {
                error!(
                    consumer = self.name(),
                    delivery_tag = delivery.delivery_tag,
                    error = err.to_string(),
                    "failure to handle message, requeuing it"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to handle message"),
                });
                let _ = self.settle(&delivery, Settlement::Requeue).await;

                if self.config.exit_on_error() {
                    self.exit();
                }
            }
        }
    }

    fn decode(&self, delivery: &InboundDelivery, message_type: &str) -> Result<M, AmqpError> {
        let content_type = delivery
            .properties
            .content_type
            .as_deref()
            .unwrap_or_default();

        self.serializer
            .deserialize(&delivery.data, message_type, content_type)?
            .downcast::<M>()
            .map(|message| *message)
            .map_err(|_| {
                AmqpError::ConsumerTypeMismatch(self.name().to_owned(), message_type.to_owned())
            })
    }

    /// Runs every handler in order; the first failure short-circuits.
    async fn dispatch(
        &self,
        ctx: &Context,
        context: &MessageConsumeContext<M>,
        handlers: &[Arc<dyn ConsumerHandler<M>>],
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), AmqpError> {
        for handler in handlers {
            self.run_with_retry(ctx, handler.as_ref(), context, shutdown)
                .await?;
        }

        Ok(())
    }

    async fn run_with_retry(
        &self,
        ctx: &Context,
        handler: &dyn ConsumerHandler<M>,
        context: &MessageConsumeContext<M>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), AmqpError> {
        let retry = self.config.retry();
        let mut attempt = 1;

        loop {
            let err = match pipeline::execute(ctx, handler, self.config.pipelines(), context).await
            {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if attempt >= retry.attempts {
                return Err(err);
            }

            let mut shutdown = shutdown.clone();
            let stopping = *shutdown.borrow_and_update();
            if stopping {
                return Err(err);
            }

            let delay = retry.delay_after(attempt);
            warn!(
                consumer = self.name(),
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = err.to_string(),
                "handler failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Err(err),
            }

            attempt += 1;
        }
    }

    async fn settle(
        &self,
        delivery: &InboundDelivery,
        settlement: Settlement,
    ) -> Result<(), AmqpError> {
        if self.config.auto_ack() {
            return Ok(());
        }

        let tag = delivery.delivery_tag;
        let result = match settlement {
            Settlement::Ack => delivery.acker.ack(tag).await,
            Settlement::Requeue => delivery.acker.nack(tag, true).await,
            Settlement::Reject => delivery.acker.nack(tag, false).await,
        };

        if let Err(err) = &result {
            error!(
                consumer = self.name(),
                delivery_tag = tag,
                error = err.to_string(),
                "failure to settle delivery"
            );
        }

        result
    }

    fn notify(&self, context: &MessageConsumeContext<M>) {
        let observers = self.observers.read().clone();
        if observers.is_empty() {
            return;
        }

        let notification = MessageNotification::new(
            context.message().clone(),
            context.message_id(),
            context.correlation_id().map(str::to_owned),
            context.headers().clone(),
        );

        for observer in observers {
            observer(&notification);
        }
    }

    fn exit(self: &Arc<Self>) {
        warn!(
            consumer = self.name(),
            "delivery exhausted its retries, stopping consumer"
        );

        let consumer = self.clone();
        tokio::spawn(async move {
            if let Err(err) = consumer.stop().await {
                error!(
                    consumer = consumer.name(),
                    error = err.to_string(),
                    "failure to stop consumer"
                );
            }
        });
    }
}

async fn reconnect_loop<M: Message>(
    consumer: Weak<ConsumerInner<M>>,
    mut reconnects: broadcast::Receiver<()>,
) {
    loop {
        match reconnects.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => {
                let Some(consumer) = consumer.upgrade() else {
                    return;
                };
                if consumer.halted.load(Ordering::SeqCst) {
                    return;
                }

                info!(consumer = consumer.name(), "restarting consumer after reconnect");
                if let Err(err) = consumer.restart().await {
                    error!(
                        consumer = consumer.name(),
                        error = err.to_string(),
                        "failure to restart consumer"
                    );
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn run_worker<M: Message>(
    consumer: Arc<ConsumerInner<M>>,
    worker: usize,
    deliveries: Arc<tokio::sync::Mutex<DeliveryStream>>,
    mut closed: broadcast::Receiver<AmqpError>,
    mut shutdown: watch::Receiver<bool>,
    handlers: Handlers<M>,
) {
    let mut watch_closed = true;

    loop {
        let stopping = *shutdown.borrow();
        if stopping {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            notice = closed.recv(), if watch_closed => match notice {
                Ok(cause) => warn!(
                    consumer = consumer.name(),
                    worker,
                    error = cause.to_string(),
                    "consumer channel closed"
                ),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => watch_closed = false,
            },
            next = next_delivery(&deliveries) => match next {
                Some(Ok(delivery)) => {
                    consumer.handle_received(delivery, &handlers, &shutdown).await
                }
                Some(Err(err)) => error!(
                    consumer = consumer.name(),
                    worker,
                    error = err.to_string(),
                    "failure to receive delivery"
                ),
                None => {
                    debug!(consumer = consumer.name(), worker, "delivery stream ended");
                    let stopping = *shutdown.borrow();
                    if !stopping {
                        spawn_recovery(consumer.clone());
                    }
                    break;
                }
            },
        }
    }
}

fn spawn_recovery<M: Message>(consumer: Arc<ConsumerInner<M>>) {
    tokio::spawn(async move {
        if let Err(err) = consumer.recover().await {
            error!(
                consumer = consumer.name(),
                error = err.to_string(),
                "failure to reopen consumer channel"
            );
        }
    });
}

async fn next_delivery(
    deliveries: &tokio::sync::Mutex<DeliveryStream>,
) -> Option<Result<InboundDelivery, AmqpError>> {
    deliveries.lock().await.next().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MessageProperties,
        connection::ConnectionOptions,
        consumer_configuration::{ConsumerConfigurationBuilder, RetryPolicy},
        queue::QueueDefinition,
        serializer::{JsonMessageSerializer, MessageTypeRegistry, JSON_CONTENT_TYPE},
        testing::InMemoryBroker,
    };
    use serde::{Deserialize, Serialize};
    use std::{
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        id: u32,
    }
    impl Message for OrderCreated {}

    const QUEUE: &str = "order_created_queue";

    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        failures: AtomicUsize,
        delay: Duration,
    }

    impl Recorder {
        fn new(delay: Duration, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                delay,
                failures: AtomicUsize::new(failures),
                ..Self::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConsumerHandler<OrderCreated> for Recorder {
        async fn handle(
            &self,
            _ctx: &Context,
            _message: &MessageConsumeContext<OrderCreated>,
        ) -> Result<(), AmqpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(AmqpError::handler("boom"));
            }
            Ok(())
        }
    }

    async fn harness() -> (InMemoryBroker, Arc<Connection>, Arc<dyn MessageSerializer>) {
        let broker = InMemoryBroker::new();
        let connection = Connection::connect(
            broker.dialer(),
            ConnectionOptions {
                reconnect: true,
                reconnect_delay: Duration::from_millis(5),
                max_reconnect_delay: Duration::from_millis(20),
            },
        )
        .await
        .unwrap();

        let mut registry = MessageTypeRegistry::new();
        registry.register::<OrderCreated>();

        (broker, connection, JsonMessageSerializer::new(registry))
    }

    fn builder() -> ConsumerConfigurationBuilder<OrderCreated> {
        ConsumerConfigurationBuilder::new().retry(RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
        ))
    }

    fn properties(id: u32) -> MessageProperties {
        MessageProperties {
            message_type: Some("order_created".to_owned()),
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            message_id: Some(format!("m-{id}")),
            ..MessageProperties::default()
        }
    }

    fn publish(broker: &InMemoryBroker, id: u32) {
        let payload = serde_json::to_vec(&OrderCreated { id }).unwrap();
        broker.publish("order_created", "order_created", &payload, properties(id));
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition was not reached in time");
    }

    #[tokio::test]
    async fn workers_never_exceed_the_concurrency_limit() {
        let (broker, connection, serializer) = harness().await;
        let handler = Recorder::new(Duration::from_millis(20), 0);
        let consumer = Consumer::new(
            builder()
                .concurrency_limit(2)
                .prefetch_count(4)
                .handler(handler.clone())
                .build()
                .unwrap(),
            connection,
            serializer,
        );

        consumer.start().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Running);
        assert_eq!(broker.qos(), vec![8]);

        for id in 0..10 {
            publish(&broker, id);
        }

        eventually(|| broker.acked().len() == 10).await;
        assert_eq!(handler.calls(), 10);
        assert!(handler.peak() <= 2);
        assert!(broker.nacked().is_empty());

        consumer.stop().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(consumer.in_flight(), 0);
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn failing_handler_is_retried_until_it_succeeds() {
        let (broker, connection, serializer) = harness().await;
        let handler = Recorder::new(Duration::ZERO, 2);
        let consumer = Consumer::new(
            builder().handler(handler.clone()).build().unwrap(),
            connection,
            serializer,
        );

        consumer.start().await.unwrap();
        publish(&broker, 1);

        eventually(|| broker.acked().len() == 1).await;
        assert_eq!(handler.calls(), 3);
        assert!(broker.nacked().is_empty());

        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_requeue_and_skip_later_handlers() {
        let (broker, connection, serializer) = harness().await;
        let failing = Recorder::new(Duration::ZERO, usize::MAX);
        let never_reached = Recorder::new(Duration::ZERO, 0);
        let consumer = Consumer::new(
            builder()
                .retry(RetryPolicy::none())
                .handler(failing.clone())
                .handler(never_reached.clone())
                .exit_on_error()
                .build()
                .unwrap(),
            connection,
            serializer,
        );

        consumer.start().await.unwrap();
        publish(&broker, 1);

        eventually(|| consumer.state() == ConsumerState::Stopped).await;

        let nacked = broker.nacked();
        assert!(!nacked.is_empty());
        assert!(nacked.iter().all(|(_, requeue)| *requeue));
        assert!(broker.acked().is_empty());
        assert_eq!(never_reached.calls(), 0);
        assert_eq!(broker.consumer_count(QUEUE), 0);
        assert_eq!(broker.queue_depth(QUEUE), 1);
    }

    #[tokio::test]
    async fn undecodable_delivery_is_dead_lettered() {
        let (broker, connection, serializer) = harness().await;
        let handler = Recorder::new(Duration::ZERO, 0);
        let consumer = Consumer::new(
            builder()
                .queue(QueueDefinition::new(QUEUE).with_dlq())
                .handler(handler.clone())
                .build()
                .unwrap(),
            connection,
            serializer,
        );

        consumer.start().await.unwrap();
        broker.publish("order_created", "order_created", b"not json", properties(1));

        eventually(|| broker.nacked().len() == 1).await;
        assert!(!broker.nacked()[0].1);
        assert_eq!(broker.queue_depth("order_created_queue-dlq"), 1);
        assert_eq!(handler.calls(), 0);

        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn every_delivery_is_settled_exactly_once() {
        let (broker, connection, serializer) = harness().await;
        let handler = Recorder::new(Duration::from_millis(2), 3);
        let consumer = Consumer::new(
            builder()
                .concurrency_limit(3)
                .retry(RetryPolicy::none())
                .handler(handler.clone())
                .build()
                .unwrap(),
            connection,
            serializer,
        );

        consumer.start().await.unwrap();
        for id in 0..6 {
            publish(&broker, id);
        }

        eventually(|| broker.acked().len() == 6).await;
        consumer.stop().await.unwrap();

        let mut tags = broker.acked();
        tags.extend(broker.nacked().iter().map(|(tag, _)| *tag));
        let settled = tags.len();
        tags.sort_unstable();
        tags.dedup();

        assert_eq!(settled, tags.len());
        assert_eq!(broker.nacked().len(), 3);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_deliveries() {
        let (broker, connection, serializer) = harness().await;
        let handler = Recorder::new(Duration::from_millis(100), 0);
        let consumer = Consumer::new(
            builder().handler(handler.clone()).build().unwrap(),
            connection,
            serializer,
        );

        consumer.start().await.unwrap();
        publish(&broker, 1);
        eventually(|| handler.calls() == 1).await;
        assert_eq!(consumer.in_flight(), 1);

        consumer.stop().await.unwrap();

        assert_eq!(consumer.in_flight(), 0);
        assert_eq!(broker.acked().len(), 1);
        assert_eq!(broker.consumer_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn consumer_resumes_after_the_connection_is_recovered() {
        let (broker, connection, serializer) = harness().await;
        let handler = Recorder::new(Duration::ZERO, 0);
        let consumer = Consumer::new(
            builder().handler(handler.clone()).build().unwrap(),
            connection,
            serializer,
        );

        consumer.start().await.unwrap();
        publish(&broker, 1);
        eventually(|| broker.acked().len() == 1).await;

        broker.drop_connections();
        eventually(|| broker.dial_count() == 2 && broker.consumer_count(QUEUE) == 1).await;
        assert_eq!(consumer.state(), ConsumerState::Running);

        publish(&broker, 2);
        eventually(|| broker.acked().len() == 2).await;
        assert_eq!(handler.calls(), 2);

        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stopped_consumer_is_not_restarted_by_a_reconnect() {
        let (broker, connection, serializer) = harness().await;
        let consumer = Consumer::new(builder().build().unwrap(), connection.clone(), serializer);
        let mut reconnects = connection.subscribe_reconnects();

        consumer.start().await.unwrap();
        consumer.stop().await.unwrap();

        broker.drop_connections();
        reconnects.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(broker.consumer_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn second_start_is_ignored() {
        let (broker, connection, serializer) = harness().await;
        let consumer = Consumer::new(builder().build().unwrap(), connection, serializer);

        consumer.start().await.unwrap();
        consumer.start().await.unwrap();

        assert_eq!(broker.consumer_count(QUEUE), 1);
        assert_eq!(broker.qos().len(), 1);

        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_reports_a_dropped_connection() {
        let (_broker, connection, serializer) = harness().await;
        let consumer = Consumer::new(builder().build().unwrap(), connection.clone(), serializer);

        connection.close().await.unwrap();

        assert_eq!(consumer.start().await, Err(AmqpError::Disconnected));
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn observers_see_acknowledged_messages() {
        let (broker, connection, serializer) = harness().await;
        let consumer = Consumer::new(builder().build().unwrap(), connection, serializer);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        consumer.is_consumed(Arc::new(move |notification: &MessageNotification| {
            let id = notification.message::<OrderCreated>().map(|m| m.id);
            sink.lock().push((notification.message_id.clone(), id));
        }));

        consumer.start().await.unwrap();
        publish(&broker, 7);
        eventually(|| !seen.lock().is_empty()).await;

        assert_eq!(*seen.lock(), vec![("m-7".to_owned(), Some(7))]);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_during_a_reconnect_restart_still_drains() {
        let (broker, connection, serializer) = harness().await;
        let handler = Recorder::new(Duration::from_millis(300), 0);
        let consumer = Consumer::new(
            builder().handler(handler.clone()).build().unwrap(),
            connection.clone(),
            serializer,
        );
        let mut reconnects = connection.subscribe_reconnects();

        consumer.start().await.unwrap();
        publish(&broker, 1);
        eventually(|| handler.calls() == 1).await;

        broker.drop_connections();
        reconnects.recv().await.unwrap();
        consumer.stop().await.unwrap();

        assert_eq!(consumer.in_flight(), 0);
        assert_eq!(handler.running.load(Ordering::SeqCst), 0);
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(broker.consumer_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn stop_without_a_session_returns_stopped() {
        let (_broker, connection, serializer) = harness().await;
        let consumer = Consumer::new(builder().build().unwrap(), connection, serializer);

        consumer.stop().await.unwrap();

        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(consumer.in_flight(), 0);
    }

    #[tokio::test]
    async fn closed_channel_is_reopened_on_a_live_connection() {
        let (broker, connection, serializer) = harness().await;
        let handler = Recorder::new(Duration::ZERO, 0);
        let consumer = Consumer::new(
            builder()
                .concurrency_limit(2)
                .handler(handler.clone())
                .build()
                .unwrap(),
            connection.clone(),
            serializer,
        );

        consumer.start().await.unwrap();
        publish(&broker, 1);
        eventually(|| broker.acked().len() == 1).await;

        broker.close_consumer_channels(QUEUE);
        eventually(|| broker.qos().len() == 2 && broker.consumer_count(QUEUE) == 1).await;

        assert!(connection.is_connected());
        assert_eq!(broker.dial_count(), 1);
        assert_eq!(consumer.state(), ConsumerState::Running);

        publish(&broker, 2);
        eventually(|| broker.acked().len() == 2).await;
        assert_eq!(handler.calls(), 2);

        consumer.stop().await.unwrap();
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn auto_ack_leaves_settlement_to_the_broker() {
        let (broker, connection, serializer) = harness().await;
        let handler = Recorder::new(Duration::ZERO, 1);
        let consumer = Consumer::new(
            builder()
                .auto_ack()
                .retry(RetryPolicy::none())
                .handler(handler.clone())
                .build()
                .unwrap(),
            connection,
            serializer,
        );

        consumer.start().await.unwrap();
        publish(&broker, 1);
        publish(&broker, 2);
        eventually(|| handler.calls() == 2).await;
        consumer.stop().await.unwrap();

        assert!(broker.acked().is_empty());
        assert!(broker.nacked().is_empty());
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth(QUEUE), 0);
    }

    struct SeenTypes(Mutex<Vec<String>>);

    #[async_trait]
    impl ConsumerHandler<OrderCreated> for SeenTypes {
        async fn handle(
            &self,
            _ctx: &Context,
            message: &MessageConsumeContext<OrderCreated>,
        ) -> Result<(), AmqpError> {
            self.0.lock().push(message.message_type().to_owned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn untyped_delivery_reports_the_configured_type() {
        let (broker, connection, serializer) = harness().await;
        let seen = Arc::new(SeenTypes(Mutex::new(vec![])));
        let consumer = Consumer::new(
            builder().handler(seen.clone()).build().unwrap(),
            connection,
            serializer,
        );

        consumer.start().await.unwrap();
        let payload = serde_json::to_vec(&OrderCreated { id: 3 }).unwrap();
        let props = MessageProperties {
            message_type: None,
            ..properties(3)
        };
        broker.publish("order_created", "order_created", &payload, props);

        eventually(|| broker.acked().len() == 1).await;
        assert_eq!(*seen.0.lock(), vec!["order_created".to_owned()]);

        consumer.stop().await.unwrap();
    }
}
