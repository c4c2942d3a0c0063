// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Bus
//!
//! [`RabbitMQBus`] puts the connection, every consumer and the producer behind one
//! object. Consumers are grouped by message type; several consumers of the same type
//! each receive their own copy of a message through their own queue.
//!
//! ```ignore
//! let mut bus = RabbitMQBus::builder(RabbitMQConfigs::load()?)
//!     .consumer(
//!         ConsumerConfiguration::<OrderCreated>::builder()
//!             .concurrency_limit(4)
//!             .handler(Arc::new(BillOrder))
//!             .build()?,
//!     )
//!     .producer(ProducerConfiguration::builder::<OrderCreated>().routing_key("orders"))
//!     .build()
//!     .await?;
//!
//! bus.start().await?;
//! bus.publish_message(&Context::current(), &OrderCreated { id: 1 }, None).await?;
//! ```

use crate::{
    broker::Dialer,
    channel::LapinDialer,
    configs::RabbitMQConfigs,
    connection::{Connection, ConnectionOptions},
    consumer::{BusConsumer, Consumer},
    consumer_configuration::{ConsumerConfiguration, ConsumerConfigurationBuilder},
    errors::AmqpError,
    message::{Headers, Message, MessageObserver},
    pipeline::ConsumerHandler,
    producer::Producer,
    producer_configuration::{ProducerConfiguration, ProducerConfigurationBuilder},
    serializer::{JsonMessageSerializer, MessageSerializer, MessageTypeRegistry},
};
use futures_util::future::join_all;
use opentelemetry::Context;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{error, info, warn};

type ConsumerFactory =
    Box<dyn FnOnce(Arc<Connection>, Arc<dyn MessageSerializer>) -> Arc<dyn BusConsumer> + Send>;

pub struct RabbitMQBus {
    connection: Arc<Connection>,
    serializer: Arc<JsonMessageSerializer>,
    producer: Producer,
    consumers: BTreeMap<String, Vec<Arc<dyn BusConsumer>>>,
    consumed: RwLock<Vec<MessageObserver>>,
}

impl RabbitMQBus {
    pub fn builder(configs: RabbitMQConfigs) -> RabbitMQBusBuilder {
        RabbitMQBusBuilder::new(configs)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    /// Consumers registered for `message_type`, in registration order.
    pub fn consumers(&self, message_type: &str) -> &[Arc<dyn BusConsumer>] {
        self.consumers
            .get(message_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn all_consumers(&self) -> impl Iterator<Item = &Arc<dyn BusConsumer>> {
        self.consumers.values().flatten()
    }

    /// Starts every consumer.
    ///
    /// A consumer failing with [`AmqpError::Disconnected`] is skipped: it starts on
    /// its own once the connection is recovered. Any other failure stops the
    /// consumers and is returned as [`AmqpError::StartAborted`]. A bus whose
    /// connection was closed by [`RabbitMQBus::stop`] cannot be started again.
    pub async fn start(&self) -> Result<(), AmqpError> {
        if self.connection.is_closed() {
            error!("cannot start the bus, its connection was closed");
            return Err(AmqpError::ConnectionError("connection closed".to_owned()));
        }

        for consumer in self.all_consumers() {
            match consumer.start().await {
                Ok(()) => {}
                Err(AmqpError::Disconnected) => {
                    warn!(
                        consumer = consumer.name(),
                        "connection is down, consumer will start after reconnect"
                    );
                }
                Err(err) => {
                    error!(
                        consumer = consumer.name(),
                        error = err.to_string(),
                        "failure to start consumer, stopping the bus"
                    );
                    let stop = self.stop_consumers().await.err().map(Box::new);
                    return Err(AmqpError::StartAborted {
                        source: Box::new(err),
                        stop,
                    });
                }
            }
        }

        info!(consumers = self.all_consumers().count(), "bus started");
        Ok(())
    }

    /// Stops every consumer concurrently, then closes the producer and the connection.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let mut outcome = self.stop_consumers().await;

        if let Err(err) = self.producer.close().await {
            error!(error = err.to_string(), "failure to close producer");
            outcome = outcome.and(Err(err));
        }

        if let Err(err) = self.connection.close().await {
            error!(error = err.to_string(), "failure to close connection");
            outcome = outcome.and(Err(err));
        }

        info!("bus stopped");
        outcome
    }

    async fn stop_consumers(&self) -> Result<(), AmqpError> {
        let results = join_all(self.all_consumers().map(|consumer| consumer.stop())).await;

        results.into_iter().fold(Ok(()), |outcome, result| {
            if let Err(err) = &result {
                error!(error = err.to_string(), "failure to stop consumer");
            }
            outcome.and(result)
        })
    }

    pub async fn publish_message<M: Message>(
        &self,
        ctx: &Context,
        message: &M,
        metadata: Option<Headers>,
    ) -> Result<(), AmqpError> {
        self.producer.publish_message(ctx, message, metadata).await
    }

    pub async fn publish_message_with_topic_name<M: Message>(
        &self,
        ctx: &Context,
        message: &M,
        metadata: Option<Headers>,
        topic: &str,
    ) -> Result<(), AmqpError> {
        self.producer
            .publish_message_with_topic_name(ctx, message, metadata, topic)
            .await
    }

    /// Attaches `handler` to every consumer of `M`; without one, a consumer with the
    /// default configuration of `M` is created for it.
    ///
    /// Running consumers pick the handler up on their next start. A consumer created
    /// here after the bus started must be started through [`RabbitMQBus::consumers`].
    pub fn connect_consumer_handler<M: Message>(
        &mut self,
        handler: Arc<dyn ConsumerHandler<M>>,
    ) -> Result<(), AmqpError> {
        let message_type = M::message_type();
        self.serializer.register::<M>();

        let mut attached = false;
        for consumer in self.consumers(&message_type) {
            if let Some(consumer) = consumer.as_any().downcast_ref::<Consumer<M>>() {
                consumer.connect_handler(handler.clone());
                attached = true;
            }
        }

        if attached {
            return Ok(());
        }

        let config = ConsumerConfigurationBuilder::<M>::new()
            .handler(handler)
            .build()?;
        let consumer = Consumer::new(config, self.connection.clone(), self.serializer.clone());
        self.connect_consumer(&message_type, Arc::new(consumer))
    }

    /// Adds a consumer for `message_type`; it is started by the next [`RabbitMQBus::start`].
    /// The consumer must consume that very type.
    pub fn connect_consumer(
        &mut self,
        message_type: &str,
        consumer: Arc<dyn BusConsumer>,
    ) -> Result<(), AmqpError> {
        if consumer.message_type() != message_type {
            return Err(AmqpError::ConfigurationError(format!(
                "consumer {} consumes {}, not {message_type}",
                consumer.name(),
                consumer.message_type()
            )));
        }

        for observer in self.consumed.read().iter() {
            consumer.is_consumed(observer.clone());
        }

        self.consumers
            .entry(message_type.to_owned())
            .or_default()
            .push(consumer);

        Ok(())
    }

    /// Observes every message acknowledged by any consumer, present or future.
    pub fn is_consumed(&self, observer: MessageObserver) {
        for consumer in self.all_consumers() {
            consumer.is_consumed(observer.clone());
        }
        self.consumed.write().push(observer);
    }

    pub fn is_produced(&self, observer: MessageObserver) {
        self.producer.is_produced(observer);
    }
}

/// Collects consumer and producer configurations, then connects and assembles the bus.
pub struct RabbitMQBusBuilder {
    configs: RabbitMQConfigs,
    dialer: Option<Arc<dyn Dialer>>,
    registry: MessageTypeRegistry,
    consumers: Vec<(String, ConsumerFactory)>,
    producers: Vec<ProducerConfiguration>,
}

impl RabbitMQBusBuilder {
    pub fn new(configs: RabbitMQConfigs) -> Self {
        Self {
            configs,
            dialer: None,
            registry: MessageTypeRegistry::new(),
            consumers: vec![],
            producers: vec![],
        }
    }

    /// Replaces the lapin transport.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Registers a consumer; calling it again for the same type adds another
    /// independent consumer of that type.
    pub fn consumer<M: Message>(mut self, config: ConsumerConfiguration<M>) -> Self {
        self.registry.register::<M>();
        let factory: ConsumerFactory = Box::new(
            move |connection: Arc<Connection>,
                  serializer: Arc<dyn MessageSerializer>|
                  -> Arc<dyn BusConsumer> {
                Arc::new(Consumer::new(config, connection, serializer))
            },
        );
        self.consumers.push((M::message_type(), factory));
        self
    }

    pub fn producer<M: Message>(mut self, config: ProducerConfigurationBuilder<M>) -> Self {
        self.registry.register::<M>();
        self.producers.push(config.build());
        self
    }

    /// Makes `M` publishable with its default producer configuration.
    pub fn message<M: Message>(mut self) -> Self {
        self.registry.register::<M>();
        self
    }

    /// Connects to the broker and assembles the bus; starts it when `auto_start` is set.
    pub async fn build(self) -> Result<RabbitMQBus, AmqpError> {
        let dialer: Arc<dyn Dialer> = match self.dialer {
            Some(dialer) => dialer,
            None => LapinDialer::new(&self.configs),
        };

        let connection =
            Connection::connect(dialer, ConnectionOptions::from(&self.configs)).await?;
        let serializer = JsonMessageSerializer::new(self.registry);
        let shared: Arc<dyn MessageSerializer> = serializer.clone();

        let mut producer = Producer::new(connection.clone(), shared.clone());
        for config in self.producers {
            producer.register(config);
        }

        let mut consumers: BTreeMap<String, Vec<Arc<dyn BusConsumer>>> = BTreeMap::new();
        for (message_type, factory) in self.consumers {
            let consumer = factory(connection.clone(), shared.clone());
            consumers.entry(message_type).or_default().push(consumer);
        }

        let bus = RabbitMQBus {
            connection,
            serializer,
            producer,
            consumers,
            consumed: RwLock::new(vec![]),
        };

        if self.configs.auto_start {
            bus.start().await?;
        }

        Ok(bus)
    }
}
