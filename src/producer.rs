// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! Publishes serialized messages on a dedicated channel. Destination and publish
//! properties come from the [`ProducerConfiguration`] registered for the message
//! type, or from the type-derived defaults. The target exchange is declared once per
//! channel, and the channel is reopened when the connection was recovered.
//! The current OpenTelemetry context is propagated through the message headers.

use crate::{
    broker::{AmqpChannel, MessageProperties},
    connection::Connection,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Headers, Message, MessageNotification, MessageObserver},
    otel,
    producer_configuration::ProducerConfiguration,
    serializer::MessageSerializer,
};
use chrono::Utc;
use opentelemetry::Context;
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, error};
use uuid::Uuid;

struct ProducerChannel {
    channel: Arc<dyn AmqpChannel>,
    declared: HashSet<String>,
}

pub struct Producer {
    connection: Arc<Connection>,
    serializer: Arc<dyn MessageSerializer>,
    configurations: HashMap<String, ProducerConfiguration>,
    channel: tokio::sync::Mutex<Option<ProducerChannel>>,
    observers: RwLock<Vec<MessageObserver>>,
}

impl Producer {
    pub fn new(connection: Arc<Connection>, serializer: Arc<dyn MessageSerializer>) -> Self {
        Self {
            connection,
            serializer,
            configurations: HashMap::new(),
            channel: tokio::sync::Mutex::new(None),
            observers: RwLock::new(vec![]),
        }
    }

    /// Registers the publish configuration of one message type, replacing any previous one.
    pub fn register(&mut self, config: ProducerConfiguration) {
        self.configurations
            .insert(config.message_type().to_owned(), config);
    }

    pub fn configuration(&self, message_type: &str) -> Option<&ProducerConfiguration> {
        self.configurations.get(message_type)
    }

    pub fn is_produced(&self, observer: MessageObserver) {
        self.observers.write().push(observer);
    }

    /// Publishes `message` to the exchange configured for its type.
    pub async fn publish_message<M: Message>(
        &self,
        ctx: &Context,
        message: &M,
        metadata: Option<Headers>,
    ) -> Result<(), AmqpError> {
        self.publish(ctx, message, metadata, None).await
    }

    /// Publishes `message` to the exchange `topic`; every other setting is kept.
    pub async fn publish_message_with_topic_name<M: Message>(
        &self,
        ctx: &Context,
        message: &M,
        metadata: Option<Headers>,
        topic: &str,
    ) -> Result<(), AmqpError> {
        self.publish(ctx, message, metadata, Some(topic)).await
    }

    /// Closes the producer channel; a later publish opens a new one.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let current = self.channel.lock().await.take();

        match current {
            Some(current) if current.channel.is_open() => current.channel.close().await,
            _ => Ok(()),
        }
    }

    async fn publish<M: Message>(
        &self,
        ctx: &Context,
        message: &M,
        metadata: Option<Headers>,
        topic: Option<&str>,
    ) -> Result<(), AmqpError> {
        let message_type = M::message_type();
        let config = self
            .configurations
            .get(&message_type)
            .cloned()
            .unwrap_or_else(|| ProducerConfiguration::for_type(&message_type));

        let exchange = match topic {
            Some(topic) => config.exchange().clone().rename(topic),
            None => config.exchange().clone(),
        };

        let serialized = self.serializer.serialize(&message_type, message)?;

        let mut headers = config.headers().clone();
        otel::inject(ctx, &mut headers);
        if let Some(metadata) = metadata {
            headers.extend(metadata);
        }

        let message_id = Uuid::new_v4().to_string();
        let properties = MessageProperties {
            content_type: Some(serialized.content_type),
            content_encoding: config.content_encoding().map(str::to_owned),
            message_type: Some(message_type.clone()),
            message_id: Some(message_id.clone()),
            correlation_id: None,
            timestamp: u64::try_from(Utc::now().timestamp()).ok(),
            delivery_mode: Some(config.delivery_mode()),
            priority: config.priority(),
            app_id: config.app_id().map(str::to_owned),
            expiration: config.expiration().map(str::to_owned),
            reply_to: config.reply_to().map(str::to_owned),
            headers,
        };

        let channel = self.channel_for(&exchange).await?;

        debug!(
            message_type = %message_type,
            exchange = exchange.name(),
            routing_key = config.routing_key(),
            "publishing message"
        );

        if let Err(err) = channel
            .basic_publish(
                exchange.name(),
                config.routing_key(),
                &serialized.payload,
                &properties,
            )
            .await
        {
            error!(error = err.to_string(), "error publishing message");
            return Err(err);
        }

        self.notify(message, &message_id, properties.headers);
        Ok(())
    }

    /// The live producer channel, with `exchange` declared on it.
    async fn channel_for(
        &self,
        exchange: &ExchangeDefinition,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut slot = self.channel.lock().await;

        let current = match slot.take() {
            Some(current) if current.channel.is_open() => current,
            _ => ProducerChannel {
                channel: self.connection.channel().await?,
                declared: HashSet::new(),
            },
        };
        let current = slot.insert(current);

        if !exchange.name().is_empty() && !current.declared.contains(exchange.name()) {
            current.channel.exchange_declare(exchange).await?;
            current.declared.insert(exchange.name().to_owned());
        }

        Ok(current.channel.clone())
    }

    fn notify<M: Message>(&self, message: &M, message_id: &str, headers: Headers) {
        let observers = self.observers.read().clone();
        if observers.is_empty() {
            return;
        }

        let notification = MessageNotification::new(message.clone(), message_id, None, headers);
        for observer in observers {
            observer(&notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{
            AmqpConnection, DeliveryMode, Dialer, MockAmqpChannel, MockAmqpConnection, MockDialer,
        },
        connection::ConnectionOptions,
        message::HeaderValue,
        serializer::{JsonMessageSerializer, MessageTypeRegistry, JSON_CONTENT_TYPE},
        testing::InMemoryBroker,
    };
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderShipped {
        id: u32,
    }
    impl Message for OrderShipped {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Unregistered;
    impl Message for Unregistered {}

    fn serializer() -> Arc<dyn MessageSerializer> {
        let mut registry = MessageTypeRegistry::new();
        registry.register::<OrderShipped>();
        JsonMessageSerializer::new(registry)
    }

    async fn producer(broker: &InMemoryBroker) -> (Producer, Arc<Connection>) {
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

        (Producer::new(connection.clone(), serializer()), connection)
    }

    #[tokio::test]
    async fn publishes_with_derived_topology_and_stamped_properties() {
        let broker = InMemoryBroker::new();
        let (producer, _connection) = producer(&broker).await;

        producer
            .publish_message(&Context::new(), &OrderShipped { id: 1 }, None)
            .await
            .unwrap();
        producer
            .publish_message(&Context::new(), &OrderShipped { id: 2 }, None)
            .await
            .unwrap();

        assert!(broker.exchange("order_shipped").is_some());
        assert_eq!(broker.open_channels(), 1);

        let published = broker.published();
        assert_eq!(published.len(), 2);

        let first = &published[0];
        assert_eq!(first.exchange, "order_shipped");
        assert_eq!(first.routing_key, "order_shipped");
        assert_eq!(first.data, br#"{"id":1}"#.to_vec());
        assert_eq!(first.properties.message_type.as_deref(), Some("order_shipped"));
        assert_eq!(first.properties.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(first.properties.delivery_mode, Some(DeliveryMode::Persistent));
        assert!(first.properties.timestamp.is_some());
        assert_ne!(first.properties.message_id, published[1].properties.message_id);
    }

    #[tokio::test]
    async fn registered_configuration_and_metadata_shape_the_message() {
        let broker = InMemoryBroker::new();
        let (mut producer, _connection) = producer(&broker).await;
        producer.register(
            ProducerConfiguration::builder::<OrderShipped>()
                .exchange(ExchangeDefinition::new("logistics").direct())
                .routing_key("shipped")
                .priority(5)
                .header("source", HeaderValue::from("warehouse"))
                .header("tenant", HeaderValue::from("default"))
                .build(),
        );

        let mut metadata = Headers::new();
        metadata.insert("tenant".to_owned(), HeaderValue::from("acme"));

        producer
            .publish_message(&Context::new(), &OrderShipped { id: 3 }, Some(metadata))
            .await
            .unwrap();

        let published = broker.published();
        let message = &published[0];
        assert_eq!(message.exchange, "logistics");
        assert_eq!(message.routing_key, "shipped");
        assert_eq!(message.properties.priority, Some(5));
        assert_eq!(
            message.properties.headers.get("source").and_then(|v| v.as_str()),
            Some("warehouse")
        );
        assert_eq!(
            message.properties.headers.get("tenant").and_then(|v| v.as_str()),
            Some("acme")
        );
    }

    #[tokio::test]
    async fn topic_name_overrides_only_the_exchange() {
        let broker = InMemoryBroker::new();
        let (mut producer, _connection) = producer(&broker).await;
        producer.register(
            ProducerConfiguration::builder::<OrderShipped>()
                .routing_key("shipped")
                .build(),
        );

        producer
            .publish_message_with_topic_name(
                &Context::new(),
                &OrderShipped { id: 4 },
                None,
                "shipping_audit",
            )
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published[0].exchange, "shipping_audit");
        assert_eq!(published[0].routing_key, "shipped");
        assert!(broker.exchange("shipping_audit").is_some());
        assert!(broker.exchange("order_shipped").is_none());
    }

    #[tokio::test]
    async fn channel_is_reopened_after_a_reconnect() {
        let broker = InMemoryBroker::new();
        let (producer, connection) = producer(&broker).await;
        let mut reconnects = connection.subscribe_reconnects();

        producer
            .publish_message(&Context::new(), &OrderShipped { id: 5 }, None)
            .await
            .unwrap();

        broker.drop_connections();
        tokio::time::timeout(Duration::from_secs(2), reconnects.recv())
            .await
            .unwrap()
            .unwrap();

        producer
            .publish_message(&Context::new(), &OrderShipped { id: 6 }, None)
            .await
            .unwrap();

        assert_eq!(broker.published().len(), 2);
        assert_eq!(broker.open_channels(), 1);
    }

    #[tokio::test]
    async fn unregistered_type_is_not_published() {
        let broker = InMemoryBroker::new();
        let (producer, _connection) = producer(&broker).await;

        let result = producer
            .publish_message(&Context::new(), &Unregistered, None)
            .await;

        assert_eq!(
            result,
            Err(AmqpError::UnknownMessageType("unregistered".to_owned()))
        );
        assert!(broker.published().is_empty());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn observers_are_notified_after_publishing() {
        let broker = InMemoryBroker::new();
        let (producer, _connection) = producer(&broker).await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        producer.is_produced(Arc::new(move |notification: &MessageNotification| {
            sink.lock().push(notification.message::<OrderShipped>().cloned());
        }));

        producer
            .publish_message(&Context::new(), &OrderShipped { id: 8 }, None)
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![Some(OrderShipped { id: 8 })]);
    }

    #[tokio::test]
    async fn broker_publish_failure_is_returned() {
        let mut dialer = MockDialer::new();
        dialer.expect_dial().times(1).returning(|| {
            let mut conn = MockAmqpConnection::new();
            conn.expect_on_close().returning(|| oneshot::channel().1);
            conn.expect_create_channel().times(1).returning(|| {
                let mut channel = MockAmqpChannel::new();
                channel.expect_is_open().return_const(true);
                channel.expect_exchange_declare().times(1).returning(|_| Ok(()));
                channel
                    .expect_basic_publish()
                    .returning(|_, _, _, _| Err(AmqpError::PublishingError("nack".to_owned())));
                Ok(Arc::new(channel) as Arc<dyn AmqpChannel>)
            });
            Ok(Arc::new(conn) as Arc<dyn AmqpConnection>)
        });

        let dialer: Arc<dyn Dialer> = Arc::new(dialer);
        let connection = Connection::connect(dialer, ConnectionOptions::default())
            .await
            .unwrap();
        let producer = Producer::new(connection, serializer());
        let notified = Arc::new(Mutex::new(0));
        let counter = notified.clone();
        producer.is_produced(Arc::new(move |_: &MessageNotification| {
            *counter.lock() += 1;
        }));

        let first = producer
            .publish_message(&Context::new(), &OrderShipped { id: 9 }, None)
            .await;
        let second = producer
            .publish_message(&Context::new(), &OrderShipped { id: 10 }, None)
            .await;

        assert_eq!(first, Err(AmqpError::PublishingError("nack".to_owned())));
        assert_eq!(second, Err(AmqpError::PublishingError("nack".to_owned())));
        assert_eq!(*notified.lock(), 0);
    }
}
