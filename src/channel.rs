// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module implements the broker traits on top of lapin. It establishes
//! connections to the RabbitMQ server, opens channels and translates the crate's
//! topology, property and header types to their lapin counterparts.

use crate::{
    broker::{
        AmqpChannel, AmqpConnection, ConsumeOptions, DeliveryAcker, DeliveryMode, DeliveryStream,
        Dialer, InboundDelivery, MessageProperties,
    },
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{Arguments, HeaderValue, Headers},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with lapin using the bus configuration.
pub struct LapinDialer {
    uri: String,
    connection_name: String,
}

impl LapinDialer {
    pub fn new(cfg: &RabbitMQConfigs) -> Arc<LapinDialer> {
        Arc::new(LapinDialer {
            uri: cfg.uri(),
            connection_name: cfg.connection_name.clone(),
        })
    }
}

#[async_trait]
impl Dialer for LapinDialer {
    async fn dial(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

/// lapin-backed [`AmqpConnection`].
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(LapinChannel::new(channel))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn
            .close(REPLY_SUCCESS, "closing connection")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    fn on_close(&self) -> oneshot::Receiver<AmqpError> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));

        self.conn.on_error(move |err| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(AmqpError::ConnectionError(err.to_string()));
            }
        });

        rx
    }
}

/// lapin-backed [`AmqpChannel`].
pub struct LapinChannel {
    channel: Channel,
    closed: broadcast::Sender<AmqpError>,
}

impl LapinChannel {
    fn new(channel: Channel) -> Arc<LapinChannel> {
        let (closed, _) = broadcast::channel(4);

        let notifier = closed.clone();
        channel.on_error(move |err| {
            let _ = notifier.send(AmqpError::ChannelError(err.to_string()));
        });

        Arc::new(LapinChannel { channel, closed })
    }
}

/// Channel that acknowledges deliveries for a consumer stream.
struct ChannelAcker(Channel);

#[async_trait]
impl DeliveryAcker for ChannelAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.0
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn exchange_declare(&self, exch: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &exch.name,
                lapin_exchange_kind(&exch.kind),
                ExchangeDeclareOptions {
                    passive: exch.passive,
                    durable: exch.durable,
                    auto_delete: exch.delete,
                    internal: exch.internal,
                    nowait: exch.no_wait,
                },
                field_table(&exch.params),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = %exch.name,
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(exch.name.clone())
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                field_table(&def.arguments()),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                AmqpError::DeclareQueueError(def.name.clone())
            })
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                field_table(&binding.params),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(err.to_string())
            })?;

        let acker: Arc<dyn DeliveryAcker> = Arc::new(ChannelAcker(self.channel.clone()));

        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(InboundDelivery {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.to_string(),
                    routing_key: delivery.routing_key.to_string(),
                    redelivered: delivery.redelivered,
                    properties: message_properties(&delivery.properties),
                    data: delivery.data,
                    acker: acker.clone(),
                }),
                Err(err) => Err(AmqpError::ConsumerDeclarationError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::ConsumerCancelError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "closing channel")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn on_close(&self) -> broadcast::Receiver<AmqpError> {
        self.closed.subscribe()
    }
}

fn lapin_exchange_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::XMessageDelayed => lapin::ExchangeKind::Custom(kind.as_str().to_owned()),
    }
}

fn amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::ShortInt(v) => AMQPValue::ShortInt(*v),
        HeaderValue::LongInt(v) => AMQPValue::LongInt(*v),
        HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(*v),
        HeaderValue::LongUInt(v) => AMQPValue::LongUInt(*v),
        HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v.clone())),
        HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v.clone())),
    }
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
        AMQPValue::ShortShortInt(v) => Some(HeaderValue::ShortInt(i16::from(*v))),
        AMQPValue::ShortShortUInt(v) => Some(HeaderValue::ShortInt(i16::from(*v))),
        AMQPValue::ShortInt(v) => Some(HeaderValue::ShortInt(*v)),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::LongInt(i32::from(*v))),
        AMQPValue::LongInt(v) => Some(HeaderValue::LongInt(*v)),
        AMQPValue::LongUInt(v) => Some(HeaderValue::LongUInt(*v)),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::LongLongInt(*v)),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok().map(HeaderValue::LongLongInt),
        AMQPValue::ShortString(v) => Some(HeaderValue::ShortString(v.to_string())),
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
            .ok()
            .map(|s| HeaderValue::LongString(s.to_owned())),
        _ => None,
    }
}

fn field_table(args: &Arguments) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = args
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
        .collect();

    FieldTable::from(btree)
}

fn headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| header_value(value).map(|v| (key.to_string(), v)))
        .collect()
}

fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_headers(field_table(&props.headers));

    if let Some(v) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.content_encoding {
        basic = basic.with_content_encoding(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.message_type {
        basic = basic.with_type(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(v.clone()));
    }
    if let Some(v) = props.timestamp {
        basic = basic.with_timestamp(v);
    }
    if let Some(v) = props.delivery_mode {
        basic = basic.with_delivery_mode(v.as_u8());
    }
    if let Some(v) = props.priority {
        basic = basic.with_priority(v);
    }
    if let Some(v) = &props.app_id {
        basic = basic.with_app_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.expiration {
        basic = basic.with_expiration(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.reply_to {
        basic = basic.with_reply_to(ShortString::from(v.clone()));
    }

    basic
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|v| v.to_string());

    MessageProperties {
        content_type: text(props.content_type()),
        content_encoding: text(props.content_encoding()),
        message_type: text(props.kind()),
        message_id: text(props.message_id()),
        correlation_id: text(props.correlation_id()),
        timestamp: *props.timestamp(),
        delivery_mode: (*props.delivery_mode()).map(DeliveryMode::from_u8),
        priority: *props.priority(),
        app_id: text(props.app_id()),
        expiration: text(props.expiration()),
        reply_to: text(props.reply_to()),
        headers: props.headers().as_ref().map(headers).unwrap_or_default(),
    }
}
