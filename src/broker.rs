// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The runtime talks to the broker only through the traits in this module.
//! `channel` implements them on top of lapin; `testing` provides an in-memory broker.
//!
//! Channels are never shared between actors: every consumer and the producer open
//! their own channel from the shared [`AmqpConnection`].

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Headers,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

/// Delivery mode stamped on published messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

impl DeliveryMode {
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        if value == 1 {
            DeliveryMode::Transient
        } else {
            DeliveryMode::Persistent
        }
    }
}

/// Basic properties travelling with every message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub message_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Seconds since the unix epoch
    pub timestamp: Option<u64>,
    pub delivery_mode: Option<DeliveryMode>,
    pub priority: Option<u8>,
    pub app_id: Option<String>,
    pub expiration: Option<String>,
    pub reply_to: Option<String>,
    pub headers: Headers,
}

/// Flags for a broker-level consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

/// Acknowledges deliveries by tag on the channel they arrived on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from a queue.
#[derive(Clone)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: MessageProperties,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .finish()
    }
}

/// Stream of deliveries produced by `basic_consume`.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// A single AMQP channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, queue: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    /// Fires when the broker closes this channel.
    fn on_close(&self) -> broadcast::Receiver<AmqpError>;
}

/// A physical broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_connected(&self) -> bool;

    /// Resolves once, when the broker closes the connection.
    fn on_close(&self) -> oneshot::Receiver<AmqpError>;
}

/// Opens physical connections; called again by the recovery loop on every redial.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_mode_maps_to_amqp_codes() {
        assert_eq!(DeliveryMode::Transient.as_u8(), 1);
        assert_eq!(DeliveryMode::Persistent.as_u8(), 2);
        assert_eq!(DeliveryMode::from_u8(1), DeliveryMode::Transient);
        assert_eq!(DeliveryMode::from_u8(2), DeliveryMode::Persistent);
        assert_eq!(DeliveryMode::default(), DeliveryMode::Persistent);
    }
}
