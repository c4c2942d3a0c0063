// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use crate::{
    broker::DeliveryMode,
    exchange::ExchangeDefinition,
    message::{HeaderValue, Headers, Message},
};
use std::{marker::PhantomData, time::Duration};

/// How messages of one type are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfiguration {
    message_type: String,
    exchange: ExchangeDefinition,
    routing_key: String,
    delivery_mode: DeliveryMode,
    priority: Option<u8>,
    app_id: Option<String>,
    expiration: Option<String>,
    reply_to: Option<String>,
    content_encoding: Option<String>,
    headers: Headers,
}

impl ProducerConfiguration {
    pub fn builder<M: Message>() -> ProducerConfigurationBuilder<M> {
        ProducerConfigurationBuilder::new()
    }

    /// Defaults for a type without explicit configuration: a durable fanout exchange
    /// and a routing key both named after the type.
    pub fn for_type(message_type: &str) -> Self {
        Self {
            message_type: message_type.to_owned(),
            exchange: ExchangeDefinition::new(message_type),
            routing_key: message_type.to_owned(),
            delivery_mode: DeliveryMode::default(),
            priority: None,
            app_id: None,
            expiration: None,
            reply_to: None,
            content_encoding: None,
            headers: Headers::new(),
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    /// Per-message TTL in milliseconds, as AMQP expects it.
    pub fn expiration(&self) -> Option<&str> {
        self.expiration.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    /// Headers stamped on every message before the per-call metadata.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Fluent builder for [`ProducerConfiguration`]; unset fields keep the
/// [`ProducerConfiguration::for_type`] defaults of `M`.
pub struct ProducerConfigurationBuilder<M: Message> {
    config: ProducerConfiguration,
    _message: PhantomData<fn() -> M>,
}

impl<M: Message> Default for ProducerConfigurationBuilder<M> {
    fn default() -> Self {
        Self {
            config: ProducerConfiguration::for_type(&M::message_type()),
            _message: PhantomData,
        }
    }
}

impl<M: Message> ProducerConfigurationBuilder<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, exchange: ExchangeDefinition) -> Self {
        self.config.exchange = exchange;
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.config.routing_key = key.to_owned();
        self
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.config.delivery_mode = mode;
        self
    }

    pub fn transient(self) -> Self {
        self.delivery_mode(DeliveryMode::Transient)
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.config.priority = Some(priority);
        self
    }

    pub fn app_id(mut self, app_id: &str) -> Self {
        self.config.app_id = Some(app_id.to_owned());
        self
    }

    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.config.expiration = Some(ttl.as_millis().to_string());
        self
    }

    pub fn reply_to(mut self, queue: &str) -> Self {
        self.config.reply_to = Some(queue.to_owned());
        self
    }

    pub fn content_encoding(mut self, encoding: &str) -> Self {
        self.config.content_encoding = Some(encoding.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.config.headers.insert(key.to_owned(), value);
        self
    }

    pub fn build(self) -> ProducerConfiguration {
        let mut config = self.config;
        if config.exchange.name().is_empty() {
            config.exchange = config.exchange.rename(&config.message_type);
        }
        config
    }
}
