// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Options
//!
//! This module provides types for defining RabbitMQ queues and their bindings.
//! It includes support for Dead Letter Queues (DLQ): a consumer that rejects a
//! delivery without requeueing it sends the message there.

use crate::message::{Arguments, HeaderValue};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Besides the standard flags it supports message TTL, max length and a
/// Dead Letter Queue declared next to the main queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) params: Arguments,
}

impl QueueDefinition {
    /// Creates a new durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    /// Replaces the queue name; a configured DLQ follows the new name.
    pub fn rename(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        if self.dlq_name.is_some() {
            self.dlq_name = Some(format!("{}-dlq", self.name));
        }
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a Dead Letter Queue named after the main queue with a "-dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    pub fn param(mut self, key: &str, value: HeaderValue) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    pub fn params(mut self, params: Arguments) -> Self {
        self.params = params;
        self
    }

    /// Arguments sent with the queue declaration, explicit params last.
    pub fn arguments(&self) -> Arguments {
        let mut args = Arguments::new();

        if let Some(dlq_name) = &self.dlq_name {
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                HeaderValue::LongString(String::new()),
            );
            args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                HeaderValue::LongString(dlq_name.clone()),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), HeaderValue::LongInt(ttl));
        }

        if let Some(max) = self.max_length {
            args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), HeaderValue::LongInt(max));
        }

        if let Some(max) = self.max_length_bytes {
            args.insert(
                AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
                HeaderValue::LongInt(max),
            );
        }

        args.extend(self.params.clone());
        args
    }

    /// The dead letter queue to declare before this one, if any.
    pub(crate) fn dlq_definition(&self) -> Option<QueueDefinition> {
        self.dlq_name.as_ref().map(|dlq_name| QueueDefinition {
            name: dlq_name.clone(),
            durable: self.durable,
            delete: self.delete,
            exclusive: self.exclusive,
            passive: self.passive,
            no_wait: self.no_wait,
            ..QueueDefinition::default()
        })
    }
}

/// Routing key and arguments used to bind a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingOptions {
    pub(crate) routing_key: String,
    pub(crate) params: Arguments,
}

impl BindingOptions {
    pub fn new(routing_key: &str) -> Self {
        Self {
            routing_key: routing_key.to_owned(),
            params: Arguments::new(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn with_routing_key(mut self, routing_key: &str) -> Self {
        self.routing_key = routing_key.to_owned();
        self
    }

    pub fn param(mut self, key: &str, value: HeaderValue) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) params: Arguments,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn options(mut self, options: &BindingOptions) -> Self {
        self.routing_key = options.routing_key.clone();
        self.params = options.params.clone();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }

    pub fn arguments(&self) -> &Arguments {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_routes_rejected_messages_through_default_exchange() {
        let def = QueueDefinition::new("payments").with_dlq().ttl(1000);
        let args = def.arguments();

        assert_eq!(def.dlq_name(), Some("payments-dlq"));
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&HeaderValue::LongString(String::new()))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&HeaderValue::LongString("payments-dlq".to_owned()))
        );
        assert_eq!(args.get(AMQP_HEADERS_MESSAGE_TTL), Some(&HeaderValue::LongInt(1000)));

        let dlq = def.dlq_definition().unwrap();
        assert_eq!(dlq.name(), "payments-dlq");
        assert!(dlq.arguments().is_empty());
    }

    #[test]
    fn rename_moves_the_dlq_along() {
        let def = QueueDefinition::new("a").with_dlq().rename("b");
        assert_eq!(def.dlq_name(), Some("b-dlq"));
    }

    #[test]
    fn explicit_params_override_derived_arguments() {
        let def = QueueDefinition::new("q")
            .max_length(10)
            .param(AMQP_HEADERS_MAX_LENGTH, HeaderValue::LongInt(20));

        assert_eq!(
            def.arguments().get(AMQP_HEADERS_MAX_LENGTH),
            Some(&HeaderValue::LongInt(20))
        );
    }

    #[test]
    fn binding_takes_routing_key_from_options() {
        let binding = QueueBinding::new("q")
            .exchange("ex")
            .options(&BindingOptions::new("rk").param("x-match", "all".into()));

        assert_eq!(binding.queue_name(), "q");
        assert_eq!(binding.exchange_name(), "ex");
        assert_eq!(binding.key(), "rk");
        assert_eq!(binding.arguments().len(), 1);
    }
}
