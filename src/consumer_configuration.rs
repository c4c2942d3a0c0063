// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Configuration
//!
//! [`ConsumerConfigurationBuilder`] assembles everything a [`Consumer`](crate::consumer::Consumer)
//! needs: topology, concurrency, acknowledgment flags, retry policy, handlers and
//! pipelines. Unset names are derived from the message type, so a consumer of
//! `OrderCreated` binds the `order_created_queue` queue to the durable fanout
//! exchange `order_created` with the routing key `order_created`.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    pipeline::{ConsumerHandler, ConsumerPipeline},
    queue::{BindingOptions, QueueBinding, QueueDefinition},
};
use std::{fmt, marker::PhantomData, sync::Arc, time::Duration};

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 1;
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Bounded retry applied to every handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay,
            max_delay,
        }
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before attempt `attempt + 1`, doubling from the initial delay.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay.max(self.initial_delay))
    }
}

/// Immutable consumer configuration for messages of type `M`.
pub struct ConsumerConfiguration<M: Message> {
    name: String,
    message_type: String,
    concurrency_limit: usize,
    prefetch_count: u16,
    auto_ack: bool,
    no_local: bool,
    no_wait: bool,
    exclusive: bool,
    exit_on_error: bool,
    retry: RetryPolicy,
    exchange: ExchangeDefinition,
    queue: QueueDefinition,
    binding: BindingOptions,
    handlers: Vec<Arc<dyn ConsumerHandler<M>>>,
    pipelines: Vec<Arc<dyn ConsumerPipeline<M>>>,
}

impl<M: Message> Clone for ConsumerConfiguration<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            message_type: self.message_type.clone(),
            concurrency_limit: self.concurrency_limit,
            prefetch_count: self.prefetch_count,
            auto_ack: self.auto_ack,
            no_local: self.no_local,
            no_wait: self.no_wait,
            exclusive: self.exclusive,
            exit_on_error: self.exit_on_error,
            retry: self.retry,
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            binding: self.binding.clone(),
            handlers: self.handlers.clone(),
            pipelines: self.pipelines.clone(),
        }
    }
}

impl<M: Message> fmt::Debug for ConsumerConfiguration<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfiguration")
            .field("name", &self.name)
            .field("message_type", &self.message_type)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("prefetch_count", &self.prefetch_count)
            .field("auto_ack", &self.auto_ack)
            .field("exit_on_error", &self.exit_on_error)
            .field("retry", &self.retry)
            .field("exchange", &self.exchange.name())
            .field("queue", &self.queue.name())
            .field("routing_key", &self.binding.routing_key())
            .field("handlers", &self.handlers.len())
            .field("pipelines", &self.pipelines.len())
            .finish()
    }
}

impl<M: Message> ConsumerConfiguration<M> {
    pub fn builder() -> ConsumerConfigurationBuilder<M> {
        ConsumerConfigurationBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    /// Broker-side prefetch for the consumer's channel, saturating at `u16::MAX`.
    pub fn effective_prefetch(&self) -> u16 {
        let total = self.concurrency_limit.saturating_mul(self.prefetch_count as usize);
        u16::try_from(total).unwrap_or(u16::MAX)
    }

    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    pub fn no_local(&self) -> bool {
        self.no_local
    }

    pub fn no_wait(&self) -> bool {
        self.no_wait
    }

    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn exit_on_error(&self) -> bool {
        self.exit_on_error
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        self.binding.routing_key()
    }

    pub(crate) fn binding(&self) -> QueueBinding {
        QueueBinding::new(self.queue.name())
            .exchange(self.exchange.name())
            .options(&self.binding)
    }

    pub fn handlers(&self) -> &[Arc<dyn ConsumerHandler<M>>] {
        &self.handlers
    }

    pub fn pipelines(&self) -> &[Arc<dyn ConsumerPipeline<M>>] {
        &self.pipelines
    }
}

/// Fluent builder for [`ConsumerConfiguration`].
pub struct ConsumerConfigurationBuilder<M: Message> {
    name: Option<String>,
    concurrency_limit: usize,
    prefetch_count: u16,
    auto_ack: bool,
    no_local: bool,
    no_wait: bool,
    exclusive: bool,
    exit_on_error: bool,
    retry: RetryPolicy,
    exchange: Option<ExchangeDefinition>,
    queue: Option<QueueDefinition>,
    binding: Option<BindingOptions>,
    handlers: Vec<Arc<dyn ConsumerHandler<M>>>,
    pipelines: Vec<Arc<dyn ConsumerPipeline<M>>>,
    _message: PhantomData<fn() -> M>,
}

impl<M: Message> Default for ConsumerConfigurationBuilder<M> {
    fn default() -> Self {
        Self {
            name: None,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            auto_ack: false,
            no_local: false,
            no_wait: false,
            exclusive: false,
            exit_on_error: false,
            retry: RetryPolicy::default(),
            exchange: None,
            queue: None,
            binding: None,
            handlers: vec![],
            pipelines: vec![],
            _message: PhantomData,
        }
    }
}

impl<M: Message> ConsumerConfigurationBuilder<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Number of workers, and of deliveries handled at once.
    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Prefetch per worker.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Stop the consumer once a delivery exhausts its retries.
    pub fn exit_on_error(mut self) -> Self {
        self.exit_on_error = true;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn exchange(mut self, exchange: ExchangeDefinition) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn queue(mut self, queue: QueueDefinition) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn binding(mut self, binding: BindingOptions) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.binding = Some(match self.binding {
            Some(binding) => binding.with_routing_key(key),
            None => BindingOptions::new(key),
        });
        self
    }

    /// Appends a handler; handlers run sequentially in registration order.
    pub fn handler(mut self, handler: Arc<dyn ConsumerHandler<M>>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Appends a pipeline; the first one registered is the outermost.
    pub fn pipeline(mut self, pipeline: Arc<dyn ConsumerPipeline<M>>) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn build(self) -> Result<ConsumerConfiguration<M>, AmqpError> {
        if self.concurrency_limit == 0 || self.concurrency_limit > u16::MAX as usize {
            return Err(AmqpError::ConfigurationError(format!(
                "concurrency limit must be between 1 and {}, got {}",
                u16::MAX,
                self.concurrency_limit
            )));
        }

        if self.prefetch_count == 0 {
            return Err(AmqpError::ConfigurationError(
                "prefetch count must be greater than zero".to_owned(),
            ));
        }

        if self.retry.attempts == 0 {
            return Err(AmqpError::ConfigurationError(
                "retry policy needs at least one attempt".to_owned(),
            ));
        }

        let message_type = M::message_type();

        let exchange = match self.exchange {
            Some(exchange) if !exchange.name().is_empty() => exchange,
            Some(exchange) => exchange.rename(&message_type),
            None => ExchangeDefinition::new(&message_type),
        };

        let default_queue = format!("{message_type}_queue");
        let queue = match self.queue {
            Some(queue) if !queue.name().is_empty() => queue,
            Some(queue) => queue.rename(&default_queue),
            None => QueueDefinition::new(&default_queue),
        };

        let binding = match self.binding {
            Some(binding) if !binding.routing_key().is_empty() => binding,
            Some(binding) => binding.with_routing_key(&message_type),
            None => BindingOptions::new(&message_type),
        };

        let name = self
            .name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{message_type}_consumer"));

        Ok(ConsumerConfiguration {
            name,
            message_type,
            concurrency_limit: self.concurrency_limit,
            prefetch_count: self.prefetch_count,
            auto_ack: self.auto_ack,
            no_local: self.no_local,
            no_wait: self.no_wait,
            exclusive: self.exclusive,
            exit_on_error: self.exit_on_error,
            retry: self.retry,
            exchange,
            queue,
            binding,
            handlers: self.handlers,
            pipelines: self.pipelines,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::MessageConsumeContext, exchange::ExchangeKind};
    use async_trait::async_trait;
    use opentelemetry::Context;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderCreated {
        id: u32,
    }
    impl Message for OrderCreated {}

    struct Noop;

    #[async_trait]
    impl ConsumerHandler<OrderCreated> for Noop {
        async fn handle(
            &self,
            _ctx: &Context,
            _message: &MessageConsumeContext<OrderCreated>,
        ) -> Result<(), AmqpError> {
            Ok(())
        }
    }

    #[test]
    fn names_are_derived_from_the_message_type() {
        let cfg = ConsumerConfiguration::<OrderCreated>::builder()
            .build()
            .unwrap();

        assert_eq!(cfg.name(), "order_created_consumer");
        assert_eq!(cfg.message_type(), "order_created");
        assert_eq!(cfg.exchange().name(), "order_created");
        assert_eq!(cfg.exchange().exchange_kind(), &ExchangeKind::Fanout);
        assert!(cfg.exchange().is_durable());
        assert_eq!(cfg.queue().name(), "order_created_queue");
        assert_eq!(cfg.routing_key(), "order_created");
        assert_eq!(cfg.concurrency_limit(), DEFAULT_CONCURRENCY_LIMIT);
        assert_eq!(cfg.retry(), &RetryPolicy::default());

        let binding = cfg.binding();
        assert_eq!(binding.queue_name(), "order_created_queue");
        assert_eq!(binding.exchange_name(), "order_created");
        assert_eq!(binding.key(), "order_created");
    }

    #[test]
    fn explicit_options_win_over_defaults() {
        let cfg = ConsumerConfiguration::<OrderCreated>::builder()
            .name("billing")
            .exchange(ExchangeDefinition::new("orders").topic())
            .queue(QueueDefinition::new("billing_orders").with_dlq())
            .routing_key("orders.created")
            .concurrency_limit(4)
            .prefetch_count(8)
            .exit_on_error()
            .handler(Arc::new(Noop))
            .build()
            .unwrap();

        assert_eq!(cfg.name(), "billing");
        assert_eq!(cfg.exchange().exchange_kind(), &ExchangeKind::Topic);
        assert_eq!(cfg.queue().dlq_name(), Some("billing_orders-dlq"));
        assert_eq!(cfg.routing_key(), "orders.created");
        assert_eq!(cfg.effective_prefetch(), 32);
        assert!(cfg.exit_on_error());
        assert_eq!(cfg.handlers().len(), 1);
    }

    #[test]
    fn effective_prefetch_saturates() {
        let cfg = ConsumerConfiguration::<OrderCreated>::builder()
            .concurrency_limit(1000)
            .prefetch_count(1000)
            .build()
            .unwrap();

        assert_eq!(cfg.effective_prefetch(), u16::MAX);
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let zero_limit = ConsumerConfiguration::<OrderCreated>::builder()
            .concurrency_limit(0)
            .build();
        let zero_prefetch = ConsumerConfiguration::<OrderCreated>::builder()
            .prefetch_count(0)
            .build();
        let no_attempts = ConsumerConfiguration::<OrderCreated>::builder()
            .retry(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO))
            .build();

        assert!(matches!(zero_limit, Err(AmqpError::ConfigurationError(_))));
        assert!(matches!(zero_prefetch, Err(AmqpError::ConfigurationError(_))));
        assert!(matches!(no_attempts, Err(AmqpError::ConfigurationError(_))));
    }

    #[test]
    fn retry_backoff_doubles_up_to_the_cap() {
        let retry = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));

        assert_eq!(retry.delay_after(1), Duration::from_millis(100));
        assert_eq!(retry.delay_after(2), Duration::from_millis(200));
        assert_eq!(retry.delay_after(3), Duration::from_millis(350));
        assert_eq!(retry.delay_after(40), Duration::from_millis(350));
    }
}
