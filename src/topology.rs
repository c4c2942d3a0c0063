// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the topology components a consumer or the producer needs:
//! exchanges, queues (with their Dead Letter Queues) and the bindings between them.
//! Declarations are idempotent on the broker, so a topology is installed again on
//! every (re)start.

use crate::{
    broker::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Declares a topology on one channel.
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: &ExchangeDefinition) -> Self {
        self.exchanges.push(def.clone());
        self
    }

    fn queue(mut self, def: &QueueDefinition) -> Self {
        self.queues.push(def.clone());
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Declares exchanges, then queues (DLQs first), then bindings.
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel.exchange_declare(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            if let Some(dlq) = def.dlq_definition() {
                debug!("creating dlq: {}", dlq.name);
                self.channel.queue_declare(&dlq).await?;
            }

            debug!("creating queue: {}", def.name);
            self.channel.queue_declare(def).await?;
            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.channel.queue_bind(binding).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockAmqpChannel;
    use mockall::Sequence;

    #[tokio::test]
    async fn installs_exchanges_then_queues_then_bindings() {
        let mut channel = MockAmqpChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_exchange_declare()
            .withf(|def| def.name() == "orders")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_queue_declare()
            .withf(|def| def.name() == "orders_queue-dlq")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_queue_declare()
            .withf(|def| def.name() == "orders_queue")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_queue_bind()
            .withf(|b| b.queue_name() == "orders_queue" && b.key() == "orders")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let exchange = ExchangeDefinition::new("orders");
        let queue = QueueDefinition::new("orders_queue").with_dlq();

        AmqpTopology::new(Arc::new(channel))
            .exchange(&exchange)
            .queue(&queue)
            .queue_binding(
                QueueBinding::new("orders_queue")
                    .exchange("orders")
                    .routing_key("orders"),
            )
            .install()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exchange_failure_stops_the_installation() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_exchange_declare()
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name().to_owned())));
        channel.expect_queue_declare().never();
        channel.expect_queue_bind().never();

        let result = AmqpTopology::new(Arc::new(channel))
            .exchange(&ExchangeDefinition::new("broken"))
            .queue(&QueueDefinition::new("q"))
            .install()
            .await;

        assert_eq!(
            result,
            Err(AmqpError::DeclareExchangeError("broken".to_owned()))
        );
    }
}
