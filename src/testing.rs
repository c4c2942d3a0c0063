// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! Implements the broker traits without a RabbitMQ server so the consumer, producer
//! and bus can be exercised in tests. Routing follows direct, fanout and topic
//! exchange rules; acknowledgments, requeues, dead-lettering and broker-initiated
//! connection drops are recorded and observable.

use crate::{
    broker::{
        AmqpChannel, AmqpConnection, ConsumeOptions, DeliveryAcker, DeliveryStream, Dialer,
        InboundDelivery, MessageProperties,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};
use tokio::sync::{broadcast, mpsc, oneshot};

/// A message accepted by the broker through `basic_publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    data: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    channel_id: u64,
    tag: String,
    no_ack: bool,
    acker: Arc<dyn DeliveryAcker>,
    sender: mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>,
}

#[derive(Default)]
struct QueueState {
    definition: QueueDefinition,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

struct ChannelState {
    connection_id: u64,
    open: bool,
    closed: broadcast::Sender<AmqpError>,
}

struct ConnectionState {
    open: bool,
    close_listener: Option<oneshot::Sender<AmqpError>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    rejected_queues: HashSet<String>,
    published: Vec<PublishedMessage>,
    unacked: HashMap<u64, Unacked>,
    acks: Vec<u64>,
    nacks: Vec<(u64, bool)>,
    qos: Vec<u16>,
    channels: HashMap<u64, ChannelState>,
    connections: HashMap<u64, ConnectionState>,
    next_tag: u64,
    next_id: u64,
    dials: usize,
    failing_dials: usize,
}

/// Shared handle to the in-memory broker; clones see the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(MemoryDialer {
            broker: self.clone(),
        })
    }

    pub fn dial_count(&self) -> usize {
        self.state.lock().dials
    }

    /// The next `count` dials fail with a connection error.
    pub fn fail_next_dials(&self, count: usize) {
        self.state.lock().failing_dials = count;
    }

    /// Declaring a queue with this name fails.
    pub fn reject_queue(&self, name: &str) {
        self.state.lock().rejected_queues.insert(name.to_owned());
    }

    /// Closes every open connection as the broker would on a failure.
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, conn)| conn.open)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            state.close_connection(id, Some("connection reset by broker"));
        }
    }

    /// Closes the channels consuming from `queue` while their connections stay up.
    pub fn close_consumer_channels(&self, queue: &str) {
        let mut state = self.state.lock();
        let ids: HashSet<u64> = state
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|slot| slot.channel_id).collect())
            .unwrap_or_default();

        for id in ids {
            state.close_channel(id, Some("channel closed by broker"));
        }
    }

    /// Routes a message as if a client had published it.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        properties: MessageProperties,
    ) {
        self.state
            .lock()
            .publish(exchange, routing_key, data, properties);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state.lock().acks.clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.state.lock().nacks.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.state.lock().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.state
            .lock()
            .queues
            .get(name)
            .map(|q| q.definition.clone())
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.state.lock().bindings.clone()
    }

    pub fn qos(&self) -> Vec<u16> {
        self.state.lock().qos.clone()
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.values().filter(|c| c.open).count()
    }

    fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        state.next_id
    }
}

impl BrokerState {
    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        properties: MessageProperties,
    ) {
        self.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.to_vec(),
            properties: properties.clone(),
        });

        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            let kind = self
                .exchanges
                .get(exchange)
                .map(|e| e.kind.clone())
                .unwrap_or_default();

            self.bindings
                .iter()
                .filter(|b| b.exchange_name == exchange)
                .filter(|b| routes(&kind, &b.routing_key, routing_key))
                .map(|b| b.queue_name.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };

        for queue in targets {
            if let Some(state) = self.queues.get_mut(&queue) {
                state.ready.push_back(StoredMessage {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    data: data.to_vec(),
                    properties: properties.clone(),
                    redelivered: false,
                });
                self.dispatch(&queue);
            }
        }
    }

    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.consumers.is_empty() || queue.ready.is_empty() {
                return;
            }

            let index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let slot = &queue.consumers[index];
            let delivery = InboundDelivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                data: message.data.clone(),
                properties: message.properties.clone(),
                acker: slot.acker.clone(),
            };
            let channel_id = slot.channel_id;
            let no_ack = slot.no_ack;

            if slot.sender.send(Ok(delivery)).is_err() {
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }

            if no_ack {
                continue;
            }

            self.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_owned(),
                    channel_id,
                    message,
                },
            );
        }
    }

    fn settle(&mut self, tag: u64, channel_id: u64) -> Result<Unacked, String> {
        let open = self
            .channels
            .get(&channel_id)
            .map(|c| c.open)
            .unwrap_or(false);
        if !open {
            return Err("channel is closed".to_owned());
        }

        match self.unacked.get(&tag) {
            Some(unacked) if unacked.channel_id == channel_id => {}
            _ => return Err(format!("unknown delivery tag {tag}")),
        }

        self.unacked
            .remove(&tag)
            .ok_or_else(|| format!("unknown delivery tag {tag}"))
    }

    fn requeue(&mut self, unacked: Unacked) {
        let queue = unacked.queue.clone();
        if let Some(state) = self.queues.get_mut(&queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            state.ready.push_front(message);
        }
        self.dispatch(&queue);
    }

    fn dead_letter(&mut self, unacked: Unacked) {
        let dlq = self
            .queues
            .get(&unacked.queue)
            .and_then(|q| q.definition.dlq_name.clone());

        if let Some(dlq) = dlq {
            if let Some(state) = self.queues.get_mut(&dlq) {
                state.ready.push_back(unacked.message);
            }
            self.dispatch(&dlq);
        }
    }

    fn close_channel(&mut self, channel_id: u64, cause: Option<&str>) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        if let Some(cause) = cause {
            let _ = channel
                .closed
                .send(AmqpError::ChannelError(cause.to_owned()));
        }

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|slot| slot.channel_id != channel_id);
        }

        let orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in orphaned {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }
    }

    fn close_connection(&mut self, connection_id: u64, cause: Option<&str>) {
        let listener = match self.connections.get_mut(&connection_id) {
            Some(conn) if conn.open => {
                conn.open = false;
                conn.close_listener.take()
            }
            _ => return,
        };

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channels {
            self.close_channel(id, cause);
        }

        if let (Some(cause), Some(listener)) = (cause, listener) {
            let _ = listener.send(AmqpError::ConnectionError(cause.to_owned()));
        }
    }
}

fn routes(kind: &ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Direct | ExchangeKind::XMessageDelayed => binding_key == routing_key,
        ExchangeKind::Topic => topic_matches(
            &binding_key.split('.').collect::<Vec<_>>(),
            &routing_key.split('.').collect::<Vec<_>>(),
        ),
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.first(), words.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], words)
                || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &words[1..]),
        (Some(p), Some(w)) if p == w => topic_matches(&pattern[1..], &words[1..]),
        _ => false,
    }
}

struct MemoryDialer {
    broker: InMemoryBroker,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let id = self.broker.next_id();
        let mut state = self.broker.state.lock();
        state.dials += 1;

        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                close_listener: None,
            },
        );

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.broker.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if !self.is_connected() {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let id = self.broker.next_id();
        let (closed, _) = broadcast::channel(4);
        self.broker.state.lock().channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                open: true,
                closed,
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state.lock().close_connection(self.id, None);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.broker
            .state
            .lock()
            .connections
            .get(&self.id)
            .map(|c| c.open)
            .unwrap_or(false)
    }

    fn on_close(&self) -> oneshot::Receiver<AmqpError> {
        let (tx, rx) = oneshot::channel();
        if let Some(conn) = self.broker.state.lock().connections.get_mut(&self.id) {
            conn.close_listener = Some(tx);
        }
        rx
    }
}

struct MemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel is closed".to_owned()))
        }
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.state.lock().qos.push(prefetch_count);
        Ok(())
    }

    async fn exchange_declare(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();

        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing.kind != exchange.kind => Err(
                AmqpError::DeclareExchangeError(exchange.name.clone()),
            ),
            _ => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, queue: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();

        if state.rejected_queues.contains(&queue.name) {
            return Err(AmqpError::DeclareQueueError(queue.name.clone()));
        }

        state
            .queues
            .entry(queue.name.clone())
            .or_default()
            .definition = queue.clone();
        Ok(())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();

        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        {
            let mut state = self.broker.state.lock();
            let Some(queue_state) = state.queues.get_mut(queue) else {
                return Err(AmqpError::ConsumerDeclarationError(format!(
                    "queue {queue} not found"
                )));
            };
            queue_state.consumers.push(ConsumerSlot {
                channel_id: self.id,
                tag: consumer_tag.to_owned(),
                no_ack: options.no_ack,
                acker: Arc::new(MemoryAcker {
                    broker: self.broker.clone(),
                    channel_id: self.id,
                }),
                sender,
            });
            state.dispatch(queue);
        }

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|slot| slot.tag != consumer_tag);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::PublishingError("channel is closed".to_owned()));
        }

        let mut state = self.broker.state.lock();
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::PublishingError(format!(
                "exchange {exchange} not found"
            )));
        }

        state.publish(exchange, routing_key, payload, properties.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state.lock().close_channel(self.id, None);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.broker
            .state
            .lock()
            .channels
            .get(&self.id)
            .map(|c| c.open)
            .unwrap_or(false)
    }

    fn on_close(&self) -> broadcast::Receiver<AmqpError> {
        let state = self.broker.state.lock();
        match state.channels.get(&self.id) {
            Some(channel) => channel.closed.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}

struct MemoryAcker {
    broker: InMemoryBroker,
    channel_id: u64,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.broker.state.lock();
        state
            .settle(delivery_tag, self.channel_id)
            .map_err(AmqpError::AckMessageError)?;
        state.acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.state.lock();
        let unacked = state
            .settle(delivery_tag, self.channel_id)
            .map_err(AmqpError::NackMessageError)?;
        state.nacks.push((delivery_tag, requeue));

        if requeue {
            state.requeue(unacked);
        } else {
            state.dead_letter(unacked);
        }
        Ok(())
    }
}
