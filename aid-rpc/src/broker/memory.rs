//! In-process broker.
//!
//! Implements enough AMQP 0-9-1 behaviour for the RPC engine to run without
//! RabbitMQ: the default exchange, direct/fanout/topic exchanges, generated
//! queue names, exclusive and auto-delete queues, manual acknowledgement with
//! a prefetch bound, and requeue of unacknowledged deliveries when a channel
//! closes. It also exposes hooks for failure injection and inspection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use super::{
    BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ConnectionEvent, Connector, Delivery,
    DeliveryStream, EventHandler, ExchangeKind, MessageProperties, QueueSpec,
};
use crate::cancel::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    topology: Mutex<Topology>,
    scripted_failures: Mutex<VecDeque<BrokerError>>,
    connect_attempts: Mutex<Vec<Instant>>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
    rejected: Mutex<Vec<RejectedDelivery>>,
    refuse_direct_publishes: AtomicBool,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Arc<Queue>>,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct Queue {
    spec: QueueSpec,
    owner: Option<u64>,
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    body: Vec<u8>,
}

/// A delivery that a consumer rejected
#[derive(Debug, Clone)]
pub struct RejectedDelivery {
    pub queue: String,
    pub routing_key: String,
    pub requeue: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Snapshot of a declared queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub has_consumer: bool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            state: Arc::clone(&self.state),
        })
    }

    /// Make the next connect attempts fail, in order, with the given errors
    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = BrokerError>) {
        lock(&self.state.scripted_failures).extend(errors);
    }

    /// Instants of every connect attempt seen so far, successful or not
    pub fn connect_attempts(&self) -> Vec<Instant> {
        lock(&self.state.connect_attempts).clone()
    }

    pub fn open_connections(&self) -> usize {
        self.state.live_connections().len()
    }

    /// Force-close every open connection, as a broker restart would
    pub fn drop_connections(&self) {
        for connection in self.state.live_connections() {
            connection.shutdown();
            connection.emit(ConnectionEvent::Shutdown("CONNECTION_FORCED - broker forced connection closure".into()));
        }
    }

    pub fn block_connections(&self, reason: &str) {
        for connection in self.state.live_connections() {
            connection.emit(ConnectionEvent::Blocked(reason.to_owned()));
        }
    }

    pub fn unblock_connections(&self) {
        for connection in self.state.live_connections() {
            connection.emit(ConnectionEvent::Unblocked);
        }
    }

    /// Refuse publishes to the default exchange (where replies go)
    pub fn refuse_direct_publishes(&self, refuse: bool) {
        self.state.refuse_direct_publishes.store(refuse, Ordering::SeqCst);
    }

    pub fn rejected(&self) -> Vec<RejectedDelivery> {
        lock(&self.state.rejected).clone()
    }

    pub fn queue(&self, name: &str) -> Option<QueueInfo> {
        let topology = lock(&self.state.topology);
        topology.queues.get(name).map(|queue| QueueInfo {
            name: queue.spec.name.clone(),
            durable: queue.spec.durable,
            exclusive: queue.spec.exclusive,
            auto_delete: queue.spec.auto_delete,
            has_consumer: lock(&queue.rx).is_none(),
        })
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        lock(&self.state.topology)
            .exchanges
            .get(name)
            .map(|exchange| exchange.kind)
    }

    /// `(queue, routing key)` bindings of an exchange
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        lock(&self.state.topology)
            .exchanges
            .get(exchange)
            .map(|exchange| {
                exchange
                    .bindings
                    .iter()
                    .map(|binding| (binding.queue.clone(), binding.routing_key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Publish as a foreign client would, bypassing any connection
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> BrokerResult<()> {
        self.state.route(Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties,
            body: body.to_vec(),
        })
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topology = lock(&self.state.topology);
        f.debug_struct("MemoryBroker")
            .field("exchanges", &topology.exchanges.len())
            .field("queues", &topology.queues.len())
            .finish()
    }
}

impl BrokerState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn live_connections(&self) -> Vec<Arc<MemoryConnection>> {
        let mut connections = lock(&self.connections);
        connections.retain(|weak| weak.strong_count() > 0);
        connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|connection| connection.is_open())
            .collect()
    }

    fn find_queue(&self, name: &str) -> Option<Arc<Queue>> {
        lock(&self.topology).queues.get(name).cloned()
    }

    fn route(&self, message: Message) -> BrokerResult<()> {
        let targets: Vec<Arc<Queue>> = {
            let topology = lock(&self.topology);
            if message.exchange.is_empty() {
                if self.refuse_direct_publishes.load(Ordering::SeqCst) {
                    return Err(BrokerError::Channel("publish to the default exchange refused".into()));
                }
                topology.queues.get(&message.routing_key).cloned().into_iter().collect()
            } else {
                let exchange = topology.exchanges.get(&message.exchange).ok_or_else(|| {
                    BrokerError::Channel(format!("NOT_FOUND - no exchange '{}'", message.exchange))
                })?;
                let mut names: Vec<&str> = exchange
                    .bindings
                    .iter()
                    .filter(|binding| match exchange.kind {
                        ExchangeKind::Fanout => true,
                        ExchangeKind::Direct => binding.routing_key == message.routing_key,
                        ExchangeKind::Topic => topic_matches(&binding.routing_key, &message.routing_key),
                    })
                    .map(|binding| binding.queue.as_str())
                    .collect();
                names.sort_unstable();
                names.dedup();
                names
                    .into_iter()
                    .filter_map(|name| topology.queues.get(name).cloned())
                    .collect()
            }
        };

        // Unroutable messages are dropped, as with a non-mandatory publish.
        for queue in targets {
            let _ = queue.tx.send(message.clone());
        }
        Ok(())
    }

    fn requeue(&self, queue: &str, mut message: Message) {
        if let Some(queue) = self.find_queue(queue) {
            message.redelivered = true;
            let _ = queue.tx.send(message);
        }
    }

    fn delete_exclusive_queues(&self, owner: u64) {
        lock(&self.topology)
            .queues
            .retain(|_, queue| queue.owner != Some(owner));
    }
}

/// `*` matches exactly one word, `#` matches zero or more
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

struct MemoryConnector {
    state: Arc<BrokerState>,
}

#[async_trait]
impl Connector for MemoryConnector {
    fn endpoint(&self) -> String {
        "memory://local".into()
    }

    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        lock(&self.state.connect_attempts).push(Instant::now());
        if let Some(err) = lock(&self.state.scripted_failures).pop_front() {
            return Err(err);
        }

        let connection = Arc::new(MemoryConnection {
            id: self.state.next_id(),
            state: Arc::clone(&self.state),
            closed: CancellationToken::new(),
            handler: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
        });
        lock(&self.state.connections).push(Arc::downgrade(&connection));
        Ok(connection)
    }
}

pub struct MemoryConnection {
    id: u64,
    state: Arc<BrokerState>,
    closed: CancellationToken,
    handler: Mutex<Option<EventHandler>>,
    channels: Mutex<Vec<Weak<MemoryChannel>>>,
}

impl MemoryConnection {
    fn emit(&self, event: ConnectionEvent) {
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn shutdown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let channels: Vec<Arc<MemoryChannel>> =
            lock(&self.channels).drain(..).filter_map(|weak| weak.upgrade()).collect();
        for channel in channels {
            channel.shutdown();
        }
        self.state.delete_exclusive_queues(self.id);
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    fn set_event_handler(&self, handler: EventHandler) {
        *lock(&self.handler) = Some(handler);
    }

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(BrokerError::Closed("connection is closed".into()));
        }
        let channel = Arc::new(MemoryChannel {
            connection_id: self.id,
            state: Arc::clone(&self.state),
            connection_closed: self.closed.clone(),
            closed: CancellationToken::new(),
            prefetch: Mutex::new(None),
            unacked: Arc::new(Mutex::new(HashMap::new())),
            next_tag: Arc::new(AtomicU64::new(0)),
        });
        lock(&self.channels).push(Arc::downgrade(&channel));
        Ok(channel)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.shutdown();
        Ok(())
    }
}

struct Unacked {
    queue: String,
    message: Message,
    _permit: Option<OwnedSemaphorePermit>,
}

type UnackedTable = Arc<Mutex<HashMap<u64, Unacked>>>;

pub struct MemoryChannel {
    connection_id: u64,
    state: Arc<BrokerState>,
    connection_closed: CancellationToken,
    closed: CancellationToken,
    prefetch: Mutex<Option<Arc<Semaphore>>>,
    unacked: UnackedTable,
    next_tag: Arc<AtomicU64>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::Closed("channel is closed".into()))
        }
    }

    fn shutdown(&self) {
        self.closed.cancel();
        let pending: Vec<Unacked> = lock(&self.unacked).drain().map(|(_, unacked)| unacked).collect();
        for unacked in pending {
            self.state.requeue(&unacked.queue, unacked.message);
        }
    }

    fn take_unacked(&self, delivery_tag: u64) -> BrokerResult<Unacked> {
        lock(&self.unacked).remove(&delivery_tag).ok_or_else(|| {
            BrokerError::Channel(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))
        })
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.connection_closed.is_cancelled()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, _durable: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut topology = lock(&self.state.topology);
        match topology.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::Channel(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}': received '{}' but current is '{}'",
                kind.as_str(),
                existing.kind.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                topology.exchanges.insert(
                    name.to_owned(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<String> {
        self.ensure_open()?;
        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            spec.name.clone()
        };

        let mut topology = lock(&self.state.topology);
        if let Some(existing) = topology.queues.get(&name) {
            if existing.owner.is_some() && existing.owner != Some(self.connection_id) {
                return Err(BrokerError::Channel(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{name}'"
                )));
            }
            return Ok(name);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Queue {
            spec: QueueSpec {
                name: name.clone(),
                ..spec.clone()
            },
            owner: spec.exclusive.then_some(self.connection_id),
            tx,
            rx: Mutex::new(Some(rx)),
        };
        topology.queues.insert(name.clone(), Arc::new(queue));
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut topology = lock(&self.state.topology);
        if !topology.queues.contains_key(queue) {
            return Err(BrokerError::Channel(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let exchange = topology
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::Channel(format!("NOT_FOUND - no exchange '{exchange}'")))?;
        let binding = Binding {
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
        };
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.ensure_open()?;
        *lock(&self.prefetch) = (count > 0).then(|| Arc::new(Semaphore::new(usize::from(count))));
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str, auto_ack: bool) -> BrokerResult<DeliveryStream> {
        self.ensure_open()?;
        let target = self
            .state
            .find_queue(queue)
            .ok_or_else(|| BrokerError::Channel(format!("NOT_FOUND - no queue '{queue}'")))?;
        let rx = lock(&target.rx)
            .take()
            .ok_or_else(|| BrokerError::Channel(format!("queue '{queue}' already has a consumer")))?;

        let consumer = Consumer {
            state: Arc::clone(&self.state),
            queue: target,
            rx: Some(rx),
            permits: if auto_ack { None } else { lock(&self.prefetch).clone() },
            unacked: Arc::clone(&self.unacked),
            next_tag: Arc::clone(&self.next_tag),
            closed: self.closed.clone(),
            connection_closed: self.connection_closed.clone(),
            auto_ack,
        };

        Ok(stream::unfold(consumer, |mut consumer| async move {
            let delivery = consumer.next_delivery().await?;
            Some((Ok(delivery), consumer))
        })
        .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        self.state.route(Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties: properties.clone(),
            body: body.to_vec(),
        })
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.ensure_open()?;
        self.take_unacked(delivery_tag).map(drop)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        let unacked = self.take_unacked(delivery_tag)?;
        lock(&self.state.rejected).push(RejectedDelivery {
            queue: unacked.queue.clone(),
            routing_key: unacked.message.routing_key.clone(),
            requeue,
            properties: unacked.message.properties.clone(),
            body: unacked.message.body.clone(),
        });
        if requeue {
            self.state.requeue(&unacked.queue, unacked.message);
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.shutdown();
        Ok(())
    }
}

/// Consumer side of one queue. Hands the receiver back (or deletes an
/// auto-delete queue) when the delivery stream is dropped.
struct Consumer {
    state: Arc<BrokerState>,
    queue: Arc<Queue>,
    rx: Option<mpsc::UnboundedReceiver<Message>>,
    permits: Option<Arc<Semaphore>>,
    unacked: UnackedTable,
    next_tag: Arc<AtomicU64>,
    closed: CancellationToken,
    connection_closed: CancellationToken,
    auto_ack: bool,
}

impl Consumer {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        let permit = match &self.permits {
            Some(permits) => tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                _ = self.connection_closed.cancelled() => return None,
                permit = Arc::clone(permits).acquire_owned() => Some(permit.ok()?),
            },
            None => None,
        };

        let rx = self.rx.as_mut()?;
        // A closed channel never takes another message; it stays queued for the next consumer
        let message = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return None,
            _ = self.connection_closed.cancelled() => return None,
            message = rx.recv() => message?,
        };

        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.auto_ack {
            lock(&self.unacked).insert(
                delivery_tag,
                Unacked {
                    queue: self.queue.spec.name.clone(),
                    message: message.clone(),
                    _permit: permit,
                },
            );
        }

        Some(Delivery {
            delivery_tag,
            exchange: message.exchange,
            routing_key: message.routing_key,
            redelivered: message.redelivered,
            properties: message.properties,
            body: message.body,
        })
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if self.queue.spec.auto_delete {
            let mut topology = lock(&self.state.topology);
            let current = topology.queues.get(&self.queue.spec.name).cloned();
            if current.is_some_and(|current| Arc::ptr_eq(&current, &self.queue)) {
                topology.queues.remove(&self.queue.spec.name);
            }
            return;
        }
        if let Some(rx) = self.rx.take() {
            *lock(&self.queue.rx) = Some(rx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn open_channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connector().connect().await.unwrap();
        connection.create_channel().await.unwrap()
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("simple.*", "simple.multiple"));
        assert!(!topic_matches("simple.*", "simple.a.b"));
        assert!(!topic_matches("simple.*", "other.multiple"));
        assert!(topic_matches("simple.#", "simple"));
        assert!(topic_matches("simple.#", "simple.a.b"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.multiple", "simple.multiple"));
    }

    #[tokio::test]
    async fn topic_exchange_routes_to_bound_queue() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_exchange("aid_rpc", ExchangeKind::Topic, true).await.unwrap();
        channel.declare_queue(&QueueSpec::durable("aid_rpc_simple")).await.unwrap();
        channel.bind_queue("aid_rpc_simple", "aid_rpc", "simple.*").await.unwrap();

        let mut deliveries = channel.consume("aid_rpc_simple", "test", true).await.unwrap();
        let properties = MessageProperties::default().with_correlation_id("c1");
        channel.publish("aid_rpc", "other.call", &properties, b"ignored").await.unwrap();
        channel.publish("aid_rpc", "simple.multiple", &properties, b"hello").await.unwrap();

        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"hello");
        assert_eq!(delivery.routing_key, "simple.multiple");
        assert_eq!(delivery.properties.correlation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn publishing_to_missing_exchange_fails() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        let err = channel
            .publish("nowhere", "a.b", &MessageProperties::default(), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Channel(_)));
    }

    #[tokio::test]
    async fn prefetch_bounds_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        let queue = channel.declare_queue(&QueueSpec::durable("work")).await.unwrap();
        channel.set_prefetch(1).await.unwrap();
        let mut deliveries = channel.consume(&queue, "worker", false).await.unwrap();

        for body in [b"1", b"2"] {
            broker.publish("", "work", MessageProperties::default(), body).unwrap();
        }

        let first = deliveries.next().await.unwrap().unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the first ack");

        channel.ack(first.delivery_tag).await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"2");
    }

    #[tokio::test]
    async fn server_named_exclusive_queue_is_removed_with_connection() {
        let broker = MemoryBroker::new();
        let connection = broker.connector().connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let name = channel.declare_queue(&QueueSpec::exclusive_reply()).await.unwrap();
        assert!(name.starts_with("amq.gen-"));
        assert!(broker.queue(&name).is_some_and(|info| info.exclusive));

        connection.close().await.unwrap();
        assert!(broker.queue(&name).is_none());
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn closing_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_queue(&QueueSpec::durable("work")).await.unwrap();
        let mut deliveries = channel.consume("work", "worker", false).await.unwrap();
        broker.publish("", "work", MessageProperties::default(), b"job").unwrap();
        let _ = deliveries.next().await.unwrap().unwrap();

        channel.close().await.unwrap();
        drop(deliveries);

        let channel = open_channel(&broker).await;
        let mut deliveries = channel.consume("work", "worker", false).await.unwrap();
        let redelivered = deliveries.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(redelivered.body, b"job");
    }

    #[tokio::test]
    async fn reject_is_recorded() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_queue(&QueueSpec::durable("work")).await.unwrap();
        let mut deliveries = channel.consume("work", "worker", false).await.unwrap();
        broker.publish("", "work", MessageProperties::default(), b"bad").unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        channel.reject(delivery.delivery_tag, false).await.unwrap();
        let rejected = broker.rejected();
        assert_eq!(rejected.len(), 1);
        assert!(!rejected[0].requeue);
        assert_eq!(rejected[0].queue, "work");
    }

    #[tokio::test]
    async fn scripted_connect_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects([BrokerError::Unreachable("refused".into())]);
        let connector = broker.connector();

        assert!(connector.connect().await.is_err());
        let _connection = connector.connect().await.unwrap();
        assert_eq!(broker.connect_attempts().len(), 2);
        assert_eq!(broker.open_connections(), 1);
    }
}
