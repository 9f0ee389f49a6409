use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerChannel, DeliveryStream, MessageProperties, QueueSpec, SerializedPublisher};
use crate::cancel::CancellationToken;
use crate::config::BrokerConfig;
use crate::connection::ConnectionManager;
use crate::correlation::{PendingCall, PendingCalls};
use crate::error::{Result, RpcError};
use crate::message::{CallArguments, RpcResponse};
use crate::protocol::{EncodedRequest, RpcProtocol};

/// Used when a call does not set its own timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

enum ClientState {
    Uninitialized,
    Ready(Arc<Session>),
    Disposed,
}

/// Publisher channel, reply queue and the task consuming it
struct Session {
    publisher: SerializedPublisher,
    subscriber: Arc<dyn BrokerChannel>,
    reply_queue: String,
    consumer: JoinHandle<()>,
}

impl Session {
    fn is_open(&self) -> bool {
        self.publisher.is_open() && self.subscriber.is_open() && !self.consumer.is_finished()
    }

    async fn close(&self) {
        self.consumer.abort();
        for channel in [self.publisher.channel(), &self.subscriber] {
            if let Err(err) = channel.close().await {
                debug!(error = %err, "Error closing client channel");
            }
        }
    }
}

/// Calls the methods of one remote service.
///
/// Replies for every call made through the client arrive on one exclusive
/// reply queue and are matched to their callers by correlation id.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use aid_rpc::{ConnectionManager, JsonProtocol, RpcClient, BrokerConfig};
/// # #[tokio::main]
/// # async fn main() -> aid_rpc::Result<()> {
/// let connection = ConnectionManager::from_config(&BrokerConfig::default());
/// let client = RpcClient::new(connection, Arc::new(JsonProtocol), "simple", None);
/// let product: i64 = client.call("multiple", serde_json::json!({"a": 5, "b": 10})).await?;
/// assert_eq!(product, 50);
/// # Ok(())
/// # }
/// ```
pub struct RpcClient {
    service: String,
    exchange: String,
    protocol: Arc<dyn RpcProtocol>,
    connection: Arc<ConnectionManager>,
    pending: Arc<PendingCalls>,
    default_timeout: Duration,
    state: RwLock<ClientState>,
    opening: Mutex<()>,
}

impl RpcClient {
    pub fn new(
        connection: Arc<ConnectionManager>,
        protocol: Arc<dyn RpcProtocol>,
        service: &str,
        exchange: Option<&str>,
    ) -> Self {
        let exchange = exchange
            .map(str::trim)
            .filter(|exchange| !exchange.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| protocol.default_exchange_name().to_string());
        Self {
            service: service.trim().to_lowercase(),
            exchange,
            protocol,
            connection,
            pending: PendingCalls::new(),
            default_timeout: DEFAULT_CALL_TIMEOUT,
            state: RwLock::new(ClientState::Uninitialized),
            opening: Mutex::new(()),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Number of calls waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Name of the reply queue, once initialized
    pub async fn reply_queue(&self) -> Option<String> {
        match &*self.state.read().await {
            ClientState::Ready(session) => Some(session.reply_queue.clone()),
            _ => None,
        }
    }

    /// Declare the reply queue and start consuming it. Calls do this on
    /// demand; repeating it is a no-op while the session is healthy.
    pub async fn initialize(&self) -> Result<()> {
        self.session().await.map(drop)
    }

    async fn session(&self) -> Result<Arc<Session>> {
        if let Some(ready) = self.current_session().await {
            return ready;
        }

        // `state` is not held across the connect
        let _opening = self.opening.lock().await;
        if let Some(ready) = self.current_session().await {
            return ready;
        }
        let session = Arc::new(self.open_session().await?);

        let mut state = self.state.write().await;
        if matches!(*state, ClientState::Disposed) {
            drop(state);
            session.close().await;
            return Err(RpcError::Disposed("RpcClient"));
        }
        *state = ClientState::Ready(Arc::clone(&session));
        Ok(session)
    }

    /// The healthy session or the disposed error; `None` when one must be opened.
    /// A broken session is closed and forgotten.
    async fn current_session(&self) -> Option<Result<Arc<Session>>> {
        match &*self.state.read().await {
            ClientState::Ready(session) if session.is_open() => return Some(Ok(Arc::clone(session))),
            ClientState::Disposed => return Some(Err(RpcError::Disposed("RpcClient"))),
            ClientState::Uninitialized => return None,
            ClientState::Ready(_) => {}
        }

        let mut state = self.state.write().await;
        match &*state {
            ClientState::Ready(session) if session.is_open() => return Some(Ok(Arc::clone(session))),
            ClientState::Disposed => return Some(Err(RpcError::Disposed("RpcClient"))),
            ClientState::Uninitialized => return None,
            ClientState::Ready(_) => {}
        }
        if let ClientState::Ready(stale) = std::mem::replace(&mut *state, ClientState::Uninitialized) {
            drop(state);
            warn!(service = %self.service, "Reply channel lost, re-initializing client");
            stale.close().await;
        }
        None
    }

    async fn open_session(&self) -> Result<Session> {
        if !self.connection.connect().await {
            return Err(RpcError::ConnectFailed {
                endpoint: self.connection.endpoint(),
            });
        }

        let publisher = self.connection.new_channel().await?;
        publisher
            .declare_exchange(&self.exchange, self.protocol.exchange_kind(), true)
            .await?;

        let subscriber = self.connection.new_channel().await?;
        let reply_queue = subscriber.declare_queue(&QueueSpec::exclusive_reply()).await?;
        let consumer_tag = format!("{reply_queue}-{}", Uuid::new_v4().simple());
        let deliveries = subscriber.consume(&reply_queue, &consumer_tag, true).await?;
        let consumer = tokio::spawn(consume_replies(
            self.service.clone(),
            Arc::clone(&self.pending),
            deliveries,
        ));

        info!(service = %self.service, %reply_queue, exchange = %self.exchange, "RPC client initialized");
        Ok(Session {
            publisher: SerializedPublisher::new(publisher),
            subscriber,
            reply_queue,
            consumer,
        })
    }

    /// Call `method` with named (object) or positional (array) parameters
    /// and convert the result into `T`
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: impl Serialize) -> Result<T> {
        self.call_with(method, CallArguments::from_serializable(params)?, CallOptions::default())
            .await
    }

    pub async fn call_with<T: DeserializeOwned>(
        &self,
        method: &str,
        arguments: CallArguments,
        options: CallOptions,
    ) -> Result<T> {
        let (correlation_id, result) = self.exchange_call(method, &arguments, &options).await?;
        serde_json::from_value(result.unwrap_or(Value::Null)).map_err(|err| RpcError::InvalidResponse {
            correlation_id,
            reason: format!("cannot convert result: {err}"),
        })
    }

    /// Call and return the raw result, `None` for methods without one
    pub async fn call_raw(
        &self,
        method: &str,
        arguments: CallArguments,
        options: CallOptions,
    ) -> Result<Option<Value>> {
        self.exchange_call(method, &arguments, &options)
            .await
            .map(|(_, result)| result)
    }

    async fn exchange_call(
        &self,
        method: &str,
        arguments: &CallArguments,
        options: &CallOptions,
    ) -> Result<(String, Option<Value>)> {
        if method.trim().is_empty() {
            return Err(RpcError::InvalidArgument("method name must not be empty".into()));
        }
        let encoded = self.protocol.encode_request(&self.service, method, arguments)?;

        let correlation_id = Uuid::new_v4().simple().to_string();
        let mut pending = self.pending.register(&correlation_id)?;
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let cancelled = async {
            match &options.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let body = tokio::select! {
            biased;
            _ = cancelled => {
                debug!(service = %self.service, method, %correlation_id, "RPC call cancelled");
                return Err(RpcError::Cancelled {
                    correlation_id,
                    service: self.service.clone(),
                    method: method.to_string(),
                });
            }
            outcome = tokio::time::timeout(timeout, self.publish_and_wait(&encoded, &mut pending)) => {
                match outcome {
                    Ok(body) => body?,
                    Err(_) => {
                        warn!(
                            service = %self.service,
                            method,
                            %correlation_id,
                            timeout_ms = timeout.as_millis() as u64,
                            "RPC call timed out"
                        );
                        return Err(RpcError::Timeout {
                            correlation_id,
                            service: self.service.clone(),
                            method: method.to_string(),
                            timeout,
                        });
                    }
                }
            }
        };
        drop(pending);

        let response: RpcResponse =
            self.protocol
                .decode_response(&body)
                .map_err(|err| RpcError::InvalidResponse {
                    correlation_id: correlation_id.clone(),
                    reason: err.to_string(),
                })?;
        match response.error {
            Some(error) => {
                debug!(
                    service = %self.service,
                    method,
                    %correlation_id,
                    error_type = error.kind(),
                    "RPC call failed on server"
                );
                Err(RpcError::Remote { correlation_id, error })
            }
            None => Ok((correlation_id, response.result)),
        }
    }

    /// Connect if needed, publish and wait for the reply. The caller bounds
    /// all of it with the call's timeout and cancellation.
    async fn publish_and_wait(&self, encoded: &EncodedRequest, pending: &mut PendingCall) -> Result<Vec<u8>> {
        let session = self.session().await?;
        let properties = MessageProperties::default()
            .with_correlation_id(pending.correlation_id())
            .with_reply_to(&session.reply_queue)
            .with_content_type(self.protocol.content_type());
        session
            .publisher
            .publish(&self.exchange, &encoded.routing_key, &properties, &encoded.body)
            .await?;
        debug!(
            service = %self.service,
            routing_key = %encoded.routing_key,
            correlation_id = pending.correlation_id(),
            "Sent RPC request"
        );
        pending.reply().await.ok_or(RpcError::Disposed("RpcClient"))
    }

    /// Close the client. Waiting calls fail with [`RpcError::Disposed`].
    pub async fn dispose(&self) {
        let previous = std::mem::replace(&mut *self.state.write().await, ClientState::Disposed);
        let abandoned = self.pending.drain();
        if let ClientState::Ready(session) = previous {
            session.close().await;
        }
        info!(service = %self.service, abandoned, "RPC client disposed");
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let ClientState::Ready(session) = self.state.get_mut() {
            session.consumer.abort();
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("service", &self.service)
            .field("exchange", &self.exchange)
            .field("protocol", &self.protocol.name())
            .field("pending_calls", &self.pending.len())
            .finish()
    }
}

/// Route each reply to its pending call; replies nobody waits for are dropped
async fn consume_replies(service: String, pending: Arc<PendingCalls>, mut deliveries: DeliveryStream) {
    while let Some(next) = deliveries.next().await {
        match next {
            Ok(delivery) => match delivery.properties.correlation_id.as_deref() {
                Some(correlation_id) => {
                    if !pending.complete(correlation_id, delivery.body) {
                        debug!(%service, correlation_id, "Discarding reply with no pending call");
                    }
                }
                None => debug!(%service, "Discarding reply without correlation id"),
            },
            Err(err) => warn!(%service, error = %err, "Reply consumer error"),
        }
    }
    debug!(%service, "Reply consumer stopped");
}

/// Hands out one cached [`RpcClient`] per target service.
///
/// Services that call other services hold a factory and create clients from
/// it on demand.
pub struct RpcClientFactory {
    connection: Arc<ConnectionManager>,
    protocol: Arc<dyn RpcProtocol>,
    exchange: Option<String>,
    default_timeout: Duration,
    clients: DashMap<String, Arc<RpcClient>>,
    disposed: AtomicBool,
}

impl RpcClientFactory {
    pub fn new(connection: Arc<ConnectionManager>, protocol: Arc<dyn RpcProtocol>) -> Self {
        Self {
            connection,
            protocol,
            exchange: None,
            default_timeout: DEFAULT_CALL_TIMEOUT,
            clients: DashMap::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// RabbitMQ-backed factory for the given settings
    pub fn from_config(config: &BrokerConfig, protocol: Arc<dyn RpcProtocol>) -> Self {
        let mut factory = Self::new(ConnectionManager::from_config(config), protocol);
        factory.exchange = config.exchange_name.clone();
        factory
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Client for `service`, created on first use; names are case-insensitive
    pub fn create_client(&self, service: &str) -> Result<Arc<RpcClient>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RpcError::Disposed("RpcClientFactory"));
        }
        let key = service.trim().to_lowercase();
        if key.is_empty() {
            return Err(RpcError::InvalidArgument("service name must not be empty".into()));
        }

        let client = self.clients.entry(key.clone()).or_insert_with(|| {
            debug!(service = %key, "Creating RPC client");
            Arc::new(
                RpcClient::new(
                    Arc::clone(&self.connection),
                    Arc::clone(&self.protocol),
                    &key,
                    self.exchange.as_deref(),
                )
                .with_default_timeout(self.default_timeout),
            )
        });
        Ok(Arc::clone(client.value()))
    }

    /// Dispose every cached client. The shared connection stays open.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let clients: Vec<Arc<RpcClient>> = self.clients.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.clients.clear();
        for client in clients {
            client.dispose().await;
        }
    }
}

impl std::fmt::Debug for RpcClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientFactory")
            .field("protocol", &self.protocol.name())
            .field("exchange", &self.exchange)
            .field("clients", &self.clients.len())
            .finish()
    }
}
