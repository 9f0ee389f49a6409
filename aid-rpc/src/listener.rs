//! Server side of the engine.
//!
//! For every registered service the listener declares the exchange, a queue
//! named after the service and its binding, then consumes with manual
//! acknowledgement. Each delivery is decoded, dispatched and answered on the
//! caller's reply queue; the delivery is acknowledged only once the reply has
//! been published.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerChannel, Delivery, DeliveryStream, MessageProperties, QueueSpec, SerializedPublisher};
use crate::cancel::CancellationToken;
use crate::config::BrokerConfig;
use crate::connection::ConnectionManager;
use crate::dispatcher::RequestDispatcher;
use crate::error::{Result, RpcError};
use crate::message::{error_types, RemoteError, RpcResponse};
use crate::protocol::RpcProtocol;
use crate::registry::{EndpointRegistry, ServiceRegistration};

/// Queue lifetime policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerMode {
    /// Durable queues that outlive the listener
    #[default]
    Server,
    /// Durable queues removed by the broker once the listener goes away
    Gateway,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Exchange to bind to; the protocol's default when unset
    pub exchange: Option<String>,
    pub mode: ListenerMode,
    /// Unacknowledged deliveries per service
    pub prefetch_count: u16,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            exchange: None,
            mode: ListenerMode::Server,
            prefetch_count: 1,
        }
    }
}

impl ListenerOptions {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            exchange: config.exchange_name.clone(),
            mode: ListenerMode::Server,
            prefetch_count: config.prefetch_count,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_mode(mut self, mode: ListenerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }
}

/// Per-service lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    NotStarted,
    TopologyReady,
    Consuming,
    Stopped,
}

pub struct RpcListener {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

struct Shared {
    connection: Arc<ConnectionManager>,
    dispatcher: RequestDispatcher,
    protocol: Arc<dyn RpcProtocol>,
    mode: ListenerMode,
    prefetch_count: u16,
    exchange: String,
    states: DashMap<String, ListenerState>,
    shutdown: CancellationToken,
}

/// An open consumer for one service
struct ServiceSession {
    channel: Arc<dyn BrokerChannel>,
    deliveries: DeliveryStream,
}

impl RpcListener {
    pub fn new(
        connection: Arc<ConnectionManager>,
        registry: Arc<EndpointRegistry>,
        protocol: Arc<dyn RpcProtocol>,
        options: ListenerOptions,
    ) -> Self {
        let exchange = options
            .exchange
            .filter(|exchange| !exchange.trim().is_empty())
            .unwrap_or_else(|| protocol.default_exchange_name().to_string());
        let states = registry
            .list_services()
            .into_iter()
            .map(|service| (service.to_string(), ListenerState::NotStarted))
            .collect();

        Self {
            shared: Arc::new(Shared {
                connection,
                dispatcher: RequestDispatcher::new(registry),
                protocol,
                mode: options.mode,
                prefetch_count: options.prefetch_count.max(1),
                exchange,
                states,
                shutdown: CancellationToken::new(),
            }),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.shared.exchange
    }

    pub fn mode(&self) -> ListenerMode {
        self.shared.mode
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        self.shared.dispatcher.registry()
    }

    pub fn state(&self, service: &str) -> Option<ListenerState> {
        self.shared
            .states
            .get(&service.to_lowercase())
            .map(|state| *state)
    }

    /// Queue a registered service is (or would be) consumed from
    pub fn queue_name(&self, service: &str) -> Option<String> {
        self.registry()
            .registration(service)
            .map(|registration| registration.queue_name(&self.shared.exchange))
    }

    /// Declare topology and start consuming for every registered service.
    ///
    /// Fails when the broker cannot be reached. A service whose topology
    /// cannot be declared is logged and retried in the background.
    pub async fn start(&self) -> Result<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(RpcError::Disposed("RpcListener"));
        }
        let registry = Arc::clone(self.registry());
        if registry.is_empty() {
            warn!("No RPC services registered, listener has nothing to consume");
            return Ok(());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("RPC listener already started");
            return Ok(());
        }

        if !self.shared.connection.connect().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(RpcError::ConnectFailed {
                endpoint: self.shared.connection.endpoint(),
            });
        }

        let mut tasks = self.tasks.lock().await;
        for service in registry.list_services() {
            let Some(registration) = registry.registration(service).cloned() else {
                continue;
            };
            let session = match self.shared.open_session(&registration).await {
                Ok(session) => Some(session),
                Err(err) => {
                    error!(
                        service = %registration.service_name,
                        error = %err,
                        "Failed to set up service topology, retrying in the background"
                    );
                    None
                }
            };
            let shared = Arc::clone(&self.shared);
            tasks.push(tokio::spawn(shared.serve(registration, session)));
        }

        info!(
            exchange = %self.shared.exchange,
            protocol = self.shared.protocol.name(),
            services = tasks.len(),
            "RPC listener started"
        );
        Ok(())
    }

    /// Stop consuming. In-flight requests are answered before each
    /// service's channel is closed.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Listener task ended abnormally");
            }
        }
        for mut state in self.shared.states.iter_mut() {
            *state = ListenerState::Stopped;
        }
        info!(exchange = %self.shared.exchange, "RPC listener stopped");
    }
}

impl Drop for RpcListener {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for RpcListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcListener")
            .field("exchange", &self.shared.exchange)
            .field("mode", &self.shared.mode)
            .field("protocol", &self.shared.protocol.name())
            .finish()
    }
}

impl Shared {
    fn set_state(&self, service: &str, state: ListenerState) {
        self.states.insert(service.to_string(), state);
    }

    async fn open_session(&self, registration: &ServiceRegistration) -> Result<ServiceSession> {
        let channel = self.connection.new_channel().await?;
        match self.declare_and_consume(&channel, registration).await {
            Ok(deliveries) => Ok(ServiceSession { channel, deliveries }),
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Error closing channel after failed setup");
                }
                Err(err)
            }
        }
    }

    async fn declare_and_consume(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        registration: &ServiceRegistration,
    ) -> Result<DeliveryStream> {
        let service = registration.service_name.as_str();
        channel
            .declare_exchange(&self.exchange, self.protocol.exchange_kind(), true)
            .await?;

        let spec = QueueSpec::durable(registration.queue_name(&self.exchange))
            .auto_delete(self.mode == ListenerMode::Gateway);
        let queue = channel.declare_queue(&spec).await?;
        let binding_key = registration.binding_key(self.protocol.as_ref());
        channel.bind_queue(&queue, &self.exchange, &binding_key).await?;
        self.set_state(service, ListenerState::TopologyReady);
        debug!(service, %queue, %binding_key, exchange = %self.exchange, "Service topology declared");

        channel.set_prefetch(self.prefetch_count).await?;
        let consumer_tag = format!("{queue}-{}", Uuid::new_v4().simple());
        let deliveries = channel.consume(&queue, &consumer_tag, false).await?;
        self.set_state(service, ListenerState::Consuming);
        info!(service, %queue, prefetch = self.prefetch_count, "Consuming RPC requests");
        Ok(deliveries)
    }

    /// Consume one service until shutdown, re-establishing the topology
    /// whenever the delivery stream ends
    async fn serve(self: Arc<Self>, registration: ServiceRegistration, mut session: Option<ServiceSession>) {
        let service = registration.service_name.clone();
        let recovery_interval = self.connection.policy().recovery_interval;

        loop {
            let ServiceSession { channel, mut deliveries } = match session.take() {
                Some(session) => session,
                None => match self.open_session(&registration).await {
                    Ok(session) => session,
                    Err(err) => {
                        warn!(%service, error = %err, "Could not re-establish consumer");
                        if self.pause(recovery_interval).await {
                            return;
                        }
                        continue;
                    }
                },
            };

            let publisher = Arc::new(SerializedPublisher::new(Arc::clone(&channel)));
            let mut in_flight = JoinSet::new();
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Err(err) = finished {
                            error!(%service, error = %err, "Request handler task failed");
                        }
                    }
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            let shared = Arc::clone(&self);
                            let publisher = Arc::clone(&publisher);
                            let service = service.clone();
                            in_flight.spawn(async move {
                                shared.handle_delivery(&service, &publisher, delivery).await;
                            });
                        }
                        Some(Err(err)) => {
                            warn!(%service, error = %err, "Consumer reported an error");
                            break;
                        }
                        None => break,
                    }
                }
            }

            while let Some(finished) = in_flight.join_next().await {
                if let Err(err) = finished {
                    error!(%service, error = %err, "Request handler task failed");
                }
            }
            drop(deliveries);

            if self.shutdown.is_cancelled() {
                if let Err(err) = channel.close().await {
                    debug!(%service, error = %err, "Error closing service channel");
                }
                self.set_state(&service, ListenerState::Stopped);
                debug!(%service, "Service consumer stopped");
                return;
            }

            self.set_state(&service, ListenerState::NotStarted);
            warn!(
                %service,
                recovery_ms = recovery_interval.as_millis() as u64,
                "Consumer stream ended, re-establishing after the recovery interval"
            );
            if self.pause(recovery_interval).await {
                return;
            }
        }
    }

    /// Sleep for `interval`; true when shutdown was requested meanwhile
    async fn pause(&self, interval: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            _ = self.shutdown.cancelled() => true,
        }
    }

    async fn handle_delivery(&self, service: &str, publisher: &SerializedPublisher, delivery: Delivery) {
        let channel = publisher.channel();
        let delivery_tag = delivery.delivery_tag;
        let properties = &delivery.properties;

        let reply_to = properties.reply_to.as_deref().filter(|value| !value.is_empty());
        let correlation_id = properties.correlation_id.as_deref().filter(|value| !value.is_empty());
        let (Some(reply_to), Some(correlation_id)) = (reply_to, correlation_id) else {
            warn!(
                service,
                delivery_tag,
                routing_key = %delivery.routing_key,
                "Request has no reply-to address or correlation id, rejecting"
            );
            if let Err(err) = channel.reject(delivery_tag, false).await {
                warn!(service, delivery_tag, error = %err, "Failed to reject delivery");
            }
            return;
        };

        let response = match self.protocol.decode_request(&delivery.body, &delivery.routing_key) {
            Ok(request) if request.method.trim().is_empty() => {
                warn!(service, correlation_id, "Request carries no method name");
                RpcResponse::failure(RemoteError::new("Invalid Request Format", error_types::PROTOCOL_ERROR))
            }
            Ok(request) => {
                debug!(service, method = %request.method, correlation_id, "Dispatching RPC request");
                self.dispatcher.dispatch_request(service, &request).await
            }
            Err(err) => {
                warn!(service, correlation_id, error = %err, "Could not decode RPC request");
                RpcResponse::failure(RemoteError::new(err.to_string(), error_types::PROTOCOL_ERROR))
            }
        };

        let body = match self.protocol.encode_response(&response) {
            Ok(body) => body,
            Err(err) => {
                error!(service, correlation_id, error = %err, "Could not encode RPC response");
                let fallback = RpcResponse::failure(RemoteError::new(
                    format!("Failed to serialize response: {err}"),
                    error_types::SERIALIZATION_ERROR,
                ));
                match self.protocol.encode_response(&fallback) {
                    Ok(body) => body,
                    Err(_) => {
                        if let Err(err) = channel.reject(delivery_tag, false).await {
                            warn!(service, delivery_tag, error = %err, "Failed to reject delivery");
                        }
                        return;
                    }
                }
            }
        };

        let reply_properties = MessageProperties::default()
            .with_correlation_id(correlation_id)
            .with_content_type(self.protocol.content_type());
        match publisher.publish("", reply_to, &reply_properties, &body).await {
            Ok(()) => {
                if let Err(err) = channel.ack(delivery_tag).await {
                    warn!(service, correlation_id, error = %err, "Failed to acknowledge request");
                }
            }
            Err(err) => {
                error!(
                    critical = true,
                    service,
                    correlation_id,
                    reply_to,
                    error = %err,
                    "Failed to publish RPC reply; the call ran but its result is lost"
                );
                if let Err(err) = channel.reject(delivery_tag, false).await {
                    warn!(service, delivery_tag, error = %err, "Failed to reject delivery");
                }
            }
        }
    }
}
