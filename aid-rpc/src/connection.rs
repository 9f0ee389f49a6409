use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::broker::amqp::AmqpConnector;
use crate::broker::{BrokerChannel, BrokerConnection, BrokerError, ConnectionEvent, Connector};
use crate::config::BrokerConfig;
use crate::error::{Result, RpcError};

/// How often and how patiently to (re)connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts per `connect` call
    pub retry_count: u32,
    /// Fixed delay between attempts
    pub recovery_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            recovery_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disposed,
}

/// Owns the single broker connection, retries and recovers it, and mints channels.
///
/// Connect attempts are serialized: a caller arriving while another connect
/// is in flight waits for it and then re-checks, instead of opening a second
/// connection.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    connect_lock: Mutex<()>,
    connecting: AtomicBool,
    disposed: AtomicBool,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: RetryPolicy) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            connector,
            policy,
            connection: RwLock::new(None),
            connect_lock: Mutex::new(()),
            connecting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// RabbitMQ connection manager for the given settings
    pub fn from_config(config: &BrokerConfig) -> Arc<Self> {
        let name = config
            .connection_name
            .clone()
            .unwrap_or_else(|| format!("aid-rpc-{}", uuid::Uuid::new_v4().simple()));
        let connector = AmqpConnector::new(config.amqp_uri(), name);
        Self::new(Arc::new(connector), config.retry_policy())
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    pub async fn state(&self) -> ConnectionState {
        if self.disposed.load(Ordering::SeqCst) {
            ConnectionState::Disposed
        } else if self.is_connected().await {
            ConnectionState::Connected
        } else if self.connecting.load(Ordering::SeqCst) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|connection| connection.is_open())
            .unwrap_or(false)
    }

    /// Establish the connection with retries.
    ///
    /// Returns `true` when connected (immediately, if already connected) and
    /// `false` once retries are exhausted, authentication is refused, or the
    /// manager has been closed.
    pub async fn connect(&self) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            warn!("Connect requested on a closed connection manager");
            return false;
        }
        if self.is_connected().await {
            return true;
        }

        let _guard = self.connect_lock.lock().await;
        if self.is_connected().await {
            return true;
        }
        let _connecting = ConnectingFlag::raise(&self.connecting);

        let endpoint = self.connector.endpoint();
        for attempt in 1..=self.policy.retry_count {
            if self.disposed.load(Ordering::SeqCst) {
                return false;
            }
            self.dispose_stale().await;

            debug!(%endpoint, attempt, "Connecting to broker");
            match self.connector.connect().await {
                Ok(connection) if connection.is_open() => {
                    connection.set_event_handler(self.event_handler(endpoint.clone()));
                    *self.connection.write().await = Some(connection);
                    info!(%endpoint, attempt, "Connected to broker");
                    return true;
                }
                Ok(_) => {
                    warn!(%endpoint, attempt, "Broker returned a connection that is already closed");
                }
                Err(BrokerError::Authentication(reason)) => {
                    error!(%endpoint, %reason, "Broker refused credentials, giving up");
                    return false;
                }
                Err(err) => {
                    warn!(
                        %endpoint,
                        attempt,
                        retry_count = self.policy.retry_count,
                        error = %err,
                        "Connection attempt failed"
                    );
                }
            }

            if attempt < self.policy.retry_count {
                tokio::time::sleep(self.policy.recovery_interval).await;
            }
        }

        error!(
            %endpoint,
            retry_count = self.policy.retry_count,
            "Could not connect to the broker after all retries"
        );
        false
    }

    /// Open a channel, reconnecting first if needed
    pub async fn new_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RpcError::Disposed("ConnectionManager"));
        }
        if !self.is_connected().await {
            warn!("Broker connection not available, reconnecting before opening a channel");
            if !self.connect().await {
                return Err(RpcError::ConnectFailed {
                    endpoint: self.connector.endpoint(),
                });
            }
        }

        let connection = self
            .connection
            .read()
            .await
            .clone()
            .filter(|connection| connection.is_open())
            .ok_or_else(|| BrokerError::Closed("connection lost while opening a channel".into()))?;
        let channel = connection.create_channel().await?;
        debug!("Opened broker channel");
        Ok(channel)
    }

    /// Close the connection. The manager cannot be reused afterwards.
    pub async fn close(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.connect_lock.lock().await;
        self.dispose_stale().await;
        info!(endpoint = %self.connector.endpoint(), "Broker connection closed");
    }

    async fn dispose_stale(&self) {
        let stale = self.connection.write().await.take();
        if let Some(connection) = stale {
            if let Err(err) = connection.close().await {
                debug!(error = %err, "Error while closing stale connection");
            }
        }
    }

    fn event_handler(&self, endpoint: String) -> crate::broker::EventHandler {
        let manager = self.this.clone();
        let runtime = tokio::runtime::Handle::try_current().ok();
        Arc::new(move |event: ConnectionEvent| {
            match &event {
                ConnectionEvent::Blocked(reason) => warn!(%endpoint, %reason, "Broker connection blocked"),
                ConnectionEvent::Unblocked => info!(%endpoint, "Broker connection unblocked"),
                ConnectionEvent::CallbackFault(reason) => {
                    error!(%endpoint, %reason, "Broker connection callback fault")
                }
                ConnectionEvent::Shutdown(reason) => {
                    warn!(%endpoint, %reason, "Broker connection shut down");
                    if let (Some(manager), Some(runtime)) = (manager.upgrade(), runtime.as_ref()) {
                        if !manager.disposed.load(Ordering::SeqCst) {
                            runtime.spawn(async move {
                                if !manager.connect().await {
                                    error!("Background reconnect after shutdown failed");
                                }
                            });
                        }
                    }
                }
            }
        })
    }
}

/// Marks a connect in progress for [`ConnectionManager::state`], cleared on every exit path
struct ConnectingFlag<'a>(&'a AtomicBool);

impl<'a> ConnectingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ConnectingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.connector.endpoint())
            .field("policy", &self.policy)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}
