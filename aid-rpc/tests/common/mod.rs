#![allow(dead_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use aid_rpc::broker::memory::MemoryBroker;
use aid_rpc::{
    rpc_service, ConnectionManager, EndpointRegistry, ListenerOptions, RetryPolicy, RpcClientFactory, RpcError,
    RpcListener, RpcProtocol,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        retry_count: 3,
        recovery_interval: Duration::from_millis(20),
    }
}

/// A listener and a client factory sharing one connection to an in-memory broker
pub struct Harness {
    pub broker: MemoryBroker,
    pub connection: Arc<ConnectionManager>,
    pub listener: RpcListener,
    pub clients: Arc<RpcClientFactory>,
}

impl Harness {
    pub async fn start(protocol: Arc<dyn RpcProtocol>, options: ListenerOptions) -> Self {
        init_tracing();
        let broker = MemoryBroker::new();
        let connection = ConnectionManager::new(broker.connector(), fast_policy());
        let clients = Arc::new(RpcClientFactory::new(Arc::clone(&connection), Arc::clone(&protocol)));

        let proxy_clients = Arc::clone(&clients);
        let registry = EndpointRegistry::builder()
            .default_service::<SimpleService>()
            .default_service::<NamedService>()
            .service(move || ProxyService {
                clients: Arc::clone(&proxy_clients),
            })
            .build();

        let listener = RpcListener::new(Arc::clone(&connection), Arc::new(registry), protocol, options);
        listener.start().await.expect("listener starts");
        Self {
            broker,
            connection,
            listener,
            clients,
        }
    }

    pub async fn shutdown(self) {
        self.clients.dispose().await;
        self.listener.stop().await;
        self.connection.close().await;
    }
}

#[derive(Debug)]
pub struct DivideByZero;

impl fmt::Display for DivideByZero {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("attempted to divide by zero")
    }
}

#[derive(Default)]
pub struct SimpleService;

#[rpc_service]
impl SimpleService {
    #[rpc_callable]
    fn multiple(&self, a: i64, b: i64) -> i64 {
        a * b
    }

    #[rpc_callable]
    fn divide(&self, a: i64, b: i64) -> Result<i64, DivideByZero> {
        if b == 0 {
            Err(DivideByZero)
        } else {
            Ok(a / b)
        }
    }

    #[rpc_callable]
    async fn delay(&self, millis: u64) -> u64 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        millis
    }

    #[rpc_callable]
    fn greet(&self, name: String, #[rpc_default("Hello")] greeting: String, title: Option<String>) -> String {
        match title {
            Some(title) => format!("{greeting}, {title} {name}"),
            None => format!("{greeting}, {name}"),
        }
    }

    #[rpc_callable]
    fn echo(&self, value: Value) -> Value {
        value
    }

    #[rpc_callable]
    fn touch(&self) {}

    #[rpc_callable]
    fn explode(&self) -> i64 {
        panic!("kaboom")
    }

    /// Not callable: no marker
    pub fn helper(&self) -> i64 {
        7
    }
}

#[derive(Default)]
pub struct NamedService;

#[rpc_service(name = "just_name_me")]
impl NamedService {
    #[rpc_callable(alias = "and_me")]
    fn subtract(&self, a: i64, #[rpc_default(1)] b: i64) -> i64 {
        a - b
    }

    #[rpc_callable("shout")]
    fn upper(&self, text: String) -> String {
        text.to_uppercase()
    }
}

/// Calls `simple` on behalf of its own callers
pub struct ProxyService {
    clients: Arc<RpcClientFactory>,
}

#[rpc_service]
impl ProxyService {
    #[rpc_callable]
    async fn multiply_string(&self, a: i64, b: i64) -> Result<String, RpcError> {
        let simple = self.clients.create_client("simple")?;
        let product: i64 = simple.call("multiple", json!({"a": a, "b": b})).await?;
        Ok(format!("{a} * {b} = {product}"))
    }
}
