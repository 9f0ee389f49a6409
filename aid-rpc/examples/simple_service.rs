//! Serves `SimpleService`, `NamedService` and `ProxyService` over RabbitMQ.
//!
//! ```text
//! RUST_LOG=aid_rpc=debug cargo run --example simple_service
//! ```
//!
//! Broker settings come from `config.toml` (if present) and `RPC_RABBITMQ__*`
//! environment variables. Stop with Ctrl-C.

use std::sync::Arc;

use aid_rpc::{
    rpc_service, BrokerConfig, ConnectionManager, EndpointRegistry, JsonProtocol, ListenerOptions,
    RpcClientFactory, RpcError, RpcListener,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
pub struct DivideByZero;

impl std::fmt::Display for DivideByZero {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("attempted to divide by zero")
    }
}

#[derive(Serialize)]
pub struct Quotient {
    pub value: i64,
    pub remainder: i64,
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
    fn divide(&self, a: i64, b: i64) -> Result<Quotient, DivideByZero> {
        if b == 0 {
            return Err(DivideByZero);
        }
        Ok(Quotient {
            value: a / b,
            remainder: a % b,
        })
    }

    #[rpc_callable]
    async fn delay(&self, #[rpc_default(1000)] millis: u64) -> u64 {
        tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
        millis
    }
}

#[derive(Default)]
pub struct NamedService;

#[rpc_service(name = "just_name_me")]
impl NamedService {
    #[rpc_callable(alias = "and_me")]
    fn subtract(&self, a: i64, b: i64) -> i64 {
        a - b
    }
}

pub struct ProxyService {
    clients: Arc<RpcClientFactory>,
}

#[rpc_service]
impl ProxyService {
    #[rpc_callable]
    async fn multiply_string(&self, a: i64, b: i64) -> Result<String, RpcError> {
        let simple = self.clients.create_client("simple")?;
        let product: i64 = simple.call("multiple", serde_json::json!({"a": a, "b": b})).await?;
        Ok(format!("{a} * {b} = {product}"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = BrokerConfig::load("config")?;
    let connection = ConnectionManager::from_config(&config);
    let clients = Arc::new(RpcClientFactory::from_config(&config, Arc::new(JsonProtocol)));

    let proxy_clients = Arc::clone(&clients);
    let registry = EndpointRegistry::builder()
        .default_service::<SimpleService>()
        .default_service::<NamedService>()
        .service(move || ProxyService {
            clients: Arc::clone(&proxy_clients),
        })
        .build();
    info!(services = ?registry.list_services(), "Services registered");

    let listener = RpcListener::new(
        Arc::clone(&connection),
        Arc::new(registry),
        Arc::new(JsonProtocol),
        ListenerOptions::from_config(&config),
    );
    listener.start().await?;
    info!(exchange = listener.exchange(), "Listening, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    listener.stop().await;
    clients.dispose().await;
    clients.connection().close().await;
    connection.close().await;
    Ok(())
}
