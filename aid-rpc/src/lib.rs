//! # aid-rpc - RPC over RabbitMQ
//!
//! aid-rpc lets independent processes expose and call named methods through
//! a message broker. Services register their methods in an
//! [`EndpointRegistry`]; an [`RpcListener`] declares one queue per service and
//! dispatches deliveries to them; an [`RpcClient`] publishes requests and
//! matches replies to callers by correlation id.
//!
//! Two wire protocols ship with the crate: the native [`JsonProtocol`] and
//! the nameko-compatible [`NamekoProtocol`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use aid_rpc::{rpc_service, BrokerConfig, ConnectionManager, EndpointRegistry,
//!               JsonProtocol, ListenerOptions, RpcClientFactory, RpcListener};
//!
//! #[derive(Default)]
//! pub struct SimpleService;
//!
//! #[rpc_service]
//! impl SimpleService {
//!     #[rpc_callable]
//!     fn multiple(&self, a: i64, b: i64) -> i64 {
//!         a * b
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> aid_rpc::Result<()> {
//!     let config = BrokerConfig::load("config")?;
//!     let connection = ConnectionManager::from_config(&config);
//!     let registry = EndpointRegistry::builder()
//!         .default_service::<SimpleService>()
//!         .build();
//!
//!     let listener = RpcListener::new(
//!         connection.clone(),
//!         Arc::new(registry),
//!         Arc::new(JsonProtocol),
//!         ListenerOptions::from_config(&config),
//!     );
//!     listener.start().await?;
//!
//!     let clients = RpcClientFactory::new(connection, Arc::new(JsonProtocol));
//!     let simple = clients.create_client("simple")?;
//!     let product: i64 = simple.call("multiple", serde_json::json!({"a": 5, "b": 10})).await?;
//!     assert_eq!(product, 50);
//!
//!     listener.stop().await;
//!     Ok(())
//! }
//! ```

extern crate self as aid_rpc;

pub mod broker;
pub mod cancel;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod listener;
pub mod message;
pub mod protocol;
pub mod registry;

pub use cancel::CancellationToken;
pub use client::{CallOptions, RpcClient, RpcClientFactory, DEFAULT_CALL_TIMEOUT};
pub use config::BrokerConfig;
pub use connection::{ConnectionManager, ConnectionState, RetryPolicy};
pub use dispatcher::RequestDispatcher;
pub use error::{Result, RpcError};
pub use handler::{Reply, ServiceFault};
pub use listener::{ListenerMode, ListenerOptions, ListenerState, RpcListener};
pub use message::{CallArguments, Parameters, RemoteError, RpcRequest, RpcResponse};
pub use protocol::{JsonProtocol, NamekoProtocol, RpcProtocol};
pub use registry::{EndpointRegistry, MethodTable, RegistryBuilder, RpcService};

pub use aid_rpc_macros::{rpc_callable, rpc_service};

#[doc(hidden)]
pub mod __private {
    pub use inventory;
}
