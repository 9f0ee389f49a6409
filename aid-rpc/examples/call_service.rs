//! Calls the services started by the `simple_service` example.
//!
//! ```text
//! cargo run --example call_service
//! ```

use std::sync::Arc;
use std::time::Duration;

use aid_rpc::{BrokerConfig, CallArguments, CallOptions, JsonProtocol, RpcClientFactory, RpcError};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct Quotient {
    value: i64,
    remainder: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = BrokerConfig::load("config")?;
    let clients = Arc::new(
        RpcClientFactory::from_config(&config, Arc::new(JsonProtocol)).with_default_timeout(Duration::from_secs(10)),
    );

    let simple = clients.create_client("simple")?;
    let product: i64 = simple.call("multiple", json!({"a": 5, "b": 10})).await?;
    info!(product, "simple.multiple(5, 10)");

    let quotient: Quotient = simple.call("divide", json!({"a": 17, "b": 5})).await?;
    info!(value = quotient.value, remainder = quotient.remainder, "simple.divide(17, 5)");

    match simple.call::<Quotient>("divide", json!({"a": 1, "b": 0})).await {
        Err(RpcError::Remote { error, .. }) => info!(kind = error.kind(), message = %error.message, "Remote failure"),
        other => warn!(?other, "Expected a remote failure"),
    }

    let named = clients.create_client("just_name_me")?;
    let difference: i64 = named.call("and_me", json!({"a": 10, "b": 4})).await?;
    info!(difference, "just_name_me.and_me(10, 4)");

    let proxy = clients.create_client("proxy")?;
    let text: String = proxy.call("multiply_string", json!({"a": 5, "b": 6})).await?;
    info!(%text, "proxy.multiply_string(5, 6)");

    let slow = simple
        .call_with::<u64>(
            "delay",
            CallArguments::new().named("millis", 2000),
            CallOptions::default().with_timeout(Duration::from_millis(500)),
        )
        .await;
    match slow {
        Err(err) if err.is_timeout() => info!(%err, "Slow call timed out"),
        other => warn!(?other, "Expected a timeout"),
    }

    clients.dispose().await;
    clients.connection().close().await;
    Ok(())
}
