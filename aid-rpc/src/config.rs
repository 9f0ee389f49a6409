use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use lapin::uri::AMQPUri;
use serde::{Deserialize, Serialize};

use crate::connection::RetryPolicy;
use crate::error::{Result, RpcError};

/// Broker connection settings.
///
/// Loaded from the `rabbitmq` section of a config file and `RPC_RABBITMQ__*`
/// environment variables. Hostname and credentials have no defaults when
/// loading, so a deployment that forgets them fails at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    /// Exchange to publish on and bind to; the protocol default when unset
    pub exchange_name: Option<String>,
    pub retry_count: u32,
    /// Seconds between connection attempts
    pub recovery_interval: u64,
    pub prefetch_count: u16,
    pub connection_name: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            exchange_name: None,
            retry_count: 3,
            recovery_interval: 5,
            prefetch_count: 1,
            connection_name: None,
        }
    }
}

impl BrokerConfig {
    /// Load from an optional file (any format `config` understands, extension
    /// optional) layered under `RPC_` environment variables
    pub fn load(file: &str) -> Result<Self> {
        let builder = Self::defaults()?.add_source(File::with_name(file).required(false));
        Self::finish(builder)
    }

    /// Load from TOML text layered under `RPC_` environment variables
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let builder = Self::defaults()?.add_source(File::from_str(text, FileFormat::Toml));
        Self::finish(builder)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(Config::builder()
            .set_default("rabbitmq.port", 5672)?
            .set_default("rabbitmq.virtual_host", "/")?
            .set_default("rabbitmq.retry_count", 3)?
            .set_default("rabbitmq.recovery_interval", 5)?
            .set_default("rabbitmq.prefetch_count", 1)?)
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings = builder
            .add_source(
                Environment::with_prefix("RPC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: BrokerConfig = settings.get("rabbitmq")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(RpcError::InvalidConfig("hostname must not be empty".into()));
        }
        if self.port == 0 {
            return Err(RpcError::InvalidConfig("port must be greater than zero".into()));
        }
        if self.username.is_empty() {
            return Err(RpcError::InvalidConfig("username must not be empty".into()));
        }
        if self.retry_count == 0 {
            return Err(RpcError::InvalidConfig("retry_count must be at least 1".into()));
        }
        if self.prefetch_count == 0 {
            return Err(RpcError::InvalidConfig("prefetch_count must be at least 1".into()));
        }
        Ok(())
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_count: self.retry_count,
            recovery_interval: self.recovery_interval(),
        }
    }

    pub fn amqp_uri(&self) -> AMQPUri {
        let mut uri = AMQPUri::default();
        uri.authority.host = self.hostname.clone();
        uri.authority.port = self.port;
        uri.authority.userinfo.username = self.username.clone();
        uri.authority.userinfo.password = self.password.clone();
        uri.vhost = self.virtual_host.clone();
        uri
    }

    /// Configured exchange, or `default` when none is set
    pub fn exchange_or(&self, default: &str) -> String {
        self.exchange_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(default)
            .to_string()
    }
}
