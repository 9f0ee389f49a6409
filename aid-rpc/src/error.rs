use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerError;
use crate::message::RemoteError;
use crate::protocol::ProtocolError;

/// Result type alias for aid-rpc operations
pub type Result<T> = std::result::Result<T, RpcError>;

/// Error types surfaced by the connection manager, listener and client
#[derive(Error, Debug)]
pub enum RpcError {
    /// Broker transport errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Message serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration source errors (missing fields, unreadable files)
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration values that loaded but make no sense
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Retries exhausted or authentication refused
    #[error("Could not connect to the broker at {endpoint}")]
    ConnectFailed { endpoint: String },

    /// The call did not complete before its deadline
    #[error("RPC call '{service}.{method}' timed out after {}ms (correlation id: {correlation_id})", .timeout.as_millis())]
    Timeout {
        correlation_id: String,
        service: String,
        method: String,
        timeout: Duration,
    },

    /// The caller cancelled the call
    #[error("RPC call '{service}.{method}' was cancelled (correlation id: {correlation_id})")]
    Cancelled {
        correlation_id: String,
        service: String,
        method: String,
    },

    /// The server executed the request and reported an error
    #[error("RPC call failed on server (correlation id: {correlation_id}): [{}] {}", .error.kind(), .error.message)]
    Remote {
        correlation_id: String,
        error: RemoteError,
    },

    /// A reply arrived but could not be decoded or converted
    #[error("Invalid RPC response (correlation id: {correlation_id}): {reason}")]
    InvalidResponse {
        correlation_id: String,
        reason: String,
    },

    /// A freshly generated correlation id was already registered
    #[error("Correlation id collision: {0}")]
    CorrelationCollision(String),

    /// Use of a client, factory or connection manager after disposal
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Tokio join errors
    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Json(err) => Self::Serialization(err),
            ProtocolError::Unsupported(reason) => Self::InvalidArgument(reason),
        }
    }
}

impl RpcError {
    /// Correlation id of the call this error belongs to, if any
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Timeout { correlation_id, .. }
            | Self::Cancelled { correlation_id, .. }
            | Self::Remote { correlation_id, .. }
            | Self::InvalidResponse { correlation_id, .. } => Some(correlation_id),
            Self::CorrelationCollision(id) => Some(id),
            _ => None,
        }
    }

    /// The server-reported error, when the failure came from the remote side
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Check if error is recoverable (should be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Broker(err) => err.is_retryable(),
            Self::Timeout { .. } => true,
            Self::ConnectFailed { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_faults_carry_correlation_id() {
        let timeout = RpcError::Timeout {
            correlation_id: "abc".into(),
            service: "simple".into(),
            method: "delay".into(),
            timeout: Duration::from_millis(500),
        };
        assert_eq!(timeout.correlation_id(), Some("abc"));
        assert!(timeout.is_timeout());
        assert!(timeout.to_string().contains("500ms"));

        let remote = RpcError::Remote {
            correlation_id: "def".into(),
            error: RemoteError::new("boom", "ValueError"),
        };
        assert_eq!(remote.correlation_id(), Some("def"));
        assert_eq!(remote.remote_error().map(|e| e.kind()), Some("ValueError"));
        assert!(!remote.is_timeout());

        assert_eq!(RpcError::Disposed("RpcClient").correlation_id(), None);
    }

    #[test]
    fn recoverable_classification() {
        assert!(RpcError::Broker(BrokerError::Unreachable("refused".into())).is_recoverable());
        assert!(!RpcError::Broker(BrokerError::Authentication("denied".into())).is_recoverable());
        assert!(!RpcError::Disposed("RpcClient").is_recoverable());
    }
}
