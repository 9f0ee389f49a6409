//! Wire protocols.
//!
//! A protocol decides how a call is addressed on the broker (routing and
//! binding keys, exchange type) and how request/response envelopes look on
//! the wire. The engine is written against [`RpcProtocol`] only.

pub mod json;
pub mod nameko;

use std::fmt::Debug;

use thiserror::Error;

use crate::broker::ExchangeKind;
use crate::message::{CallArguments, RpcRequest, RpcResponse};

pub use json::JsonProtocol;
pub use nameko::NamekoProtocol;

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Unsupported(String),
}

/// An encoded outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRequest {
    pub routing_key: String,
    pub body: Vec<u8>,
}

pub trait RpcProtocol: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::Topic
    }

    fn default_exchange_name(&self) -> &'static str;

    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode_request(
        &self,
        service: &str,
        method: &str,
        arguments: &CallArguments,
    ) -> Result<EncodedRequest, ProtocolError>;

    fn decode_response(&self, body: &[u8]) -> Result<RpcResponse, ProtocolError>;

    /// Routing pattern a listener binds the service queue with
    fn service_binding_key(&self, service: &str) -> String {
        format!("{service}.*")
    }

    fn decode_request(&self, body: &[u8], routing_key: &str) -> Result<RpcRequest, ProtocolError>;

    fn encode_response(&self, response: &RpcResponse) -> Result<Vec<u8>, ProtocolError>;
}

/// `{service}.{method}`, with the method lower-cased
pub fn routing_key(service: &str, method: &str) -> String {
    format!("{service}.{}", method.to_lowercase())
}
