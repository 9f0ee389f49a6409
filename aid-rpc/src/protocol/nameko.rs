use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::{error_types, normalize_number, CallArguments, Parameters, RemoteError, RpcRequest, RpcResponse};

use super::{routing_key, EncodedRequest, ProtocolError, RpcProtocol};

/// Compatibility protocol speaking the nameko RPC envelope
/// (`args`/`kwargs`/`context_data` requests, `result`/`error` responses).
#[derive(Debug, Clone, Copy, Default)]
pub struct NamekoProtocol;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RequestDto {
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Option<Map<String, Value>>,
    #[serde(default)]
    context_data: Map<String, Value>,
    /// Not part of nameko's envelope; honoured when a publisher includes it
    #[serde(default, skip_serializing)]
    method: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ResponseDto {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Map<String, Value>>,
}

fn text_field(error: &Map<String, Value>, key: &str) -> Option<String> {
    match error.get(key)? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

impl RpcProtocol for NamekoProtocol {
    fn name(&self) -> &'static str {
        "nameko"
    }

    fn default_exchange_name(&self) -> &'static str {
        "nameko-rpc"
    }

    fn encode_request(
        &self,
        service: &str,
        method: &str,
        arguments: &CallArguments,
    ) -> Result<EncodedRequest, ProtocolError> {
        let request = RequestDto {
            args: arguments.positional.clone(),
            kwargs: Some(arguments.named.clone().normalized().into_map()),
            context_data: Map::new(),
            method: None,
        };
        Ok(EncodedRequest {
            routing_key: routing_key(service, method),
            body: serde_json::to_vec(&request)?,
        })
    }

    fn decode_response(&self, body: &[u8]) -> Result<RpcResponse, ProtocolError> {
        let dto: Option<ResponseDto> = serde_json::from_slice(body)?;
        let Some(dto) = dto else {
            return Ok(RpcResponse::failure(RemoteError::new(
                "Empty response from Nameko",
                error_types::PROTOCOL_ERROR,
            )));
        };

        match dto.error {
            Some(error) => Ok(RpcResponse::failure(RemoteError {
                message: text_field(&error, "value").unwrap_or_else(|| "Unknown error".into()),
                error_type: Some(text_field(&error, "exc_type").unwrap_or_else(|| "NamekoError".into())),
                stack_trace: text_field(&error, "exc_tb"),
            })),
            None => Ok(RpcResponse::success(dto.result.map(normalize_number))),
        }
    }

    fn decode_request(&self, body: &[u8], routing_key: &str) -> Result<RpcRequest, ProtocolError> {
        let dto: Option<RequestDto> = serde_json::from_slice(body)?;
        let dto = dto.unwrap_or_default();

        let method = dto
            .method
            .filter(|method| !method.trim().is_empty())
            .unwrap_or_else(|| match routing_key.rsplit_once('.') {
                Some((_, method)) => method.to_string(),
                None => String::new(),
            });

        let parameters = Parameters::from(dto.kwargs.unwrap_or_default()).normalized();
        let positional = dto.args.into_iter().map(normalize_number).collect();
        Ok(RpcRequest::new(method, parameters).with_positional(positional))
    }

    fn encode_response(&self, response: &RpcResponse) -> Result<Vec<u8>, ProtocolError> {
        let dto = match &response.error {
            None => ResponseDto {
                result: response.result.clone(),
                error: None,
            },
            Some(error) => {
                let mut fields = Map::new();
                fields.insert("exc_type".into(), Value::from(error.kind()));
                fields.insert("value".into(), Value::from(error.message.as_str()));
                if let Some(trace) = error.stack_trace.as_deref().filter(|trace| !trace.is_empty()) {
                    fields.insert("exc_tb".into(), Value::from(trace));
                }
                ResponseDto {
                    result: None,
                    error: Some(fields),
                }
            }
        };
        Ok(serde_json::to_vec(&dto)?)
    }
}
