use crate::message::{error_types, normalize_number, CallArguments, RemoteError, RpcRequest, RpcResponse};

use super::{routing_key, EncodedRequest, ProtocolError, RpcProtocol};

/// Native protocol: `{"Method", "Parameters"}` requests and
/// `{"Result", "Error"}` responses on the `aid_rpc` topic exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonProtocol;

impl RpcProtocol for JsonProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn default_exchange_name(&self) -> &'static str {
        "aid_rpc"
    }

    fn encode_request(
        &self,
        service: &str,
        method: &str,
        arguments: &CallArguments,
    ) -> Result<EncodedRequest, ProtocolError> {
        if !arguments.positional.is_empty() {
            return Err(ProtocolError::Unsupported(
                "the json protocol only carries named parameters".into(),
            ));
        }
        let request = RpcRequest::new(method.to_lowercase(), arguments.named.clone());
        Ok(EncodedRequest {
            routing_key: routing_key(service, method),
            body: serde_json::to_vec(&request)?,
        })
    }

    fn decode_response(&self, body: &[u8]) -> Result<RpcResponse, ProtocolError> {
        let response: Option<RpcResponse> = if body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            serde_json::from_slice(body)?
        };
        Ok(match response {
            Some(mut response) => {
                response.result = response.result.map(normalize_number);
                response
            }
            None => RpcResponse::failure(RemoteError::new("Empty response body", error_types::PROTOCOL_ERROR)),
        })
    }

    fn decode_request(&self, body: &[u8], _routing_key: &str) -> Result<RpcRequest, ProtocolError> {
        let mut request: RpcRequest = serde_json::from_slice(body)?;
        request.parameters = request.parameters.normalized();
        Ok(request)
    }

    fn encode_response(&self, response: &RpcResponse) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(response)?)
    }
}
