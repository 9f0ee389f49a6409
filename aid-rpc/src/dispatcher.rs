use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, error, Level};

use crate::handler::{ParameterSpec, ServiceFault};
use crate::message::{error_types, Parameters, RemoteError, RpcRequest, RpcResponse};
use crate::registry::EndpointRegistry;

/// Resolves an endpoint, binds arguments, invokes it and shapes the outcome
/// into an [`RpcResponse`]. Never fails: every error ends up in the envelope.
#[derive(Debug, Clone)]
pub struct RequestDispatcher {
    registry: Arc<EndpointRegistry>,
}

impl RequestDispatcher {
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Dispatch a call with named parameters only
    pub async fn dispatch(&self, service: &str, method: &str, parameters: &Parameters) -> RpcResponse {
        self.execute(service, method, &[], parameters).await
    }

    /// Dispatch a decoded request, including any positional arguments
    pub async fn dispatch_request(&self, service: &str, request: &RpcRequest) -> RpcResponse {
        self.execute(service, &request.method, &request.positional, &request.parameters)
            .await
    }

    async fn execute(&self, service: &str, method: &str, positional: &[Value], named: &Parameters) -> RpcResponse {
        let started = Instant::now();
        match self.invoke(service, method, positional, named).await {
            Ok(result) => {
                debug!(
                    service,
                    method,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "RPC method completed"
                );
                RpcResponse::success(result)
            }
            Err(mut failure) => {
                error!(
                    service,
                    method,
                    error_type = failure.kind(),
                    error = %failure.message,
                    "Error executing RPC method"
                );
                if !tracing::enabled!(Level::DEBUG) {
                    failure.stack_trace = None;
                }
                RpcResponse::failure(failure)
            }
        }
    }

    async fn invoke(
        &self,
        service: &str,
        method: &str,
        positional: &[Value],
        named: &Parameters,
    ) -> Result<Option<Value>, RemoteError> {
        let entry = self.registry.lookup(service, method).ok_or_else(|| {
            RemoteError::new(
                format!("Method '{method}' not found in service '{service}'"),
                error_types::METHOD_NOT_FOUND,
            )
        })?;

        let args = bind_arguments(entry.parameters(), positional, named)?;

        let instance = std::panic::catch_unwind(AssertUnwindSafe(|| entry.activate()))
            .map_err(|panic| panic_error(panic.as_ref()))?
            .map_err(|fault| {
                ServiceFault {
                    error_type: error_types::ACTIVATION_ERROR.to_string(),
                    ..fault
                }
                .into_remote()
            })?;

        match AssertUnwindSafe(entry.invoke(instance, args)).catch_unwind().await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err.into_remote()),
            Err(panic) => Err(panic_error(panic.as_ref())),
        }
    }
}

/// Order arguments by declared parameter: positional first, then by name
/// (case-insensitive), then the declared default, then `null` for nullable types
fn bind_arguments(
    specs: &[ParameterSpec],
    positional: &[Value],
    named: &Parameters,
) -> Result<Vec<Value>, RemoteError> {
    if positional.len() > specs.len() {
        return Err(RemoteError::new(
            format!(
                "Too many positional arguments: expected at most {}, got {}",
                specs.len(),
                positional.len()
            ),
            error_types::ARGUMENT_ERROR,
        ));
    }

    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            if let Some(value) = positional.get(index) {
                return Ok(value.clone());
            }
            let value = named.get(&spec.name);
            if let Some(value) = value.filter(|value| !value.is_null() || spec.nullable) {
                return Ok(value.clone());
            }
            if let Some(default) = &spec.default {
                return Ok(default.clone());
            }
            // An explicit null for a non-nullable type fails in decoding with the type name
            if spec.nullable || value.is_some() {
                return Ok(Value::Null);
            }
            Err(RemoteError::new(
                format!("Missing required parameter '{}'", spec.name),
                error_types::ARGUMENT_ERROR,
            ))
        })
        .collect()
}

fn panic_error(payload: &(dyn Any + Send)) -> RemoteError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "RPC method panicked".to_string());
    RemoteError::new(message, error_types::PANIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MethodTable, RpcService};
    use crate::Reply;
    use serde_json::json;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct InsufficientFunds {
        missing: i64,
    }

    impl fmt::Display for InsufficientFunds {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "missing {} credits", self.missing)
        }
    }

    struct SimpleService {
        activation: usize,
    }

    impl SimpleService {
        fn multiple(&self, a: i64, b: i64) -> i64 {
            a * b
        }

        fn greet(&self, name: String, greeting: String, title: Option<String>) -> String {
            match title {
                Some(title) => format!("{greeting}, {title} {name}"),
                None => format!("{greeting}, {name}"),
            }
        }

        fn withdraw(&self, amount: i64) -> Result<i64, InsufficientFunds> {
            if amount > 100 {
                Err(InsufficientFunds { missing: amount - 100 })
            } else {
                Ok(100 - amount)
            }
        }

        async fn delay(self: Arc<Self>, millis: u64) -> u64 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            millis
        }
    }

    impl RpcService for SimpleService {
        fn register_methods(methods: &mut MethodTable<Self>) {
            methods
                .callable("multiple")
                .param::<i64>("a")
                .param::<i64>("b")
                .sync(|this, (a, b): (i64, i64)| Reply(this.multiple(a, b)));
            methods
                .callable("greet")
                .param::<String>("name")
                .param_or("greeting", "Hello".to_string())
                .param::<Option<String>>("title")
                .sync(|this, (name, greeting, title): (String, String, Option<String>)| {
                    Reply(this.greet(name, greeting, title))
                });
            methods
                .callable("withdraw")
                .param::<i64>("amount")
                .sync(|this, (amount,): (i64,)| this.withdraw(amount));
            methods
                .callable("activation")
                .sync(|this, (): ()| Reply(this.activation));
            methods
                .callable("explode")
                .sync(|_, (): ()| -> Reply<i64> { panic!("kaboom") });
            methods
                .callable("delay")
                .param::<u64>("millis")
                .future(|this, (millis,): (u64,)| async move { Reply(this.delay(millis).await) });
            methods.callable("nothing").sync(|_, (): ()| ());
        }
    }

    fn dispatcher() -> (RequestDispatcher, Arc<AtomicUsize>) {
        let activations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&activations);
        let registry = EndpointRegistry::builder()
            .service(move || SimpleService {
                activation: counter.fetch_add(1, Ordering::SeqCst) + 1,
            })
            .build();
        (RequestDispatcher::new(Arc::new(registry)), activations)
    }

    fn params(value: Value) -> Parameters {
        Parameters::from_serializable(value).unwrap()
    }

    #[tokio::test]
    async fn dispatch_matches_direct_invocation() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher
            .dispatch("simple", "multiple", &params(json!({"a": 5, "b": 10})))
            .await;
        assert!(response.is_success());
        assert_eq!(response.result, Some(json!(50)));

        let response = dispatcher
            .dispatch("Simple", "MULTIPLE", &params(json!({"A": 6, "B": 7})))
            .await;
        assert_eq!(response.result, Some(json!(42)));
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher.dispatch("simple", "ghost", &Parameters::new()).await;
        let error = response.error.unwrap();
        assert_eq!(error.kind(), "MethodNotFound");
        assert_eq!(error.message, "Method 'ghost' not found in service 'simple'");
        assert!(response.result.is_none());
    }

    #[tokio::test]
    async fn missing_and_defaulted_parameters() {
        let (dispatcher, _) = dispatcher();

        let response = dispatcher
            .dispatch("simple", "multiple", &params(json!({"a": 5})))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.kind(), "ArgumentError");
        assert_eq!(error.message, "Missing required parameter 'b'");

        let response = dispatcher
            .dispatch("simple", "greet", &params(json!({"name": "Ada"})))
            .await;
        assert_eq!(response.result, Some(json!("Hello, Ada")));

        let response = dispatcher
            .dispatch(
                "simple",
                "greet",
                &params(json!({"name": "Ada", "greeting": "Hi", "title": "Dr."})),
            )
            .await;
        assert_eq!(response.result, Some(json!("Hi, Dr. Ada")));
    }

    #[tokio::test]
    async fn explicit_null_binds_to_nullable_parameters_only() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher
            .dispatch("simple", "greet", &params(json!({"name": "Ada", "title": null})))
            .await;
        assert_eq!(response.result, Some(json!("Hello, Ada")));

        let response = dispatcher
            .dispatch("simple", "greet", &params(json!({"name": "Ada", "greeting": null})))
            .await;
        assert_eq!(response.result, Some(json!("Hello, Ada")));

        let response = dispatcher
            .dispatch("simple", "multiple", &params(json!({"a": null, "b": 2})))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.kind(), "ArgumentError");
        assert!(error.message.starts_with("Failed to deserialize parameter 'a'"));
    }

    #[tokio::test]
    async fn mistyped_parameter() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher
            .dispatch("simple", "multiple", &params(json!({"a": "five", "b": 2})))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.kind(), "ArgumentError");
        assert!(error
            .message
            .starts_with("Failed to deserialize parameter 'a'. Expected: i64. Error:"));
    }

    #[tokio::test]
    async fn service_errors_keep_their_type() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher
            .dispatch("simple", "withdraw", &params(json!({"amount": 130})))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.kind(), "InsufficientFunds");
        assert_eq!(error.message, "missing 30 credits");

        let response = dispatcher
            .dispatch("simple", "withdraw", &params(json!({"amount": 30})))
            .await;
        assert_eq!(response.result, Some(json!(70)));
    }

    #[tokio::test]
    async fn panics_are_captured() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher.dispatch("simple", "explode", &Parameters::new()).await;
        let error = response.error.unwrap();
        assert_eq!(error.kind(), "Panic");
        assert_eq!(error.message, "kaboom");
    }

    #[tokio::test]
    async fn one_instance_per_dispatch() {
        let (dispatcher, activations) = dispatcher();
        for expected in 1..=3 {
            let response = dispatcher.dispatch("simple", "activation", &Parameters::new()).await;
            assert_eq!(response.result, Some(json!(expected)));
        }
        assert_eq!(activations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn async_methods_are_awaited() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher
            .dispatch("simple", "delay", &params(json!({"millis": 5})))
            .await;
        assert_eq!(response.result, Some(json!(5)));
    }

    #[tokio::test]
    async fn unit_methods_have_no_result() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher.dispatch("simple", "nothing", &Parameters::new()).await;
        assert!(response.is_success());
        assert_eq!(response.result, None);
    }

    #[tokio::test]
    async fn positional_then_named() {
        let (dispatcher, _) = dispatcher();
        let request = RpcRequest::new("multiple", params(json!({"b": 10}))).with_positional(vec![json!(5)]);
        let response = dispatcher.dispatch_request("simple", &request).await;
        assert_eq!(response.result, Some(json!(50)));

        let request = RpcRequest::new("multiple", Parameters::new())
            .with_positional(vec![json!(1), json!(2), json!(3)]);
        let response = dispatcher.dispatch_request("simple", &request).await;
        assert_eq!(response.error.unwrap().kind(), "ArgumentError");
    }

    #[tokio::test]
    async fn failed_activation_is_reported() {
        let registry = EndpointRegistry::builder()
            .try_service(|| -> Result<SimpleService, ServiceFault> {
                Err(ServiceFault::new("database unavailable", "ConnectionRefused"))
            })
            .build();
        let dispatcher = RequestDispatcher::new(Arc::new(registry));
        let response = dispatcher
            .dispatch("simple", "multiple", &params(json!({"a": 1, "b": 2})))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.kind(), "ActivationError");
        assert_eq!(error.message, "database unavailable");
    }
}
