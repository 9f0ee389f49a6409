mod common;

use std::sync::Arc;
use std::time::Duration;

use aid_rpc::{CallArguments, CallOptions, CancellationToken, JsonProtocol, ListenerOptions, RpcError};
use common::Harness;
use futures_util::future::join_all;
use serde_json::{json, Value};

#[tokio::test]
async fn multiple_returns_the_product() {
    let harness = Harness::start(Arc::new(JsonProtocol), ListenerOptions::default()).await;
    let simple = harness.clients.create_client("simple").unwrap();

    let product: i64 = simple.call("multiple", json!({"a": 5, "b": 10})).await.unwrap();
    assert_eq!(product, 50);

    // names are case-insensitive on both ends
    let product: i64 = simple.call("Multiple", json!({"A": 6, "B": 7})).await.unwrap();
    assert_eq!(product, 42);
    assert_eq!(simple.pending_calls(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn aliases_address_services_and_methods() {
    let harness = Harness::start(Arc::new(JsonProtocol), ListenerOptions::default()).await;
    let named = harness.clients.create_client("just_name_me").unwrap();

    let difference: i64 = named.call("and_me", json!({"a": 10, "b": 4})).await.unwrap();
    assert_eq!(difference, 6);
    let defaulted: i64 = named.call("and_me", json!({"a": 10})).await.unwrap();
    assert_eq!(defaulted, 9);
    let shouted: String = named.call("shout", json!({"text": "quiet"})).await.unwrap();
    assert_eq!(shouted, "QUIET");

    let err = named.call::<i64>("subtract", json!({"a": 1, "b": 1})).await.unwrap_err();
    assert_eq!(err.remote_error().unwrap().kind(), "MethodNotFound");

    harness.shutdown().await;
}

#[tokio::test]
async fn unknown_method_is_a_remote_error() {
    let harness = Harness::start(Arc::new(JsonProtocol), ListenerOptions::default()).await;
    let simple = harness.clients.create_client("simple").unwrap();

    let err = simple.call::<Value>("ghost", json!({})).await.unwrap_err();
    match &err {
        RpcError::Remote { correlation_id, error } => {
            assert_eq!(correlation_id.len(), 32);
            assert_eq!(error.kind(), "MethodNotFound");
            assert_eq!(error.message, "Method 'ghost' not found in service 'simple'");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }

    // methods without the marker are not exposed
    let err = simple.call::<i64>("helper", json!({})).await.unwrap_err();
    assert_eq!(err.remote_error().unwrap().kind(), "MethodNotFound");

    harness.shutdown().await;
}

#[tokio::test]
async fn argument_binding() {
    let harness = Harness::start(Arc::new(JsonProtocol), ListenerOptions::default()).await;
    let simple = harness.clients.create_client("simple").unwrap();

    let greeting: String = simple.call("greet", json!({"name": "Ada"})).await.unwrap();
    assert_eq!(greeting, "Hello, Ada");
    let greeting: String = simple
        .call("greet", json!({"name": "Ada", "greeting": "Welcome", "title": "Countess"}))
        .await
        .unwrap();
    assert_eq!(greeting, "Welcome, Countess Ada");

    let err = simple.call::<i64>("multiple", json!({"a": 5})).await.unwrap_err();
    let remote = err.remote_error().unwrap();
    assert_eq!(remote.kind(), "ArgumentError");
    assert_eq!(remote.message, "Missing required parameter 'b'");

    let err = simple.call::<i64>("multiple", json!({"a": "five", "b": 1})).await.unwrap_err();
    let remote = err.remote_error().unwrap();
    assert_eq!(remote.kind(), "ArgumentError");
    assert!(remote.message.contains("Expected: i64"));

    let echoed: Value = simple
        .call("echo", json!({"value": {"nested": [1, 2.5, null]}}))
        .await
        .unwrap();
    assert_eq!(echoed, json!({"nested": [1, 2.5, null]}));

    harness.shutdown().await;
}

#[tokio::test]
async fn service_failures_travel_back() {
    let harness = Harness::start(Arc::new(JsonProtocol), ListenerOptions::default()).await;
    let simple = harness.clients.create_client("simple").unwrap();

    let err = simple.call::<i64>("divide", json!({"a": 1, "b": 0})).await.unwrap_err();
    let remote = err.remote_error().unwrap();
    assert_eq!(remote.kind(), "DivideByZero");
    assert_eq!(remote.message, "attempted to divide by zero");
    assert!(err.correlation_id().is_some());

    let err = simple.call::<i64>("explode", json!({})).await.unwrap_err();
    let remote = err.remote_error().unwrap();
    assert_eq!(remote.kind(), "Panic");
    assert_eq!(remote.message, "kaboom");

    // the listener keeps serving after a panic
    let quotient: i64 = simple.call("divide", json!({"a": 9, "b": 3})).await.unwrap();
    assert_eq!(quotient, 3);

    harness.shutdown().await;
}

#[tokio::test]
async fn unit_methods_and_raw_results() {
    let harness = Harness::start(Arc::new(JsonProtocol), ListenerOptions::default()).await;
    let simple = harness.clients.create_client("simple").unwrap();

    simple.call::<()>("touch", json!({})).await.unwrap();
    let raw = simple
        .call_raw("touch", CallArguments::new(), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(raw, None);

    let err = simple.call::<String>("multiple", json!({"a": 2, "b": 2})).await.unwrap_err();
    assert!(matches!(err, RpcError::InvalidResponse { .. }));

    harness.shutdown().await;
}

#[tokio::test]
async fn timeout_deregisters_and_late_reply_is_dropped() {
    let harness = Harness::start(Arc::new(JsonProtocol), ListenerOptions::default()).await;
    let simple = harness.clients.create_client("simple").unwrap();

    let err = simple
        .call_with::<u64>(
            "delay",
            CallArguments::new().named("millis", 300),
            CallOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    match &err {
        RpcError::Timeout {
            service, method, timeout, ..
        } => {
            assert_eq!(service, "simple");
            assert_eq!(method, "delay");
            assert_eq!(*timeout, Duration::from_millis(100));
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(simple.pending_calls(), 0);

    // the reply to the timed-out call arrives and is discarded
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(simple.pending_calls(), 0);
    let product: i64 = simple.call("multiple", json!({"a": 2, "b": 3})).await.unwrap();
    assert_eq!(product, 6);

    harness.shutdown().await;
}

#[tokio::test]
async fn cancellation_is_not_a_timeout() {
    let harness = Harness::start(Arc::new(JsonProtocol), ListenerOptions::default()).await;
    let simple = harness.clients.create_client("simple").unwrap();
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let err = simple
        .call_with::<u64>(
            "delay",
            CallArguments::new().named("millis", 500),
            CallOptions::default().with_cancellation(token),
        )
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(!err.is_timeout());
    assert!(err.remote_error().is_none());
    assert_eq!(simple.pending_calls(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn concurrent_calls_get_their_own_replies() {
    let options = ListenerOptions::default().with_prefetch(32);
    let harness = Harness::start(Arc::new(JsonProtocol), options).await;
    let simple = harness.clients.create_client("simple").unwrap();

    let calls = (0..1000i64).map(|i| {
        let simple = Arc::clone(&simple);
        async move {
            let product: i64 = simple.call("multiple", json!({"a": i, "b": 3})).await.unwrap();
            (i, product)
        }
    });
    for (i, product) in join_all(calls).await {
        assert_eq!(product, i * 3);
    }
    assert_eq!(simple.pending_calls(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn services_can_call_services() {
    let harness = Harness::start(Arc::new(JsonProtocol), ListenerOptions::default()).await;
    let proxy = harness.clients.create_client("proxy").unwrap();

    let text: String = proxy.call("multiply_string", json!({"a": 5, "b": 6})).await.unwrap();
    assert_eq!(text, "5 * 6 = 30");

    harness.shutdown().await;
}

#[tokio::test]
async fn positional_arguments_need_the_compatibility_protocol() {
    let harness = Harness::start(Arc::new(JsonProtocol), ListenerOptions::default()).await;
    let simple = harness.clients.create_client("simple").unwrap();

    let err = simple.call::<i64>("multiple", json!([5, 10])).await.unwrap_err();
    assert!(matches!(err, RpcError::InvalidArgument(_)));
    assert_eq!(simple.pending_calls(), 0);

    harness.shutdown().await;
}
