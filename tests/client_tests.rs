//! End-to-end tests of the resilient client against a local HTTP server.

use outbound_resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, ClientConfig, ResilienceError,
    ResilientClient, RetryPolicy, TransportError,
};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(5))
        .max_delay(Duration::from_millis(50))
        .jitter_fraction(0.0)
}

fn client_for(server: &MockServer, policy: RetryPolicy) -> ResilientClient {
    ResilientClient::builder("inventory")
        .base_url(server.uri())
        .timeout(Duration::from_secs(2))
        .retry_policy(policy)
        .build()
        .expect("client builds")
}

#[tokio::test]
async fn test_retries_unavailable_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items/42"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_retry(3));
    let response = client
        .get(&CancellationToken::new(), "/items/42")
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["id"], 42);

    let metrics = client.metrics();
    assert_eq!(metrics.successes, 1);
    assert_eq!(metrics.retries, 2);
    assert_eq!(client.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such item"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_retry(3));
    let err = client
        .get(&CancellationToken::new(), "/missing")
        .await
        .unwrap_err();

    match err {
        ResilienceError::Operation(TransportError::Status { status, body, .. }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "no such item");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_retry_after_is_capped_by_max_delay() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/quota"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/quota"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server, fast_retry(2));
    let started = Instant::now();
    let response = client.get(&CancellationToken::new(), "/quota").await.unwrap();

    assert_eq!(response.status, 200);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_exhausted_calls_open_the_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::default();
    let config = ClientConfig::new("flaky", server.uri())
        .retry(fast_retry(1))
        .circuit_breaker(
            CircuitBreakerConfig::new()
                .failure_threshold(2)
                .open_timeout(Duration::from_secs(60)),
        );
    let client = ResilientClient::from_config(&config, Some(&registry)).unwrap();
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let err = client.get(&cancel, "/flaky").await.unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::RetriesExhausted { attempts: 2, .. }
        ));
    }
    assert_eq!(client.circuit_state(), CircuitState::Open);

    let err = client.get(&cancel, "/flaky").await.unwrap_err();
    assert!(err.is_circuit_rejection());
    assert_eq!(registry.get("flaky").unwrap().state(), CircuitState::Open);
}

#[tokio::test]
async fn test_post_json_sends_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(body_json(json!({"sku": "A-1", "quantity": 3})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"order": "o-9"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_retry(0));
    let response = client
        .post_json(
            &CancellationToken::new(),
            "/orders",
            &json!({"sku": "A-1", "quantity": 3}),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 201);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["order"], "o-9");
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let client = ResilientClient::builder("slow")
        .base_url(server.uri())
        .timeout(Duration::from_millis(50))
        .retry_policy(RetryPolicy::no_retry())
        .build()
        .unwrap();

    let err = client
        .get(&CancellationToken::new(), "/slow")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ResilienceError::RetriesExhausted {
            attempts: 1,
            last_error: TransportError::Timeout { .. }
        }
    ));
}

#[tokio::test]
async fn test_cancellation_stops_retrying() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = ResilientClient::builder("down")
        .base_url(server.uri())
        .retry_policy(
            RetryPolicy::new()
                .max_retries(10)
                .initial_delay(Duration::from_secs(10))
                .jitter_fraction(0.0),
        )
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = client.get(&cancel, "/down").await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(client.circuit_state(), CircuitState::Closed);
    assert_eq!(client.metrics().cancelled, 1);
}
