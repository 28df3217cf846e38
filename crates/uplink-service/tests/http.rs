use std::time::Duration;

use serde_json::json;

use uplink_test as test;

use uplink_service::calls::{
    CallBroker, CallError, CallOutcome, CallPolicy, CallRequest, HttpRemoteService, RetryPolicy,
};

fn quiz_request() -> CallRequest {
    let mut params = serde_json::Map::new();
    params.insert("topic".into(), json!("rust"));
    CallRequest::new("generate", params).unwrap()
}

fn quick_policy() -> CallPolicy {
    CallPolicy {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            attempt_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_recovers_from_server_errors() {
    test::setup();

    let upstream = test::json_upstream(vec![
        (500, json!({"error": "overloaded"})),
        (503, json!({"error": "overloaded"})),
        (200, json!({"question": "What does the ? operator do?"})),
    ])
    .await;

    let service = HttpRemoteService::new(upstream.url());
    let broker = CallBroker::new("generate", quick_policy(), service);

    let outcome = broker.dispatch(quiz_request()).await;
    assert_eq!(
        outcome,
        CallOutcome::Success(json!({"question": "What does the ? operator do?"}))
    );
    assert_eq!(upstream.hits(), 3);
}

#[tokio::test]
async fn test_authentication_rejection_is_permanent() {
    test::setup();

    let upstream = test::json_upstream(vec![(403, json!({"error": "bad key"}))]).await;

    let service = HttpRemoteService::new(upstream.url());
    let broker = CallBroker::new("generate", quick_policy(), service);

    let outcome = broker.dispatch(quiz_request()).await;
    let error = outcome.error().expect("dispatch must fail");
    assert!(matches!(error, CallError::Permanent(_)));
    // No retries on a permanent rejection.
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test]
async fn test_rate_limiting_is_retried() {
    test::setup();

    let upstream = test::json_upstream(vec![
        (429, json!({"error": "slow down"})),
        (200, json!({"ok": true})),
    ])
    .await;

    let service = HttpRemoteService::new(upstream.url());
    let broker = CallBroker::new("generate", quick_policy(), service);

    let outcome = broker.dispatch(quiz_request()).await;
    assert_eq!(outcome, CallOutcome::Success(json!({"ok": true})));
    assert_eq!(upstream.hits(), 2);
}
