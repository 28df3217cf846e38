use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;

use uplink_test as test;
use uplink_test::{Attempt, ScriptedService};

use super::*;

fn request(text: &str) -> CallRequest {
    let mut params = serde_json::Map::new();
    params.insert("text".into(), json!(text));
    CallRequest::new("moderate", params).unwrap()
}

fn quick_policy() -> CallPolicy {
    CallPolicy {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            attempt_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        cache_ttl: Duration::ZERO,
        ..Default::default()
    }
}

/// N concurrent dispatches with one fingerprint must result in exactly one
/// upstream call, with every caller observing the identical outcome.
#[tokio::test]
async fn test_concurrent_dispatches_are_coalesced() {
    test::setup();

    let service = ScriptedService::new(vec![Attempt::Delayed(
        Duration::from_millis(50),
        json!({"flagged": false}),
    )]);
    let broker = CallBroker::new("moderate", quick_policy(), service.clone());

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dispatch(request("same input")).await })
        })
        .collect();

    for task in tasks {
        let outcome = task.await.unwrap();
        assert_eq!(outcome, CallOutcome::Success(json!({"flagged": false})));
    }

    assert_eq!(service.calls(), 1);
}

/// A cached response is served without calling upstream until the TTL
/// elapses, after which the upstream is consulted again.
#[tokio::test]
async fn test_cache_round_trip() {
    test::setup();

    let service = ScriptedService::new(vec![
        Attempt::Succeed(json!({"score": 1})),
        Attempt::Succeed(json!({"score": 2})),
    ]);
    let policy = CallPolicy {
        cache_ttl: Duration::from_millis(150),
        ..quick_policy()
    };
    let broker = CallBroker::new("moderate", policy, service.clone());

    let first = broker.dispatch(request("cache me")).await;
    let second = broker.dispatch(request("cache me")).await;
    assert_eq!(first, CallOutcome::Success(json!({"score": 1})));
    assert_eq!(second, CallOutcome::Success(json!({"score": 1})));
    assert_eq!(service.calls(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let third = broker.dispatch(request("cache me")).await;
    assert_eq!(third, CallOutcome::Success(json!({"score": 2})));
    assert_eq!(service.calls(), 2);
}

/// Failures must never be cached: the next dispatch for the same
/// fingerprint goes upstream again.
#[tokio::test]
async fn test_failures_are_not_cached() {
    test::setup();

    let service = ScriptedService::new(vec![
        Attempt::Fail(CallError::Permanent("rejected".into())),
        Attempt::Succeed(json!({"score": 1})),
    ]);
    let policy = CallPolicy {
        cache_ttl: Duration::from_secs(60),
        ..quick_policy()
    };
    let broker = CallBroker::new("moderate", policy, service.clone());

    let first = broker.dispatch(request("flaky")).await;
    assert!(first.error().is_some());

    let second = broker.dispatch(request("flaky")).await;
    assert_eq!(second, CallOutcome::Success(json!({"score": 1})));
    assert_eq!(service.calls(), 2);
}

/// Two transient failures followed by a success must settle as a success
/// after exactly three attempts.
#[tokio::test]
async fn test_transient_failures_are_retried_to_success() {
    test::setup();

    let service = ScriptedService::new(vec![
        Attempt::Fail(CallError::Transient("overloaded".into())),
        Attempt::Fail(CallError::Transient("overloaded".into())),
        Attempt::Succeed(json!({"score": 3})),
    ]);
    let broker = CallBroker::new("moderate", quick_policy(), service.clone());

    let outcome = broker.dispatch(request("eventually fine")).await;
    assert_eq!(outcome, CallOutcome::Success(json!({"score": 3})));
    assert_eq!(service.calls(), 3);
}

/// A permanent failure short-circuits: one attempt, no fallback registered,
/// and the classified error surfaces.
#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    test::setup();

    let service = ScriptedService::new(vec![Attempt::Fail(CallError::Permanent(
        "bad credentials".into(),
    ))]);
    let broker = CallBroker::new("moderate", quick_policy(), service.clone());

    let outcome = broker.dispatch(request("whatever")).await;
    assert_eq!(
        outcome,
        CallOutcome::Failed(CallError::Permanent("bad credentials".into()))
    );
    assert_eq!(service.calls(), 1);
}

/// An upstream that always hangs, paired with a fallback, must yield a
/// degraded success after the attempts are exhausted, with the fallback
/// invoked exactly once.
#[tokio::test]
async fn test_fallback_serves_degraded_result() {
    test::setup();

    let service = ScriptedService::new(vec![Attempt::Hang, Attempt::Hang]);
    let policy = CallPolicy {
        retry: RetryPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(20),
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            ..Default::default()
        },
        ..Default::default()
    };

    let fallbacks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fallbacks);
    let broker = CallBroker::new("moderate", policy, service.clone()).with_fallback(
        move |_: &CallRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            json!({"flagged": false, "degraded": true})
        },
    );

    let outcome = broker.dispatch(request("needs fallback")).await;
    assert_eq!(
        outcome,
        CallOutcome::Degraded(json!({"flagged": false, "degraded": true}))
    );
    assert!(outcome.is_degraded());
    assert_eq!(service.calls(), 2);
    assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
}

/// Degraded results are never written to the cache: once the upstream
/// recovers, the next dispatch uses it.
#[tokio::test]
async fn test_degraded_results_are_not_cached() {
    test::setup();

    let service = ScriptedService::new(vec![
        Attempt::Fail(CallError::Permanent("down".into())),
        Attempt::Succeed(json!({"score": 1})),
    ]);
    let policy = CallPolicy {
        cache_ttl: Duration::from_secs(60),
        ..quick_policy()
    };
    let broker = CallBroker::new("moderate", policy, service.clone())
        .with_fallback(|_: &CallRequest| json!({"score": 0}));

    let first = broker.dispatch(request("recovering")).await;
    assert_eq!(first, CallOutcome::Degraded(json!({"score": 0})));

    let second = broker.dispatch(request("recovering")).await;
    assert_eq!(second, CallOutcome::Success(json!({"score": 1})));
    assert_eq!(service.calls(), 2);
}

/// One caller abandoning a coalesced dispatch must not abort the underlying
/// call for the caller still waiting.
#[tokio::test]
async fn test_cancellation_does_not_leak_across_callers() {
    test::setup();

    let service = ScriptedService::new(vec![Attempt::Delayed(
        Duration::from_millis(100),
        json!({"flagged": false}),
    )]);
    let broker = CallBroker::new("moderate", quick_policy(), service.clone());

    let abandoned = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.dispatch(request("shared")).await })
    };
    let patient = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.dispatch(request("shared")).await })
    };

    // Give both dispatches time to join the same in-flight call.
    tokio::time::sleep(Duration::from_millis(20)).await;
    abandoned.abort();

    let outcome = patient.await.unwrap();
    assert_eq!(outcome, CallOutcome::Success(json!({"flagged": false})));
    assert_eq!(service.calls(), 1);
}

/// Explicit invalidation forces the next dispatch to consult the upstream
/// even though the TTL has not elapsed.
#[tokio::test]
async fn test_invalidate_forces_freshness() {
    test::setup();

    let service = ScriptedService::new(vec![
        Attempt::Succeed(json!({"score": 1})),
        Attempt::Succeed(json!({"score": 2})),
    ]);
    let policy = CallPolicy {
        cache_ttl: Duration::from_secs(60),
        ..quick_policy()
    };
    let broker = CallBroker::new("moderate", policy, service.clone());

    let first = broker.dispatch(request("stale")).await;
    assert_eq!(first, CallOutcome::Success(json!({"score": 1})));

    broker.invalidate(&request("stale"));

    let second = broker.dispatch(request("stale")).await;
    assert_eq!(second, CallOutcome::Success(json!({"score": 2})));
    assert_eq!(service.calls(), 2);
}

/// The moderation wordlist fixture is a well-behaved fallback: pure and
/// total, and its outcome is clearly marked as degraded.
#[tokio::test]
async fn test_wordlist_moderation_fallback() {
    test::setup();

    let service = ScriptedService::new(vec![Attempt::Fail(CallError::Transient(
        "moderation upstream down".into(),
    ))]);
    let policy = CallPolicy {
        retry: RetryPolicy {
            max_attempts: 1,
            ..quick_policy().retry
        },
        ..quick_policy()
    };
    let broker = CallBroker::new("moderate", policy, service)
        .with_fallback(test::wordlist_moderation(&["scam", "spam"]));

    let outcome = broker.dispatch(request("this is spam and also a scam")).await;
    let value = outcome.value().expect("fallback must produce a value");
    assert_eq!(value["flagged"], json!(true));
    assert_eq!(value["score"], json!(2));
    assert!(outcome.is_degraded());
}

/// `Value`-typed brokers are not special; any cloneable response type works.
#[tokio::test]
async fn test_custom_response_types() {
    test::setup();

    struct Doubler;

    impl RemoteService for Doubler {
        type Response = u64;

        fn call(
            &self,
            request: &CallRequest,
        ) -> futures::future::BoxFuture<'static, CallResult<u64>> {
            let n = request.params()["n"].as_u64().unwrap_or_default();
            Box::pin(async move { Ok(n * 2) })
        }
    }

    let mut params = serde_json::Map::new();
    params.insert("n".into(), json!(21));
    let request = CallRequest::new("double", params).unwrap();

    let broker = CallBroker::new("double", quick_policy(), Doubler);
    assert_eq!(broker.dispatch(request).await, CallOutcome::Success(42));
}
