//! Helpers for testing the call dispatch machinery.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`json_upstream`], make sure the returned handle is held until all requests
//!    to the server have been made; the handle also carries the hit counter the assertions
//!    need. Assign it to a variable: `let upstream = test::json_upstream(...)`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use url::Url;

use uplink_service::calls::{CallError, CallRequest, CallResult, RemoteService};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `uplink-service` crate and
///    mutes all other logs.
pub fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("uplink_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The outcome one scripted upstream attempt should produce.
#[derive(Debug, Clone)]
pub enum Attempt {
    /// Respond successfully with the given value.
    Succeed(Value),
    /// Fail with the given error.
    Fail(CallError),
    /// Never resolve; exercises attempt deadlines.
    Hang,
    /// Respond successfully after the given delay.
    Delayed(Duration, Value),
}

/// A [`RemoteService`] driven by a queue of scripted attempt outcomes.
///
/// Every invocation pops the next scripted attempt and bumps the invocation
/// counter; an exhausted script fails permanently, which makes accidental
/// extra upstream calls show up loudly in tests.
///
/// Clones share the script and the counter.
#[derive(Debug, Clone)]
pub struct ScriptedService {
    script: Arc<Mutex<VecDeque<Attempt>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedService {
    pub fn new(script: impl IntoIterator<Item = Attempt>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The number of times the service has been invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RemoteService for ScriptedService {
    type Response = Value;

    fn call(&self, _request: &CallRequest) -> BoxFuture<'static, CallResult<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();

        async move {
            match next {
                Some(Attempt::Succeed(value)) => Ok(value),
                Some(Attempt::Fail(error)) => Err(error),
                Some(Attempt::Hang) => futures::future::pending().await,
                Some(Attempt::Delayed(delay, value)) => {
                    tokio::time::sleep(delay).await;
                    Ok(value)
                }
                None => Err(CallError::Permanent("script exhausted".into())),
            }
        }
        .boxed()
    }
}

/// The additive keyword scorer the quiz service falls back to when remote
/// moderation is unavailable.
///
/// Pure and total: it only ever inspects the request's `text` parameter and
/// always produces a verdict document.
pub fn wordlist_moderation(
    blocklist: &'static [&'static str],
) -> impl Fn(&CallRequest) -> Value + Send + Sync + 'static {
    move |request: &CallRequest| {
        let text = request
            .params()
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();

        let matched: Vec<_> = blocklist
            .iter()
            .copied()
            .filter(|word| text.contains(&word.to_lowercase()))
            .collect();

        json!({
            "flagged": !matched.is_empty(),
            "score": matched.len(),
            "matched": matched,
        })
    }
}

#[derive(Clone)]
struct UpstreamState {
    script: Arc<Mutex<VecDeque<(u16, Value)>>>,
    hits: Arc<AtomicUsize>,
}

/// A running scripted JSON upstream.
pub struct JsonUpstream {
    url: Url,
    hits: Arc<AtomicUsize>,
}

impl JsonUpstream {
    /// The endpoint requests should be posted to.
    pub fn url(&self) -> Url {
        self.url.clone()
    }

    /// The number of requests the upstream has received.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Spawns a local HTTP upstream whose handler pops scripted
/// `(status, body)` responses.
///
/// Once the script is exhausted, further requests are answered with a 500.
pub async fn json_upstream(script: Vec<(u16, Value)>) -> JsonUpstream {
    let state = UpstreamState {
        script: Arc::new(Mutex::new(script.into_iter().collect())),
        hits: Arc::new(AtomicUsize::new(0)),
    };
    let hits = Arc::clone(&state.hits);

    let app = Router::new()
        .route("/", post(scripted_response))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let url = format!("http://{addr}/").parse().unwrap();
    JsonUpstream { url, hits }
}

async fn scripted_response(
    State(state): State<UpstreamState>,
    Json(_body): Json<Value>,
) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);

    let (status, body) = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or((500, json!({"error": "script exhausted"})));

    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body))
}
