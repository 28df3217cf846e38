//! Support for JSON-over-HTTP upstreams.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use url::Url;

use super::outcome::{CallError, CallResult};
use super::remote::RemoteService;
use super::request::CallRequest;

/// An upstream reached by posting JSON over HTTP.
///
/// The request's parameters are sent as a JSON document and a JSON document
/// is expected back. Server and transport failures are classified onto
/// [`CallError`]: rate limiting and server errors are transient, other
/// client errors are permanent. Attempt deadlines are left to the dispatch
/// machinery; the client itself only bounds connection establishment.
#[derive(Debug, Clone)]
pub struct HttpRemoteService {
    client: Client,
    endpoint: Url,
}

impl HttpRemoteService {
    pub fn new(endpoint: Url) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .build()
            .unwrap();

        Self { client, endpoint }
    }

    /// Uses a pre-configured client, e.g. one shared across upstreams.
    pub fn with_client(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }
}

impl RemoteService for HttpRemoteService {
    type Response = Value;

    fn call(&self, request: &CallRequest) -> BoxFuture<'static, CallResult<Value>> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let operation = request.operation().to_owned();
        let body = Value::Object(request.params().clone());

        async move {
            tracing::debug!(operation, %endpoint, "posting upstream request");

            let response = client
                .post(endpoint)
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if status.is_success() {
                response.json().await.map_err(|e| {
                    // Generative upstreams frequently produce parseable
                    // output on a fresh attempt.
                    CallError::Transient(format!("undecodable response body: {e}"))
                })
            } else {
                let message = response.text().await.unwrap_or_default();
                Err(status_error(status, message))
            }
        }
        .boxed()
    }
}

fn status_error(status: StatusCode, message: String) -> CallError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        CallError::Transient(format!("{status}: {message}"))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        CallError::Permanent(format!("authentication rejected ({status}): {message}"))
    } else {
        CallError::Permanent(format!("{status}: {message}"))
    }
}

fn transport_error(error: reqwest::Error) -> CallError {
    // Connection loss, DNS failure and the client's own connect timeout are
    // all worth another attempt; the per-attempt deadline is enforced one
    // layer up.
    CallError::Transient(error.to_string())
}
