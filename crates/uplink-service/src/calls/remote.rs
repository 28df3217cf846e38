use futures::future::BoxFuture;

use super::outcome::CallResult;
use super::request::CallRequest;

/// An upstream service the call layer can dispatch against.
///
/// Implementations are transport-specific (HTTP, gRPC, an in-process model);
/// the dispatch machinery imposes deadlines, retries, caching and
/// deduplication on top and stays agnostic to the transport. Implementations
/// only have to map their transport's failures onto
/// [`CallError`](super::CallError) — an unclassified error must never escape
/// a `call` future.
pub trait RemoteService: Send + Sync + 'static {
    /// The value a successful call produces.
    type Response: Clone + Send + Sync + 'static;

    /// Performs one attempt against the upstream.
    ///
    /// Every invocation corresponds to exactly one attempt; the retry
    /// executor invokes this again for each retry, and concurrent callers
    /// with the same fingerprint share a single sequence of attempts.
    fn call(&self, request: &CallRequest) -> BoxFuture<'static, CallResult<Self::Response>>;
}
