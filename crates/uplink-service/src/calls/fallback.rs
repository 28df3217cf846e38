use std::sync::Arc;

use super::outcome::{CallError, CallOutcome};
use super::request::CallRequest;

/// A pure, synchronous, best-effort computation producing a degraded but
/// valid result when the upstream path is unusable.
///
/// Implementations must be total over their inputs: they never fail, block,
/// or perform I/O. The produced value is wrapped as
/// [`CallOutcome::Degraded`] so callers can tell it apart from a genuine
/// upstream response.
pub trait LocalFallback: Send + Sync + 'static {
    type Response;

    /// Computes the degraded result.
    fn compute(&self, request: &CallRequest) -> Self::Response;
}

impl<T, F> LocalFallback for F
where
    F: Fn(&CallRequest) -> T + Send + Sync + 'static,
{
    type Response = T;

    fn compute(&self, request: &CallRequest) -> T {
        self(request)
    }
}

/// Resolves an exhausted or permanently failed call against the optional
/// fallback.
///
/// The fallback is invoked at most once and never retried; without one the
/// original failure passes through unchanged.
pub(crate) fn resolve<T: 'static>(
    request: &CallRequest,
    failure: CallError,
    fallback: Option<&Arc<dyn LocalFallback<Response = T>>>,
) -> CallOutcome<T> {
    match fallback {
        Some(fallback) => {
            tracing::debug!(
                operation = request.operation(),
                error = %failure,
                "upstream path exhausted, serving local fallback"
            );
            metric!(counter("calls.fallback") += 1, "operation" => request.operation());
            CallOutcome::Degraded(fallback.compute(request))
        }
        None => CallOutcome::Failed(failure),
    }
}
