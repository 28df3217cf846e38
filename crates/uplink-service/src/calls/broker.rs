use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::utils::futures::{m, measure};

use super::cache::ResponseCache;
use super::fallback::{self, LocalFallback};
use super::fingerprint::Fingerprint;
use super::inflight::InFlightTable;
use super::outcome::{CallError, CallOutcome};
use super::remote::RemoteService;
use super::request::CallRequest;
use super::retry::{self, RetryPolicy};

/// Everything that governs how calls for one operation are dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPolicy {
    /// Deadlines, attempt counts and backoff.
    pub retry: RetryPolicy,
    /// Time-to-live for cached responses. Zero disables caching.
    pub cache_ttl: Duration,
    /// Maximum number of responses kept in the cache.
    pub cache_capacity: u64,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            cache_ttl: Duration::ZERO,
            cache_capacity: 10 * 1024,
        }
    }
}

/// Dispatches calls for one logical upstream operation.
///
/// A broker owns the response cache and the in-flight table for its
/// operation and composes the individual pieces: cache check, in-flight
/// coalescing, bounded attempts under an overall deadline, fallback
/// resolution, and cache population. The response cache is populated exactly
/// once per successful underlying call, never once per waiter, and failures
/// are never cached — upstream availability can change at any time.
///
/// Brokers are cheap to clone; clones share all state.
pub struct CallBroker<S: RemoteService> {
    name: Arc<str>,
    policy: CallPolicy,
    service: Arc<S>,
    fallback: Option<Arc<dyn LocalFallback<Response = S::Response>>>,
    cache: ResponseCache<S::Response>,
    inflight: InFlightTable<S::Response>,
}

impl<S: RemoteService> Clone for CallBroker<S> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        CallBroker {
            name: Arc::clone(&self.name),
            policy: self.policy.clone(),
            service: Arc::clone(&self.service),
            fallback: self.fallback.clone(),
            cache: self.cache.clone(),
            inflight: self.inflight.clone(),
        }
    }
}

impl<S: RemoteService> std::fmt::Debug for CallBroker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallBroker")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("fallback", &self.fallback.is_some())
            .field("inflight", &self.inflight)
            .finish()
    }
}

impl<S: RemoteService> CallBroker<S> {
    /// Creates a broker for the named operation.
    pub fn new(name: &str, policy: CallPolicy, service: S) -> Self {
        let cache = ResponseCache::new(name, policy.cache_capacity);

        CallBroker {
            name: name.into(),
            policy,
            service: Arc::new(service),
            fallback: None,
            cache,
            inflight: InFlightTable::new(),
        }
    }

    /// Registers a local fallback serving degraded results once the upstream
    /// path is exhausted.
    pub fn with_fallback(
        mut self,
        fallback: impl LocalFallback<Response = S::Response>,
    ) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Dispatches a call.
    ///
    /// Cached responses are returned without suspending. Otherwise the
    /// caller joins the in-flight call for the request's fingerprint, or
    /// starts one. The returned [`CallOutcome`] is the only way a dispatch
    /// can end; errors always arrive classified.
    ///
    /// Dropping the returned future releases this caller's interest in the
    /// outcome; the underlying call is only aborted when no other caller
    /// remains.
    pub async fn dispatch(&self, request: CallRequest) -> CallOutcome<S::Response> {
        metric!(counter("calls.dispatch") += 1, "operation" => &self.name);

        let fingerprint = request.fingerprint();

        if !self.policy.cache_ttl.is_zero() {
            if let Some(value) = self.cache.get(&fingerprint) {
                metric!(counter("calls.cache.hit") += 1, "operation" => &self.name);
                return CallOutcome::Success(value);
            }
            metric!(counter("calls.cache.miss") += 1, "operation" => &self.name);
        }

        let waiter = self.inflight.join_or_start(&fingerprint, || {
            let broker = self.clone();
            let request = request.clone();
            let fingerprint = fingerprint.clone();
            async move { broker.execute(request, fingerprint).await }.boxed()
        });

        let outcome = waiter.wait().await;
        metric!(
            counter("calls.outcome") += 1,
            "operation" => &self.name,
            "status" => outcome.status(),
        );
        outcome
    }

    /// Runs one underlying call to settlement.
    ///
    /// This is invoked exactly once per in-flight fingerprint; concurrent
    /// dispatches share its outcome through the in-flight table.
    async fn execute(
        &self,
        request: CallRequest,
        fingerprint: Fingerprint,
    ) -> CallOutcome<S::Response> {
        // The ceiling caps a whole sequence of attempts; a single upstream
        // hanging past its per-attempt deadline cannot exceed it either.
        let deadline = self.policy.retry.overall_deadline();

        let job = retry::run_attempts(&self.name, &self.policy.retry, || {
            self.service.call(&request)
        });
        let job = tokio::time::timeout(deadline, job);
        let job = measure("calls.execute", m::timed_result, job);

        let result = match job.await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout(deadline)),
        };

        match result {
            Ok(value) => {
                if !self.policy.cache_ttl.is_zero() {
                    self.cache
                        .put(fingerprint, value.clone(), self.policy.cache_ttl);
                    metric!(counter("calls.cache.write") += 1, "operation" => &self.name);
                }
                CallOutcome::Success(value)
            }
            Err(error) => fallback::resolve(&request, error, self.fallback.as_ref()),
        }
    }

    /// Drops the cached response for `request`, if any.
    ///
    /// Used when a caller needs freshness guarantees, for example after a
    /// mutating operation invalidated a previously cached read.
    pub fn invalidate(&self, request: &CallRequest) {
        self.cache.invalidate(&request.fingerprint());
    }

    /// Drops all cached responses of this operation.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
