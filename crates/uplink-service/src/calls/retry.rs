use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rand::Rng;

use super::outcome::{CallError, CallResult, ErrorKind};

/// Retry behavior for one logical call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles per subsequent retry.
    pub base_delay: Duration,
    /// Upper bound on the computed backoff, excluding jitter.
    pub max_delay: Duration,
    /// Deadline for each individual attempt.
    pub attempt_timeout: Duration,
    /// Error kinds that are worth another attempt.
    ///
    /// Permanent errors and invalid requests short-circuit regardless of
    /// what is listed here; retrying on bad credentials only wastes quota.
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            attempt_timeout: Duration::from_secs(30),
            retry_on: vec![ErrorKind::Timeout, ErrorKind::Transient],
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry following `attempt` (1-based), capped at
    /// [`max_delay`](Self::max_delay).
    pub fn backoff(&self, attempt: u32) -> Duration {
        // The shift saturates well before the duration math would overflow.
        let doublings = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay)
    }

    /// Upper bound on the wall-clock time a whole sequence of attempts may
    /// take.
    pub fn overall_deadline(&self) -> Duration {
        (self.attempt_timeout + self.max_delay).saturating_mul(self.max_attempts.max(1))
    }

    fn is_retryable(&self, error: &CallError) -> bool {
        let kind = error.kind();
        if matches!(kind, ErrorKind::Permanent | ErrorKind::InvalidRequest) {
            return false;
        }
        self.retry_on.contains(&kind)
    }
}

/// Diagnostic record of a single attempt. Never persisted.
#[derive(Debug)]
struct AttemptRecord<'a> {
    attempt: u32,
    elapsed: Duration,
    error: &'a CallError,
    backoff: Option<Duration>,
}

impl AttemptRecord<'_> {
    fn log(&self, operation: &str) {
        tracing::debug!(
            operation,
            attempt = self.attempt,
            elapsed = ?self.elapsed,
            error = %self.error,
            backoff = ?self.backoff,
            "upstream attempt failed"
        );
    }
}

/// Runs `attempt_fn` until it succeeds, fails permanently, or the policy's
/// attempts are exhausted.
///
/// Each attempt runs under [`RetryPolicy::attempt_timeout`]; a deadline
/// expiry counts as a retryable timeout. Between attempts the executor
/// sleeps for the exponential backoff plus a uniform random jitter in
/// `[0, backoff / 2]`, so concurrent callers that fail together do not
/// retry in lockstep.
pub(crate) async fn run_attempts<T, G>(
    operation: &str,
    policy: &RetryPolicy,
    mut attempt_fn: G,
) -> CallResult<T>
where
    G: FnMut() -> BoxFuture<'static, CallResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let started = Instant::now();
        let result = match tokio::time::timeout(policy.attempt_timeout, attempt_fn()).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout(policy.attempt_timeout)),
        };

        let error = match result {
            Ok(value) => {
                metric!(
                    counter("calls.attempt") += 1,
                    "operation" => operation,
                    "status" => "success",
                );
                return Ok(value);
            }
            Err(error) => error,
        };

        metric!(
            counter("calls.attempt") += 1,
            "operation" => operation,
            "status" => error.metrics_tag(),
        );

        if !policy.is_retryable(&error) || attempt >= max_attempts {
            AttemptRecord {
                attempt,
                elapsed: started.elapsed(),
                error: &error,
                backoff: None,
            }
            .log(operation);
            return Err(error);
        }

        let backoff = policy.backoff(attempt);
        let delay = backoff + jitter(backoff);
        AttemptRecord {
            attempt,
            elapsed: started.elapsed(),
            error: &error,
            backoff: Some(delay),
        }
        .log(operation);
        metric!(counter("calls.retry") += 1, "operation" => operation);

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Uniform random jitter in `[0, backoff / 2]`.
fn jitter(backoff: Duration) -> Duration {
    let cap = (backoff.as_millis() / 2) as u64;
    if cap == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
}
