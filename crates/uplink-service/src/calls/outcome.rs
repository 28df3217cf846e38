use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error that happens while dispatching a call to an upstream service.
///
/// Every failure the dispatch machinery can encounter is mapped onto one of
/// these variants before it crosses the component boundary; callers never see
/// a raw transport error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The request itself was malformed, for example an empty operation name.
    ///
    /// Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// An attempt exceeded its deadline.
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),
    /// The upstream signaled a retryable condition.
    ///
    /// Rate limiting, 5xx-equivalent responses, and transient network
    /// failures all end up here.
    #[error("transient upstream error: {0}")]
    Transient(String),
    /// The upstream signaled a non-retryable condition.
    ///
    /// The attached string contains the upstream's response, for example an
    /// authentication rejection.
    #[error("permanent upstream error: {0}")]
    Permanent(String),
}

/// Coarse classification of a [`CallError`], used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    Timeout,
    Transient,
    Permanent,
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Permanent(_) => ErrorKind::Permanent,
        }
    }

    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Timeout(_) => "timeout",
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }
}

/// The result of a single attempt or a whole underlying call.
pub type CallResult<T> = Result<T, CallError>;

/// The terminal result of a dispatched call.
///
/// This is the only value ever handed back to a caller. A degraded success is
/// distinguishable from a genuine upstream response so that callers can
/// surface a degradation notice; the two are produced by different estimators
/// and their values are not otherwise comparable.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    /// The upstream service responded.
    Success(T),
    /// The registered fallback produced the value after the upstream path
    /// was exhausted.
    Degraded(T),
    /// The call failed and no fallback was registered.
    Failed(CallError),
}

impl<T> CallOutcome<T> {
    /// `true` if the value was produced by the local fallback.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }

    /// The value, if the call produced one through either path.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Success(value) | Self::Degraded(value) => Some(value),
            Self::Failed(_) => None,
        }
    }

    /// The error, if the call failed.
    pub fn error(&self) -> Option<&CallError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Collapses the degraded/genuine distinction.
    pub fn into_result(self) -> CallResult<T> {
        match self {
            Self::Success(value) | Self::Degraded(value) => Ok(value),
            Self::Failed(error) => Err(error),
        }
    }

    pub(crate) fn status(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Degraded(_) => "degraded",
            Self::Failed(_) => "failed",
        }
    }
}
