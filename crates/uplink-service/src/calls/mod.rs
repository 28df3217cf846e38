//! # Outbound call orchestration
//!
//! Everything this crate is about lives here: dispatching calls against
//! upstream services that may fail, hang, or return garbage, while callers
//! only ever see a single, classified [`CallOutcome`].
//!
//! ## Layers
//!
//! A dispatched call goes through the following layers, in order:
//!
//! - A [`Fingerprint`] is derived from the request's normalized inputs.
//!   Semantically identical requests collide deterministically, no matter
//!   how the caller assembled them.
//! - The response cache is consulted. A hit returns synchronously; entries
//!   expire per-operation after their time-to-live and are evicted lazily.
//! - The in-flight table is consulted. If a call for the same fingerprint is
//!   already running, the caller joins it and shares its outcome instead of
//!   starting a second upstream call. Interest is reference counted: one
//!   caller abandoning the wait does not cancel the call for the others,
//!   and only the last one leaving aborts it.
//! - The retry executor runs the actual upstream attempts, each under its
//!   own deadline, retrying transient failures with exponentially growing,
//!   jittered backoff. Permanent failures short-circuit.
//! - On exhaustion, the registered [`LocalFallback`] (if any) produces a
//!   degraded result. Degraded results are marked as such; they are served
//!   to the caller but never cached, and neither are failures — upstream
//!   availability can change at any time, so a failed fingerprint is
//!   immediately eligible for a fresh call.
//! - A genuine upstream success is written to the response cache, exactly
//!   once per underlying call.
//!
//! All of this is owned by a [`CallBroker`], one per logical operation,
//! created at startup from the [`Config`](crate::config::Config) and dropped
//! at shutdown. There is no process-global state; brokers are cheap to clone
//! and clones share their caches and in-flight tables.
//!
//! ## Metrics
//!
//! Each decision point is counted, tagged with the broker's operation name:
//!
//! - `calls.dispatch`: all dispatches.
//! - `calls.cache.hit` / `calls.cache.miss` / `calls.cache.write`: response
//!   cache traffic.
//! - `calls.inflight.joined` / `calls.inflight.started` /
//!   `calls.inflight.aborted`: in-flight coalescing.
//! - `calls.attempt` (tagged with the attempt status) and `calls.retry`:
//!   upstream attempts.
//! - `calls.fallback`: degraded results served.
//! - `calls.outcome` (tagged `success`/`degraded`/`failed`): terminal
//!   outcomes.
//!
//! ## Errors
//!
//! Every failure is mapped onto a [`CallError`] before it crosses this
//! module's boundary: [`CallError::InvalidRequest`] for malformed input,
//! [`CallError::Timeout`] for missed deadlines, [`CallError::Transient`]
//! for retryable upstream conditions, and [`CallError::Permanent`] for
//! rejections that retrying can only make more expensive. Which kinds are
//! retried is part of the [`RetryPolicy`].

mod broker;
mod cache;
mod fallback;
mod fingerprint;
mod http;
mod inflight;
mod outcome;
mod remote;
mod request;
mod retry;

pub use broker::{CallBroker, CallPolicy};
pub use fallback::LocalFallback;
pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use http::HttpRemoteService;
pub use outcome::{CallError, CallOutcome, CallResult, ErrorKind};
pub use remote::RemoteService;
pub use request::CallRequest;
pub use retry::RetryPolicy;
