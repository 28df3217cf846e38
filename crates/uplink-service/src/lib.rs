//! Orchestration of calls against unreliable upstream services.
//!
//! The [`calls`] module is the heart of this crate: fingerprint-keyed
//! response caching, in-flight request coalescing, bounded retries with
//! jittered backoff, and graceful degradation to a local fallback.

#[macro_use]
pub mod metrics;

pub mod calls;
pub mod config;
pub mod logging;
pub mod utils;
