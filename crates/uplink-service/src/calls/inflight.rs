use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use tokio::task::AbortHandle;

use crate::utils::futures::CallOnDrop;

use super::fingerprint::Fingerprint;
use super::outcome::{CallError, CallOutcome};

/// The shared settlement channel for one underlying call.
///
/// Awaiting the receiver yields `Err(Canceled)` when the sender is dropped
/// without settling, which happens when the underlying task is aborted.
type SettlementChannel<T> = Shared<oneshot::Receiver<CallOutcome<T>>>;

/// Bookkeeping for one fingerprint that is currently in flight.
struct InFlightEntry<T> {
    channel: SettlementChannel<T>,
    /// Identifies the underlying call this entry belongs to, so that stale
    /// guards from an earlier call for the same fingerprint cannot touch it.
    call_id: u64,
    /// Number of waiters currently interested in the outcome.
    interest: usize,
    /// Aborts the underlying task once interest reaches zero.
    abort: AbortHandle,
}

struct TableInner<T> {
    entries: BTreeMap<Fingerprint, InFlightEntry<T>>,
    next_call_id: u64,
}

/// Table of underlying calls currently in flight, keyed by fingerprint.
///
/// This guarantees at most one concurrent underlying call per fingerprint:
/// callers arriving while a call is in flight join its settlement channel
/// instead of starting a second call. The check and the registration happen
/// under one lock, so two callers can never both observe "no entry" and start
/// redundant work.
///
/// Entries are evicted the instant the underlying call settles — success or
/// failure — before any waiter is woken, so a fingerprint can never remain
/// stuck in flight after completion. Waiter interest is reference counted;
/// dropping one waiter leaves the call running for the others, and only the
/// last waiter's departure aborts it.
pub(crate) struct InFlightTable<T> {
    inner: Arc<Mutex<TableInner<T>>>,
}

impl<T> Clone for InFlightTable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for InFlightTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightTable")
            .field("in-flight calls", &self.len())
            .finish()
    }
}

impl<T> InFlightTable<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableInner {
                entries: BTreeMap::new(),
                next_call_id: 0,
            })),
        }
    }

    /// The number of fingerprints currently in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

impl<T: Clone + Send + Sync + 'static> InFlightTable<T> {
    /// Joins the call in flight for `fingerprint`, or spawns `start_fn`'s
    /// future as a new underlying call.
    ///
    /// The returned [`Waiter`] resolves to the shared [`CallOutcome`]. All
    /// waiters for one fingerprint observe the identical outcome.
    pub fn join_or_start<F>(&self, fingerprint: &Fingerprint, start_fn: F) -> Waiter<T>
    where
        F: FnOnce() -> BoxFuture<'static, CallOutcome<T>>,
    {
        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.entries.get_mut(fingerprint) {
            // A concurrent caller is coalesced onto the in-flight call.
            metric!(counter("calls.inflight.joined") += 1);
            entry.interest += 1;
            return Waiter {
                channel: entry.channel.clone(),
                guard: InterestGuard {
                    inner: Arc::clone(&self.inner),
                    fingerprint: fingerprint.clone(),
                    call_id: entry.call_id,
                },
            };
        }

        metric!(counter("calls.inflight.started") += 1);
        let call_id = inner.next_call_id;
        inner.next_call_id += 1;

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();

        // Evicts the entry when the underlying future settles, before any
        // waiter is woken: late callers either join a channel that will still
        // receive data, or start a fresh call.
        let eviction_token = {
            let inner = Arc::clone(&self.inner);
            let fingerprint = fingerprint.clone();
            CallOnDrop::new(move || {
                let mut inner = inner.lock().unwrap();
                let settled_call = inner
                    .entries
                    .get(&fingerprint)
                    .is_some_and(|entry| entry.call_id == call_id);
                if settled_call {
                    inner.entries.remove(&fingerprint);
                }
            })
        };

        let future = start_fn();
        // The task cannot settle before the entry is registered below: the
        // eviction token needs the table lock, which is held until this
        // function returns.
        let task = tokio::spawn(async move {
            let outcome = future.await;
            drop(eviction_token);
            sender.send(outcome).ok();
        });

        inner.entries.insert(
            fingerprint.clone(),
            InFlightEntry {
                channel: channel.clone(),
                call_id,
                interest: 1,
                abort: task.abort_handle(),
            },
        );

        Waiter {
            channel,
            guard: InterestGuard {
                inner: Arc::clone(&self.inner),
                fingerprint: fingerprint.clone(),
                call_id,
            },
        }
    }
}

/// One caller's interest in an in-flight call.
///
/// Dropping the waiter before settlement releases its interest; the
/// underlying call keeps running as long as any other waiter remains and is
/// aborted only when the last one is gone.
pub(crate) struct Waiter<T: Clone> {
    channel: SettlementChannel<T>,
    guard: InterestGuard<T>,
}

impl<T: Clone> Waiter<T> {
    /// Waits for the call to settle.
    pub async fn wait(self) -> CallOutcome<T> {
        let outcome = match self.channel.clone().await {
            Ok(outcome) => outcome,
            // The sender was dropped without settling. This only happens when
            // the task was aborted or panicked; transient keeps the
            // fingerprint immediately retryable.
            Err(_canceled) => {
                CallOutcome::Failed(CallError::Transient("call aborted before settling".into()))
            }
        };
        drop(self.guard);
        outcome
    }
}

struct InterestGuard<T> {
    inner: Arc<Mutex<TableInner<T>>>,
    fingerprint: Fingerprint,
    call_id: u64,
}

impl<T> Drop for InterestGuard<T> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(&self.fingerprint) else {
            // The call already settled and evicted itself.
            return;
        };
        if entry.call_id != self.call_id {
            // The entry belongs to a newer call for the same fingerprint.
            return;
        }
        entry.interest -= 1;
        if entry.interest == 0 {
            metric!(counter("calls.inflight.aborted") += 1);
            entry.abort.abort();
            inner.entries.remove(&self.fingerprint);
        }
    }
}
