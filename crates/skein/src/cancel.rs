// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation.
//!
//! Every cancellable task runs inside the scope of a [`CancelToken`]. Code
//! that suspends inside the task registers what it is waiting on with the
//! token; cancelling the token interrupts all of it. Nothing is unwound from
//! outside: the task observes the interruption at its suspension point and
//! returns on its own.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

use crate::error::Error;
use crate::snapshot::Snapshot;

/// Something a token can wake when it trips.
pub(crate) trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

#[derive(Clone)]
enum Registry {
    Armed(Vec<(u64, Arc<dyn Interrupt>)>),
    Tripped,
}

/// Cancellation flag shared between a task and its handle.
pub struct CancelToken {
    state: Snapshot<Registry>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            state: Snapshot::new(Registry::Armed(Vec::new())),
        }
    }

    /// Trip the token and interrupt everything registered with it.
    /// Returns false if it was already tripped.
    pub fn cancel(&self) -> bool {
        loop {
            let current = self.state.load();
            let Registry::Armed(waiting) = &*current else {
                return false;
            };
            if self.state.replace(&current, Registry::Tripped) {
                for (_, target) in waiting {
                    target.interrupt();
                }
                return true;
            }
        }
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.load(), Registry::Tripped)
    }

    /// Register `target` under `id`. A tripped token interrupts it at once
    /// and returns false.
    pub(crate) fn register(&self, id: u64, target: Arc<dyn Interrupt>) -> bool {
        loop {
            let current = self.state.load();
            let Registry::Armed(waiting) = &*current else {
                target.interrupt();
                return false;
            };
            let mut next = waiting.clone();
            next.push((id, target.clone()));
            if self.state.replace(&current, Registry::Armed(next)) {
                return true;
            }
        }
    }

    pub(crate) fn deregister(&self, id: u64) {
        loop {
            let current = self.state.load();
            let Registry::Armed(waiting) = &*current else {
                return;
            };
            if !waiting.iter().any(|(entry, _)| *entry == id) {
                return;
            }
            let next = waiting
                .iter()
                .filter(|(entry, _)| *entry != id)
                .cloned()
                .collect();
            if self.state.replace(&current, Registry::Armed(next)) {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

tokio::task_local! {
    static CURRENT: Arc<CancelToken>;
}

/// Run `future` with `token` as the current task's token.
pub(crate) fn scope<F: Future>(token: Arc<CancelToken>, future: F) -> impl Future<Output = F::Output> {
    CURRENT.scope(token, future)
}

/// Token of the task currently executing, if it is cancellable.
pub(crate) fn current() -> Option<Arc<CancelToken>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Check if the current task has been cancelled.
///
/// Always false outside a cancellable task.
pub fn is_cancelled() -> bool {
    current().is_some_and(|token| token.is_cancelled())
}

/// `Err(Cancelled)` once the current task has been cancelled.
pub fn checkpoint() -> Result<(), Error> {
    if is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Future that resolves when the current task is cancelled.
///
/// Outside a cancellable task it never resolves.
pub fn cancellation() -> Cancellation {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    let alarm = Arc::new(Alarm {
        fired: AtomicBool::new(false),
        waker: AtomicWaker::new(),
    });
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let token = current();
    if let Some(token) = &token {
        token.register(id, alarm.clone());
    }
    Cancellation { token, alarm, id }
}

struct Alarm {
    fired: AtomicBool,
    waker: AtomicWaker,
}

impl Interrupt for Alarm {
    fn interrupt(&self) {
        self.fired.store(true, Ordering::Release);
        self.waker.wake();
    }
}

/// Returned by [`cancellation`].
pub struct Cancellation {
    token: Option<Arc<CancelToken>>,
    alarm: Arc<Alarm>,
    id: u64,
}

impl Future for Cancellation {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.token.is_none() {
            return Poll::Pending;
        }
        self.alarm.waker.register(cx.waker());
        if self.alarm.fired.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Cancellation {
    fn drop(&mut self) {
        if let Some(token) = &self.token {
            token.deregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    impl Interrupt for Counter {
        fn interrupt(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_interrupts_registered_targets_once() {
        let token = CancelToken::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        assert!(token.register(1, counter.clone()));
        token.cancel();
        token.cancel();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_after_cancel_interrupts_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        assert!(!token.register(1, counter.clone()));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregistered_targets_are_skipped() {
        let token = CancelToken::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        token.register(1, counter.clone());
        token.deregister(1);
        token.cancel();
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn outside_a_task_nothing_is_cancelled() {
        assert!(!is_cancelled());
        assert!(checkpoint().is_ok());
    }

    #[tokio::test]
    async fn cancellation_resolves_inside_scope() {
        let token = Arc::new(CancelToken::new());
        let trip = token.clone();
        let waited = scope(token, async move {
            let pending = cancellation();
            trip.cancel();
            pending.await;
            checkpoint()
        })
        .await;
        assert!(matches!(waited, Err(Error::Cancelled)));
    }
}
