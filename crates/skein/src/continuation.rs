// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-shot resumption handles.
//!
//! [`pause`] suspends the calling task and hands a [`Continuation`] to a setup
//! closure. The task stays parked until somebody resumes the continuation,
//! the task is cancelled, or the continuation is dropped unresumed (a leak).
//! Exactly one of those wins; the slot status is the arbiter.

use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::cancel::{self, CancelToken, Interrupt};
use crate::error::{Error, Result};
use crate::leak::{self, Violation};

const WAITING: u8 = 0;
const RESUMED: u8 = 1;
const INTERRUPTED: u8 = 2;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

struct Slot<T> {
    id: u64,
    status: AtomicU8,
    sender: UnsafeCell<Option<oneshot::Sender<Result<T>>>>,
}

// SAFETY: `sender` is only taken by the thread whose CAS moved `status` out
// of WAITING, which happens once.
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    fn claim(&self, to: u8) -> std::result::Result<oneshot::Sender<Result<T>>, u8> {
        match self
            .status
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
        {
            // SAFETY: the CAS above is the single exclusive claim.
            Ok(_) => unsafe { (*self.sender.get()).take() }.ok_or(to),
            Err(actual) => Err(actual),
        }
    }

    fn withdraw(&self) {
        drop(self.claim(INTERRUPTED));
    }
}

impl<T: Send> Interrupt for Slot<T> {
    fn interrupt(&self) {
        if let Ok(sender) = self.claim(INTERRUPTED) {
            let _ = sender.send(Err(Error::Cancelled));
        }
    }
}

/// Resumes exactly one suspended task, exactly once.
pub struct Continuation<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Continuation<T> {
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// True until the continuation is resumed or its task interrupted.
    pub fn is_pending(&self) -> bool {
        self.slot.status.load(Ordering::Acquire) == WAITING
    }

    pub fn resume(&self, value: T) {
        self.resume_with(Ok(value));
    }

    pub fn resume_with_error(&self, error: Error) {
        self.resume_with(Err(error));
    }

    /// Deliver `result` to the suspended task.
    ///
    /// Resuming twice is a contract violation. Resuming after the task was
    /// interrupted is a no-op.
    pub fn resume_with(&self, result: Result<T>) {
        match self.slot.claim(RESUMED) {
            Ok(sender) => {
                let _ = sender.send(result);
            }
            Err(RESUMED) => leak::report(Violation::DoubleResume { id: self.slot.id }),
            Err(_) => tracing::trace!(id = self.slot.id, "resume after interrupt ignored"),
        }
    }

    /// Deliver `result` if the task is still waiting; otherwise hand it back.
    pub(crate) fn offer(&self, result: Result<T>) -> std::result::Result<(), Result<T>> {
        match self.slot.claim(RESUMED) {
            Ok(sender) => sender.send(result),
            Err(_) => Err(result),
        }
    }

    pub(crate) fn offer_value(&self, value: T) -> std::result::Result<(), T> {
        match self.offer(Ok(value)) {
            Ok(()) => Ok(()),
            Err(Ok(value)) => Err(value),
            Err(Err(_)) => unreachable!("offer hands back what it was given"),
        }
    }
}

impl<T> Drop for Continuation<T> {
    fn drop(&mut self) {
        if let Ok(sender) = self.slot.claim(RESUMED) {
            let _ = sender.send(Err(Error::Leaked("Continuation")));
            leak::report(Violation::Leaked {
                kind: "Continuation",
                id: self.slot.id,
            });
        }
    }
}

impl<T> std::fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("id", &self.slot.id)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// The parked side of a continuation. Resolves to whatever it was resumed with.
pub struct Suspension<T> {
    slot: Arc<Slot<T>>,
    receiver: oneshot::Receiver<Result<T>>,
    token: Option<Arc<CancelToken>>,
}

impl<T> Future for Suspension<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Leaked("Continuation"))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Suspension<T> {
    fn drop(&mut self) {
        self.slot.withdraw();
        if let Some(token) = &self.token {
            token.deregister(self.slot.id);
        }
    }
}

/// Build a continuation bound to `token`, if any.
pub(crate) fn suspend<T: Send + 'static>(
    token: Option<Arc<CancelToken>>,
) -> (Continuation<T>, Suspension<T>) {
    let (sender, receiver) = oneshot::channel();
    let slot = Arc::new(Slot {
        id: next_id(),
        status: AtomicU8::new(WAITING),
        sender: UnsafeCell::new(Some(sender)),
    });
    if let Some(token) = &token {
        token.register(slot.id, slot.clone());
    }
    (
        Continuation { slot: slot.clone() },
        Suspension {
            slot,
            receiver,
            token,
        },
    )
}

/// Suspend the current task until the continuation passed to `setup` is
/// resumed.
///
/// `setup` runs immediately. Inside a cancellable task the suspension also
/// resolves to `Err(Cancelled)` when the task is cancelled; if it already
/// was, it resolves that way without waiting.
pub fn pause<T, F>(setup: F) -> Suspension<T>
where
    T: Send + 'static,
    F: FnOnce(Continuation<T>),
{
    let (continuation, suspension) = suspend(cancel::current());
    setup(continuation);
    suspension
}

/// A continuation that can only succeed.
pub struct UnfailingContinuation<T>(Continuation<T>);

impl<T> UnfailingContinuation<T> {
    pub fn resume(&self, value: T) {
        self.0.resume(value);
    }

    pub fn id(&self) -> u64 {
        self.0.id()
    }

    pub fn is_pending(&self) -> bool {
        self.0.is_pending()
    }

    pub(crate) fn offer_leak(&self, kind: &'static str) {
        let _ = self.0.offer(Err(Error::Leaked(kind)));
    }
}

/// Like [`pause`], but ignores cancellation and yields the value directly.
///
/// # Panics
///
/// The returned future panics if the continuation is dropped without being
/// resumed.
pub fn pause_unfailing<T, F>(setup: F) -> impl Future<Output = T>
where
    T: Send + 'static,
    F: FnOnce(UnfailingContinuation<T>),
{
    let (continuation, suspension) = suspend(None);
    setup(UnfailingContinuation(continuation));
    async move {
        match suspension.await {
            Ok(value) => value,
            Err(error) => panic!("unfailing suspension broken: {error}"),
        }
    }
}
