// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task handles.
//!
//! A task is a future spawned on the tokio runtime. Its handle observes the
//! single terminal outcome and, for [`TaskHandle`], requests cooperative
//! cancellation. A handle dropped while its task is still running is a leak:
//! it must be awaited, cancelled, or explicitly [detached](TaskHandle::detach).

use std::any::Any;
use std::cell::Cell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::FutureExt;

use crate::cancel::{self, CancelToken};
use crate::continuation::{self, pause, Continuation};
use crate::error::{Error, Result};
use crate::leak::{self, Violation};
use crate::snapshot::Snapshot;

const RUNNING: u8 = 0;
const CANCELLING: u8 = 1;
const FINISHED: u8 = 2;
const CANCELLED: u8 = 3;

thread_local! {
    /// Set while a value produced after cancellation is being dropped.
    static DISCARDING: Cell<bool> = const { Cell::new(false) };
}

struct Discarding;

impl Drop for Discarding {
    fn drop(&mut self) {
        DISCARDING.with(|flag| flag.set(false));
    }
}

/// Drop a value its task can no longer deliver. Running handles inside it
/// are cancelled rather than reported as leaks.
fn discard<V>(value: V) {
    DISCARDING.with(|flag| flag.set(true));
    let _reset = Discarding;
    drop(value);
}

fn discarding() -> bool {
    DISCARDING.with(Cell::get)
}

/// Observable lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    /// Completed with a value or a failure other than cancellation.
    Finished,
    Cancelled,
}

enum Outcome<T> {
    Pending(Vec<Arc<Continuation<Arc<Result<T>>>>>),
    Ready(Arc<Result<T>>),
}

impl<T> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Pending(waiters) => Outcome::Pending(waiters.clone()),
            Outcome::Ready(result) => Outcome::Ready(result.clone()),
        }
    }
}

struct Core<T> {
    id: u64,
    status: AtomicU8,
    token: Option<Arc<CancelToken>>,
    outcome: Snapshot<Outcome<T>>,
}

impl<T: Send + Sync + 'static> Core<T> {
    fn spawn<F>(token: Option<Arc<CancelToken>>, operation: F) -> Arc<Self>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let core = Arc::new(Core {
            id: continuation::next_id(),
            status: AtomicU8::new(RUNNING),
            token,
            outcome: Snapshot::new(Outcome::Pending(Vec::new())),
        });
        tracing::debug!(task = core.id, cancellable = core.token.is_some(), "task spawned");

        let task = core.clone();
        tokio::spawn(async move {
            let body = AssertUnwindSafe(operation).catch_unwind();
            let caught = match &task.token {
                Some(token) => cancel::scope(token.clone(), body).await,
                None => body.await,
            };
            let result = caught.unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::warn!(task = task.id, %message, "task panicked");
                Err(Error::Panicked(message))
            });
            task.complete(result);
        });
        core
    }

    fn complete(&self, result: Result<T>) {
        let terminal = match &result {
            Err(Error::Cancelled) => CANCELLED,
            _ => FINISHED,
        };
        let result = match self
            .status
            .compare_exchange(RUNNING, terminal, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => result,
            Err(_) => {
                // Cancel requested before the body returned.
                self.status.store(CANCELLED, Ordering::Release);
                discard(result);
                Err(Error::Cancelled)
            }
        };
        tracing::debug!(task = self.id, ok = result.is_ok(), "task completed");
        self.publish(Arc::new(result));
    }

    fn publish(&self, shared: Arc<Result<T>>) {
        loop {
            let current = self.outcome.load();
            let Outcome::Pending(waiters) = &*current else {
                return;
            };
            if self.outcome.replace(&current, Outcome::Ready(shared.clone())) {
                for waiter in waiters {
                    let _ = waiter.offer(Ok(shared.clone()));
                }
                return;
            }
        }
    }

    async fn wait(&self) -> Arc<Result<T>> {
        if let Outcome::Ready(result) = &*self.outcome.load() {
            return result.clone();
        }
        let mut waiter_id = 0;
        let waiting = pause(|waiter: Continuation<Arc<Result<T>>>| {
            waiter_id = waiter.id();
            let waiter = Arc::new(waiter);
            loop {
                let current = self.outcome.load();
                match &*current {
                    Outcome::Ready(result) => {
                        let _ = waiter.offer(Ok(result.clone()));
                        return;
                    }
                    Outcome::Pending(waiters) => {
                        let mut next = waiters.clone();
                        next.push(waiter.clone());
                        if self.outcome.replace(&current, Outcome::Pending(next)) {
                            return;
                        }
                    }
                }
            }
        });
        match waiting.await {
            Ok(result) => result,
            Err(error) => {
                self.forget(waiter_id);
                Arc::new(Err(error))
            }
        }
    }

    /// Drop an observer that stopped waiting.
    fn forget(&self, waiter_id: u64) {
        loop {
            let current = self.outcome.load();
            let Outcome::Pending(waiters) = &*current else {
                return;
            };
            let Some(position) = waiters.iter().position(|w| w.id() == waiter_id) else {
                return;
            };
            let mut next = waiters.clone();
            next.remove(position);
            if self.outcome.replace(&current, Outcome::Pending(next)) {
                return;
            }
        }
    }
}

impl<T> Core<T> {
    fn request_cancel(&self) -> bool {
        let Some(token) = &self.token else {
            return false;
        };
        if self
            .status
            .compare_exchange(RUNNING, CANCELLING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        tracing::debug!(task = self.id, "task cancellation requested");
        token.cancel();
        true
    }

    fn status(&self) -> Status {
        match self.status.load(Ordering::Acquire) {
            RUNNING | CANCELLING => Status::Running,
            FINISHED => Status::Finished,
            _ => Status::Cancelled,
        }
    }

    fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == RUNNING
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a cancellable task.
pub struct TaskHandle<T> {
    core: Arc<Core<T>>,
    detached: bool,
}

impl<T: Send + Sync + 'static> TaskHandle<T> {
    /// Spawn `operation` on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new<F>(operation: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            core: Core::spawn(Some(Arc::new(CancelToken::new())), operation),
            detached: false,
        }
    }

    /// Wait for the task and return a copy of its outcome.
    pub async fn value(&self) -> Result<T>
    where
        T: Clone,
    {
        (*self.result().await).clone()
    }

    /// Wait for the task and return its shared outcome.
    ///
    /// If the caller is cancelled while waiting, the outcome it sees is
    /// `Err(Cancelled)`; the observed task is not affected.
    pub async fn result(&self) -> Arc<Result<T>> {
        self.core.wait().await
    }

    /// Transform the success value. Cancelling the returned handle cancels
    /// this one too.
    pub fn map<U, F>(self, transform: F) -> TaskHandle<U>
    where
        T: Clone,
        U: Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        TaskHandle::new(async move {
            let source = self;
            let outcome = source.result().await;
            if cancel::is_cancelled() {
                source.cancel();
                return Err(Error::Cancelled);
            }
            match &*outcome {
                Ok(value) => Ok(transform(value.clone())),
                Err(error) => Err(error.clone()),
            }
        })
    }
}

impl<T> TaskHandle<T> {
    /// Request cooperative cancellation. Idempotent; does not wait.
    pub fn cancel(&self) {
        self.core.request_cancel();
    }

    pub fn status(&self) -> Status {
        self.core.status()
    }

    /// True once cancellation was requested or took effect.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.core.status.load(Ordering::Acquire),
            CANCELLING | CANCELLED
        )
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Let the task run on without anyone observing it.
    pub fn detach(mut self) {
        self.detached = true;
        tracing::debug!(task = self.core.id, "task detached");
    }
}

impl<T: Clone + Send + Sync + 'static> TaskHandle<TaskHandle<T>> {
    /// Flatten a task that produces a task.
    pub fn join(self) -> TaskHandle<T> {
        TaskHandle::new(async move {
            let outer = self;
            let first = outer.result().await;
            if cancel::is_cancelled() {
                outer.cancel();
                if let Ok(inner) = &*first {
                    inner.cancel();
                }
                return Err(Error::Cancelled);
            }
            let inner = match &*first {
                Ok(inner) => inner,
                Err(error) => return Err(error.clone()),
            };
            let second = inner.result().await;
            if cancel::is_cancelled() {
                inner.cancel();
                return Err(Error::Cancelled);
            }
            (*second).clone()
        })
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if self.detached || !self.core.is_running() {
            return;
        }
        self.core.request_cancel();
        if discarding() {
            tracing::debug!(task = self.core.id, "discarded handle cancelled");
            return;
        }
        leak::report(Violation::Leaked {
            kind: "TaskHandle",
            id: self.core.id,
        });
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.core.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Handle to a task that cannot be cancelled.
///
/// The body runs outside any cancel scope, so nothing it suspends on is ever
/// interrupted.
pub struct Uncancellable<T> {
    core: Arc<Core<T>>,
    released: bool,
}

impl<T: Send + Sync + 'static> Uncancellable<T> {
    pub fn new<F>(operation: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            core: Core::spawn(None, operation),
            released: false,
        }
    }

    pub async fn value(&self) -> Result<T>
    where
        T: Clone,
    {
        (*self.result().await).clone()
    }

    pub async fn result(&self) -> Arc<Result<T>> {
        self.core.wait().await
    }
}

impl<T> Uncancellable<T> {
    pub fn status(&self) -> Status {
        self.core.status()
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn detach(mut self) {
        self.release();
    }

    /// Skip the leak check on drop. The owner reports on its own terms.
    pub(crate) fn release(&mut self) {
        self.released = true;
    }
}

impl<T> Drop for Uncancellable<T> {
    fn drop(&mut self) {
        if !self.released && self.core.is_running() && !discarding() {
            leak::report(Violation::Leaked {
                kind: "Uncancellable",
                id: self.core.id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn value_returns_body_result() {
        let h = TaskHandle::new(async { Ok(42) });
        assert_eq!(h.value().await.unwrap(), 42);
        assert_eq!(h.status(), Status::Finished);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failures_are_shared_by_observers() {
        let h = TaskHandle::<u8>::new(async { Err(Error::msg("nope")) });
        let a = h.result().await;
        let b = h.result().await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.as_ref().as_ref().unwrap_err().to_string(), "nope");
        assert_eq!(h.status(), Status::Finished);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panics_become_errors() {
        let h = TaskHandle::<i32>::new(async { panic!("boom") });
        match h.value().await {
            Err(Error::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_interrupts_suspended_body() {
        let h = TaskHandle::new(async {
            time::sleep(Duration::from_secs(30)).await?;
            Ok("slept")
        });
        h.cancel();
        h.cancel();
        assert!(h.is_cancelled());
        assert!(matches!(h.value().await, Err(Error::Cancelled)));
        assert_eq!(h.status(), Status::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_after_finish_is_noop() {
        let h = TaskHandle::new(async { Ok(1) });
        assert_eq!(h.value().await.unwrap(), 1);
        h.cancel();
        assert!(!h.is_cancelled());
        assert_eq!(h.value().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn body_that_ignores_cancel_still_reports_cancelled() {
        let h = TaskHandle::new(async {
            while !cancel::is_cancelled() {
                tokio::task::yield_now().await;
            }
            Ok("done anyway")
        });
        h.cancel();
        assert!(matches!(h.value().await, Err(Error::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn map_transforms_success() {
        let h = TaskHandle::new(async { Ok(20) }).map(|v| v * 2 + 2);
        assert_eq!(h.value().await.unwrap(), 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn map_forwards_failure() {
        let h = TaskHandle::<u8>::new(async { Err(Error::Closed) }).map(|v| v + 1);
        assert!(matches!(h.value().await, Err(Error::Closed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelling_mapped_cancels_source() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let source = TaskHandle::new(async move {
            let slept = time::sleep(Duration::from_secs(30)).await;
            let _ = tx.send(slept.is_err());
            slept.map(|_| 1)
        });
        let mapped = source.map(|v| v + 1);
        tokio::task::yield_now().await;
        mapped.cancel();
        assert!(matches!(mapped.value().await, Err(Error::Cancelled)));
        assert!(rx.await.unwrap(), "source observed cancellation");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn join_flattens() {
        let h = TaskHandle::new(async { Ok(TaskHandle::new(async { Ok("inner") })) }).join();
        assert_eq!(h.value().await.unwrap(), "inner");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelling_join_reaches_inner_produced_late() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let outer = TaskHandle::new(async move {
            // Not a cancellation point: the outer body finishes anyway.
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(TaskHandle::new(async move {
                let slept = time::sleep(Duration::from_secs(30)).await;
                let _ = tx.send(slept.is_err());
                slept
            }))
        });
        let joined = outer.join();
        tokio::time::sleep(Duration::from_millis(10)).await;
        joined.cancel();
        assert!(matches!(joined.value().await, Err(Error::Cancelled)));
        let cancelled = tokio::time::timeout(Duration::from_secs(2), rx).await;
        assert!(cancelled.unwrap().unwrap(), "inner task observed cancellation");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelling_join_reaches_running_inner() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let joined = TaskHandle::new(async move {
            Ok(TaskHandle::new(async move {
                let slept = time::sleep(Duration::from_secs(30)).await;
                let _ = tx.send(slept.is_err());
                slept
            }))
        })
        .join();
        tokio::time::sleep(Duration::from_millis(10)).await;
        joined.cancel();
        assert!(matches!(joined.value().await, Err(Error::Cancelled)));
        assert!(rx.await.unwrap());
    }

    fn pending_observers<T>(handle: &TaskHandle<T>) -> usize {
        match &*handle.core.outcome.load() {
            Outcome::Pending(waiters) => waiters.len(),
            Outcome::Ready(_) => 0,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_observers_are_pruned() {
        let watched = Arc::new(TaskHandle::new(async {
            time::sleep(Duration::from_secs(30)).await?;
            Ok(())
        }));
        let observers: Vec<_> = (0..3)
            .map(|_| {
                let watched = watched.clone();
                TaskHandle::new(async move {
                    let _ = watched.result().await;
                    Ok(())
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pending_observers(&watched), 3);
        for observer in &observers {
            observer.cancel();
        }
        for observer in &observers {
            assert!(matches!(*observer.result().await, Err(Error::Cancelled)));
        }
        assert_eq!(pending_observers(&watched), 0);
        watched.cancel();
        assert!(matches!(*watched.result().await, Err(Error::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn detached_task_keeps_running() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        TaskHandle::new(async move {
            let _ = tx.send(7);
            Ok(())
        })
        .detach();
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn uncancellable_ignores_token() {
        let h = Uncancellable::new(async {
            assert!(!cancel::is_cancelled());
            Ok(3)
        });
        assert_eq!(h.value().await.unwrap(), 3);
        assert_eq!(h.status(), Status::Finished);
    }

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&5u8), "unknown panic");
    }
}
