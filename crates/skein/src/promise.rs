// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-assignment value cells.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::continuation::{self, pause_unfailing, Continuation, UnfailingContinuation};
use crate::error::{Error, Result};
use crate::leak::{self, Violation};
use crate::snapshot::{Parcel, Snapshot};
use crate::task::Uncancellable;

const WAITING: u8 = 0;
const SUCCEEDED: u8 = 1;
const FAILED: u8 = 2;

/// Lifecycle of a [`Promise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseStatus {
    Waiting,
    Succeeded,
    Failed,
}

/// A value written once and read by anyone.
///
/// Dropping a promise nobody wrote is a leak.
pub struct Promise<T> {
    continuation: Continuation<T>,
    task: Uncancellable<T>,
    state: AtomicU8,
}

impl<T: Send + Sync + 'static> Promise<T> {
    pub fn new() -> Self {
        let (continuation, suspension) = continuation::suspend(None);
        Self {
            continuation,
            task: Uncancellable::new(suspension),
            state: AtomicU8::new(WAITING),
        }
    }

    /// Fulfil the promise. Fails with `AlreadyWritten` if it was written.
    pub fn succeed(&self, value: T) -> Result<()> {
        self.settle(SUCCEEDED)?;
        self.continuation.resume(value);
        Ok(())
    }

    /// Break the promise with `error`.
    pub fn fail(&self, error: Error) -> Result<()> {
        self.settle(FAILED)?;
        self.continuation.resume_with_error(error);
        Ok(())
    }

    pub async fn value(&self) -> Result<T>
    where
        T: Clone,
    {
        self.task.value().await
    }

    pub async fn result(&self) -> Arc<Result<T>> {
        self.task.result().await
    }
}

impl<T> Promise<T> {
    fn settle(&self, to: u8) -> Result<()> {
        self.state
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|_| Error::AlreadyWritten)
    }

    pub fn status(&self) -> PromiseStatus {
        match self.state.load(Ordering::Acquire) {
            WAITING => PromiseStatus::Waiting,
            SUCCEEDED => PromiseStatus::Succeeded,
            _ => PromiseStatus::Failed,
        }
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        // The continuation reports the leak itself and unblocks the task.
        self.task.release();
    }
}

enum Rendezvous<T> {
    Empty,
    Offered {
        parcel: Arc<Parcel<T>>,
        ack: Arc<UnfailingContinuation<()>>,
    },
    Awaited(Arc<UnfailingContinuation<T>>),
    Complete,
}

impl<T> Clone for Rendezvous<T> {
    fn clone(&self) -> Self {
        match self {
            Rendezvous::Empty => Rendezvous::Empty,
            Rendezvous::Offered { parcel, ack } => Rendezvous::Offered {
                parcel: parcel.clone(),
                ack: ack.clone(),
            },
            Rendezvous::Awaited(reader) => Rendezvous::Awaited(reader.clone()),
            Rendezvous::Complete => Rendezvous::Complete,
        }
    }
}

/// One producer hands one value to one consumer.
///
/// Both sides suspend until the other shows up. Writing twice, waiting twice,
/// or dropping the cell before the handoff are contract violations.
pub struct UnbreakablePromise<T> {
    id: u64,
    state: Snapshot<Rendezvous<T>>,
}

impl<T: Send + 'static> UnbreakablePromise<T> {
    pub fn new() -> Self {
        Self {
            id: continuation::next_id(),
            state: Snapshot::new(Rendezvous::Empty),
        }
    }

    /// Hand over `value`, waiting until the consumer takes it.
    pub async fn succeed(&self, value: T) {
        let parcel = Arc::new(Parcel::new(value));
        pause_unfailing(|ack: UnfailingContinuation<()>| {
            let ack = Arc::new(ack);
            loop {
                let current = self.state.load();
                match &*current {
                    Rendezvous::Empty => {
                        let offered = Rendezvous::Offered {
                            parcel: parcel.clone(),
                            ack: ack.clone(),
                        };
                        if self.state.replace(&current, offered) {
                            return;
                        }
                    }
                    Rendezvous::Awaited(reader) => {
                        if self.state.replace(&current, Rendezvous::Complete) {
                            if let Some(value) = parcel.take() {
                                reader.resume(value);
                            }
                            ack.resume(());
                            return;
                        }
                    }
                    Rendezvous::Offered { .. } | Rendezvous::Complete => {
                        leak::report(Violation::DoubleWrite {
                            kind: "UnbreakablePromise",
                            id: self.id,
                        });
                        ack.resume(());
                        return;
                    }
                }
            }
        })
        .await
    }

    /// Wait for the producer's value.
    pub async fn value(&self) -> T {
        pause_unfailing(|reader: UnfailingContinuation<T>| {
            let reader = Arc::new(reader);
            loop {
                let current = self.state.load();
                match &*current {
                    Rendezvous::Empty => {
                        if self.state.replace(&current, Rendezvous::Awaited(reader.clone())) {
                            return;
                        }
                    }
                    Rendezvous::Offered { parcel, ack } => {
                        if self.state.replace(&current, Rendezvous::Complete) {
                            if let Some(value) = parcel.take() {
                                reader.resume(value);
                            }
                            ack.resume(());
                            return;
                        }
                    }
                    Rendezvous::Awaited(_) | Rendezvous::Complete => {
                        leak::report(Violation::DoubleWait {
                            kind: "UnbreakablePromise",
                            id: self.id,
                        });
                        reader.offer_leak("UnbreakablePromise");
                        return;
                    }
                }
            }
        })
        .await
    }
}

impl<T> UnbreakablePromise<T> {
    /// True once the value changed hands.
    pub fn is_complete(&self) -> bool {
        matches!(*self.state.load(), Rendezvous::Complete)
    }
}

impl<T: Send + 'static> Default for UnbreakablePromise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for UnbreakablePromise<T> {
    fn drop(&mut self) {
        if !self.is_complete() {
            leak::report(Violation::Leaked {
                kind: "UnbreakablePromise",
                id: self.id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn succeed_then_read() {
        let p = Promise::new();
        assert_eq!(p.status(), PromiseStatus::Waiting);
        p.succeed(7).unwrap();
        assert_eq!(p.status(), PromiseStatus::Succeeded);
        assert_eq!(p.value().await.unwrap(), 7);
        assert_eq!(p.value().await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_write_is_rejected() {
        let p = Promise::new();
        p.succeed("first").unwrap();
        assert!(matches!(p.succeed("second"), Err(Error::AlreadyWritten)));
        assert!(matches!(p.fail(Error::Closed), Err(Error::AlreadyWritten)));
        assert_eq!(p.value().await.unwrap(), "first");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_reaches_every_reader() {
        let p = Arc::new(Promise::<u8>::new());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.result().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(5)).await;
        p.fail(Error::msg("broken")).unwrap();
        assert_eq!(p.status(), PromiseStatus::Failed);
        for reader in readers {
            let outcome = reader.await.unwrap();
            assert_eq!(outcome.as_ref().as_ref().unwrap_err().to_string(), "broken");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unbreakable_reader_first() {
        let cell = Arc::new(UnbreakablePromise::new());
        let reader = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.value().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        cell.succeed(String::from("hi")).await;
        assert_eq!(reader.await.unwrap(), "hi");
        assert!(cell.is_complete());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unbreakable_writer_first() {
        let cell = Arc::new(UnbreakablePromise::new());
        let writer = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.succeed(11).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!cell.is_complete());
        assert_eq!(cell.value().await, 11);
        writer.await.unwrap();
    }
}
