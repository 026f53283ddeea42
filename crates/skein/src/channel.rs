// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Lock-free channels.
//!
//! The whole channel is one immutable snapshot: buffered values, blocked
//! readers, blocked writers and the phase. Every operation loads it, builds
//! the next snapshot and publishes it with a compare-and-swap, retrying on
//! contention. Parties removed from a snapshot are resumed only after the
//! swap succeeded, so each wake-up happens exactly once.
//!
//! At most one of these holds at a time: the buffer is non-empty, readers
//! are waiting (buffer empty), or writers are waiting (buffer full).
//!
//! Building the next snapshot copies its queues, so every operation is linear
//! in the number of values and parties currently held.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::continuation::{self, pause, Continuation};
use crate::error::{Error, Result};
use crate::snapshot::{Parcel, Snapshot};

/// What a full buffer does with the next write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overflow {
    /// Block the writer until a slot frees up.
    #[default]
    Suspend,
    /// Fail the write with [`Error::Dropped`].
    Drop,
}

/// Buffering strategy of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capacity {
    /// Writers wait until a reader takes their value.
    #[default]
    Rendezvous,
    /// Up to `size` values are held without blocking their writers.
    Bounded { size: usize, overflow: Overflow },
    /// No limit on buffered values. Each write and read copies the backlog,
    /// so filling it with n values costs O(n²) overall.
    Unbounded,
}

impl Capacity {
    fn slots(self) -> usize {
        match self {
            Capacity::Rendezvous => 1,
            Capacity::Bounded { size, .. } => size.max(1),
            Capacity::Unbounded => usize::MAX,
        }
    }

    fn is_rendezvous(self) -> bool {
        matches!(
            self,
            Capacity::Rendezvous | Capacity::Bounded { size: 0, .. }
        )
    }

    fn overflow(self) -> Overflow {
        match self {
            Capacity::Bounded { overflow, .. } => overflow,
            _ => Overflow::Suspend,
        }
    }
}

/// A value in the channel and the writer waiting on it, if any.
struct Pending<T> {
    parcel: Parcel<T>,
    ack: Option<Arc<Continuation<()>>>,
}

impl<T> Pending<T> {
    fn new(value: T, ack: Option<Arc<Continuation<()>>>) -> Arc<Self> {
        Arc::new(Self {
            parcel: Parcel::new(value),
            ack,
        })
    }

    /// Let the writer go. Harmless if it already left.
    fn release(&self) {
        if let Some(ack) = &self.ack {
            let_go(ack);
        }
    }

    fn settle(&self, result: Result<()>) {
        if let Some(ack) = &self.ack {
            let _ = ack.offer(result);
        }
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Open,
    Finished,
    Cancelled(Error),
}

struct State<T> {
    buffer: VecDeque<Arc<Pending<T>>>,
    readers: VecDeque<Arc<Continuation<T>>>,
    writers: VecDeque<Arc<Pending<T>>>,
    /// Accepted values a cancel took out of the queue, kept for the owner.
    stranded: VecDeque<Arc<Pending<T>>>,
    phase: Phase,
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            readers: self.readers.clone(),
            writers: self.writers.clone(),
            stranded: self.stranded.clone(),
            phase: self.phase.clone(),
        }
    }
}

impl<T> State<T> {
    fn empty(phase: Phase) -> Self {
        Self {
            buffer: VecDeque::new(),
            readers: VecDeque::new(),
            writers: VecDeque::new(),
            stranded: VecDeque::new(),
            phase,
        }
    }
}

enum Placement<T> {
    Delivered,
    Queued(Arc<Pending<T>>),
    Rejected(Error),
}

struct Inner<T> {
    id: u64,
    capacity: Capacity,
    retains: AtomicBool,
    state: Snapshot<State<T>>,
}

/// Multi-producer, multi-consumer channel. Clones share the same queue.
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Channel<T> {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: continuation::next_id(),
                capacity,
                retains: AtomicBool::new(false),
                state: Snapshot::new(State::empty(Phase::Open)),
            }),
        }
    }

    pub fn rendezvous() -> Self {
        Self::new(Capacity::Rendezvous)
    }

    /// Buffer up to `size` values; further writers wait.
    pub fn bounded(size: usize) -> Self {
        Self::new(Capacity::Bounded {
            size,
            overflow: Overflow::Suspend,
        })
    }

    pub fn unbounded() -> Self {
        Self::new(Capacity::Unbounded)
    }

    /// Send `value`, waiting for room (or for a reader, on a rendezvous
    /// channel).
    ///
    /// If the writing task is cancelled while its value is still in the
    /// channel, the value is taken back and the write fails with
    /// `Cancelled`. If a reader got it first, the write succeeds.
    pub async fn write(&self, value: T) -> Result<()> {
        let mut placement = Placement::Delivered;
        let acked = pause(|ack: Continuation<()>| placement = self.offer(value, Arc::new(ack))).await;
        match placement {
            Placement::Delivered => Ok(()),
            Placement::Rejected(error) => Err(error),
            Placement::Queued(entry) => match acked {
                Ok(()) => Ok(()),
                Err(error) => self.recall(&entry, error),
            },
        }
    }

    /// Receive the oldest value, waiting if there is none.
    ///
    /// Fails with `Finished` once the channel is finished and drained, or
    /// with the cancel error once it is cancelled.
    pub async fn read(&self) -> Result<T> {
        let mut reader_id = 0;
        let got = pause(|reader: Continuation<T>| {
            reader_id = reader.id();
            self.take_or_wait(reader);
        })
        .await;
        if got.is_err() {
            self.forget(reader_id);
        }
        got
    }

    /// Receive without waiting. `Ok(None)` when open and empty.
    pub fn try_read(&self) -> Result<Option<T>> {
        loop {
            let current = self.inner.state.load();
            if current.buffer.is_empty() {
                return match &current.phase {
                    Phase::Open => Ok(None),
                    Phase::Finished => Err(Error::Finished),
                    Phase::Cancelled(error) => Err(error.clone()),
                };
            }
            if let Some(value) = self.take_front(&current) {
                return Ok(Some(value));
            }
        }
    }

    fn offer(&self, value: T, ack: Arc<Continuation<()>>) -> Placement<T> {
        let capacity = self.inner.capacity;
        let mut entry = Pending::new(value, Some(ack.clone()));
        loop {
            let current = self.inner.state.load();
            match &current.phase {
                Phase::Open => {}
                Phase::Finished => {
                    let_go(&ack);
                    return Placement::Rejected(Error::Closed);
                }
                Phase::Cancelled(error) => {
                    let_go(&ack);
                    return Placement::Rejected(error.clone());
                }
            }

            let mut next = (*current).clone();
            if let Some(reader) = next.readers.pop_front() {
                if !self.inner.state.replace(&current, next) {
                    continue;
                }
                let Some(value) = entry.parcel.take() else {
                    return Placement::Delivered;
                };
                match reader.offer_value(value) {
                    Ok(()) => {
                        tracing::trace!(channel = self.inner.id, reader = reader.id(), "handed off");
                        let_go(&ack);
                        return Placement::Delivered;
                    }
                    Err(value) => {
                        // Reader withdrew; try the next one.
                        entry = Pending::new(value, Some(ack.clone()));
                        continue;
                    }
                }
            }

            if next.buffer.len() < capacity.slots() {
                next.buffer.push_back(entry.clone());
                if !self.inner.state.replace(&current, next) {
                    continue;
                }
                if capacity.is_rendezvous() {
                    return Placement::Queued(entry);
                }
                let_go(&ack);
                return Placement::Delivered;
            }

            match capacity.overflow() {
                Overflow::Drop => {
                    let_go(&ack);
                    return Placement::Rejected(Error::Dropped);
                }
                Overflow::Suspend => {
                    next.writers.push_back(entry.clone());
                    if self.inner.state.replace(&current, next) {
                        return Placement::Queued(entry);
                    }
                }
            }
        }
    }

    fn take_or_wait(&self, reader: Continuation<T>) {
        let reader = Arc::new(reader);
        loop {
            let current = self.inner.state.load();
            if !current.buffer.is_empty() {
                let Some(value) = self.take_front(&current) else {
                    continue;
                };
                if let Err(value) = reader.offer_value(value) {
                    self.restore(value);
                }
                return;
            }
            match &current.phase {
                Phase::Finished => {
                    let _ = reader.offer(Err(Error::Finished));
                    return;
                }
                Phase::Cancelled(error) => {
                    let _ = reader.offer(Err(error.clone()));
                    return;
                }
                Phase::Open => {
                    let mut next = (*current).clone();
                    next.readers.push_back(reader.clone());
                    if self.inner.state.replace(&current, next) {
                        return;
                    }
                }
            }
        }
    }

    /// Put a value a withdrawn reader could not accept back at the front.
    fn restore(&self, value: T) {
        let mut entry = Pending::new(value, None);
        loop {
            let current = self.inner.state.load();
            if matches!(current.phase, Phase::Cancelled(_)) {
                if !self.retains() {
                    return;
                }
                let mut next = (*current).clone();
                next.stranded.push_front(entry.clone());
                if self.inner.state.replace(&current, next) {
                    return;
                }
                continue;
            }
            let mut next = (*current).clone();
            if let Some(reader) = next.readers.pop_front() {
                if !self.inner.state.replace(&current, next) {
                    continue;
                }
                let Some(value) = entry.parcel.take() else {
                    return;
                };
                match reader.offer_value(value) {
                    Ok(()) => return,
                    Err(value) => {
                        entry = Pending::new(value, None);
                        continue;
                    }
                }
            }
            next.buffer.push_front(entry.clone());
            if self.inner.state.replace(&current, next) {
                return;
            }
        }
    }
}

impl<T> Channel<T> {
    /// Remove the oldest buffered value and let its writer go. `None` if the
    /// snapshot moved underneath.
    fn take_front(&self, current: &Arc<State<T>>) -> Option<T> {
        let front = current.buffer.front()?.clone();
        let mut next = (**current).clone();
        next.buffer.pop_front();
        let promoted = self.promote(&mut next);
        if !self.inner.state.replace(current, next) {
            return None;
        }
        if let Some(promoted) = promoted {
            if !self.inner.capacity.is_rendezvous() {
                promoted.release();
            }
        }
        front.release();
        front.parcel.take()
    }

    /// Move the first blocked writer into a free buffer slot.
    fn promote(&self, next: &mut State<T>) -> Option<Arc<Pending<T>>> {
        if next.buffer.len() >= self.inner.capacity.slots() {
            return None;
        }
        let writer = next.writers.pop_front()?;
        next.buffer.push_back(writer.clone());
        Some(writer)
    }

    fn recall(&self, entry: &Arc<Pending<T>>, error: Error) -> Result<()> {
        loop {
            let current = self.inner.state.load();
            let mut next = (*current).clone();
            let removed = remove_entry(&mut next.buffer, entry)
                || remove_entry(&mut next.writers, entry)
                || remove_entry(&mut next.stranded, entry);
            if !removed {
                if entry.parcel.is_taken() {
                    return Ok(());
                }
                return match &current.phase {
                    Phase::Cancelled(cancel) => Err(cancel.clone()),
                    // Claimed by a reader that has not taken it yet.
                    _ => Ok(()),
                };
            }
            let promoted = self.promote(&mut next);
            if self.inner.state.replace(&current, next) {
                if let Some(promoted) = promoted {
                    if !self.inner.capacity.is_rendezvous() {
                        promoted.release();
                    }
                }
                tracing::trace!(channel = self.inner.id, %error, "write recalled");
                return Err(error);
            }
        }
    }

    fn forget(&self, reader_id: u64) {
        loop {
            let current = self.inner.state.load();
            let Some(position) = current.readers.iter().position(|r| r.id() == reader_id) else {
                return;
            };
            let mut next = (*current).clone();
            next.readers.remove(position);
            if self.inner.state.replace(&current, next) {
                return;
            }
        }
    }

    /// Stop accepting writes. Values already in the channel stay readable;
    /// waiting readers get `Finished`. Returns false if the channel was not
    /// open.
    pub fn finish(&self) -> bool {
        loop {
            let current = self.inner.state.load();
            if !matches!(current.phase, Phase::Open) {
                return false;
            }
            let mut next = (*current).clone();
            next.phase = Phase::Finished;
            let readers = std::mem::take(&mut next.readers);
            if self.inner.state.replace(&current, next) {
                for reader in readers {
                    let _ = reader.offer(Err(Error::Finished));
                }
                tracing::debug!(channel = self.inner.id, held = self.len(), "channel finished");
                return true;
            }
        }
    }

    /// Fail every pending and future operation with `error`, discarding
    /// buffered values. Returns false if it was already cancelled.
    pub fn cancel(&self, error: Error) -> bool {
        loop {
            let current = self.inner.state.load();
            if matches!(current.phase, Phase::Cancelled(_)) {
                return false;
            }
            let mut next = State::empty(Phase::Cancelled(error.clone()));
            if self.retains() && !self.inner.capacity.is_rendezvous() {
                // Their writers were already released.
                next.stranded = current.buffer.clone();
            }
            if self.inner.state.replace(&current, next) {
                for reader in &current.readers {
                    let _ = reader.offer(Err(error.clone()));
                }
                for entry in current.buffer.iter().chain(&current.writers) {
                    entry.settle(Err(error.clone()));
                }
                tracing::debug!(
                    channel = self.inner.id,
                    readers = current.readers.len(),
                    writers = current.writers.len(),
                    %error,
                    "channel cancelled"
                );
                return true;
            }
        }
    }

    /// Values waiting to be read, including those of blocked writers.
    pub fn len(&self) -> usize {
        let state = self.inner.state.load();
        state.buffer.len() + state.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.inner.state.load().phase, Phase::Finished)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.state.load().phase, Phase::Cancelled(_))
    }

    pub fn capacity(&self) -> Capacity {
        self.inner.capacity
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Keep accepted values aside on cancel instead of dropping them.
    pub(crate) fn retain_on_cancel(&self) {
        self.inner.retains.store(true, Ordering::Release);
    }

    fn retains(&self) -> bool {
        self.inner.retains.load(Ordering::Acquire)
    }

    /// Hand over the accepted values a cancel took out of the queue.
    pub(crate) fn take_stranded(&self) -> Vec<T> {
        loop {
            let current = self.inner.state.load();
            if current.stranded.is_empty() {
                return Vec::new();
            }
            let mut next = (*current).clone();
            let stranded = std::mem::take(&mut next.stranded);
            if self.inner.state.replace(&current, next) {
                return stranded.iter().filter_map(|entry| entry.parcel.take()).collect();
            }
        }
    }
}

impl<T: Send + 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::rendezvous()
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.load();
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("capacity", &self.inner.capacity)
            .field("buffered", &state.buffer.len())
            .field("readers", &state.readers.len())
            .field("writers", &state.writers.len())
            .field("phase", &state.phase)
            .finish()
    }
}

fn remove_entry<T>(queue: &mut VecDeque<Arc<Pending<T>>>, entry: &Arc<Pending<T>>) -> bool {
    match queue.iter().position(|queued| Arc::ptr_eq(queued, entry)) {
        Some(position) => {
            queue.remove(position);
            true
        }
        None => false,
    }
}

/// Resume a writer unless it already left.
fn let_go(ack: &Continuation<()>) {
    let _ = ack.offer(Ok(()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskHandle;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn bounded_write_returns_immediately() {
        let ch = Channel::bounded(2);
        ch.write(1).await.unwrap();
        ch.write(2).await.unwrap();
        assert_eq!(ch.len(), 2);
        assert_eq!(ch.read().await.unwrap(), 1);
        assert_eq!(ch.read().await.unwrap(), 2);
        assert!(ch.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rendezvous_writer_waits_for_reader() {
        let ch = Channel::rendezvous();
        let writer = {
            let ch = ch.clone();
            TaskHandle::new(async move { ch.write("v").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(writer.status(), crate::task::Status::Running);
        assert_eq!(ch.read().await.unwrap(), "v");
        writer.value().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reader_waits_for_writer() {
        let ch = Channel::<u32>::unbounded();
        let reader = {
            let ch = ch.clone();
            TaskHandle::new(async move { ch.read().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.write(9).await.unwrap();
        assert_eq!(reader.value().await.unwrap(), 9);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drop_overflow_rejects() {
        let ch = Channel::new(Capacity::Bounded {
            size: 1,
            overflow: Overflow::Drop,
        });
        ch.write(1).await.unwrap();
        assert!(matches!(ch.write(2).await, Err(Error::Dropped)));
        assert_eq!(ch.try_read().unwrap(), Some(1));
        assert_eq!(ch.try_read().unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finish_keeps_values_readable() {
        let ch = Channel::bounded(4);
        ch.write('a').await.unwrap();
        assert!(ch.finish());
        assert!(!ch.finish());
        assert!(ch.is_finished());
        assert!(matches!(ch.write('b').await, Err(Error::Closed)));
        assert_eq!(ch.read().await.unwrap(), 'a');
        assert!(matches!(ch.read().await, Err(Error::Finished)));
        assert!(matches!(ch.try_read(), Err(Error::Finished)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finish_releases_waiting_readers() {
        let ch = Channel::<u8>::rendezvous();
        let reader = {
            let ch = ch.clone();
            TaskHandle::new(async move { ch.read().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.finish();
        assert!(matches!(reader.value().await, Err(Error::Finished)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_discards_and_fails_everyone() {
        let ch = Channel::bounded(1);
        ch.write(1).await.unwrap();
        let blocked = {
            let ch = ch.clone();
            TaskHandle::new(async move { ch.write(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ch.len(), 2);
        assert!(ch.cancel(Error::msg("shutdown")));
        assert!(!ch.cancel(Error::Closed));
        let err = blocked.value().await.unwrap_err();
        assert_eq!(err.to_string(), "shutdown");
        assert_eq!(ch.read().await.unwrap_err().to_string(), "shutdown");
        assert_eq!(ch.write(3).await.unwrap_err().to_string(), "shutdown");
        assert!(ch.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retained_values_survive_cancel() {
        let ch = Channel::bounded(2);
        ch.retain_on_cancel();
        ch.write(1).await.unwrap();
        ch.write(2).await.unwrap();
        let blocked = {
            let ch = ch.clone();
            TaskHandle::new(async move { ch.write(3).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ch.cancel(Error::msg("shutdown")));
        assert_eq!(blocked.value().await.unwrap_err().to_string(), "shutdown");
        assert!(ch.is_empty());
        assert_eq!(ch.read().await.unwrap_err().to_string(), "shutdown");
        assert_eq!(ch.take_stranded(), vec![1, 2]);
        assert!(ch.take_stranded().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_writer_recalls_its_value() {
        let ch = Channel::rendezvous();
        let writer = {
            let ch = ch.clone();
            TaskHandle::new(async move { ch.write(5).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ch.len(), 1);
        writer.cancel();
        assert!(matches!(writer.value().await, Err(Error::Cancelled)));
        assert!(ch.is_empty());
        assert_eq!(ch.try_read().unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_reader_leaves_the_queue() {
        let ch = Channel::<u8>::bounded(1);
        let reader = {
            let ch = ch.clone();
            TaskHandle::new(async move { ch.read().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        reader.cancel();
        assert!(matches!(reader.value().await, Err(Error::Cancelled)));
        ch.write(4).await.unwrap();
        assert_eq!(ch.try_read().unwrap(), Some(4));
    }

    #[test]
    fn capacity_defaults() {
        assert_eq!(Capacity::default(), Capacity::Rendezvous);
        assert_eq!(Capacity::Unbounded.slots(), usize::MAX);
        assert!(Capacity::Bounded { size: 0, overflow: Overflow::Drop }.is_rendezvous());
        assert_eq!(Capacity::Bounded { size: 3, overflow: Overflow::Drop }.overflow(), Overflow::Drop);
    }
}
