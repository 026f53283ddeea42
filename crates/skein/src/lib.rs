// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Lock-free concurrency primitives on top of tokio.
//!
//! Components, leaves first:
//! - continuation: one-shot suspend/resume
//! - task: cancellable and uncancellable task handles
//! - promise: single-assignment cells
//! - channel: rendezvous, bounded and unbounded queues
//! - fold: sequential reducers consuming a channel
//!
//! Every primitive keeps its shared state in one atomically swapped snapshot;
//! there is no mutex anywhere. Abandoning a handshake half way (dropping a
//! pending continuation, an unawaited task, an unwritten promise) is caught
//! on drop and handled according to the configured [`LeakPolicy`].

pub mod cancel;
pub mod channel;
pub mod config;
pub mod continuation;
pub mod error;
pub mod fold;
pub mod leak;
pub mod promise;
mod snapshot;
pub mod task;
pub mod time;

pub use channel::{Capacity, Channel, Overflow};
pub use config::{Config, LeakPolicy};
pub use continuation::{pause, pause_unfailing, Continuation, Suspension, UnfailingContinuation};
pub use error::{Error, Result};
pub use fold::{Completion, Effect, Fold, Folder};
pub use promise::{Promise, PromiseStatus, UnbreakablePromise};
pub use task::{Status, TaskHandle, Uncancellable};
