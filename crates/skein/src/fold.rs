// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sequential reducers over a channel of actions.
//!
//! A [`Folder`] describes a state machine; a [`Fold`] runs one. The loop owns
//! the state, applies actions one at a time in channel order, and on the way
//! out accounts for every action it did not reduce: each goes to the
//! disposer, then the finalizer runs exactly once.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::task::{self, Status, TaskHandle};

/// How a fold ended.
#[derive(Debug, Clone)]
pub enum Completion {
    Finished,
    Cancelled,
    Failure(Error),
}

impl Completion {
    fn from_error(error: Error) -> Self {
        match error {
            Error::Finished => Completion::Finished,
            Error::Cancelled => Completion::Cancelled,
            other => Completion::Failure(other),
        }
    }

    fn into_result<S>(self, state: S) -> Result<S> {
        match self {
            Completion::Finished => Ok(state),
            Completion::Cancelled => Err(Error::Cancelled),
            Completion::Failure(error) => Err(error),
        }
    }
}

/// What a reducer asks the loop to do after an action.
#[derive(Debug, Clone)]
pub enum Effect {
    None,
    /// Stop the loop.
    Complete(Completion),
    /// Run the emitter on the current state.
    Emit,
}

type Initializer<S, A> = Arc<dyn Fn(Channel<A>) -> BoxFuture<'static, Result<S>> + Send + Sync>;
type Reducer<S, A> = Arc<dyn Fn(&mut S, A) -> Result<Vec<Effect>> + Send + Sync>;
type Emitter<S> = Arc<dyn Fn(&S) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type Disposer<A> = Arc<dyn Fn(A, &Completion) + Send + Sync>;
type Finalizer<S> = Arc<dyn Fn(&mut S, &Completion) + Send + Sync>;

/// Reusable description of a sequential state machine.
pub struct Folder<S, A> {
    initializer: Initializer<S, A>,
    reducer: Reducer<S, A>,
    emitter: Emitter<S>,
    disposer: Disposer<A>,
    finalizer: Finalizer<S>,
}

impl<S, A> Clone for Folder<S, A> {
    fn clone(&self) -> Self {
        Self {
            initializer: self.initializer.clone(),
            reducer: self.reducer.clone(),
            emitter: self.emitter.clone(),
            disposer: self.disposer.clone(),
            finalizer: self.finalizer.clone(),
        }
    }
}

impl<S, A> Folder<S, A>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
{
    pub fn new<I, IF, R, E, EF, D, F>(
        initializer: I,
        reducer: R,
        emitter: E,
        disposer: D,
        finalizer: F,
    ) -> Self
    where
        I: Fn(Channel<A>) -> IF + Send + Sync + 'static,
        IF: Future<Output = Result<S>> + Send + 'static,
        R: Fn(&mut S, A) -> Result<Vec<Effect>> + Send + Sync + 'static,
        E: Fn(&S) -> EF + Send + Sync + 'static,
        EF: Future<Output = Result<()>> + Send + 'static,
        D: Fn(A, &Completion) + Send + Sync + 'static,
        F: Fn(&mut S, &Completion) + Send + Sync + 'static,
    {
        Self::reducing(initializer, reducer)
            .with_emitter(emitter)
            .with_disposer(disposer)
            .with_finalizer(finalizer)
    }

    /// A folder that only reduces. Emitting, disposing and finalizing do
    /// nothing.
    pub fn reducing<I, IF, R>(initializer: I, reducer: R) -> Self
    where
        I: Fn(Channel<A>) -> IF + Send + Sync + 'static,
        IF: Future<Output = Result<S>> + Send + 'static,
        R: Fn(&mut S, A) -> Result<Vec<Effect>> + Send + Sync + 'static,
    {
        Self {
            initializer: Arc::new(move |channel: Channel<A>| initializer(channel).boxed()),
            reducer: Arc::new(reducer),
            emitter: Arc::new(emit_nothing::<S>),
            disposer: Arc::new(dispose_nothing::<A>),
            finalizer: Arc::new(finalize_nothing::<S>),
        }
    }

    pub fn with_emitter<E, EF>(mut self, emitter: E) -> Self
    where
        E: Fn(&S) -> EF + Send + Sync + 'static,
        EF: Future<Output = Result<()>> + Send + 'static,
    {
        self.emitter = Arc::new(move |state: &S| emitter(state).boxed());
        self
    }

    pub fn with_disposer<D>(mut self, disposer: D) -> Self
    where
        D: Fn(A, &Completion) + Send + Sync + 'static,
    {
        self.disposer = Arc::new(disposer);
        self
    }

    pub fn with_finalizer<F>(mut self, finalizer: F) -> Self
    where
        F: Fn(&mut S, &Completion) + Send + Sync + 'static,
    {
        self.finalizer = Arc::new(finalizer);
        self
    }

    async fn run(self, channel: Channel<A>) -> Result<S> {
        let id = channel.id();
        tracing::debug!(channel = id, "fold started");

        let initialized = AssertUnwindSafe(async { (self.initializer)(channel.clone()).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(callback_panicked(id, payload)));
        let mut state = match initialized {
            Ok(state) => state,
            Err(error) => {
                let disposed = self.drain(&channel, &Completion::from_error(error.clone()));
                tracing::debug!(channel = id, disposed, %error, "fold failed to initialize");
                return Err(error);
            }
        };

        let completion = AssertUnwindSafe(self.consume(&channel, &mut state))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Completion::Failure(callback_panicked(id, payload)));
        let disposed = self.drain(&channel, &completion);
        (self.finalizer)(&mut state, &completion);
        tracing::debug!(channel = id, disposed, ?completion, "fold stopped");
        completion.into_result(state)
    }

    async fn consume(&self, channel: &Channel<A>, state: &mut S) -> Completion {
        loop {
            let action = match channel.read().await {
                Ok(action) => action,
                Err(error) => return Completion::from_error(error),
            };
            let effects = match (self.reducer)(state, action) {
                Ok(effects) => effects,
                Err(error) => return Completion::from_error(error),
            };
            for effect in effects {
                match effect {
                    Effect::None => {}
                    Effect::Complete(completion) => return completion,
                    Effect::Emit => {
                        if let Err(error) = (self.emitter)(state).await {
                            return Completion::from_error(error);
                        }
                    }
                }
            }
        }
    }

    /// Close the channel and hand every leftover action to the disposer,
    /// including those a channel cancel took out of the queue.
    fn drain(&self, channel: &Channel<A>, completion: &Completion) -> usize {
        channel.finish();
        let mut disposed = 0;
        while let Ok(Some(action)) = channel.try_read() {
            (self.disposer)(action, completion);
            disposed += 1;
        }
        for action in channel.take_stranded() {
            (self.disposer)(action, completion);
            disposed += 1;
        }
        disposed
    }
}

fn callback_panicked(channel: u64, payload: Box<dyn Any + Send>) -> Error {
    let message = task::panic_message(payload.as_ref());
    tracing::warn!(channel, %message, "fold callback panicked");
    Error::Panicked(message)
}

fn emit_nothing<S>(_: &S) -> BoxFuture<'static, Result<()>> {
    futures::future::ready(Ok(())).boxed()
}

fn dispose_nothing<A>(_: A, _: &Completion) {}

fn finalize_nothing<S>(_: &mut S, _: &Completion) {}

/// A running [`Folder`].
pub struct Fold<S, A> {
    channel: Channel<A>,
    task: TaskHandle<S>,
}

impl<S, A> Fold<S, A>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
{
    /// Spawn the loop over `channel`.
    pub fn start(channel: Channel<A>, folder: Folder<S, A>) -> Self {
        channel.retain_on_cancel();
        let task = TaskHandle::new(folder.run(channel.clone()));
        Self { channel, task }
    }

    /// Queue an action, waiting under the channel's backpressure.
    pub async fn send(&self, action: A) -> Result<()> {
        self.channel.write(action).await
    }

    /// Final state once the loop is done.
    pub async fn value(&self) -> Result<S>
    where
        S: Clone,
    {
        self.task.value().await
    }

    pub async fn result(&self) -> Arc<Result<S>> {
        self.task.result().await
    }
}

impl<S, A> Fold<S, A> {
    /// Stop accepting actions; the loop ends once it has read the rest.
    pub fn finish(&self) -> bool {
        self.channel.finish()
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }

    pub fn status(&self) -> Status {
        self.task.status()
    }

    pub fn channel(&self) -> &Channel<A> {
        &self.channel
    }
}
