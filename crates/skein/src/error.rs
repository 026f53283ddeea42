// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error type shared by every primitive.
//!
//! Errors are `Clone`: a task outcome or a channel cancellation is observed by
//! any number of parties, and each gets the same value.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure observed by a suspended or completed party.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Cooperative cancellation reached a suspension point.
    #[error("operation was cancelled")]
    Cancelled,

    /// The counterpart of a handshake was destroyed before completing it.
    #[error("{0} was dropped before its handshake completed")]
    Leaked(&'static str),

    /// A promise received a second write.
    #[error("promise was already written")]
    AlreadyWritten,

    /// Write to a channel that no longer accepts values.
    #[error("channel is closed to new values")]
    Closed,

    /// Write rejected because the channel buffer is full.
    #[error("value dropped: channel buffer is full")]
    Dropped,

    /// Read from a finished channel with nothing left in it.
    #[error("channel finished")]
    Finished,

    /// A task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Error raised by user code, forwarded unchanged.
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap a user error.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Failed(Arc::new(error))
    }

    /// User error carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::failed(Message(message.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Borrow the wrapped user error, if this is one.
    pub fn user_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Error::Failed(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}
