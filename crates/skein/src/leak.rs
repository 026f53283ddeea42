// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Contract-violation reporting.
//!
//! A violation is a programming error: a handshake abandoned before it
//! completed, or a one-shot transition attempted twice. It never surfaces
//! as an [`Error`](crate::Error); the active [`LeakPolicy`] decides whether
//! the process keeps going.

use thiserror::Error;

use crate::config::{self, LeakPolicy};

/// A broken handshake contract.
#[derive(Debug, Clone, Error)]
pub enum Violation {
    #[error("{kind} #{id} dropped before its handshake completed")]
    Leaked { kind: &'static str, id: u64 },

    #[error("continuation #{id} resumed more than once")]
    DoubleResume { id: u64 },

    #[error("{kind} #{id} written more than once")]
    DoubleWrite { kind: &'static str, id: u64 },

    #[error("{kind} #{id} awaited more than once")]
    DoubleWait { kind: &'static str, id: u64 },
}

/// Report `violation` under the active policy.
pub(crate) fn report(violation: Violation) {
    let policy = config::leak_policy();
    tracing::error!(%violation, %policy, "contract violation");

    match policy {
        LeakPolicy::Warn => {}
        LeakPolicy::Assert => {
            // Panicking while unwinding would abort; the first panic is the story.
            if !std::thread::panicking() {
                panic!("contract violation: {violation}");
            }
        }
        LeakPolicy::Abort => std::process::abort(),
    }
}
