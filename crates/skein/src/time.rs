// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cancellation-aware timers.

use std::time::Duration;

use crate::cancel;
use crate::error::{Error, Result};

/// Sleep for `duration`, or until the current task is cancelled.
///
/// Returns `Err(Cancelled)` in the latter case. Outside a cancellable task it
/// always sleeps the full duration.
pub async fn sleep(duration: Duration) -> Result<()> {
    cancel::checkpoint()?;
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel::cancellation() => Err(Error::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn sleeps_outside_tasks() {
        let start = Instant::now();
        sleep(Duration::from_millis(10)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(9));
    }

    #[tokio::test]
    async fn cancelled_scope_cuts_sleep_short() {
        let token = Arc::new(CancelToken::new());
        token.cancel();
        let start = Instant::now();
        let slept = cancel::scope(token, sleep(Duration::from_secs(10))).await;
        assert!(matches!(slept, Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
