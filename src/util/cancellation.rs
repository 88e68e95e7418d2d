//! Cooperative cancellation: every connection worker owns a [CancellationSource] and passes
//!  [CancellationToken]s to its suspension points. Cancelling (or dropping) the source wakes all
//!  of them.

use std::future::Future;
use std::time::Duration;

use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Returned by operations that were interrupted by cancellation. This is not a failure, and
///  shutdown paths check for it (see [is_cancellation]) to avoid logging it as one.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("operation was cancelled")]
pub struct Cancelled;

pub fn is_cancellation(e: &anyhow::Error) -> bool {
    e.downcast_ref::<Cancelled>().is_some()
}

pub struct CancellationSource {
    sender: watch::Sender<bool>,
}
impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}
impl CancellationSource {
    pub fn new() -> CancellationSource {
        let (sender, _) = watch::channel(false);
        CancellationSource { sender }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

#[derive(Clone, Debug)]
pub struct CancellationToken {
    receiver: watch::Receiver<bool>,
}
impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Completes once the source is cancelled or dropped
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        let _ = receiver.wait_for(|&cancelled| cancelled).await;
    }

    /// Runs a future to completion unless cancellation fires first.
    pub async fn guard<F: Future>(&self, f: F) -> Result<F::Output, Cancelled> {
        select! {
            biased;
            _ = self.cancelled() => Err(Cancelled),
            r = f => Ok(r),
        }
    }
}

/// Waits for a cancelled worker to finish, giving up after `timeout`. A worker that does not
///  finish in time is aborted and abandoned - this never blocks teardown indefinitely.
pub async fn await_termination(handle: JoinHandle<()>, timeout: Duration, what: &str) {
    let abort_handle = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => debug!("{} terminated", what),
        Ok(Err(e)) if e.is_cancelled() => debug!("{} was aborted", what),
        Ok(Err(e)) => warn!("{} terminated abnormally: {}", what, e),
        Err(_) => {
            warn!("{} did not terminate within {:?} - abandoning it", what, timeout);
            abort_handle.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn test_guard_completes_without_cancellation() {
        let source = CancellationSource::new();
        let result = source.token().guard(async { 5 }).await;
        assert_eq!(result, Ok(5));
        assert!(!source.token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_pending_future() {
        let source = CancellationSource::new();
        let token = source.token();

        let handle = tokio::spawn(async move {
            token.guard(sleep(Duration::from_secs(3600))).await
        });
        sleep(Duration::from_millis(10)).await;
        source.cancel();

        assert_eq!(handle.await.unwrap(), Err(Cancelled));
        assert!(source.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropping_source_cancels() {
        let source = CancellationSource::new();
        let token = source.token();
        drop(source);

        assert!(token.is_cancelled());
        assert_eq!(token.guard(std::future::pending::<()>()).await, Err(Cancelled));
    }

    #[test]
    fn test_is_cancellation() {
        assert!(is_cancellation(&anyhow::Error::new(Cancelled)));
        assert!(!is_cancellation(&anyhow::anyhow!("something else")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_termination_abandons_stuck_worker() {
        let handle = tokio::spawn(std::future::pending::<()>());
        let abort_handle = handle.abort_handle();

        await_termination(handle, Duration::from_secs(1), "stuck worker").await;
        sleep(Duration::from_millis(1)).await;
        assert!(abort_handle.is_finished());
    }
}
