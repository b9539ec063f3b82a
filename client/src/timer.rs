//! Cancellable delayed task used for reconnection backoff.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs a task once after a delay unless cancelled first.
///
/// Cancelling only stops the wait; a task that already started runs to completion.
pub struct ReconnectTimer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReconnectTimer {
    pub fn schedule<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => task.await,
                () = token.cancelled() => {}
            }
        });
        Self { cancel, handle }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the wait and the task (if it ran) are over.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
