use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::HarnessError;

/// Handle on a spawned event loop that exits when signalled.
pub(crate) struct Worker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawns `run` with the receiving end of the stop signal.
    pub(crate) fn spawn<R, F>(run: R) -> Self
    where
        R: FnOnce(oneshot::Receiver<()>) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run(stop_rx));
        Self { stop, handle }
    }

    /// Signals the loop and waits for it to exit.
    pub(crate) async fn halt(self, component: &str) -> Result<(), HarnessError> {
        // The loop may already have exited; a closed channel is fine
        let _ = self.stop.send(());
        self.handle.await.map_err(|e| HarnessError::Shutdown {
            component: component.to_string(),
            reason: format!("event loop ended abnormally: {e}"),
        })
    }

    /// Cancels the loop without waiting.
    pub(crate) fn abort(self) {
        self.handle.abort();
    }
}
