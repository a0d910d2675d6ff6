//! Runtime primitives used across perch.
//!
//! Everything async in perch goes through these helpers so that the tokio
//! surface stays in one place.

use std::future::Future;
use std::time::Duration;

pub use tokio::runtime::Handle;
pub use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
pub use tokio::sync::oneshot::{Receiver as OneshotReceiver, Sender as OneshotSender};

/// Create an unbounded mpsc channel.
pub fn unbounded<T>() -> (UnboundedSender<T>, UnboundedReceiver<T>) {
    unbounded_channel()
}

/// Create a oneshot channel.
pub fn oneshot<T>() -> (OneshotSender<T>, OneshotReceiver<T>) {
    tokio::sync::oneshot::channel()
}

/// Handle to a spawned task. Aborting is idempotent.
#[derive(Debug)]
pub struct AbortHandle(tokio::task::AbortHandle);

impl AbortHandle {
    /// Abort the associated task.
    ///
    /// Returns `false` if the task had already finished (or was already
    /// aborted).
    pub fn abort(&self) -> bool {
        let running = !self.0.is_finished();
        self.0.abort();
        running
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

/// Spawn a task on the current runtime.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future)
}

/// Spawn a task and return an abort handle that can be used to cancel it.
pub fn spawn_with_abort<F>(future: F) -> AbortHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(future);
    AbortHandle(handle.abort_handle())
}

/// Run `f` after the current call returns: as a task on the current
/// runtime, or on a short-lived thread outside of one.
pub fn defer<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { f() });
        }
        Err(_) => {
            let spawned = std::thread::Builder::new()
                .name("perch-deferred".to_owned())
                .spawn(f);
            if let Err(e) = spawned {
                warn!(error = %e, "could not start thread for deferred work");
            }
        }
    }
}

/// Handle of the runtime we're currently inside, if any.
pub fn current() -> Option<Handle> {
    Handle::try_current().ok()
}

/// Sleep for the given duration.
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Run a future with a timeout.
///
/// Returns `Some(result)` if the future completes within the timeout,
/// or `None` if the timeout expires.
pub async fn timeout<F, T>(duration: Duration, future: F) -> Option<T>
where
    F: Future<Output = T>,
{
    (tokio::time::timeout(duration, future).await).ok()
}
