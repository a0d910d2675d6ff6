use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use perch_codec::Value;
use perch_messenger::runtime::{self, AbortHandle};

use crate::EventSink;

/// Emits a finite sequence into an [`EventSink`] at a fixed period, then ends
/// the stream.
///
/// The first item goes out one period after starting. Stopping is
/// idempotent, and dropping the ticker stops it.
pub struct Ticker {
    task: Mutex<Option<AbortHandle>>,
}

impl Ticker {
    /// Start ticking. Must be called from within the runtime.
    pub fn start<I>(sink: EventSink, period: Duration, items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        let items = items.into_iter();
        let task = runtime::spawn_with_abort(async move {
            for item in items {
                runtime::sleep(period).await;
                if sink.success(item).is_err() {
                    // session is gone, nobody to end it for
                    return;
                }
            }
            runtime::sleep(period).await;
            sink.end_of_stream();
        });
        Self {
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop emitting. Returns true if the ticker was still running.
    pub fn stop(&self) -> bool {
        match self.task.lock().take() {
            Some(task) => task.abort(),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticker")
            .field("running", &self.is_running())
            .finish()
    }
}
