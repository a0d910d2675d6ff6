//! In-process messenger pair.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::runtime::{self, Handle, UnboundedReceiver, UnboundedSender};
use crate::{
    BinaryMessenger, Message, MessageHandler, MessengerConfig, MessengerError, ReplyCallback,
    ReplySender,
};

const SPY_PREFIX_LEN: usize = 64;

/// One end of an in-process connection.
///
/// Messages sent on one end are delivered to the handler registered for that
/// channel on the other end. Cloning gives another handle to the same end.
#[derive(Clone)]
pub struct LocalMessenger {
    local: Arc<Endpoint>,
    peer: Arc<Endpoint>,
}

struct Delivery {
    message: Message,
    reply: ReplySender,
}

/// `None` asks the worker to check whether it can retire.
type Job = Option<Delivery>;

struct Queue {
    worker: u64,
    tx: UnboundedSender<Job>,
}

struct Endpoint {
    side: &'static str,
    handlers: Mutex<HashMap<String, MessageHandler>>,
    /// Per-channel delivery queues, each drained by its own task. A worker
    /// retires once its channel has no handler and nothing queued.
    queues: Mutex<HashMap<String, Queue>>,
    next_worker: AtomicU64,
    runtime: Handle,
    config: MessengerConfig,
}

impl LocalMessenger {
    /// Create two connected ends on the current tokio runtime.
    pub fn pair(config: MessengerConfig) -> Result<(Self, Self), MessengerError> {
        let handle = runtime::current().ok_or(MessengerError::NoRuntime)?;
        Ok(Self::pair_on(handle, config))
    }

    /// Create two connected ends whose tasks run on `handle`.
    pub fn pair_on(handle: Handle, config: MessengerConfig) -> (Self, Self) {
        let a = Arc::new(Endpoint::new("a", handle.clone(), config.clone()));
        let b = Arc::new(Endpoint::new("b", handle, config));
        debug!(wire_spy = a.config.wire_spy, "created local messenger pair");
        (
            Self {
                local: a.clone(),
                peer: b.clone(),
            },
            Self { local: b, peer: a },
        )
    }

    /// Whether this end has a handler on `channel`.
    pub fn has_handler(&self, channel: &str) -> bool {
        self.local.handlers.lock().contains_key(channel)
    }

    /// Number of channels with a handler on this end.
    pub fn handler_count(&self) -> usize {
        self.local.handlers.lock().len()
    }

    /// Number of channels on this end with a live delivery task.
    pub fn delivery_task_count(&self) -> usize {
        self.local.queues.lock().len()
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.local.config
    }
}

impl BinaryMessenger for LocalMessenger {
    fn send(&self, channel: &str, message: Message, on_reply: Option<ReplyCallback>) {
        let len = message.as_ref().map_or(0, Bytes::len);
        if len > self.local.config.max_message_size {
            warn!(
                side = self.local.side,
                channel,
                len,
                max = self.local.config.max_message_size,
                "dropping oversized message"
            );
            if let Some(callback) = on_reply {
                self.local.runtime.spawn(async move { callback(None) });
            }
            return;
        }

        self.local.spy(channel, &message);
        trace!(side = self.local.side, channel, len, "send");

        // The reply crosses back to this end, always on a fresh task.
        let reply = match on_reply {
            Some(callback) => {
                let handle = self.local.runtime.clone();
                ReplySender::new(
                    channel,
                    Box::new(move |reply| {
                        handle.spawn(async move { callback(reply) });
                    }),
                )
            }
            None => ReplySender::discard(channel),
        };

        self.peer.deliver(channel, Delivery { message, reply });
    }

    fn set_handler(&self, channel: &str, handler: Option<MessageHandler>) {
        let mut handlers = self.local.handlers.lock();
        match handler {
            Some(handler) => {
                debug!(side = self.local.side, channel, "set handler");
                handlers.insert(channel.to_owned(), handler);
            }
            None => {
                if handlers.remove(channel).is_some() {
                    debug!(side = self.local.side, channel, "removed handler");
                    drop(handlers);
                    // wake an idle worker so it can retire
                    if let Some(queue) = self.local.queues.lock().get(channel) {
                        let _ = queue.tx.send(None);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for LocalMessenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMessenger")
            .field("side", &self.local.side)
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl Endpoint {
    fn new(side: &'static str, runtime: Handle, config: MessengerConfig) -> Self {
        Self {
            side,
            handlers: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            next_worker: AtomicU64::new(0),
            runtime,
            config,
        }
    }

    fn deliver(self: &Arc<Self>, channel: &str, delivery: Delivery) {
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(channel.to_owned())
            .or_insert_with(|| self.spawn_worker(channel));
        let Err(failed) = queue.tx.send(Some(delivery)) else {
            return;
        };

        // The worker died (a handler panicked). Start a fresh one.
        warn!(side = self.side, channel, "delivery task gone, restarting");
        let queue = self.spawn_worker(channel);
        let result = queue.tx.send(failed.0);
        queues.insert(channel.to_owned(), queue);
        drop(queues);
        // dropping the delivery replies empty
        drop(result);
    }

    fn spawn_worker(self: &Arc<Self>, channel: &str) -> Queue {
        let (tx, mut rx) = runtime::unbounded::<Job>();
        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let endpoint: Weak<Endpoint> = Arc::downgrade(self);
        let channel = channel.to_owned();

        self.runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                let Some(live) = endpoint.upgrade() else {
                    break;
                };
                if let Some(Delivery { message, reply }) = job {
                    let handler = live.handlers.lock().get(&channel).cloned();
                    let side = live.side;
                    drop(live);

                    match handler {
                        Some(handler) => {
                            trace!(side, channel = %channel, "deliver");
                            handler(message, reply);
                        }
                        None => {
                            debug!(side, channel = %channel, "no handler, replying empty");
                            reply.send(None);
                        }
                    }
                } else {
                    drop(live);
                }

                let Some(live) = endpoint.upgrade() else {
                    break;
                };
                if live.retire_if_idle(&channel, worker, &rx) {
                    break;
                }
            }
        });

        Queue { worker, tx }
    }

    /// Drop the queue of `channel` if it has no handler and nothing waiting.
    fn retire_if_idle(&self, channel: &str, worker: u64, rx: &UnboundedReceiver<Job>) -> bool {
        // deliveries are enqueued under this lock, so `rx` can't gain one
        // between the check and the removal
        let mut queues = self.queues.lock();
        if !rx.is_empty() || self.handlers.lock().contains_key(channel) {
            return false;
        }
        if queues.get(channel).is_some_and(|queue| queue.worker == worker) {
            queues.remove(channel);
        }
        trace!(side = self.side, channel, "delivery task retired");
        true
    }

    fn spy(&self, channel: &str, message: &Message) {
        if !self.config.wire_spy {
            return;
        }
        match message {
            Some(bytes) => debug!(
                side = self.side,
                channel,
                len = bytes.len(),
                head = ?&bytes[..bytes.len().min(SPY_PREFIX_LEN)],
                "[WIRE] send"
            ),
            None => debug!(side = self.side, channel, "[WIRE] send <empty>"),
        }
    }
}
