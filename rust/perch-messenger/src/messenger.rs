use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::runtime;

/// A message on a channel. `None` is the empty message: a reply from a side
/// with no handler registered, or an end-of-stream marker on event channels.
pub type Message = Option<Bytes>;

/// Receives the reply to a sent message. Called at most once.
pub type ReplyCallback = Box<dyn FnOnce(Message) + Send + 'static>;

/// Handles incoming messages on one channel.
///
/// The handler must eventually consume the [`ReplySender`] (or drop it, which
/// replies with the empty message).
pub type MessageHandler = Arc<dyn Fn(Message, ReplySender) + Send + Sync + 'static>;

/// Transport over which perch channels run.
///
/// Implementations must deliver messages on a channel in the order they were
/// sent and may run reply callbacks on any thread.
pub trait BinaryMessenger: Send + Sync {
    /// Send `message` on `channel`. `on_reply` receives the peer's reply, or
    /// the empty message if nothing is listening on that channel.
    fn send(&self, channel: &str, message: Message, on_reply: Option<ReplyCallback>);

    /// Install (or, with `None`, remove) the handler for `channel`.
    fn set_handler(&self, channel: &str, handler: Option<MessageHandler>);
}

impl<M: BinaryMessenger + ?Sized> BinaryMessenger for Arc<M> {
    fn send(&self, channel: &str, message: Message, on_reply: Option<ReplyCallback>) {
        (**self).send(channel, message, on_reply)
    }

    fn set_handler(&self, channel: &str, handler: Option<MessageHandler>) {
        (**self).set_handler(channel, handler)
    }
}

/// Send `message` and wait for the reply.
///
/// An empty reply means no handler was registered on the peer's side and is
/// reported as [`MessengerError::NoHandler`].
pub async fn request(
    messenger: &dyn BinaryMessenger,
    channel: &str,
    message: Message,
) -> Result<Bytes, MessengerError> {
    let (tx, rx) = runtime::oneshot();
    messenger.send(
        channel,
        message,
        Some(Box::new(move |reply| {
            let _ = tx.send(reply);
        })),
    );
    match rx.await {
        Ok(Some(reply)) => Ok(reply),
        Ok(None) => Err(MessengerError::NoHandler(channel.to_owned())),
        Err(_) => Err(MessengerError::ReplyDropped(channel.to_owned())),
    }
}

// ============================================================================
// ReplySender
// ============================================================================

/// One-shot reply handle passed to a [`MessageHandler`].
///
/// Dropping it without calling [`ReplySender::send`] replies with the empty
/// message, so the sender is never left waiting.
pub struct ReplySender {
    channel: Arc<str>,
    callback: Option<ReplyCallback>,
}

impl ReplySender {
    pub fn new(channel: impl Into<Arc<str>>, callback: ReplyCallback) -> Self {
        Self {
            channel: channel.into(),
            callback: Some(callback),
        }
    }

    /// A reply handle for a message whose sender didn't ask for a reply.
    pub fn discard(channel: impl Into<Arc<str>>) -> Self {
        Self {
            channel: channel.into(),
            callback: None,
        }
    }

    /// Channel the request arrived on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn send(mut self, reply: Message) {
        if let Some(callback) = self.callback.take() {
            callback(reply);
        }
    }
}

impl Drop for ReplySender {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            trace!(channel = %self.channel, "reply sender dropped, replying empty");
            callback(None);
        }
    }
}

impl fmt::Debug for ReplySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySender")
            .field("channel", &self.channel)
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error from a request/reply exchange on the messenger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessengerError {
    /// The peer has no handler registered on the channel.
    NoHandler(String),
    /// The reply callback was discarded without being called.
    ReplyDropped(String),
    /// No tokio runtime to deliver messages on.
    NoRuntime,
}

impl fmt::Display for MessengerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessengerError::NoHandler(channel) => {
                write!(f, "unable to establish connection on channel: \"{channel}\"")
            }
            MessengerError::ReplyDropped(channel) => {
                write!(f, "reply on channel \"{channel}\" was dropped")
            }
            MessengerError::NoRuntime => write!(f, "no tokio runtime available"),
        }
    }
}

impl std::error::Error for MessengerError {}
