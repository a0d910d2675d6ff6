//! Event streams.
//!
//! An event channel carries one subscription at a time. The listening side
//! sends a `listen` method call; the host starts a session and pushes events
//! on the same channel, each a success or error envelope, until it sends the
//! empty message as end of stream. `cancel` stops the session.
//!
//! Listening again while a session is active replaces it: the old session is
//! cancelled first and its sink goes inert. On the listening side only the
//! newest stream of a channel owns it; an older stream that is dropped or
//! cancelled afterwards leaves the channel alone.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use perch_codec::envelope::{self, MethodCall, Reply};
use perch_codec::{StandardCodec, Value};
use perch_messenger::runtime::{self, UnboundedReceiver, UnboundedSender};
use perch_messenger::{BinaryMessenger, Message, MessageHandler, ReplySender, request};

use crate::responder::panic_error;
use crate::{CallError, RemoteError, SinkError};

const LISTEN: &str = "listen";
const CANCEL: &str = "cancel";

/// Host-side callbacks for an event channel.
pub trait StreamHandler: Send + Sync + 'static {
    /// A listener subscribed. Events go to `sink` until it is ended or the
    /// session is cancelled.
    fn on_listen(&self, arguments: Value, sink: EventSink);

    /// The listener unsubscribed, or a new subscription replaced this one.
    fn on_cancel(&self, arguments: Value) {
        let _ = arguments;
    }
}

/// A named event channel on a messenger.
///
/// Clones share the listening session, so listen through clones of one
/// channel rather than separate channels with the same name.
#[derive(Clone)]
pub struct EventChannel {
    messenger: Arc<dyn BinaryMessenger>,
    codec: Arc<StandardCodec>,
    name: Arc<str>,
    /// Token of the newest `listen`; zero before the first one.
    session: Arc<AtomicU64>,
}

impl EventChannel {
    pub fn new(
        messenger: Arc<dyn BinaryMessenger>,
        codec: Arc<StandardCodec>,
        name: impl Into<String>,
    ) -> Self {
        let name: String = name.into();
        Self {
            messenger,
            codec,
            name: name.into(),
            session: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ========================================================================
    // Host side
    // ========================================================================

    /// Serve subscriptions with `handler`, or stop serving with `None`.
    pub fn set_stream_handler(&self, handler: Option<Arc<dyn StreamHandler>>) {
        let Some(handler) = handler else {
            debug!(channel = %self.name, "removed stream handler");
            self.messenger.set_handler(&self.name, None);
            return;
        };

        let host = Arc::new(StreamHost {
            channel: self.clone(),
            handler,
            active: Mutex::new(None),
        });
        let on_message: MessageHandler =
            Arc::new(move |message: Message, reply: ReplySender| host.on_message(message, reply));
        self.messenger.set_handler(&self.name, Some(on_message));
        debug!(channel = %self.name, "set stream handler");
    }

    // ========================================================================
    // Listener side
    // ========================================================================

    /// Subscribe with `arguments`.
    ///
    /// Events are buffered until read from the returned stream.
    pub async fn listen(&self, arguments: Value) -> Result<EventStream, CallError> {
        let session = self.session.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = runtime::unbounded();
        let events = EventReceiver {
            codec: self.codec.clone(),
            tx,
        };
        let on_event: MessageHandler =
            Arc::new(move |message: Message, reply: ReplySender| events.on_event(message, reply));
        self.messenger.set_handler(&self.name, Some(on_event));

        match self.invoke(LISTEN, arguments.clone()).await {
            Ok(()) => {
                debug!(channel = %self.name, "listening");
                Ok(EventStream {
                    channel: self.clone(),
                    session,
                    arguments,
                    rx,
                    ended: false,
                    cancelled: false,
                })
            }
            Err(e) => {
                if self.owns(session) {
                    self.messenger.set_handler(&self.name, None);
                }
                Err(e)
            }
        }
    }

    fn owns(&self, session: u64) -> bool {
        self.session.load(Ordering::Acquire) == session
    }

    async fn invoke(&self, method: &str, arguments: Value) -> Result<(), CallError> {
        let body = envelope::encode_method_call(&self.codec, &MethodCall::new(method, arguments))?;
        let reply = request(self.messenger.as_ref(), &self.name, Some(body)).await?;
        match envelope::decode_envelope(&self.codec, &reply)? {
            Reply::Success(_) => Ok(()),
            Reply::Error {
                code,
                message,
                details,
            } => Err(CallError::Remote(RemoteError {
                code,
                message,
                details,
            })),
        }
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("name", &self.name)
            .finish()
    }
}

struct StreamHost {
    channel: EventChannel,
    handler: Arc<dyn StreamHandler>,
    active: Mutex<Option<EventSink>>,
}

impl StreamHost {
    fn on_message(&self, message: Message, reply: ReplySender) {
        let codec = &self.channel.codec;
        let call = match message
            .as_deref()
            .map(|bytes| envelope::decode_method_call(codec, bytes))
        {
            Some(Ok(call)) => call,
            Some(Err(e)) => {
                let error = RemoteError::new("error", e.to_string(), Value::Null);
                return self.reply_error(reply, &error);
            }
            None => {
                let error = RemoteError::new("error", "empty method call", Value::Null);
                return self.reply_error(reply, &error);
            }
        };

        match call.method.as_str() {
            LISTEN => self.listen(call.args, reply),
            CANCEL => self.cancel(call.args, reply),
            other => {
                debug!(channel = %self.channel.name, method = other, "unknown stream method");
                // no reply body: the method is not implemented
                reply.send(None);
            }
        }
    }

    fn listen(&self, arguments: Value, reply: ReplySender) {
        let replaced = self.active.lock().take();
        if let Some(old) = replaced {
            debug!(channel = %self.channel.name, "replacing active stream session");
            old.inner.cancel();
            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.handler.on_cancel(Value::Null)
            })) {
                let error = panic_error(payload);
                warn!(channel = %self.channel.name, message = %error.message, "on_cancel panicked");
            }
        }

        let sink = EventSink::new(self.channel.clone());
        *self.active.lock() = Some(sink.clone());

        let handler = &self.handler;
        let started = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler.on_listen(arguments, sink)
        }));
        match started {
            Ok(()) => {
                debug!(channel = %self.channel.name, "stream session started");
                self.reply_success(reply);
            }
            Err(payload) => {
                if let Some(sink) = self.active.lock().take() {
                    sink.inner.cancel();
                }
                let error = panic_error(payload);
                warn!(channel = %self.channel.name, message = %error.message, "on_listen panicked");
                self.reply_error(reply, &RemoteError::new("error", error.message, Value::Null));
            }
        }
    }

    fn cancel(&self, arguments: Value, reply: ReplySender) {
        let Some(sink) = self.active.lock().take() else {
            return self.reply_error(
                reply,
                &RemoteError::new("error", "No active stream to cancel", Value::Null),
            );
        };
        sink.inner.cancel();

        let cancelled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handler.on_cancel(arguments)
        }));
        match cancelled {
            Ok(()) => {
                debug!(channel = %self.channel.name, "stream session cancelled");
                self.reply_success(reply);
            }
            Err(payload) => {
                let error = panic_error(payload);
                self.reply_error(reply, &RemoteError::new("error", error.message, Value::Null));
            }
        }
    }

    fn reply_success(&self, reply: ReplySender) {
        match envelope::encode_success_envelope(&self.channel.codec, &Value::Null) {
            Ok(bytes) => reply.send(Some(bytes)),
            Err(e) => warn!(error = %e, "could not encode stream reply"),
        }
    }

    fn reply_error(&self, reply: ReplySender, error: &RemoteError) {
        let codec = &self.channel.codec;
        match envelope::encode_error_envelope(codec, &error.code, &error.message, &error.details) {
            Ok(bytes) => reply.send(Some(bytes)),
            Err(e) => warn!(error = %e, "could not encode stream reply"),
        }
    }
}

// ============================================================================
// EventSink
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Open,
    Ended,
    Cancelled,
}

/// Pushes events to the listener of one stream session.
///
/// Clones share the session. Events are sent in the order the calls return,
/// whichever thread they come from.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    channel: EventChannel,
    state: Mutex<SinkState>,
}

impl EventSink {
    fn new(channel: EventChannel) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                channel,
                state: Mutex::new(SinkState::Open),
            }),
        }
    }

    /// Send an event.
    pub fn success(&self, event: Value) -> Result<(), SinkError> {
        let codec = &self.inner.channel.codec;
        let bytes = envelope::encode_success_envelope(codec, &event).map_err(SinkError::Format)?;
        self.inner.send(Some(bytes))
    }

    /// Send an error event. The stream stays open.
    pub fn error(&self, code: &str, message: &str, details: Value) -> Result<(), SinkError> {
        let codec = &self.inner.channel.codec;
        let bytes = envelope::encode_error_envelope(codec, code, message, &details)
            .map_err(SinkError::Format)?;
        self.inner.send(Some(bytes))
    }

    /// End the stream. Ending twice, or after cancellation, does nothing.
    pub fn end_of_stream(&self) {
        let mut state = self.inner.state.lock();
        if *state != SinkState::Open {
            return;
        }
        *state = SinkState::Ended;
        debug!(channel = self.inner.channel.name(), "end of stream");
        let channel = &self.inner.channel;
        channel.messenger.send(channel.name(), None, None);
    }

    pub fn is_open(&self) -> bool {
        *self.inner.state.lock() == SinkState::Open
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("channel", &self.inner.channel.name())
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl SinkInner {
    fn send(&self, message: Message) -> Result<(), SinkError> {
        // holding the lock across send keeps events from racing each other
        let state = self.state.lock();
        match *state {
            SinkState::Open => {
                trace!(channel = self.channel.name(), "event");
                self.channel.messenger.send(self.channel.name(), message, None);
                Ok(())
            }
            SinkState::Ended => {
                warn!(channel = self.channel.name(), "event after end of stream, dropping");
                Err(SinkError::Ended)
            }
            SinkState::Cancelled => Err(SinkError::Cancelled),
        }
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        if *state == SinkState::Open {
            *state = SinkState::Cancelled;
        }
    }
}

// ============================================================================
// EventStream
// ============================================================================

enum StreamEvent {
    Item(Result<Value, RemoteError>),
    End,
}

struct EventReceiver {
    codec: Arc<StandardCodec>,
    tx: UnboundedSender<StreamEvent>,
}

impl EventReceiver {
    fn on_event(&self, message: Message, reply: ReplySender) {
        let event = match message {
            None => StreamEvent::End,
            Some(bytes) => match envelope::decode_envelope(&self.codec, &bytes) {
                Ok(Reply::Success(value)) => StreamEvent::Item(Ok(value)),
                Ok(Reply::Error {
                    code,
                    message,
                    details,
                }) => StreamEvent::Item(Err(RemoteError {
                    code,
                    message,
                    details,
                })),
                Err(e) => StreamEvent::Item(Err(RemoteError::format(&e))),
            },
        };
        let _ = self.tx.send(event);
        drop(reply);
    }
}

/// Listener side of one stream session.
///
/// Dropping the stream cancels the session if it wasn't cancelled already
/// and no newer `listen` on the channel replaced it.
pub struct EventStream {
    channel: EventChannel,
    session: u64,
    arguments: Value,
    rx: UnboundedReceiver<StreamEvent>,
    ended: bool,
    cancelled: bool,
}

impl EventStream {
    /// Next event, or `None` once the host ended the stream (or the session
    /// was cancelled).
    pub async fn next(&mut self) -> Option<Result<Value, RemoteError>> {
        if self.ended {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamEvent::Item(item)) => Some(item),
            Some(StreamEvent::End) | None => {
                self.ended = true;
                None
            }
        }
    }

    /// Collect every remaining event until end of stream.
    pub async fn collect(&mut self) -> Vec<Result<Value, RemoteError>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item);
        }
        out
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Unsubscribe. Cancelling twice is a no-op, and so is cancelling a
    /// stream that a newer `listen` already replaced.
    pub async fn cancel(&mut self) -> Result<(), CallError> {
        if self.cancelled {
            return Ok(());
        }
        self.cancelled = true;
        self.ended = true;
        if !self.channel.owns(self.session) {
            debug!(channel = %self.channel.name, "stream was replaced, not cancelling");
            return Ok(());
        }
        self.channel.messenger.set_handler(&self.channel.name, None);
        self.channel.invoke(CANCEL, self.arguments.clone()).await
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if self.cancelled || !self.channel.owns(self.session) {
            return;
        }
        self.channel.messenger.set_handler(&self.channel.name, None);
        let call = MethodCall::new(CANCEL, std::mem::replace(&mut self.arguments, Value::Null));
        match envelope::encode_method_call(&self.channel.codec, &call) {
            Ok(body) => self.channel.messenger.send(&self.channel.name, Some(body), None),
            Err(e) => warn!(error = %e, "could not encode cancel"),
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("channel", &self.channel.name)
            .field("session", &self.session)
            .field("ended", &self.ended)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}
