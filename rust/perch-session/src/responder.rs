use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use perch_codec::{StandardCodec, Value, envelope};
use perch_messenger::{ReplySender, runtime};

use crate::{RemoteError, ResponderError};

/// Completes one request.
///
/// Clones share the same pending reply: whichever clone completes first sends
/// it, every later attempt is rejected with [`ResponderError::AlreadyReplied`]
/// and nothing more goes on the wire. If every clone is dropped without
/// replying, the caller receives a `no-reply` error.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

struct ResponderInner {
    channel: Arc<str>,
    codec: Arc<StandardCodec>,
    reply: Mutex<Option<ReplySender>>,
}

impl Responder {
    pub fn new(codec: Arc<StandardCodec>, reply: ReplySender) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                channel: reply.channel().into(),
                codec,
                reply: Mutex::new(Some(reply)),
            }),
        }
    }

    /// Channel the request arrived on.
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Whether a reply has been sent.
    pub fn is_done(&self) -> bool {
        self.inner.reply.lock().is_none()
    }

    pub fn success(&self, value: Value) -> Result<(), ResponderError> {
        self.complete(Ok(value))
    }

    pub fn error(&self, error: RemoteError) -> Result<(), ResponderError> {
        self.complete(Err(error))
    }

    /// Send the reply for `result`.
    ///
    /// A success value that can't be encoded is replied as a `format-error`.
    pub fn complete(&self, result: Result<Value, RemoteError>) -> Result<(), ResponderError> {
        let Some(reply) = self.inner.reply.lock().take() else {
            warn!(channel = %self.inner.channel, "second reply for a request, ignoring");
            return Err(ResponderError::AlreadyReplied);
        };

        let codec = &self.inner.codec;
        let bytes = match &result {
            Ok(value) => envelope::encode_success(codec, value)
                .or_else(|e| encode_error(codec, &RemoteError::format(&e))),
            Err(error) => encode_error(codec, error),
        };
        match bytes {
            Ok(bytes) => {
                trace!(channel = %self.inner.channel, ok = result.is_ok(), "reply");
                reply.send(Some(bytes));
            }
            // dropping the sender replies empty
            Err(e) => warn!(channel = %self.inner.channel, error = %e, "could not encode reply"),
        }
        Ok(())
    }

    /// Drive `future` on the runtime and reply with its output.
    ///
    /// A panic inside the future is replied as a `panic` error.
    pub fn spawn<F>(self, future: F)
    where
        F: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let task = runtime::spawn(future);
        runtime::spawn(async move {
            let result = match task.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(panic_error(e.into_panic())),
                Err(_) => Err(RemoteError::new(
                    "cancelled",
                    "handler task was cancelled",
                    Value::Null,
                )),
            };
            let _ = self.complete(result);
        });
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("channel", &self.inner.channel)
            .field("done", &self.is_done())
            .finish()
    }
}

impl Drop for ResponderInner {
    fn drop(&mut self) {
        let Some(reply) = self.reply.get_mut().take() else {
            return;
        };
        warn!(channel = %self.channel, "request dropped without a reply");
        let error = RemoteError::new(
            "no-reply",
            format!("handler for \"{}\" finished without replying", self.channel),
            Value::Null,
        );
        if let Ok(bytes) = encode_error(&self.codec, &error) {
            reply.send(Some(bytes));
        }
    }
}

fn encode_error(
    codec: &StandardCodec,
    error: &RemoteError,
) -> Result<Bytes, perch_codec::FormatError> {
    envelope::encode_error(codec, &error.code, &error.message, &error.details).or_else(|_| {
        // details that don't encode are replaced rather than losing the error
        envelope::encode_error(codec, &error.code, &error.message, &Value::Null)
    })
}

/// Convert a panic payload into the error replied to the caller.
pub(crate) fn panic_error(payload: Box<dyn Any + Send>) -> RemoteError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    };
    RemoteError::new("panic", message, Value::Null)
}
