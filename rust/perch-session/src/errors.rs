use std::fmt;

use perch_codec::{FormatError, Value};
use perch_messenger::MessengerError;

/// Error raised by the code on the other side of a call, carried across the
/// wire as `(code, message, details)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
    pub details: Value,
}

impl RemoteError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<Value>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: details.into(),
        }
    }

    /// Convert an arbitrary error into the wire triple.
    ///
    /// The code is the error's type name, the message its `Display` output and
    /// the details describe its source chain (null if it has none).
    pub fn wrap<E: std::error::Error + ?Sized>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let code = full.rsplit("::").next().unwrap_or(full);

        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        let details = if causes.is_empty() {
            Value::Null
        } else {
            Value::String(format!("Cause: {}", causes.join(": ")))
        };

        Self::new(code, err.to_string(), details)
    }

    pub(crate) fn format(err: &FormatError) -> Self {
        Self::new("format-error", err.to_string(), Value::Null)
    }

    pub(crate) fn argument(message: impl Into<String>) -> Self {
        Self::new("argument-error", message, Value::Null)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if !self.details.is_null() {
            write!(f, " ({})", self.details)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

/// Error from an outgoing call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// The peer's handler failed.
    Remote(RemoteError),
    /// The request could not be encoded or the reply could not be decoded.
    Format(FormatError),
    /// Nothing is listening on the channel.
    ChannelUnavailable(String),
    /// The messenger lost the reply.
    Messenger(MessengerError),
}

impl CallError {
    /// The wire triple for this error, as the caller should see it.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            CallError::Remote(e) => e.clone(),
            CallError::Format(e) => RemoteError::format(e),
            CallError::ChannelUnavailable(channel) => RemoteError::new(
                "channel-error",
                format!("Unable to establish connection on channel: \"{channel}\"."),
                Value::Null,
            ),
            CallError::Messenger(e) => {
                RemoteError::new("channel-error", e.to_string(), Value::Null)
            }
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Remote(e) => write!(f, "remote error: {e}"),
            CallError::Format(e) => write!(f, "format error: {e}"),
            CallError::ChannelUnavailable(channel) => {
                write!(f, "unable to establish connection on channel \"{channel}\"")
            }
            CallError::Messenger(e) => write!(f, "messenger error: {e}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Remote(e) => Some(e),
            CallError::Format(e) => Some(e),
            CallError::ChannelUnavailable(_) => None,
            CallError::Messenger(e) => Some(e),
        }
    }
}

impl From<RemoteError> for CallError {
    fn from(value: RemoteError) -> Self {
        CallError::Remote(value)
    }
}

impl From<FormatError> for CallError {
    fn from(value: FormatError) -> Self {
        CallError::Format(value)
    }
}

impl From<MessengerError> for CallError {
    fn from(value: MessengerError) -> Self {
        match value {
            MessengerError::NoHandler(channel) => CallError::ChannelUnavailable(channel),
            other => CallError::Messenger(other),
        }
    }
}

/// A responder was asked to reply a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderError {
    AlreadyReplied,
}

impl fmt::Display for ResponderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponderError::AlreadyReplied => {
                write!(f, "a reply was already sent for this request")
            }
        }
    }
}

impl std::error::Error for ResponderError {}

/// An event sink refused an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// `end_of_stream` was already called on this session.
    Ended,
    /// The listener cancelled, or a newer session replaced this one.
    Cancelled,
    /// The event could not be encoded.
    Format(FormatError),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Ended => write!(f, "event stream already ended"),
            SinkError::Cancelled => write!(f, "event stream was cancelled"),
            SinkError::Format(e) => write!(f, "could not encode event: {e}"),
        }
    }
}

impl std::error::Error for SinkError {}
