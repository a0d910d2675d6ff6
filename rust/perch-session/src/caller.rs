//! Calling APIs implemented on the other side.

use std::fmt;
use std::sync::Arc;

use perch_codec::envelope::{self, Reply};
use perch_codec::{StandardCodec, Value};
use perch_messenger::{BinaryMessenger, ChannelName, DEFAULT_PREFIX, Message, request};

use crate::CallError;

/// Client for an API served by the peer.
///
/// ```ignore
/// let api = ApiClient::new(messenger, codec, "FlutterIntegrationCoreApi")
///     .with_suffix("suffixOne");
/// let echoed = api.call("echoString", &[Value::from("hello")]).await?;
/// ```
#[derive(Clone)]
pub struct ApiClient {
    messenger: Arc<dyn BinaryMessenger>,
    codec: Arc<StandardCodec>,
    prefix: String,
    api: String,
    suffix: String,
}

impl ApiClient {
    pub fn new(
        messenger: Arc<dyn BinaryMessenger>,
        codec: Arc<StandardCodec>,
        api: impl Into<String>,
    ) -> Self {
        Self {
            messenger,
            codec,
            prefix: DEFAULT_PREFIX.to_owned(),
            api: api.into(),
            suffix: String::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn codec(&self) -> &Arc<StandardCodec> {
        &self.codec
    }

    /// Channel used for `method`.
    pub fn channel(&self, method: &str) -> String {
        ChannelName::new(&self.prefix, &self.api, method)
            .with_suffix(&self.suffix)
            .to_string()
    }

    /// Call `method` with `args` and wait for the reply.
    pub async fn call(&self, method: &str, args: &[Value]) -> Result<Value, CallError> {
        let channel = self.channel(method);
        let body = envelope::encode_request(&self.codec, args)?;
        trace!(channel = %channel, args = args.len(), "call");
        let reply = request(self.messenger.as_ref(), &channel, Some(body)).await?;
        decode_reply(&self.codec, &reply)
    }

    /// Call `method` and hand the outcome to `on_result`, which may run on any
    /// thread.
    pub fn call_with<F>(&self, method: &str, args: &[Value], on_result: F)
    where
        F: FnOnce(Result<Value, CallError>) + Send + 'static,
    {
        let channel = self.channel(method);
        let body = match envelope::encode_request(&self.codec, args) {
            Ok(body) => body,
            Err(e) => return on_result(Err(e.into())),
        };
        let codec = self.codec.clone();
        let reply_channel = channel.clone();
        self.messenger.send(
            &channel,
            Some(body),
            Some(Box::new(move |reply: Message| {
                let result = match reply {
                    Some(bytes) => decode_reply(&codec, &bytes),
                    None => Err(CallError::ChannelUnavailable(reply_channel)),
                };
                on_result(result);
            })),
        );
    }
}

fn decode_reply(codec: &StandardCodec, bytes: &[u8]) -> Result<Value, CallError> {
    match envelope::decode_reply(codec, bytes)? {
        Reply::Success(value) => Ok(value),
        Reply::Error {
            code,
            message,
            details,
        } => Err(CallError::Remote(crate::RemoteError {
            code,
            message,
            details,
        })),
    }
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("api", &self.api)
            .field("suffix", &self.suffix)
            .finish()
    }
}
