//! Host-side API dispatch.
//!
//! An API is a named table of methods. [`ApiServer::set_up`] registers one
//! messenger handler per method on the channel
//! `<prefix>.<api>.<method>[.<suffix>]`. Every request body is the argument
//! list; every reply is `[result]` or `[code, message, details]`.
//!
//! Handlers may reply in three ways:
//!
//! - directly, by returning a result ([`Handler::Direct`])
//! - later, through a [`Responder`] that may be completed from any thread
//!   after the handler has returned ([`Handler::Callback`])
//! - from a future driven on the runtime ([`Handler::Future`])
//!
//! In all three cases exactly one reply is sent per request, including when
//! the handler panics.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use perch_codec::{StandardCodec, Value, envelope};
use perch_messenger::{BinaryMessenger, ChannelName, DEFAULT_PREFIX, Message, ReplySender};

use crate::responder::panic_error;
use crate::{Args, RemoteError, Responder};

/// Boxed future returned by [`Handler::Future`] methods.
pub type BoxFuture = Pin<Box<dyn Future<Output = Result<Value, RemoteError>> + Send + 'static>>;

/// Name and method table of an API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiDescriptor {
    pub name: String,
    pub methods: Vec<String>,
}

impl ApiDescriptor {
    pub fn new(
        name: impl Into<String>,
        methods: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }

    pub fn method_index(&self, method: &str) -> Option<usize> {
        self.methods.iter().position(|m| m == method)
    }
}

/// An API implemented on this side.
///
/// `handle` receives the index of the method in the descriptor and must
/// eventually complete the responder (or let it drop).
pub trait HostApi: Send + Sync + 'static {
    fn descriptor(&self) -> &ApiDescriptor;

    fn handle(&self, method: usize, args: Args, responder: Responder);
}

// ============================================================================
// Closure-based APIs
// ============================================================================

/// How one method of an [`FnApi`] produces its reply.
#[derive(Clone)]
pub enum Handler {
    Direct(Arc<dyn Fn(Args) -> Result<Value, RemoteError> + Send + Sync>),
    Callback(Arc<dyn Fn(Args, Responder) + Send + Sync>),
    Future(Arc<dyn Fn(Args) -> BoxFuture + Send + Sync>),
}

impl Handler {
    pub fn direct<F>(f: F) -> Self
    where
        F: Fn(Args) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        Handler::Direct(Arc::new(f))
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Args, Responder) + Send + Sync + 'static,
    {
        Handler::Callback(Arc::new(f))
    }

    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        Handler::Future(Arc::new(move |args| Box::pin(f(args)) as BoxFuture))
    }

    /// Run the handler for one request.
    pub fn invoke(&self, args: Args, responder: Responder) {
        match self {
            Handler::Direct(f) => {
                let _ = responder.complete(f(args));
            }
            Handler::Callback(f) => f(args, responder),
            Handler::Future(f) => responder.spawn(f(args)),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Direct(_) => write!(f, "Handler::Direct"),
            Handler::Callback(_) => write!(f, "Handler::Callback"),
            Handler::Future(_) => write!(f, "Handler::Future"),
        }
    }
}

/// An API assembled from closures.
///
/// ```ignore
/// let api = FnApi::builder("HostSmallApi")
///     .direct("echo", |args| args.get::<String>(0).map(Value::from))
///     .future("voidVoid", |_| async { Ok(Value::Null) })
///     .build();
/// ```
pub struct FnApi {
    descriptor: ApiDescriptor,
    handlers: Vec<Handler>,
}

impl FnApi {
    pub fn builder(name: impl Into<String>) -> FnApiBuilder {
        FnApiBuilder {
            descriptor: ApiDescriptor::new(name, Vec::<String>::new()),
            handlers: Vec::new(),
        }
    }
}

impl HostApi for FnApi {
    fn descriptor(&self) -> &ApiDescriptor {
        &self.descriptor
    }

    fn handle(&self, method: usize, args: Args, responder: Responder) {
        match self.handlers.get(method) {
            Some(handler) => handler.invoke(args, responder),
            None => {
                let _ = responder.error(RemoteError::new(
                    "unknown-method",
                    format!("no method #{method} on {}", self.descriptor.name),
                    Value::Null,
                ));
            }
        }
    }
}

pub struct FnApiBuilder {
    descriptor: ApiDescriptor,
    handlers: Vec<Handler>,
}

impl FnApiBuilder {
    pub fn method(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.descriptor.methods.push(name.into());
        self.handlers.push(handler);
        self
    }

    pub fn direct<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.method(name, Handler::direct(f))
    }

    pub fn callback<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args, Responder) + Send + Sync + 'static,
    {
        self.method(name, Handler::callback(f))
    }

    pub fn future<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        self.method(name, Handler::future(f))
    }

    pub fn build(self) -> FnApi {
        FnApi {
            descriptor: self.descriptor,
            handlers: self.handlers,
        }
    }
}

// ============================================================================
// Serving
// ============================================================================

/// Decode a request and hand it to `f` with a responder for the reply.
///
/// Undecodable requests are answered with `format-error` without calling `f`.
/// A panic in `f` is answered with `panic` unless `f` already replied.
pub fn handle_message<F>(codec: &Arc<StandardCodec>, message: Message, reply: ReplySender, f: F)
where
    F: FnOnce(Args, Responder),
{
    let responder = Responder::new(codec.clone(), reply);
    let args = match envelope::decode_request(codec, message.as_deref()) {
        Ok(args) => Args::new(args),
        Err(e) => {
            debug!(channel = responder.channel(), error = %e, "undecodable request");
            let _ = responder.error(RemoteError::format(&e));
            return;
        }
    };

    let guard = responder.clone();
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(args, responder))) {
        let error = panic_error(payload);
        warn!(channel = guard.channel(), message = %error.message, "handler panicked");
        let _ = guard.error(error);
    }
}

/// Registers host APIs on a messenger.
pub struct ApiServer {
    messenger: Arc<dyn BinaryMessenger>,
    codec: Arc<StandardCodec>,
    prefix: String,
    /// Channels registered per `(api, suffix)`.
    registered: Mutex<HashMap<(String, String), Vec<String>>>,
}

impl ApiServer {
    pub fn new(messenger: Arc<dyn BinaryMessenger>, codec: Arc<StandardCodec>) -> Self {
        Self {
            messenger,
            codec,
            prefix: DEFAULT_PREFIX.to_owned(),
            registered: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn codec(&self) -> &Arc<StandardCodec> {
        &self.codec
    }

    /// Register every method of `api` under `suffix` (empty for none).
    ///
    /// Returns the channel names. Registering the same API and suffix again
    /// replaces the previous handlers.
    pub fn set_up(&self, api: Arc<dyn HostApi>, suffix: &str) -> Vec<String> {
        let descriptor = api.descriptor().clone();
        let mut channels = Vec::with_capacity(descriptor.methods.len());

        for (index, method) in descriptor.methods.iter().enumerate() {
            let channel = ChannelName::new(&self.prefix, &descriptor.name, method)
                .with_suffix(suffix)
                .to_string();
            let api = api.clone();
            let codec = self.codec.clone();
            self.messenger.set_handler(
                &channel,
                Some(Arc::new(move |message: Message, reply: ReplySender| {
                    trace!(channel = reply.channel(), "request");
                    handle_message(&codec, message, reply, |args, responder| {
                        api.handle(index, args, responder)
                    });
                })),
            );
            channels.push(channel);
        }

        debug!(api = %descriptor.name, suffix, methods = channels.len(), "set up api");
        self.registered
            .lock()
            .insert((descriptor.name, suffix.to_owned()), channels.clone());
        channels
    }

    /// Remove the handlers registered by [`ApiServer::set_up`] for `api` and
    /// `suffix`. Returns false if nothing was registered.
    pub fn tear_down(&self, api: &str, suffix: &str) -> bool {
        let channels = self
            .registered
            .lock()
            .remove(&(api.to_owned(), suffix.to_owned()));
        let Some(channels) = channels else {
            return false;
        };
        for channel in &channels {
            self.messenger.set_handler(channel, None);
        }
        debug!(api, suffix, "tore down api");
        true
    }

    /// Remove every handler this server registered.
    pub fn tear_down_all(&self) {
        let all: Vec<_> = self.registered.lock().drain().collect();
        for (_, channels) in all {
            for channel in &channels {
                self.messenger.set_handler(channel, None);
            }
        }
    }
}

impl fmt::Debug for ApiServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiServer")
            .field("prefix", &self.prefix)
            .field("apis", &self.registered.lock().len())
            .finish()
    }
}
