//! Wiring proxy APIs onto a messenger.
//!
//! Every host method of every registered [`ProxyApi`] gets a channel
//! `<prefix>.<Type>.<method>`. Calls from the peer are routed through the
//! shared [`InstanceManager`]: constructors register the new object under the
//! identifier the peer dictates, instance methods resolve their receiver from
//! the first argument. In the other direction, host-created objects are
//! announced to the peer with `<Type>.newInstance` before their first use, and
//! their deallocation is reported with
//! `PerchInstanceManagerApi.removeStrongReference`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use perch_codec::{StandardCodec, Value};
use perch_messenger::runtime::{self, OneshotReceiver, OneshotSender};
use perch_messenger::{BinaryMessenger, ChannelName, DEFAULT_PREFIX, Message, ReplySender};
use perch_session::{ApiClient, Args, CallError, RemoteError, Responder, handle_message};

use crate::proxy_api::resolve;
use crate::{
    FinalizerDelegate, Instance, InstanceManager, ProxyApi, ProxyArgs, ProxyContext, ProxyError,
    ProxyMethodKind,
};

/// API both sides serve to manage each other's references.
pub const INSTANCE_MANAGER_API: &str = "PerchInstanceManagerApi";

/// Lifecycle of a [`ProxyApiRegistrar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarState {
    Uninitialized,
    SetUp,
    TornDown,
}

type Ack = OneshotReceiver<Result<(), CallError>>;
type AckSender = OneshotSender<Result<(), CallError>>;

/// Serves a set of proxy APIs over one messenger, sharing one
/// [`InstanceManager`] between them.
///
/// ```ignore
/// let registrar = ProxyApiRegistrar::builder(messenger, codec)
///     .api(Arc::new(TestClassApi::new()))
///     .build();
/// registrar.set_up()?;
/// ```
#[derive(Clone)]
pub struct ProxyApiRegistrar {
    inner: Arc<RegistrarInner>,
}

pub struct RegistrarBuilder {
    messenger: Arc<dyn BinaryMessenger>,
    codec: Arc<StandardCodec>,
    prefix: String,
    apis: Vec<Arc<dyn ProxyApi>>,
}

impl RegistrarBuilder {
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn api(mut self, api: Arc<dyn ProxyApi>) -> Self {
        self.apis.push(api);
        self
    }

    pub fn build(self) -> ProxyApiRegistrar {
        let inner = Arc::new_cyclic(|weak: &Weak<RegistrarInner>| RegistrarInner {
            messenger: self.messenger,
            codec: self.codec,
            prefix: self.prefix,
            apis: self.apis,
            manager: InstanceManager::new(Arc::new(PeerFinalizer {
                registrar: weak.clone(),
            })),
            state: Mutex::new(RegistrarState::Uninitialized),
            channels: Mutex::new(Vec::new()),
            announcing: Mutex::new(HashMap::new()),
            ignore_calls_to_peer: AtomicBool::new(false),
        });
        ProxyApiRegistrar { inner }
    }
}

pub(crate) struct RegistrarInner {
    messenger: Arc<dyn BinaryMessenger>,
    codec: Arc<StandardCodec>,
    prefix: String,
    apis: Vec<Arc<dyn ProxyApi>>,
    manager: InstanceManager,
    state: Mutex<RegistrarState>,
    channels: Mutex<Vec<String>>,
    /// Host-created identifiers whose `newInstance` is still unacknowledged,
    /// with everyone waiting for the acknowledgement.
    announcing: Mutex<HashMap<i64, Vec<AckSender>>>,
    ignore_calls_to_peer: AtomicBool,
}

/// Reports deallocated host-created objects to the peer.
struct PeerFinalizer {
    registrar: Weak<RegistrarInner>,
}

impl FinalizerDelegate for PeerFinalizer {
    fn on_deinit(&self, identifier: i64) {
        if let Some(registrar) = self.registrar.upgrade() {
            registrar.remove_strong_reference_on_peer(identifier);
        }
    }
}

// ============================================================================
// Registrar
// ============================================================================

impl ProxyApiRegistrar {
    pub fn builder(
        messenger: Arc<dyn BinaryMessenger>,
        codec: Arc<StandardCodec>,
    ) -> RegistrarBuilder {
        RegistrarBuilder {
            messenger,
            codec,
            prefix: DEFAULT_PREFIX.to_owned(),
            apis: Vec::new(),
        }
    }

    pub fn state(&self) -> RegistrarState {
        *self.inner.state.lock()
    }

    pub fn instance_manager(&self) -> &InstanceManager {
        &self.inner.manager
    }

    /// Suppress every message to the peer. Used while the peer is going away.
    pub fn set_ignore_calls_to_peer(&self, ignore: bool) {
        self.inner.ignore_calls_to_peer.store(ignore, Ordering::Release);
    }

    pub fn ignores_calls_to_peer(&self) -> bool {
        self.inner.ignores_calls_to_peer()
    }

    /// Register the handlers of every proxy API and of the instance manager.
    pub fn set_up(&self) -> Result<(), ProxyError> {
        {
            let mut state = self.inner.state.lock();
            if *state != RegistrarState::Uninitialized {
                return Err(ProxyError::ProtocolState {
                    expected: RegistrarState::Uninitialized,
                    actual: *state,
                });
            }
            *state = RegistrarState::SetUp;
        }

        let mut channels = Vec::new();
        for (api_index, api) in self.inner.apis.iter().enumerate() {
            let descriptor = api.descriptor();
            for (method_index, method) in descriptor.methods.iter().enumerate() {
                let channel = self.inner.channel(&descriptor.name, &method.name);
                let registrar = Arc::downgrade(&self.inner);
                self.inner.messenger.set_handler(
                    &channel,
                    Some(Arc::new(move |message: Message, reply: ReplySender| {
                        let Some(registrar) = registrar.upgrade() else {
                            return;
                        };
                        handle_message(&registrar.codec, message, reply, |args, responder| {
                            registrar.route(api_index, method_index, args, responder)
                        });
                    })),
                );
                channels.push(channel);
            }
        }

        for method in ["removeStrongReference", "clear"] {
            let channel = self.inner.channel(INSTANCE_MANAGER_API, method);
            let registrar = Arc::downgrade(&self.inner);
            self.inner.messenger.set_handler(
                &channel,
                Some(Arc::new(move |message: Message, reply: ReplySender| {
                    let Some(registrar) = registrar.upgrade() else {
                        return;
                    };
                    handle_message(&registrar.codec, message, reply, |args, responder| {
                        registrar.handle_instance_manager(method, args, responder)
                    });
                })),
            );
            channels.push(channel);
        }

        debug!(
            apis = self.inner.apis.len(),
            channels = channels.len(),
            "set up proxy apis"
        );
        *self.inner.channels.lock() = channels;
        Ok(())
    }

    /// Unregister every handler and forget every object.
    ///
    /// Only a registrar that is set up can be torn down. Identifiers handed
    /// out before are invalid afterwards; calls that still arrive find no
    /// handler.
    pub fn tear_down(&self) -> Result<(), ProxyError> {
        {
            let mut state = self.inner.state.lock();
            if *state != RegistrarState::SetUp {
                return Err(ProxyError::ProtocolState {
                    expected: RegistrarState::SetUp,
                    actual: *state,
                });
            }
            *state = RegistrarState::TornDown;
        }

        let channels = std::mem::take(&mut *self.inner.channels.lock());
        for channel in &channels {
            self.inner.messenger.set_handler(channel, None);
        }
        self.inner.manager.remove_all_objects();
        debug!(channels = channels.len(), "tore down proxy apis");
        Ok(())
    }

    /// Identifier of `instance`, announcing it to the peer first if needed.
    pub async fn export(&self, instance: &Instance) -> Result<i64, ProxyError> {
        let (identifier, ack) = self.inner.export(instance)?;
        wait_for_ack(ack).await?;
        Ok(identifier)
    }

    /// Call `method` on the peer's proxy of `instance`.
    ///
    /// The instance is exported first, so the peer always knows the receiver
    /// by the time the call arrives.
    pub async fn call_peer(
        &self,
        instance: &Instance,
        method: &str,
        args: &[Value],
    ) -> Result<Value, ProxyError> {
        self.inner.check_set_up()?;
        if self.inner.ignores_calls_to_peer() {
            trace!(method, "ignoring call to peer");
            return Ok(Value::Null);
        }
        let api = self.inner.api_for(instance)?;
        if !api.descriptor().peer_methods.iter().any(|m| m == method) {
            return Err(ProxyError::UnknownMethod(format!(
                "{}.{method}",
                api.descriptor().name
            )));
        }
        let identifier = self.export(instance).await?;

        let mut values = Vec::with_capacity(args.len() + 1);
        values.push(Value::Instance(identifier));
        values.extend_from_slice(args);
        Ok(self.inner.client(&api.descriptor().name).call(method, &values).await?)
    }
}

impl fmt::Debug for ProxyApiRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyApiRegistrar")
            .field("prefix", &self.inner.prefix)
            .field("apis", &self.inner.apis.len())
            .field("state", &self.state())
            .finish()
    }
}

/// Join the waiters of an announcement that is still in flight.
fn wait_on(announcing: &mut HashMap<i64, Vec<AckSender>>, identifier: i64) -> Option<Ack> {
    let waiters = announcing.get_mut(&identifier)?;
    let (tx, rx) = runtime::oneshot();
    waiters.push(tx);
    Some(rx)
}

async fn wait_for_ack(ack: Option<Ack>) -> Result<(), ProxyError> {
    let Some(ack) = ack else {
        return Ok(());
    };
    match ack.await {
        Ok(result) => Ok(result?),
        // the messenger dropped the callback; the peer never saw the object
        Err(_) => Err(ProxyError::Call(CallError::ChannelUnavailable(
            "newInstance".to_owned(),
        ))),
    }
}

// ============================================================================
// Routing
// ============================================================================

impl RegistrarInner {
    pub(crate) fn manager(&self) -> &InstanceManager {
        &self.manager
    }

    fn channel(&self, api: &str, method: &str) -> String {
        ChannelName::new(&self.prefix, api, method).to_string()
    }

    fn client(&self, api: &str) -> ApiClient {
        ApiClient::new(self.messenger.clone(), self.codec.clone(), api).with_prefix(&self.prefix)
    }

    fn state(&self) -> RegistrarState {
        *self.state.lock()
    }

    fn ignores_calls_to_peer(&self) -> bool {
        self.ignore_calls_to_peer.load(Ordering::Acquire)
    }

    fn check_set_up(&self) -> Result<(), ProxyError> {
        match self.state() {
            RegistrarState::SetUp => Ok(()),
            actual => Err(ProxyError::ProtocolState {
                expected: RegistrarState::SetUp,
                actual,
            }),
        }
    }

    fn api_for(&self, instance: &Instance) -> Result<&Arc<dyn ProxyApi>, ProxyError> {
        self.apis
            .iter()
            .find(|api| api.is_instance(instance))
            .ok_or(ProxyError::UnknownType(instance.type_name()))
    }

    fn route(
        self: &Arc<Self>,
        api_index: usize,
        method_index: usize,
        args: Args,
        responder: Responder,
    ) {
        let cx = ProxyContext::new(self.clone());
        let result = self.invoke(api_index, method_index, args, &cx);

        let pending = cx.into_pending();
        if pending.is_empty() {
            let _ = responder.complete(result);
            return;
        }
        // the peer must know every exported object before it sees the reply
        responder.spawn(async move {
            for ack in pending {
                if let Err(e) = wait_for_ack(Some(ack)).await {
                    warn!(error = %e, "peer did not acknowledge new instance");
                }
            }
            result
        });
    }

    fn invoke(
        &self,
        api_index: usize,
        method_index: usize,
        args: Args,
        cx: &ProxyContext,
    ) -> Result<Value, RemoteError> {
        self.check_set_up()?;
        let api = &self.apis[api_index];
        let method = &api.descriptor().methods[method_index];
        trace!(api = %api.descriptor().name, method = %method.name, "proxy call");

        match method.kind {
            ProxyMethodKind::Constructor => {
                let identifier = args.get::<i64>(0)?;
                let rest = self.proxy_args(args);
                let instance = api.construct(method_index, rest, cx)?;
                self.manager.add_dart_created_instance(&instance, identifier)?;
                Ok(Value::Null)
            }
            ProxyMethodKind::Instance => {
                let receiver = resolve(&self.manager, args.raw(0))?;
                let rest = self.proxy_args(args);
                api.invoke(method_index, Some(receiver), rest, cx)
            }
            ProxyMethodKind::Static => {
                let args = ProxyArgs::new(args, self.manager.clone());
                api.invoke(method_index, None, args, cx)
            }
        }
    }

    /// Arguments after the first.
    fn proxy_args(&self, args: Args) -> ProxyArgs {
        let rest = args.into_vec().into_iter().skip(1).collect();
        ProxyArgs::new(Args::new(rest), self.manager.clone())
    }

    fn handle_instance_manager(&self, method: &str, args: Args, responder: Responder) {
        let result = match method {
            "removeStrongReference" => args
                .get::<i64>(0)
                .and_then(|identifier| Ok(self.manager.remove_instance(identifier)?))
                .map(|_| Value::Null),
            _ => {
                self.manager.remove_all_objects();
                Ok(Value::Null)
            }
        };
        let _ = responder.complete(result);
    }

    /// Identifier of `instance` plus the acknowledgement of its
    /// `newInstance` message while that is still outstanding.
    ///
    /// Every exporter of an object gets to wait for the same acknowledgement,
    /// not just the one that sent the announcement.
    pub(crate) fn export(
        self: &Arc<Self>,
        instance: &Instance,
    ) -> Result<(i64, Option<Ack>), ProxyError> {
        self.check_set_up()?;
        // held until the announcement is recorded, so a concurrent exporter
        // finds either nothing or the pending entry
        let mut announcing = self.announcing.lock();
        if let Some(identifier) = self.manager.identifier(instance) {
            return Ok((identifier, wait_on(&mut announcing, identifier)));
        }
        let api = self.api_for(instance)?;
        let identifier = match self.manager.add_host_created_instance(instance) {
            Ok(identifier) => identifier,
            Err(ProxyError::AlreadyRegistered(identifier)) => {
                return Ok((identifier, wait_on(&mut announcing, identifier)));
            }
            Err(e) => return Err(e),
        };

        if self.ignores_calls_to_peer() {
            return Ok((identifier, None));
        }
        let (tx, rx) = runtime::oneshot();
        announcing.insert(identifier, vec![tx]);
        drop(announcing);

        let mut fields = vec![Value::Int(identifier)];
        fields.extend(api.new_instance_fields(instance));
        debug!(api = %api.descriptor().name, identifier, "announcing new instance");
        let registrar = Arc::downgrade(self);
        self.client(&api.descriptor().name)
            .call_with("newInstance", &fields, move |result| {
                if let Some(registrar) = registrar.upgrade() {
                    registrar.announced(identifier, result.map(|_| ()));
                }
            });
        Ok((identifier, Some(rx)))
    }

    fn announced(&self, identifier: i64, result: Result<(), CallError>) {
        let waiters = self.announcing.lock().remove(&identifier).unwrap_or_default();
        trace!(identifier, waiters = waiters.len(), "new instance acknowledged");
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn remove_strong_reference_on_peer(&self, identifier: i64) {
        if self.state() != RegistrarState::SetUp || self.ignores_calls_to_peer() {
            return;
        }
        debug!(identifier, "releasing peer reference");
        self.client(INSTANCE_MANAGER_API).call_with(
            "removeStrongReference",
            &[Value::Int(identifier)],
            move |result| {
                if let Err(e) = result {
                    warn!(identifier, error = %e, "removeStrongReference failed");
                }
            },
        );
    }
}
