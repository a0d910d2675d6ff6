//! The interface a proxy type implements to be reachable from the peer.

use std::sync::Arc;

use parking_lot::Mutex;
use perch_codec::Value;
use perch_messenger::runtime::OneshotReceiver;
use perch_session::{Args, CallError, FromValue, RemoteError};

use crate::registrar::RegistrarInner;
use crate::{Instance, InstanceManager, ProxyError};

/// How a host-side method is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMethodKind {
    /// Builds a new object under the identifier passed as the first argument.
    Constructor,
    /// Called on an object passed as the first argument.
    Instance,
    /// Called without a receiver.
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyMethod {
    pub name: String,
    pub kind: ProxyMethodKind,
}

impl ProxyMethod {
    pub fn constructor(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProxyMethodKind::Constructor,
        }
    }

    pub fn instance(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProxyMethodKind::Instance,
        }
    }

    pub fn static_method(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProxyMethodKind::Static,
        }
    }
}

/// Name and method tables of a proxy type.
///
/// `methods` are implemented here and called by the peer; `peer_methods` are
/// implemented by the peer and called through
/// [`ProxyApiRegistrar::call_peer`](crate::ProxyApiRegistrar::call_peer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyApiDescriptor {
    pub name: String,
    pub methods: Vec<ProxyMethod>,
    pub peer_methods: Vec<String>,
}

impl ProxyApiDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            peer_methods: Vec::new(),
        }
    }

    pub fn method(mut self, method: ProxyMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn peer_method(mut self, name: impl Into<String>) -> Self {
        self.peer_methods.push(name.into());
        self
    }

    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }
}

/// A proxy type served by a [`ProxyApiRegistrar`](crate::ProxyApiRegistrar).
///
/// The registrar resolves receivers and dictated identifiers before calling
/// in, so implementations only deal with live objects.
pub trait ProxyApi: Send + Sync + 'static {
    fn descriptor(&self) -> &ProxyApiDescriptor;

    /// Whether `instance` is one of this API's objects.
    fn is_instance(&self, instance: &Instance) -> bool;

    /// Build a new object for constructor `method`.
    fn construct(
        &self,
        method: usize,
        args: ProxyArgs,
        cx: &ProxyContext,
    ) -> Result<Instance, RemoteError>;

    /// Run instance or static method `method`. `receiver` is `None` for
    /// static methods.
    fn invoke(
        &self,
        method: usize,
        receiver: Option<Instance>,
        args: ProxyArgs,
        cx: &ProxyContext,
    ) -> Result<Value, RemoteError>;

    /// Field values sent to the peer along with a new host-created object.
    fn new_instance_fields(&self, instance: &Instance) -> Vec<Value> {
        let _ = instance;
        Vec::new()
    }
}

/// Arguments of a routed proxy call.
#[derive(Debug)]
pub struct ProxyArgs {
    args: Args,
    manager: InstanceManager,
}

impl ProxyArgs {
    pub(crate) fn new(args: Args, manager: InstanceManager) -> Self {
        Self { args, manager }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn raw(&self, index: usize) -> &Value {
        self.args.raw(index)
    }

    pub fn get<T: FromValue>(&self, index: usize) -> Result<T, RemoteError> {
        self.args.get(index)
    }

    /// Resolve argument `index` to the object it references.
    pub fn instance(&self, index: usize) -> Result<Instance, RemoteError> {
        resolve(&self.manager, self.args.raw(index))
    }

    /// Like [`ProxyArgs::instance`], but null resolves to `None`.
    pub fn nullable_instance(&self, index: usize) -> Result<Option<Instance>, RemoteError> {
        match self.args.raw(index) {
            Value::Null => Ok(None),
            other => resolve(&self.manager, other).map(Some),
        }
    }
}

pub(crate) fn resolve(manager: &InstanceManager, value: &Value) -> Result<Instance, RemoteError> {
    let identifier = match value {
        Value::Instance(id) | Value::Int(id) => *id,
        other => {
            return Err(RemoteError::new(
                "argument-error",
                format!("expected an instance reference, got {}", other.kind()),
                Value::Null,
            ));
        }
    };
    manager
        .instance(identifier)
        .map_err(|e: ProxyError| e.to_remote())
}

/// Access to the registrar from inside a proxy call.
pub struct ProxyContext {
    registrar: Arc<RegistrarInner>,
    /// Acknowledgements of `newInstance` messages sent during the call; the
    /// reply waits for them.
    pending: Mutex<Vec<OneshotReceiver<Result<(), CallError>>>>,
}

impl ProxyContext {
    pub(crate) fn new(registrar: Arc<RegistrarInner>) -> Self {
        Self {
            registrar,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn instance_manager(&self) -> &InstanceManager {
        self.registrar.manager()
    }

    /// Reference to `instance` that can be returned to the peer.
    ///
    /// An object the peer doesn't know yet is registered as host-created and
    /// announced to the peer before the current call replies.
    pub fn export(&self, instance: &Instance) -> Result<Value, RemoteError> {
        let (identifier, ack) = self.registrar.export(instance).map_err(|e| e.to_remote())?;
        if let Some(ack) = ack {
            self.pending.lock().push(ack);
        }
        Ok(Value::Instance(identifier))
    }

    pub(crate) fn into_pending(self) -> Vec<OneshotReceiver<Result<(), CallError>>> {
        self.pending.into_inner()
    }
}
