//! Reference-counted objects with identity and finalizers.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use perch_messenger::runtime;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an [`Instance`].
///
/// Two instances are the same object exactly when their object ids are
/// equal, no matter how their values compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

/// Told when an object it was attached to is deallocated.
pub trait FinalizerDelegate: Send + Sync + 'static {
    fn on_deinit(&self, identifier: i64);
}

/// Owner token for finalizers attached outside any instance manager.
pub(crate) const UNOWNED: u64 = 0;

struct Finalizer {
    owner: u64,
    identifier: i64,
    delegate: Arc<dyn FinalizerDelegate>,
}

/// A shared, type-erased object that can be handed across the channel.
///
/// Cloning an `Instance` adds a strong reference. When the last strong
/// reference goes away, every finalizer still attached runs once, after the
/// dropping call has returned: on the runtime if the drop happened inside
/// one, otherwise on a separate thread.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    id: ObjectId,
    type_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
    finalizers: Mutex<Vec<Finalizer>>,
}

impl Instance {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        let id = ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(InstanceInner {
                id,
                type_name: std::any::type_name::<T>(),
                value: Box::new(value),
                finalizers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.inner.id
    }

    /// Type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.value.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.value.downcast_ref()
    }

    pub fn downgrade(&self) -> WeakInstance {
        WeakInstance {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of strong references, this one included.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Run `delegate.on_deinit(identifier)` when this object is deallocated.
    pub fn attach_finalizer(&self, identifier: i64, delegate: Arc<dyn FinalizerDelegate>) {
        self.attach_owned(UNOWNED, identifier, delegate);
    }

    pub(crate) fn attach_owned(
        &self,
        owner: u64,
        identifier: i64,
        delegate: Arc<dyn FinalizerDelegate>,
    ) {
        self.inner.finalizers.lock().push(Finalizer {
            owner,
            identifier,
            delegate,
        });
    }

    /// Detach `owner`'s finalizers, only the one for `identifier` if given.
    pub(crate) fn detach_owned(&self, owner: u64, identifier: Option<i64>) {
        self.inner
            .finalizers
            .lock()
            .retain(|f| f.owner != owner || identifier.is_some_and(|id| id != f.identifier));
    }

    /// Number of finalizers still attached.
    pub fn finalizer_count(&self) -> usize {
        self.inner.finalizers.lock().len()
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Instance {}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.inner.id.0)
            .field("type", &self.inner.type_name)
            .finish()
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        let finalizers = std::mem::take(self.finalizers.get_mut());
        if finalizers.is_empty() {
            return;
        }
        let object = self.id.0;
        runtime::defer(move || {
            for finalizer in finalizers {
                debug!(object, identifier = finalizer.identifier, "running finalizer");
                finalizer.delegate.on_deinit(finalizer.identifier);
            }
        });
    }
}

/// Non-owning reference to an [`Instance`].
#[derive(Clone)]
pub struct WeakInstance {
    id: ObjectId,
    inner: Weak<InstanceInner>,
}

impl WeakInstance {
    pub fn upgrade(&self) -> Option<Instance> {
        self.inner.upgrade().map(|inner| Instance { inner })
    }

    pub fn object_id(&self) -> ObjectId {
        self.id
    }

    /// Whether the object is still alive. Unlike [`WeakInstance::upgrade`],
    /// never creates a strong reference.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl fmt::Debug for WeakInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakInstance")
            .field("id", &self.id.0)
            .field("alive", &self.is_alive())
            .finish()
    }
}
