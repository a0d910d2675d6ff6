//! Identifier-keyed registry of proxy objects.
//!
//! Identifiers are matched to objects by identity ([`ObjectId`]), never by
//! value. Objects created at the peer's request ("Dart-created") are held
//! strongly under the identifier the peer chose. Objects created on this
//! side and handed to the peer ("host-created") are tracked weakly under an
//! identifier from [`MIN_HOST_CREATED_IDENTIFIER`] upwards; when one is
//! deallocated, the manager forgets it and tells its finalizer delegate.
//!
//! The tables are guarded by a single mutex. Finalizers are delivered after
//! the deallocating call returns, so by the time one arrives the tables may
//! have been cleared; it checks the generation it was attached under and
//! drops out if that is gone.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::instance::UNOWNED;
use crate::{FinalizerDelegate, Instance, ObjectId, ProxyError, WeakInstance};

/// First identifier handed out by [`InstanceManager::add_host_created_instance`].
/// The peer allocates identifiers below this.
pub const MIN_HOST_CREATED_IDENTIFIER: i64 = 65536;

static NEXT_MANAGER: AtomicU64 = AtomicU64::new(UNOWNED + 1);

/// Bidirectional map between identifiers and live objects.
///
/// Cloning gives another handle to the same manager.
#[derive(Clone)]
pub struct InstanceManager {
    shared: Arc<Shared>,
}

struct Shared {
    owner: u64,
    tables: Mutex<Tables>,
    delegate: Arc<dyn FinalizerDelegate>,
}

#[derive(Default)]
struct Tables {
    /// Most recent identifier of each registered object.
    identifiers: HashMap<ObjectId, i64>,
    weak: HashMap<i64, WeakInstance>,
    strong: HashMap<i64, Instance>,
    next_identifier: i64,
    /// Bumped by `remove_all_objects`; finalizers from older generations are
    /// ignored.
    generation: u64,
}

impl Tables {
    fn in_use(&self, identifier: i64) -> bool {
        self.strong.contains_key(&identifier)
            || self.weak.get(&identifier).is_some_and(WeakInstance::is_alive)
    }
}

/// Finalizer the manager attaches to every object it tracks.
struct ManagerFinalizer {
    shared: Weak<Shared>,
    generation: u64,
    object: ObjectId,
}

impl FinalizerDelegate for ManagerFinalizer {
    fn on_deinit(&self, identifier: i64) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        {
            let mut tables = shared.tables.lock();
            if tables.generation != self.generation {
                return;
            }
            let tracked = tables
                .weak
                .get(&identifier)
                .is_some_and(|w| w.object_id() == self.object);
            if !tracked {
                return;
            }
            tables.weak.remove(&identifier);
            if tables.identifiers.get(&self.object) == Some(&identifier) {
                tables.identifiers.remove(&self.object);
            }
        }
        debug!(identifier, "instance deallocated");
        shared.delegate.on_deinit(identifier);
    }
}

impl InstanceManager {
    /// A manager that reports deallocated host-created objects to `delegate`.
    pub fn new(delegate: Arc<dyn FinalizerDelegate>) -> Self {
        Self {
            shared: Arc::new(Shared {
                owner: NEXT_MANAGER.fetch_add(1, Ordering::Relaxed),
                tables: Mutex::new(Tables {
                    next_identifier: MIN_HOST_CREATED_IDENTIFIER,
                    ..Tables::default()
                }),
                delegate,
            }),
        }
    }

    /// Register `instance` under the identifier chosen by the peer and hold
    /// it strongly.
    ///
    /// The same object may be registered under several identifiers; each
    /// resolves to it.
    pub fn add_dart_created_instance(
        &self,
        instance: &Instance,
        identifier: i64,
    ) -> Result<(), ProxyError> {
        if identifier < 0 {
            return Err(ProxyError::InvalidIdentifier(identifier));
        }
        let mut tables = self.shared.tables.lock();
        if tables.in_use(identifier) {
            return Err(ProxyError::IdentifierInUse(identifier));
        }
        self.track(&mut tables, instance, identifier);
        tables.strong.insert(identifier, instance.clone());
        trace!(identifier, "added dart-created instance");
        Ok(())
    }

    /// Assign a fresh identifier to `instance` and track it weakly.
    pub fn add_host_created_instance(&self, instance: &Instance) -> Result<i64, ProxyError> {
        let mut tables = self.shared.tables.lock();
        if let Some(existing) = Self::lookup_identifier(&tables, instance) {
            return Err(ProxyError::AlreadyRegistered(existing));
        }

        let mut identifier = tables.next_identifier;
        while tables.in_use(identifier) {
            identifier += 1;
        }
        tables.next_identifier = identifier + 1;

        self.track(&mut tables, instance, identifier);
        trace!(identifier, "added host-created instance");
        Ok(identifier)
    }

    fn track(&self, tables: &mut Tables, instance: &Instance, identifier: i64) {
        tables.identifiers.insert(instance.object_id(), identifier);
        tables.weak.insert(identifier, instance.downgrade());
        instance.attach_owned(
            self.shared.owner,
            identifier,
            Arc::new(ManagerFinalizer {
                shared: Arc::downgrade(&self.shared),
                generation: tables.generation,
                object: instance.object_id(),
            }),
        );
    }

    /// The object registered under `identifier`.
    pub fn instance(&self, identifier: i64) -> Result<Instance, ProxyError> {
        let tables = self.shared.tables.lock();
        if let Some(instance) = tables.strong.get(&identifier) {
            return Ok(instance.clone());
        }
        // Upgrading under the lock is fine: the object is alive, and the
        // strong reference we create is returned, not dropped here.
        tables
            .weak
            .get(&identifier)
            .and_then(WeakInstance::upgrade)
            .ok_or(ProxyError::NotFound(identifier))
    }

    /// The identifier `instance` is registered under, matched by identity.
    pub fn identifier(&self, instance: &Instance) -> Option<i64> {
        Self::lookup_identifier(&self.shared.tables.lock(), instance)
    }

    fn lookup_identifier(tables: &Tables, instance: &Instance) -> Option<i64> {
        let identifier = *tables.identifiers.get(&instance.object_id())?;
        tables
            .weak
            .get(&identifier)
            .is_some_and(|w| w.object_id() == instance.object_id())
            .then_some(identifier)
    }

    /// Forget `identifier`, returning the strong reference if the manager
    /// held one.
    ///
    /// The object's finalizer for this identifier is detached, so no
    /// deallocation is reported for it afterwards. Fails only when the
    /// identifier is unknown.
    pub fn remove_instance(&self, identifier: i64) -> Result<Option<Instance>, ProxyError> {
        let (strong, weak) = {
            let mut tables = self.shared.tables.lock();
            let strong = tables.strong.remove(&identifier);
            let weak = tables.weak.remove(&identifier);
            if strong.is_none() && weak.is_none() {
                return Err(ProxyError::NotFound(identifier));
            }
            if let Some(object) = weak.as_ref().map(WeakInstance::object_id) {
                if tables.identifiers.get(&object) == Some(&identifier) {
                    tables.identifiers.remove(&object);
                    // another alias of the same object takes over
                    let alias = tables
                        .weak
                        .iter()
                        .find(|(_, w)| w.object_id() == object)
                        .map(|(id, _)| *id);
                    if let Some(alias) = alias {
                        tables.identifiers.insert(object, alias);
                    }
                }
            }
            (strong, weak)
        };

        let owner = self.shared.owner;
        match &strong {
            Some(instance) => instance.detach_owned(owner, Some(identifier)),
            None => {
                if let Some(instance) = weak.as_ref().and_then(WeakInstance::upgrade) {
                    instance.detach_owned(owner, Some(identifier));
                }
            }
        }
        debug!(identifier, strong = strong.is_some(), "removed instance");
        Ok(strong)
    }

    /// Forget every object and detach every pending finalizer.
    ///
    /// Identifiers handed out before are permanently invalid for this
    /// manager.
    pub fn remove_all_objects(&self) {
        let tables = {
            let mut tables = self.shared.tables.lock();
            let generation = tables.generation + 1;
            std::mem::replace(
                &mut *tables,
                Tables {
                    next_identifier: MIN_HOST_CREATED_IDENTIFIER,
                    generation,
                    ..Tables::default()
                },
            )
        };

        let owner = self.shared.owner;
        for weak in tables.weak.values() {
            if let Some(instance) = weak.upgrade() {
                instance.detach_owned(owner, None);
            }
        }
        debug!(
            strong = tables.strong.len(),
            weak = tables.weak.len(),
            "removed all instances"
        );
        // strong references are released here, outside the lock
        drop(tables);
    }

    pub fn strong_instance_count(&self) -> usize {
        self.shared.tables.lock().strong.len()
    }

    pub fn weak_instance_count(&self) -> usize {
        self.shared.tables.lock().weak.len()
    }

    pub fn contains_identifier(&self, identifier: i64) -> bool {
        self.shared.tables.lock().in_use(identifier)
    }
}

impl fmt::Debug for InstanceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.shared.tables.lock();
        f.debug_struct("InstanceManager")
            .field("strong", &tables.strong.len())
            .field("weak", &tables.weak.len())
            .finish()
    }
}
