use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use parking_lot::Mutex;
use perch_codec::{StandardCodec, Value};
use perch_messenger::runtime;
use perch_messenger::{BinaryMessenger, LocalMessenger, MessengerConfig};
use perch_session::{ApiClient, ApiServer, Args, CallError, FnApi, RemoteError};

use super::*;

#[derive(Default)]
struct Recorder {
    deinits: Mutex<Vec<i64>>,
}

impl FinalizerDelegate for Recorder {
    fn on_deinit(&self, identifier: i64) {
        self.deinits.lock().push(identifier);
    }
}

fn manager() -> (InstanceManager, Arc<Recorder>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let recorder = Arc::new(Recorder::default());
    (InstanceManager::new(recorder.clone()), recorder)
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        runtime::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// ============================================================================
// Instance manager
// ============================================================================

#[test]
fn dart_created_instance_is_held_strongly() {
    let (manager, _) = manager();
    let object = Instance::new(String::from("a"));
    manager.add_dart_created_instance(&object, 0).unwrap();

    assert_eq!(manager.instance(0).unwrap(), object);
    assert_eq!(manager.identifier(&object), Some(0));
    assert_eq!(manager.strong_instance_count(), 1);

    drop(object);
    // still alive through the manager
    assert!(manager.instance(0).unwrap().is::<String>());
}

#[test]
fn host_created_instance_is_tracked_weakly() {
    let (manager, _) = manager();
    let object = Instance::new(1u8);
    let identifier = manager.add_host_created_instance(&object).unwrap();

    assert!(identifier >= MIN_HOST_CREATED_IDENTIFIER);
    assert_eq!(manager.strong_instance_count(), 0);
    assert_eq!(manager.weak_instance_count(), 1);
    assert_eq!(manager.instance(identifier).unwrap(), object);
    assert_eq!(
        manager.add_host_created_instance(&object),
        Err(ProxyError::AlreadyRegistered(identifier))
    );
}

#[test]
fn remove_instance_forgets_the_identifier() {
    let (manager, recorder) = manager();
    let object = Instance::new(0u32);
    manager.add_dart_created_instance(&object, 0).unwrap();

    let removed = manager.remove_instance(0).unwrap();
    assert_eq!(removed.as_ref(), Some(&object));
    assert_eq!(manager.strong_instance_count(), 0);
    assert_eq!(manager.instance(0), Err(ProxyError::NotFound(0)));
    assert_eq!(manager.remove_instance(0), Err(ProxyError::NotFound(0)));

    drop(removed);
    drop(object);
    assert!(recorder.deinits.lock().is_empty());
}

#[tokio::test]
async fn deallocation_reaches_the_delegate() {
    let (manager, recorder) = manager();
    let object = Instance::new(());
    let identifier = manager.add_host_created_instance(&object).unwrap();

    drop(object);
    assert!(eventually(|| *recorder.deinits.lock() == vec![identifier]).await);
    assert_eq!(manager.weak_instance_count(), 0);
    assert!(!manager.contains_identifier(identifier));
    assert_eq!(
        manager.instance(identifier),
        Err(ProxyError::NotFound(identifier))
    );
}

#[test]
fn remove_all_objects_detaches_finalizers() {
    let (manager, recorder) = manager();
    let dart = Instance::new(1i32);
    let host = Instance::new(2i32);
    manager.add_dart_created_instance(&dart, 0).unwrap();
    let identifier = manager.add_host_created_instance(&host).unwrap();
    assert_eq!(host.finalizer_count(), 1);

    manager.remove_all_objects();
    assert_eq!(manager.strong_instance_count(), 0);
    assert_eq!(manager.weak_instance_count(), 0);
    assert_eq!(host.finalizer_count(), 0);
    assert_eq!(dart.finalizer_count(), 0);

    drop(host);
    drop(dart);
    assert!(recorder.deinits.lock().is_empty());
    assert!(!manager.contains_identifier(identifier));
}

#[test]
fn one_object_under_several_identifiers() {
    let (manager, _) = manager();
    let object = Instance::new(String::from("shared"));
    manager.add_dart_created_instance(&object, 0).unwrap();
    manager.add_dart_created_instance(&object, 1).unwrap();

    assert_eq!(manager.instance(0).unwrap(), manager.instance(1).unwrap());
    assert_eq!(object.finalizer_count(), 2);

    manager.remove_instance(0).unwrap();
    assert_eq!(manager.instance(1).unwrap(), object);
    assert_eq!(manager.identifier(&object), Some(1));
    assert_eq!(object.finalizer_count(), 1);
}

#[test]
fn identity_not_value_decides_the_identifier() {
    let (manager, _) = manager();
    let a = Instance::new(5i64);
    let b = Instance::new(5i64);
    assert_ne!(a, b);

    let ia = manager.add_host_created_instance(&a).unwrap();
    let ib = manager.add_host_created_instance(&b).unwrap();
    assert_ne!(ia, ib);
    assert_eq!(manager.identifier(&a), Some(ia));
    assert_eq!(manager.identifier(&b), Some(ib));
}

#[test]
fn host_identifiers_skip_those_in_use() {
    let (manager, _) = manager();
    let dart = Instance::new(0u8);
    manager
        .add_dart_created_instance(&dart, MIN_HOST_CREATED_IDENTIFIER)
        .unwrap();

    let host = Instance::new(1u8);
    assert_eq!(
        manager.add_host_created_instance(&host),
        Ok(MIN_HOST_CREATED_IDENTIFIER + 1)
    );
}

#[test]
fn rejects_bad_dart_identifiers() {
    let (manager, _) = manager();
    let a = Instance::new(0u8);
    let b = Instance::new(1u8);

    assert_eq!(
        manager.add_dart_created_instance(&a, -1),
        Err(ProxyError::InvalidIdentifier(-1))
    );
    manager.add_dart_created_instance(&a, 0).unwrap();
    assert_eq!(
        manager.add_dart_created_instance(&b, 0),
        Err(ProxyError::IdentifierInUse(0))
    );
}

#[tokio::test]
async fn user_finalizers_survive_manager_cleanup() {
    let (manager, _) = manager();
    let recorder = Arc::new(Recorder::default());
    let object = Instance::new(0u8);
    object.attach_finalizer(7, recorder.clone());
    manager.add_dart_created_instance(&object, 0).unwrap();

    manager.remove_all_objects();
    assert_eq!(object.finalizer_count(), 1);
    drop(object);
    assert!(eventually(|| *recorder.deinits.lock() == vec![7]).await);
}

/// Records into a lock that the test itself holds while dropping.
struct Locking {
    deinits: Arc<Mutex<Vec<i64>>>,
}

impl FinalizerDelegate for Locking {
    fn on_deinit(&self, identifier: i64) {
        self.deinits.lock().push(identifier);
    }
}

#[tokio::test]
async fn finalizers_run_after_the_drop_returns() {
    let deinits = Arc::new(Mutex::new(Vec::new()));
    let manager = InstanceManager::new(Arc::new(Locking {
        deinits: deinits.clone(),
    }));
    let object = Instance::new(());
    let identifier = manager.add_host_created_instance(&object).unwrap();

    {
        let held = deinits.lock();
        drop(object);
        assert!(held.is_empty());
    }
    assert!(eventually(|| *deinits.lock() == vec![identifier]).await);
}

#[tokio::test]
async fn finalizers_from_before_a_clear_are_ignored() {
    let (manager, recorder) = manager();
    let object = Instance::new(());
    let identifier = manager.add_host_created_instance(&object).unwrap();

    // delivery is still queued when the manager is cleared
    drop(object);
    manager.remove_all_objects();
    let replacement = Instance::new(());
    assert_eq!(manager.add_host_created_instance(&replacement), Ok(identifier));

    runtime::sleep(Duration::from_millis(20)).await;
    assert!(recorder.deinits.lock().is_empty());
    assert_eq!(manager.instance(identifier), Ok(replacement));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_keeps_identifiers_unique() {
    const THREADS: i64 = 8;
    const ROUNDS: i64 = 200;

    let (manager, _) = manager();
    let handle = runtime::current().unwrap();
    let start = Barrier::new(THREADS as usize);
    let seen = Mutex::new(HashSet::new());

    std::thread::scope(|scope| {
        for thread in 0..THREADS {
            let (manager, handle, start, seen) = (&manager, handle.clone(), &start, &seen);
            scope.spawn(move || {
                let _runtime = handle.enter();
                start.wait();
                for round in 0..ROUNDS {
                    let host = Instance::new((thread, round));
                    let identifier = manager.add_host_created_instance(&host).unwrap();
                    assert!(identifier >= MIN_HOST_CREATED_IDENTIFIER);
                    assert!(seen.lock().insert(identifier), "{identifier} handed out twice");
                    assert_eq!(manager.instance(identifier).unwrap(), host);
                    assert_eq!(manager.identifier(&host), Some(identifier));

                    let dart = Instance::new(round);
                    let chosen = thread * ROUNDS + round;
                    manager.add_dart_created_instance(&dart, chosen).unwrap();
                    assert_eq!(manager.instance(chosen).unwrap(), dart);

                    assert_eq!(manager.remove_instance(chosen).unwrap(), Some(dart));
                    if round % 2 == 0 {
                        assert_eq!(manager.remove_instance(identifier).unwrap(), None);
                    }
                    // odd rounds are forgotten through their finalizer
                }
            });
        }
    });

    assert_eq!(seen.lock().len(), (THREADS * ROUNDS) as usize);
    assert_eq!(manager.strong_instance_count(), 0);
    assert!(eventually(|| manager.weak_instance_count() == 0).await);
}

// ============================================================================
// Registrar
// ============================================================================

struct Counter {
    value: AtomicI64,
    children: Mutex<Vec<Instance>>,
}

impl Counter {
    fn new(value: i64) -> Self {
        Self {
            value: AtomicI64::new(value),
            children: Mutex::new(Vec::new()),
        }
    }
}

struct CounterApi {
    descriptor: ProxyApiDescriptor,
}

impl CounterApi {
    fn new() -> Self {
        Self {
            descriptor: ProxyApiDescriptor::new("Counter")
                .method(ProxyMethod::constructor("pigeon_defaultConstructor"))
                .method(ProxyMethod::instance("increment"))
                .method(ProxyMethod::instance("spawnChild"))
                .method(ProxyMethod::static_method("describe"))
                .peer_method("onChange"),
        }
    }
}

impl ProxyApi for CounterApi {
    fn descriptor(&self) -> &ProxyApiDescriptor {
        &self.descriptor
    }

    fn is_instance(&self, instance: &Instance) -> bool {
        instance.is::<Counter>()
    }

    fn construct(
        &self,
        _method: usize,
        args: ProxyArgs,
        _cx: &ProxyContext,
    ) -> Result<Instance, RemoteError> {
        Ok(Instance::new(Counter::new(args.get::<i64>(0)?)))
    }

    fn invoke(
        &self,
        method: usize,
        receiver: Option<Instance>,
        _args: ProxyArgs,
        cx: &ProxyContext,
    ) -> Result<Value, RemoteError> {
        let counter = || {
            receiver
                .as_ref()
                .and_then(|r| r.downcast_ref::<Counter>())
                .ok_or_else(|| RemoteError::new("argument-error", "not a counter", Value::Null))
        };
        match self.descriptor.methods[method].name.as_str() {
            "increment" => Ok(Value::Int(counter()?.value.fetch_add(1, Ordering::SeqCst) + 1)),
            "spawnChild" => {
                let child = Instance::new(Counter::new(100));
                let reference = cx.export(&child)?;
                counter()?.children.lock().push(child);
                Ok(reference)
            }
            _ => Ok(Value::from("Counter")),
        }
    }

    fn new_instance_fields(&self, instance: &Instance) -> Vec<Value> {
        instance
            .downcast_ref::<Counter>()
            .map(|c| vec![Value::Int(c.value.load(Ordering::SeqCst))])
            .unwrap_or_default()
    }
}

struct Peers {
    guest: Arc<dyn BinaryMessenger>,
    codec: Arc<StandardCodec>,
    registrar: ProxyApiRegistrar,
}

fn peers() -> Peers {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (host, guest) = LocalMessenger::pair(MessengerConfig::default()).unwrap();
    let codec = Arc::new(StandardCodec::new());
    let registrar = ProxyApiRegistrar::builder(Arc::new(host), codec.clone())
        .api(Arc::new(CounterApi::new()))
        .build();
    registrar.set_up().unwrap();
    Peers {
        guest: Arc::new(guest),
        codec,
        registrar,
    }
}

impl Peers {
    fn client(&self, api: &str) -> ApiClient {
        ApiClient::new(self.guest.clone(), self.codec.clone(), api)
    }
}

#[tokio::test]
async fn set_up_only_once() {
    let peers = peers();
    assert_eq!(peers.registrar.state(), RegistrarState::SetUp);
    assert_eq!(
        peers.registrar.set_up(),
        Err(ProxyError::ProtocolState {
            expected: RegistrarState::Uninitialized,
            actual: RegistrarState::SetUp,
        })
    );
}

#[tokio::test]
async fn peer_constructs_and_calls_objects() {
    let peers = peers();
    let counter = peers.client("Counter");

    let reply = counter
        .call("pigeon_defaultConstructor", &[Value::Int(0), Value::Int(5)])
        .await
        .unwrap();
    assert_eq!(reply, Value::Null);
    let object = peers.registrar.instance_manager().instance(0).unwrap();
    assert_eq!(object.downcast_ref::<Counter>().unwrap().value.load(Ordering::SeqCst), 5);

    let reply = counter.call("increment", &[Value::Instance(0)]).await.unwrap();
    assert_eq!(reply, Value::Int(6));
    assert_eq!(counter.call("describe", &[]).await.unwrap(), Value::from("Counter"));

    match counter.call("increment", &[Value::Instance(9)]).await {
        Err(CallError::Remote(e)) => assert_eq!(e.code, "not-found"),
        other => panic!("expected not-found, got {other:?}"),
    }
    match counter
        .call("pigeon_defaultConstructor", &[Value::Int(0), Value::Int(1)])
        .await
    {
        Err(CallError::Remote(e)) => assert_eq!(e.code, "identifier-in-use"),
        other => panic!("expected identifier-in-use, got {other:?}"),
    }
}

#[tokio::test]
async fn peer_releases_its_references() {
    let peers = peers();
    let counter = peers.client("Counter");
    counter
        .call("pigeon_defaultConstructor", &[Value::Int(3), Value::Int(0)])
        .await
        .unwrap();
    assert_eq!(peers.registrar.instance_manager().strong_instance_count(), 1);

    peers
        .client(INSTANCE_MANAGER_API)
        .call("removeStrongReference", &[Value::Int(3)])
        .await
        .unwrap();
    assert_eq!(peers.registrar.instance_manager().strong_instance_count(), 0);

    match counter.call("increment", &[Value::Instance(3)]).await {
        Err(CallError::Remote(e)) => assert_eq!(e.code, "not-found"),
        other => panic!("expected not-found, got {other:?}"),
    }
}

#[tokio::test]
async fn tear_down_needs_a_set_up_registrar() {
    let (host, _guest) = LocalMessenger::pair(MessengerConfig::default()).unwrap();
    let registrar = ProxyApiRegistrar::builder(Arc::new(host), Arc::new(StandardCodec::new()))
        .api(Arc::new(CounterApi::new()))
        .build();

    assert_eq!(
        registrar.tear_down(),
        Err(ProxyError::ProtocolState {
            expected: RegistrarState::SetUp,
            actual: RegistrarState::Uninitialized,
        })
    );
    assert_eq!(registrar.state(), RegistrarState::Uninitialized);

    registrar.set_up().unwrap();
    registrar.tear_down().unwrap();
    assert_eq!(
        registrar.tear_down(),
        Err(ProxyError::ProtocolState {
            expected: RegistrarState::SetUp,
            actual: RegistrarState::TornDown,
        })
    );
}

#[tokio::test]
async fn tear_down_unregisters_channels() {
    let peers = peers();
    let counter = peers.client("Counter");
    counter
        .call("pigeon_defaultConstructor", &[Value::Int(0), Value::Int(0)])
        .await
        .unwrap();

    peers.registrar.tear_down().unwrap();
    assert_eq!(peers.registrar.state(), RegistrarState::TornDown);
    assert_eq!(peers.registrar.instance_manager().strong_instance_count(), 0);
    assert!(peers.registrar.tear_down().is_err());

    match counter.call("increment", &[Value::Instance(0)]).await {
        Err(CallError::ChannelUnavailable(channel)) => {
            assert_eq!(channel, "dev.perch.Counter.increment")
        }
        other => panic!("expected channel-unavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn new_instances_reach_the_peer_before_the_reply() {
    let peers = peers();
    let announced: Arc<Mutex<Vec<Vec<Value>>>> = Arc::default();
    let server = ApiServer::new(peers.guest.clone(), peers.codec.clone());
    let record = announced.clone();
    server.set_up(
        Arc::new(
            FnApi::builder("Counter")
                .direct("newInstance", move |args: Args| {
                    record.lock().push(args.into_vec());
                    Ok(Value::Null)
                })
                .build(),
        ),
        "",
    );

    let counter = peers.client("Counter");
    counter
        .call("pigeon_defaultConstructor", &[Value::Int(0), Value::Int(0)])
        .await
        .unwrap();
    let child = counter.call("spawnChild", &[Value::Instance(0)]).await.unwrap();

    assert_eq!(child, Value::Instance(MIN_HOST_CREATED_IDENTIFIER));
    assert_eq!(
        *announced.lock(),
        vec![vec![Value::Int(MIN_HOST_CREATED_IDENTIFIER), Value::Int(100)]]
    );

    // a second export reuses the identifier without announcing again
    let reply = counter
        .call("increment", &[Value::Instance(MIN_HOST_CREATED_IDENTIFIER)])
        .await
        .unwrap();
    assert_eq!(reply, Value::Int(101));
    assert_eq!(announced.lock().len(), 1);
}

#[tokio::test]
async fn call_peer_exports_then_calls() {
    let peers = peers();
    let (tx, mut removed) = runtime::unbounded::<i64>();
    let server = ApiServer::new(peers.guest.clone(), peers.codec.clone());
    server.set_up(
        Arc::new(
            FnApi::builder("Counter")
                .direct("newInstance", |_args: Args| Ok(Value::Null))
                .direct("onChange", |args: Args| {
                    Ok(Value::List(args.into_vec()))
                })
                .build(),
        ),
        "",
    );
    server.set_up(
        Arc::new(
            FnApi::builder(INSTANCE_MANAGER_API)
                .direct("removeStrongReference", move |args: Args| {
                    let _ = tx.send(args.get::<i64>(0)?);
                    Ok(Value::Null)
                })
                .build(),
        ),
        "",
    );

    let object = Instance::new(Counter::new(1));
    let reply = peers
        .registrar
        .call_peer(&object, "onChange", &[Value::Int(2)])
        .await
        .unwrap();
    assert_eq!(
        reply,
        Value::List(vec![Value::Instance(MIN_HOST_CREATED_IDENTIFIER), Value::Int(2)])
    );
    assert_eq!(
        peers.registrar.call_peer(&object, "onDelete", &[]).await,
        Err(ProxyError::UnknownMethod("Counter.onDelete".to_owned()))
    );

    drop(object);
    let identifier = runtime::timeout(Duration::from_secs(5), removed.recv())
        .await
        .flatten();
    assert_eq!(identifier, Some(MIN_HOST_CREATED_IDENTIFIER));
}

#[tokio::test]
async fn concurrent_exports_all_wait_for_the_announcement() {
    let peers = peers();
    let peer_manager = InstanceManager::new(Arc::new(Recorder::default()));
    let server = ApiServer::new(peers.guest.clone(), peers.codec.clone());
    let known = peer_manager.clone();
    let mirrors = peer_manager.clone();
    server.set_up(
        Arc::new(
            FnApi::builder("Counter")
                .future("newInstance", move |args: Args| {
                    let known = known.clone();
                    async move {
                        // a slow peer constructor
                        runtime::sleep(Duration::from_millis(20)).await;
                        let identifier = args.get::<i64>(0)?;
                        known
                            .add_dart_created_instance(&Instance::new(()), identifier)
                            .map_err(|e| e.to_remote())?;
                        Ok(Value::Null)
                    }
                })
                .direct("onChange", move |args: Args| {
                    let identifier = args.get::<i64>(0)?;
                    mirrors.instance(identifier).map_err(|e| e.to_remote())?;
                    Ok(Value::Int(identifier))
                })
                .build(),
        ),
        "",
    );

    let object = Instance::new(Counter::new(0));
    let registrar = &peers.registrar;
    let (a, b, c) = tokio::join!(
        registrar.call_peer(&object, "onChange", &[]),
        registrar.call_peer(&object, "onChange", &[]),
        registrar.export(&object),
    );
    assert_eq!(a, Ok(Value::Int(MIN_HOST_CREATED_IDENTIFIER)));
    assert_eq!(b, Ok(Value::Int(MIN_HOST_CREATED_IDENTIFIER)));
    assert_eq!(c, Ok(MIN_HOST_CREATED_IDENTIFIER));
    assert_eq!(peer_manager.strong_instance_count(), 1);
}

#[tokio::test]
async fn ignored_peer_sees_nothing() {
    let peers = peers();
    peers.registrar.set_ignore_calls_to_peer(true);
    let object = Instance::new(Counter::new(0));
    let reply = peers.registrar.call_peer(&object, "onChange", &[]).await;
    assert_eq!(reply, Ok(Value::Null));
    assert!(peers.registrar.ignores_calls_to_peer());

    match peers.registrar.call_peer(&Instance::new(0u8), "onChange", &[]).await {
        Ok(Value::Null) => {}
        other => panic!("ignored calls short-circuit, got {other:?}"),
    }
}
