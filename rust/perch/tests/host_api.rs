//! End-to-end tests for request/reply APIs.
//!
//! Both sides live in one process, connected by a local messenger pair: the
//! "host" serves the APIs under test and the "guest" plays the peer.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use perch::{
    ApiClient, ApiServer, Args, BinaryMessenger, CallError, FnApi, LocalMessenger,
    MessengerConfig, RemoteError, ResponderError, StandardCodec, Value, ValueMap, runtime,
};

struct Peers {
    host: Arc<dyn BinaryMessenger>,
    guest: Arc<dyn BinaryMessenger>,
    codec: Arc<StandardCodec>,
}

fn peers() -> Peers {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (host, guest) = LocalMessenger::pair(MessengerConfig::default()).unwrap();
    let codec = StandardCodec::builder()
        .enumeration("AnEnum", 5)
        .class("AllNullableTypes", 3)
        .build()
        .unwrap();
    Peers {
        host: Arc::new(host),
        guest: Arc::new(guest),
        codec: Arc::new(codec),
    }
}

impl Peers {
    fn host_server(&self) -> ApiServer {
        ApiServer::new(self.host.clone(), self.codec.clone())
    }

    fn guest_client(&self, api: &str) -> ApiClient {
        ApiClient::new(self.guest.clone(), self.codec.clone(), api)
    }
}

fn core_api() -> FnApi {
    FnApi::builder("HostIntegrationCoreApi")
        .direct("echo", |args: Args| Ok(args.raw(0).clone()))
        .direct("throwError", |_args: Args| {
            Err(RemoteError::new("code", "message", "details"))
        })
        .future("echoAsync", |args: Args| async move {
            runtime::sleep(Duration::from_millis(5)).await;
            Ok(args.raw(0).clone())
        })
        .direct("panic", |_args: Args| -> Result<Value, RemoteError> {
            panic!("handler blew up")
        })
        .build()
}

// ============================================================================
// Echo
// ============================================================================

#[tokio::test]
async fn echo_every_shape() {
    let peers = peers();
    peers.host_server().set_up(Arc::new(core_api()), "");
    let api = peers.guest_client("HostIntegrationCoreApi");

    let mut map = ValueMap::new();
    map.insert(
        "a",
        Value::List(vec![Value::Int(1), Value::Int(2), Value::Null]),
    );

    let values = vec![
        Value::from("hello"),
        Value::Int(42),
        Value::Int(i64::from(i32::MAX) + 1),
        Value::Float(3.5),
        Value::Bool(true),
        Value::Map(map),
        peers.codec.enum_value("AnEnum", 1).unwrap(),
        Value::Null,
        Value::Bytes(vec![1, 2, 3]),
        Value::Int64List(vec![-1, 0, 1]),
        peers
            .codec
            .class_value(
                "AllNullableTypes",
                vec![Value::Null, Value::Int(7), Value::from("x")],
            )
            .unwrap(),
    ];

    for value in values {
        assert_eq!(api.call("echo", &[value.clone()]).await.unwrap(), value);
        assert_eq!(api.call("echoAsync", &[value.clone()]).await.unwrap(), value);
    }
}

#[tokio::test]
async fn errors_arrive_as_the_triple() {
    let peers = peers();
    peers.host_server().set_up(Arc::new(core_api()), "");
    let api = peers.guest_client("HostIntegrationCoreApi");

    match api.call("throwError", &[]).await {
        Err(CallError::Remote(e)) => {
            assert_eq!(e.code, "code");
            assert_eq!(e.message, "message");
            assert_eq!(e.details, Value::from("details"));
        }
        other => panic!("expected a remote error, got {other:?}"),
    }

    match api.call("panic", &[]).await {
        Err(CallError::Remote(e)) => {
            assert_eq!(e.code, "panic");
            assert!(e.message.contains("handler blew up"));
        }
        other => panic!("expected a panic error, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_method_is_channel_error() {
    let peers = peers();
    peers.host_server().set_up(Arc::new(core_api()), "");
    let api = peers.guest_client("HostIntegrationCoreApi");

    let err = api.call("noSuchMethod", &[]).await.unwrap_err();
    assert_eq!(
        err,
        CallError::ChannelUnavailable("dev.perch.HostIntegrationCoreApi.noSuchMethod".to_owned())
    );
    let remote = err.to_remote();
    assert_eq!(remote.code, "channel-error");
    assert_eq!(
        remote.message,
        "Unable to establish connection on channel: \"dev.perch.HostIntegrationCoreApi.noSuchMethod\"."
    );
}

// ============================================================================
// Suffixes
// ============================================================================

fn small_api(reply: &'static str) -> FnApi {
    FnApi::builder("HostSmallApi")
        .future("echo", move |args: Args| async move {
            let input = args.get::<String>(0)?;
            runtime::sleep(Duration::from_millis(2)).await;
            Ok(Value::from(format!("{reply}:{input}")))
        })
        .build()
}

#[tokio::test]
async fn suffixed_instances_do_not_cross_talk() {
    let peers = peers();
    let server = peers.host_server();
    server.set_up(Arc::new(small_api("one")), "suffixOne");
    server.set_up(Arc::new(small_api("two")), "suffixTwo");

    let one = peers.guest_client("HostSmallApi").with_suffix("suffixOne");
    let two = peers.guest_client("HostSmallApi").with_suffix("suffixTwo");

    for _ in 0..10 {
        let args = [Value::from("same")];
        let (a, b) = tokio::join!(one.call("echo", &args), two.call("echo", &args));
        assert_eq!(a.unwrap(), Value::from("one:same"));
        assert_eq!(b.unwrap(), Value::from("two:same"));
    }

    assert!(server.tear_down("HostSmallApi", "suffixOne"));
    assert!(matches!(
        one.call("echo", &[Value::from("x")]).await,
        Err(CallError::ChannelUnavailable(_))
    ));
    assert_eq!(
        two.call("echo", &[Value::from("x")]).await.unwrap(),
        Value::from("two:x")
    );
}

// ============================================================================
// Replies
// ============================================================================

#[tokio::test]
async fn only_the_first_reply_counts() {
    let peers = peers();
    let second: Arc<Mutex<Option<Result<(), ResponderError>>>> = Arc::default();
    let record = second.clone();
    let api = FnApi::builder("HostIntegrationCoreApi")
        .callback("echoTwice", move |args, responder| {
            let value = args.raw(0).clone();
            let _ = responder.success(value);
            *record.lock() = Some(responder.success(Value::from("late")));
        })
        .build();
    peers.host_server().set_up(Arc::new(api), "");

    let reply = peers
        .guest_client("HostIntegrationCoreApi")
        .call("echoTwice", &[Value::Int(1)])
        .await
        .unwrap();
    assert_eq!(reply, Value::Int(1));
    assert_eq!(*second.lock(), Some(Err(ResponderError::AlreadyReplied)));
}

#[tokio::test]
async fn completion_from_another_task() {
    let peers = peers();
    let api = FnApi::builder("HostIntegrationCoreApi")
        .callback("echoLater", |args, responder| {
            let value = args.raw(0).clone();
            runtime::spawn(async move {
                runtime::sleep(Duration::from_millis(10)).await;
                let _ = responder.success(value);
            });
        })
        .build();
    peers.host_server().set_up(Arc::new(api), "");

    let reply = peers
        .guest_client("HostIntegrationCoreApi")
        .call("echoLater", &[Value::from("later")])
        .await
        .unwrap();
    assert_eq!(reply, Value::from("later"));
}

// ============================================================================
// Calling the peer
// ============================================================================

#[tokio::test]
async fn host_handler_calls_back_into_the_peer() {
    let peers = peers();

    let flutter = FnApi::builder("FlutterIntegrationCoreApi")
        .direct("echoString", |args: Args| {
            Ok(Value::from(args.get::<String>(0)?.to_uppercase()))
        })
        .build();
    ApiServer::new(peers.guest.clone(), peers.codec.clone()).set_up(Arc::new(flutter), "");

    let to_flutter = ApiClient::new(
        peers.host.clone(),
        peers.codec.clone(),
        "FlutterIntegrationCoreApi",
    );
    let api = FnApi::builder("HostIntegrationCoreApi")
        .future("callFlutterEchoString", move |args: Args| {
            let to_flutter = to_flutter.clone();
            async move {
                to_flutter
                    .call("echoString", &[args.raw(0).clone()])
                    .await
                    .map_err(|e| e.to_remote())
            }
        })
        .build();
    peers.host_server().set_up(Arc::new(api), "");

    let reply = peers
        .guest_client("HostIntegrationCoreApi")
        .call("callFlutterEchoString", &[Value::from("hello")])
        .await
        .unwrap();
    assert_eq!(reply, Value::from("HELLO"));
}
