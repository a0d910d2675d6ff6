//! End-to-end tests for event channels.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use perch::{
    BinaryMessenger, ChannelName, EventChannel, EventSink, LocalMessenger, MessengerConfig,
    RemoteError, StandardCodec, StreamHandler, Ticker, Value, runtime,
};

struct Peers {
    host: Arc<dyn BinaryMessenger>,
    guest: Arc<dyn BinaryMessenger>,
    codec: Arc<StandardCodec>,
}

fn peers() -> Peers {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (host, guest) = LocalMessenger::pair(MessengerConfig::default()).unwrap();
    Peers {
        host: Arc::new(host),
        guest: Arc::new(guest),
        codec: Arc::new(StandardCodec::new()),
    }
}

impl Peers {
    /// The same event channel as seen from each side.
    fn channel(&self, name: &str) -> (EventChannel, EventChannel) {
        (
            EventChannel::new(self.host.clone(), self.codec.clone(), name),
            EventChannel::new(self.guest.clone(), self.codec.clone(), name),
        )
    }
}

/// Emits a fixed sequence on a timer for every subscription.
struct TickingHandler {
    items: Vec<Value>,
    ticker: Mutex<Option<Ticker>>,
    cancels: Mutex<Vec<Value>>,
}

impl TickingHandler {
    fn new(items: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            items,
            ticker: Mutex::new(None),
            cancels: Mutex::new(Vec::new()),
        })
    }
}

impl StreamHandler for TickingHandler {
    fn on_listen(&self, _arguments: Value, sink: EventSink) {
        let ticker = Ticker::start(sink, Duration::from_millis(10), self.items.clone());
        if let Some(previous) = self.ticker.lock().replace(ticker) {
            previous.stop();
        }
    }

    fn on_cancel(&self, arguments: Value) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
        self.cancels.lock().push(arguments);
    }
}

fn ints(range: std::ops::Range<i64>) -> Vec<Value> {
    range.map(Value::Int).collect()
}

fn oks(values: Vec<Value>) -> Vec<Result<Value, RemoteError>> {
    values.into_iter().map(Ok).collect()
}

#[tokio::test]
async fn int_stream_ends_after_five() {
    let peers = peers();
    let name = ChannelName::perch("EventChannelMethods", "streamInts").to_string();
    let (host, guest) = peers.channel(&name);
    let handler = TickingHandler::new(ints(0..5));
    host.set_stream_handler(Some(handler.clone()));

    let mut stream = guest.listen(Value::Null).await.unwrap();
    let events = stream.collect().await;
    assert_eq!(events, oks(ints(0..5)));
    assert!(stream.is_ended());
    assert_eq!(stream.next().await, None);

    // cancelling after the end still reaches the handler, once
    stream.cancel().await.unwrap();
    stream.cancel().await.unwrap();
    assert_eq!(*handler.cancels.lock(), vec![Value::Null]);
}

#[tokio::test]
async fn resubscribing_starts_over() {
    let peers = peers();
    let (host, guest) = peers.channel("dev.perch.EventChannelMethods.streamInts");
    let handler = TickingHandler::new(ints(0..3));
    host.set_stream_handler(Some(handler.clone()));

    let mut first = guest.listen(Value::from("first")).await.unwrap();
    assert_eq!(first.next().await, Some(Ok(Value::Int(0))));
    first.cancel().await.unwrap();

    let mut second = guest.listen(Value::from("second")).await.unwrap();
    assert_eq!(second.collect().await, oks(ints(0..3)));
    assert_eq!(*handler.cancels.lock(), vec![Value::from("first")]);
}

#[tokio::test]
async fn replacing_a_live_stream_keeps_the_new_session() {
    let peers = peers();
    let (host, guest) = peers.channel("dev.perch.EventChannelMethods.streamInts");
    let handler = TickingHandler::new(ints(0..3));
    host.set_stream_handler(Some(handler.clone()));

    let mut stream = guest.listen(Value::from("first")).await.unwrap();
    assert_eq!(stream.collect().await, oks(ints(0..3)));

    // the old stream is dropped only after the new listen took the channel
    stream = guest.listen(Value::from("second")).await.unwrap();
    let events = runtime::timeout(Duration::from_millis(500), stream.collect()).await;
    assert_eq!(events, Some(oks(ints(0..3))));

    // the host saw the first session replaced, never the second cancelled
    assert_eq!(*handler.cancels.lock(), vec![Value::Null]);

    // a replaced stream cancels nothing
    let mut old = guest.listen(Value::from("third")).await.unwrap();
    assert_eq!(old.collect().await, oks(ints(0..3)));
    let mut new = guest.listen(Value::from("fourth")).await.unwrap();
    old.cancel().await.unwrap();
    drop(old);
    assert_eq!(new.collect().await, oks(ints(0..3)));
    assert_eq!(handler.cancels.lock().len(), 3);
}

#[tokio::test]
async fn dropping_the_stream_cancels_it() {
    let peers = peers();
    let (host, guest) = peers.channel("dev.perch.EventChannelMethods.streamInts");
    let handler = TickingHandler::new(ints(0..100));
    host.set_stream_handler(Some(handler.clone()));

    let stream = guest.listen(Value::Int(9)).await.unwrap();
    drop(stream);

    let mut cancelled = false;
    for _ in 0..200 {
        if !handler.cancels.lock().is_empty() {
            cancelled = true;
            break;
        }
        runtime::sleep(Duration::from_millis(5)).await;
    }
    assert!(cancelled);
    assert_eq!(*handler.cancels.lock(), vec![Value::Int(9)]);
    assert!(handler.ticker.lock().is_none());
}

#[tokio::test]
async fn suffixed_streams_stay_separate() {
    let peers = peers();
    let base = ChannelName::perch("EventChannelMethods", "streamConsistentNumbers");
    let (host_one, guest_one) = peers.channel(&base.clone().with_suffix("1").to_string());
    let (host_two, guest_two) = peers.channel(&base.with_suffix("2").to_string());
    host_one.set_stream_handler(Some(TickingHandler::new(vec![Value::Int(1); 10])));
    host_two.set_stream_handler(Some(TickingHandler::new(vec![Value::Int(2); 10])));

    let mut one = guest_one.listen(Value::Null).await.unwrap();
    let mut two = guest_two.listen(Value::Null).await.unwrap();
    let (a, b) = tokio::join!(one.collect(), two.collect());

    assert_eq!(a, oks(vec![Value::Int(1); 10]));
    assert_eq!(b, oks(vec![Value::Int(2); 10]));
}

/// Emits an error event between two values, then ends.
struct Mixed;

impl StreamHandler for Mixed {
    fn on_listen(&self, _arguments: Value, sink: EventSink) {
        runtime::spawn(async move {
            let _ = sink.success(Value::from("before"));
            let _ = sink.error("code", "message", Value::from("details"));
            let _ = sink.success(Value::from("after"));
            sink.end_of_stream();
            assert!(sink.success(Value::from("too late")).is_err());
        });
    }
}

#[tokio::test]
async fn error_events_do_not_end_the_stream() {
    let peers = peers();
    let (host, guest) = peers.channel("dev.perch.EventChannelMethods.streamEvents");
    host.set_stream_handler(Some(Arc::new(Mixed)));

    let mut stream = guest.listen(Value::Null).await.unwrap();
    assert_eq!(
        stream.collect().await,
        vec![
            Ok(Value::from("before")),
            Err(RemoteError::new("code", "message", "details")),
            Ok(Value::from("after")),
        ]
    );
}

#[tokio::test]
async fn listening_without_a_host_fails() {
    let peers = peers();
    let (_host, guest) = peers.channel("dev.perch.EventChannelMethods.nobody");
    assert!(guest.listen(Value::Null).await.is_err());
}
