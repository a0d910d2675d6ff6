//! perch - RPC over a named-channel binary messenger
//!
//! This crate provides a unified API over the perch component crates.
//! Users should depend on this crate rather than the individual crates.

#![deny(unsafe_code)]

pub use perch_codec as codec;
pub use perch_messenger as messenger;
pub use perch_proxy as proxy;
pub use perch_session as session;

// Values and the standard codec
pub use perch_codec::{CodecBuilder, FormatError, StandardCodec, Value, ValueMap};

// Transport
pub use perch_messenger::{
    BinaryMessenger, ChannelName, DEFAULT_PREFIX, LocalMessenger, MessengerConfig, MessengerError,
    runtime,
};

// Request/reply APIs and event streams
pub use perch_session::{
    ApiClient, ApiDescriptor, ApiServer, Args, CallError, EventChannel, EventSink, EventStream,
    FnApi, FromValue, Handler, HostApi, RemoteError, Responder, ResponderError, SinkError,
    StreamHandler, Ticker,
};

// Proxy objects
pub use perch_proxy::{
    FinalizerDelegate, INSTANCE_MANAGER_API, Instance, InstanceManager,
    MIN_HOST_CREATED_IDENTIFIER, ProxyApi, ProxyApiDescriptor, ProxyApiRegistrar, ProxyArgs,
    ProxyContext, ProxyError, ProxyMethod, ProxyMethodKind, RegistrarState,
};

// Re-export tracing so embedders can filter on the same crate
pub use tracing;
