#![deny(unsafe_code)]

//! Request/reply dispatch and event streams for perch.
//!
//! - [`ApiServer`] serves [`HostApi`]s: one channel per method, arguments in,
//!   exactly one reply out
//! - [`ApiClient`] calls APIs the peer serves
//! - [`EventChannel`] carries subscriptions to long-lived event streams, with
//!   [`Ticker`] as a helper for timer-driven sequences
//!
//! Replies are `[result]` on success and `[code, message, details]` on
//! failure; callers see failures as [`CallError::Remote`].

#[macro_use]
mod macros;

mod api;
mod args;
mod caller;
mod errors;
mod event_channel;
mod responder;
mod ticker;

pub use api::*;
pub use args::*;
pub use caller::*;
pub use errors::*;
pub use event_channel::*;
pub use responder::Responder;
pub use ticker::*;
