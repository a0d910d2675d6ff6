#![deny(unsafe_code)]

//! Named-channel binary messenger.
//!
//! The messenger is the only thing the two sides of a perch connection share:
//! a set of named channels, each carrying opaque byte messages with an
//! optional reply. Everything above it (request envelopes, proxy objects,
//! event streams) is built on [`BinaryMessenger::send`] and
//! [`BinaryMessenger::set_handler`].
//!
//! [`LocalMessenger::pair`] connects two endpoints inside one process. Each
//! channel on the receiving side gets its own delivery task, so messages on a
//! channel are handled in the order they were sent while independent
//! channels never block each other. Replies are always delivered on a
//! runtime task, never on the sender's stack.

#[macro_use]
mod macros;

mod channel_name;
mod config;
mod local;
mod messenger;
pub mod runtime;

pub use channel_name::*;
pub use config::*;
pub use local::*;
pub use messenger::*;
