#![deny(unsafe_code)]

//! Standard message codec for perch.
//!
//! Values crossing a perch channel are encoded with a self-delimiting,
//! tag-prefixed binary format:
//!
//! - [`Value`] is the tagged union every message is built from
//! - [`StandardCodec`] encodes and decodes values, including custom classes
//!   and enums registered through a [`CodecBuilder`]
//! - [`envelope`] builds request/response lists and the method-call envelopes
//!   used by event channels
//!
//! Decoding never guesses: truncated input, unknown type discriminants and
//! schema mismatches all surface as [`FormatError`].

#[macro_use]
mod macros;

mod codec;
pub mod envelope;
mod error;
mod value;

pub use codec::*;
pub use error::*;
pub use value::*;
