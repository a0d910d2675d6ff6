// Tracing macros for perch-codec
//
// These macros forward to the tracing crate.

#![allow(unused_macros)]
#![allow(unused_macro_rules)]

// -----------------------------------------------------------------------------
// trace! - Very verbose: per-value encode/decode activity
// -----------------------------------------------------------------------------

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) }
}

// -----------------------------------------------------------------------------
// debug! - Schema construction, rejected payloads
// -----------------------------------------------------------------------------

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) }
}

// Macros are made available via #[macro_use] on the module in lib.rs
