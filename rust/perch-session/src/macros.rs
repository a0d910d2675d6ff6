// Tracing macros for perch-session
//
// These macros forward to the tracing crate.

#![allow(unused_macros)]
#![allow(unused_macro_rules)]

// -----------------------------------------------------------------------------
// trace! - Very verbose: every request, reply and event
// -----------------------------------------------------------------------------

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) }
}

// -----------------------------------------------------------------------------
// debug! - Handler registration, stream session transitions
// -----------------------------------------------------------------------------

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) }
}

// -----------------------------------------------------------------------------
// warn! - Second replies, events after end of stream
// -----------------------------------------------------------------------------

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) }
}

// Macros are made available via #[macro_use] on the module in lib.rs
