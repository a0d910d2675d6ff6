// Tracing macros for perch-proxy
//
// These macros forward to the tracing crate.

#![allow(unused_macros)]
#![allow(unused_macro_rules)]

// -----------------------------------------------------------------------------
// trace! - Very verbose: identifier lookups, routed calls
// -----------------------------------------------------------------------------

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) }
}

// -----------------------------------------------------------------------------
// debug! - Instance registration, finalizers, registrar state
// -----------------------------------------------------------------------------

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) }
}

// -----------------------------------------------------------------------------
// warn! - Peer notifications that could not be delivered
// -----------------------------------------------------------------------------

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) }
}

// Macros are made available via #[macro_use] on the module in lib.rs
