// Tracing macros for perch-messenger
//
// These macros forward to the tracing crate.

#![allow(unused_macros)]
#![allow(unused_macro_rules)]

// -----------------------------------------------------------------------------
// trace! - Very verbose: every frame sent or delivered
// -----------------------------------------------------------------------------

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) }
}

// -----------------------------------------------------------------------------
// debug! - Handler registration, wire spy output
// -----------------------------------------------------------------------------

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) }
}

// -----------------------------------------------------------------------------
// warn! - Dropped frames and replies that went nowhere
// -----------------------------------------------------------------------------

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) }
}

// Macros are made available via #[macro_use] on the module in lib.rs
