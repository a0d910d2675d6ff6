#![deny(unsafe_code)]

//! Proxy objects for perch.
//!
//! A proxy object lives on one side of the connection and is mirrored on the
//! other under an integer identifier. [`InstanceManager`] keeps the mapping
//! between identifiers and live [`Instance`]s; [`ProxyApiRegistrar`] exposes
//! [`ProxyApi`] implementations on a messenger and keeps both sides'
//! managers in step.

#[macro_use]
mod macros;

mod errors;
mod instance;
mod instance_manager;
mod proxy_api;
mod registrar;

pub use errors::*;
pub use instance::{FinalizerDelegate, Instance, ObjectId, WeakInstance};
pub use instance_manager::*;
pub use proxy_api::{
    ProxyApi, ProxyApiDescriptor, ProxyArgs, ProxyContext, ProxyMethod, ProxyMethodKind,
};
pub use registrar::{INSTANCE_MANAGER_API, ProxyApiRegistrar, RegistrarBuilder, RegistrarState};

#[cfg(test)]
mod tests;
