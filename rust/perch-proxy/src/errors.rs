use std::fmt;

use perch_codec::Value;
use perch_session::{CallError, RemoteError};

use crate::RegistrarState;

/// Error from the instance manager or the proxy API registrar.
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyError {
    /// No object is registered under the identifier.
    NotFound(i64),
    /// Identifiers are non-negative.
    InvalidIdentifier(i64),
    /// The identifier already belongs to a live object.
    IdentifierInUse(i64),
    /// The object already has an identifier (the one carried here).
    AlreadyRegistered(i64),
    /// The registrar is not in a state that allows the operation.
    ProtocolState {
        expected: RegistrarState,
        actual: RegistrarState,
    },
    /// No registered proxy API accepts the object.
    UnknownType(&'static str),
    /// The proxy API does not declare the peer method.
    UnknownMethod(String),
    /// A call into the peer failed.
    Call(CallError),
}

impl ProxyError {
    /// The wire triple for this error.
    pub fn to_remote(&self) -> RemoteError {
        let code = match self {
            ProxyError::NotFound(_) => "not-found",
            ProxyError::InvalidIdentifier(_) => "invalid-identifier",
            ProxyError::IdentifierInUse(_) => "identifier-in-use",
            ProxyError::AlreadyRegistered(_) => "already-registered",
            ProxyError::ProtocolState { .. } => "protocol-state",
            ProxyError::UnknownType(_) => "unknown-type",
            ProxyError::UnknownMethod(_) => "unknown-method",
            ProxyError::Call(e) => return e.to_remote(),
        };
        RemoteError::new(code, self.to_string(), Value::Null)
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NotFound(id) => write!(f, "no instance with identifier {id}"),
            ProxyError::InvalidIdentifier(id) => write!(f, "invalid identifier {id}"),
            ProxyError::IdentifierInUse(id) => write!(f, "identifier {id} is already in use"),
            ProxyError::AlreadyRegistered(id) => {
                write!(f, "instance is already registered with identifier {id}")
            }
            ProxyError::ProtocolState { expected, actual } => {
                write!(f, "registrar is {actual:?}, expected {expected:?}")
            }
            ProxyError::UnknownType(name) => write!(f, "no proxy API handles {name}"),
            ProxyError::UnknownMethod(name) => write!(f, "no peer method {name}"),
            ProxyError::Call(e) => write!(f, "call failed: {e}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Call(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CallError> for ProxyError {
    fn from(value: CallError) -> Self {
        ProxyError::Call(value)
    }
}

impl From<ProxyError> for RemoteError {
    fn from(value: ProxyError) -> Self {
        value.to_remote()
    }
}
