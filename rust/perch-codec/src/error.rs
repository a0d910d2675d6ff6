use std::fmt;

/// Error produced when bytes cannot be decoded into a [`Value`](crate::Value),
/// or a value cannot be encoded under the codec's schema.
///
/// Format errors are fatal for the message they occur in and are never
/// retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The buffer ended in the middle of a value.
    UnexpectedEof,
    /// A type discriminant that neither the standard set nor the schema knows.
    UnknownType(u8),
    /// String bytes were not valid UTF-8.
    InvalidUtf8,
    /// A size prefix was malformed or too large to represent.
    InvalidSize,
    /// Nested lists/maps/classes exceeded the decoder's depth limit.
    TooDeep,
    /// An enum ordinal outside the registered variant range.
    EnumOutOfRange { type_id: u8, ordinal: i64 },
    /// A custom class whose field list does not match its schema.
    FieldCount {
        type_id: u8,
        expected: usize,
        found: usize,
    },
    /// A custom type payload had the wrong shape (e.g. an enum ordinal that
    /// was not an integer).
    InvalidCustom { type_id: u8, reason: &'static str },
    /// A proxy instance reference carried a negative identifier.
    InvalidIdentifier(i64),
    /// Bytes remained after the top-level value was decoded.
    TrailingBytes(usize),
    /// A request/reply envelope did not have the expected structure.
    InvalidEnvelope(&'static str),
    /// The schema ran out of custom type discriminants.
    TooManyTypes,
    /// Two custom types were registered under the same name.
    DuplicateType(String),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::UnexpectedEof => write!(f, "unexpected end of message"),
            FormatError::UnknownType(t) => write!(f, "unknown type discriminant: {t}"),
            FormatError::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            FormatError::InvalidSize => write!(f, "invalid size prefix"),
            FormatError::TooDeep => write!(f, "value nesting too deep"),
            FormatError::EnumOutOfRange { type_id, ordinal } => {
                write!(f, "enum {type_id}: ordinal {ordinal} out of range")
            }
            FormatError::FieldCount {
                type_id,
                expected,
                found,
            } => write!(
                f,
                "class {type_id}: expected {expected} fields, found {found}"
            ),
            FormatError::InvalidCustom { type_id, reason } => {
                write!(f, "custom type {type_id}: {reason}")
            }
            FormatError::InvalidIdentifier(id) => write!(f, "invalid instance identifier: {id}"),
            FormatError::TrailingBytes(n) => write!(f, "{n} trailing bytes after message"),
            FormatError::InvalidEnvelope(why) => write!(f, "invalid envelope: {why}"),
            FormatError::TooManyTypes => write!(f, "no custom type discriminants left"),
            FormatError::DuplicateType(name) => write!(f, "custom type {name:?} registered twice"),
        }
    }
}

impl std::error::Error for FormatError {}
