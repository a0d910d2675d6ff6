//! Request/response envelopes.
//!
//! A request is the argument list encoded as a single list value. A reply is
//! a list of fixed arity: `[result]` on success, `[code, message, details]` on
//! failure. The arity alone tells the two apart, so a successful result that
//! happens to look like an error triple is still unambiguous.
//!
//! Event channels use the method-call codec instead: a call is the method
//! name followed by its argument, and every event is a one-byte status
//! followed by the payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{FormatError, Reader, StandardCodec, Value};

/// A decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success(Value),
    Error {
        code: String,
        message: String,
        details: Value,
    },
}

impl Reply {
    pub fn error(code: impl Into<String>, message: impl Into<String>, details: Value) -> Self {
        Reply::Error {
            code: code.into(),
            message: message.into(),
            details,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success(_))
    }
}

// ============================================================================
// Message-style APIs
// ============================================================================

/// Encode an argument list as a request body.
pub fn encode_request(codec: &StandardCodec, args: &[Value]) -> Result<Bytes, FormatError> {
    let mut buf = BytesMut::new();
    codec.encode_list_into(&mut buf, args)?;
    Ok(buf.freeze())
}

/// Decode a request body into its argument list.
///
/// An absent message is an empty argument list (methods without parameters
/// may send nothing at all).
pub fn decode_request(
    codec: &StandardCodec,
    message: Option<&[u8]>,
) -> Result<Vec<Value>, FormatError> {
    let Some(bytes) = message else {
        return Ok(Vec::new());
    };
    match codec.decode(bytes)? {
        Value::List(args) => Ok(args),
        Value::Null => Ok(Vec::new()),
        _ => Err(FormatError::InvalidEnvelope("request is not a list")),
    }
}

/// Encode a successful reply: `[value]`.
pub fn encode_success(codec: &StandardCodec, value: &Value) -> Result<Bytes, FormatError> {
    encode_request(codec, std::slice::from_ref(value))
}

/// Encode an error reply: `[code, message, details]`.
pub fn encode_error(
    codec: &StandardCodec,
    code: &str,
    message: &str,
    details: &Value,
) -> Result<Bytes, FormatError> {
    let mut buf = BytesMut::new();
    buf.put_u8(crate::type_tag::LIST);
    buf.put_u8(3);
    codec.encode_into(&mut buf, &Value::String(code.to_owned()))?;
    codec.encode_into(&mut buf, &Value::String(message.to_owned()))?;
    codec.encode_into(&mut buf, details)?;
    Ok(buf.freeze())
}

pub fn encode_reply(codec: &StandardCodec, reply: &Reply) -> Result<Bytes, FormatError> {
    match reply {
        Reply::Success(value) => encode_success(codec, value),
        Reply::Error {
            code,
            message,
            details,
        } => encode_error(codec, code, message, details),
    }
}

/// Decode a reply list.
pub fn decode_reply(codec: &StandardCodec, bytes: &[u8]) -> Result<Reply, FormatError> {
    let Value::List(mut items) = codec.decode(bytes)? else {
        return Err(FormatError::InvalidEnvelope("reply is not a list"));
    };
    match items.len() {
        1 => Ok(Reply::Success(items.remove(0))),
        3 => {
            let details = items.pop().unwrap_or(Value::Null);
            let message = items.pop().unwrap_or(Value::Null);
            let code = items.pop().unwrap_or(Value::Null);
            error_from_parts(code, message, details)
        }
        _ => Err(FormatError::InvalidEnvelope("reply list must have 1 or 3 elements")),
    }
}

fn error_from_parts(code: Value, message: Value, details: Value) -> Result<Reply, FormatError> {
    let Value::String(code) = code else {
        return Err(FormatError::InvalidEnvelope("error code is not a string"));
    };
    let message = match message {
        Value::String(m) => m,
        Value::Null => String::new(),
        _ => return Err(FormatError::InvalidEnvelope("error message is not a string")),
    };
    Ok(Reply::Error {
        code,
        message,
        details,
    })
}

// ============================================================================
// Method-call codec (event channels)
// ============================================================================

const ENVELOPE_SUCCESS: u8 = 0;
const ENVELOPE_ERROR: u8 = 1;

/// A named call with a single argument value.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub method: String,
    pub args: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

pub fn encode_method_call(codec: &StandardCodec, call: &MethodCall) -> Result<Bytes, FormatError> {
    let mut buf = BytesMut::new();
    codec.encode_into(&mut buf, &Value::String(call.method.clone()))?;
    codec.encode_into(&mut buf, &call.args)?;
    Ok(buf.freeze())
}

pub fn decode_method_call(codec: &StandardCodec, bytes: &[u8]) -> Result<MethodCall, FormatError> {
    let mut reader = Reader::new(bytes);
    let Value::String(method) = codec.read_value(&mut reader)? else {
        return Err(FormatError::InvalidEnvelope("method name is not a string"));
    };
    let args = if reader.remaining() == 0 {
        Value::Null
    } else {
        codec.read_value(&mut reader)?
    };
    reader.finish()?;
    Ok(MethodCall { method, args })
}

/// Encode a success envelope: status byte 0 then the value.
pub fn encode_success_envelope(codec: &StandardCodec, value: &Value) -> Result<Bytes, FormatError> {
    let mut buf = BytesMut::new();
    buf.put_u8(ENVELOPE_SUCCESS);
    codec.encode_into(&mut buf, value)?;
    Ok(buf.freeze())
}

/// Encode an error envelope: status byte 1 then code, message, details.
pub fn encode_error_envelope(
    codec: &StandardCodec,
    code: &str,
    message: &str,
    details: &Value,
) -> Result<Bytes, FormatError> {
    let mut buf = BytesMut::new();
    buf.put_u8(ENVELOPE_ERROR);
    codec.encode_into(&mut buf, &Value::String(code.to_owned()))?;
    codec.encode_into(&mut buf, &Value::String(message.to_owned()))?;
    codec.encode_into(&mut buf, details)?;
    Ok(buf.freeze())
}

pub fn decode_envelope(codec: &StandardCodec, bytes: &[u8]) -> Result<Reply, FormatError> {
    let mut reader = Reader::new(bytes);
    let reply = match reader.u8()? {
        ENVELOPE_SUCCESS => Reply::Success(codec.read_value(&mut reader)?),
        ENVELOPE_ERROR => {
            let code = codec.read_value(&mut reader)?;
            let message = codec.read_value(&mut reader)?;
            let details = codec.read_value(&mut reader)?;
            error_from_parts(code, message, details)?
        }
        _ => return Err(FormatError::InvalidEnvelope("unknown envelope status")),
    };
    reader.finish()?;
    Ok(reply)
}
