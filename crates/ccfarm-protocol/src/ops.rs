//! Operation dispatch.
//!
//! Every request frame is a JSON object. The optional `op` field selects the
//! operation; a frame without one is a compile request.

pub mod probe;

pub use probe::ProbeResponse;

use serde_json::Value;

use crate::error::ProtocolError;
use crate::request::CompileRequest;

/// Known operation names.
pub mod names {
    pub const COMPILE: &str = "compile";
    pub const PROBE: &str = "probe";
}

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Compile(CompileRequest),
    Probe,
}

impl Request {
    /// Parse a raw frame payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(payload)?;
        Self::from_value(value)
    }

    /// Parse an already-decoded JSON object.
    pub fn from_value(mut value: Value) -> Result<Self, ProtocolError> {
        let op = match value.as_object_mut().and_then(|map| map.remove("op")) {
            None | Some(Value::Null) => names::COMPILE.to_string(),
            Some(Value::String(op)) => op,
            Some(other) => return Err(ProtocolError::UnknownOperation(other.to_string())),
        };

        match op.as_str() {
            names::COMPILE => Ok(Self::Compile(serde_json::from_value(value)?)),
            names::PROBE => Ok(Self::Probe),
            _ => Err(ProtocolError::UnknownOperation(op)),
        }
    }

    /// Encode for the wire, tagging with `op` except for plain compiles.
    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        match self {
            Self::Compile(request) => Ok(serde_json::to_value(request)?),
            Self::Probe => Ok(serde_json::json!({ "op": names::PROBE })),
        }
    }

    /// Operation name for logging.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Compile(_) => names::COMPILE,
            Self::Probe => names::PROBE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_op_is_compile() {
        let payload = br#"{"compiler":"gcc","args":["-O2"],"source_name":"a.c","source":"eA==","output_name":"a.o"}"#;
        match Request::from_payload(payload).unwrap() {
            Request::Compile(req) => {
                assert_eq!(req.compiler, "gcc");
                assert_eq!(req.source, b"x");
            }
            other => panic!("expected compile, got {other:?}"),
        }
    }

    #[test]
    fn test_explicit_compile_op() {
        let payload = br#"{"op":"compile","compiler":"cc","source_name":"a.c","source":"","output_name":"a.o"}"#;
        assert!(matches!(Request::from_payload(payload).unwrap(), Request::Compile(_)));
    }

    #[test]
    fn test_probe_op() {
        assert_eq!(Request::from_payload(br#"{"op":"probe"}"#).unwrap(), Request::Probe);
    }

    #[test]
    fn test_unknown_op_rejected() {
        let err = Request::from_payload(br#"{"op":"reboot"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOperation(op) if op == "reboot"));
    }

    #[test]
    fn test_compile_missing_fields_is_malformed() {
        let err = Request::from_payload(br#"{"compiler":"gcc"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_probe_encoding() {
        let value = Request::Probe.to_value().unwrap();
        assert_eq!(value, serde_json::json!({"op": "probe"}));
    }
}
