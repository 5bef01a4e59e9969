//! The daemon wire protocol: one JSON request per connection, one JSON response.
//!
//! Grounded on the teacher's JSON-RPC-ish envelope conventions (request id echoed
//! back, `{ok, error:{code,message}}` on failure) adapted from a long-lived
//! stream to the daemon's short-lived-connection-per-call model described in
//! the component design.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HubError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Response {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: &HubError) -> Self {
        Response {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: error.daemon_code(),
                message: error.to_string(),
            }),
        }
    }
}

/// Parse one request from a buffer that may or may not yet be a complete JSON
/// value. `Ok(None)` means "keep reading"; an empty buffer at EOF is the
/// caller's cue to report `empty_request` instead of calling this again.
pub fn try_parse(buffer: &[u8]) -> Result<Option<Request>> {
    if buffer.is_empty() {
        return Ok(None);
    }
    match serde_json::from_slice::<Request>(buffer) {
        Ok(req) => Ok(Some(req)),
        Err(e) if e.is_eof() => Ok(None),
        Err(e) => Err(HubError::InvalidJsonRequest(e.to_string())),
    }
}

/// Final attempt at EOF: any parse failure here is conclusive, not "keep reading".
pub fn parse_at_eof(buffer: &[u8]) -> Result<Request> {
    if buffer.is_empty() {
        return Err(HubError::EmptyRequest);
    }
    serde_json::from_slice::<Request>(buffer).map_err(|e| HubError::InvalidJsonRequest(e.to_string()))
}

pub const METHOD_STATUS: &str = "status";
pub const METHOD_CALL_TOOL: &str = "callTool";
pub const METHOD_LIST_TOOLS: &str = "listTools";
pub const METHOD_LIST_RESOURCES: &str = "listResources";
pub const METHOD_CLOSE_SERVER: &str = "closeServer";
pub const METHOD_STOP: &str = "stop";

pub const KNOWN_METHODS: &[&str] = &[
    METHOD_STATUS,
    METHOD_CALL_TOOL,
    METHOD_LIST_TOOLS,
    METHOD_LIST_RESOURCES,
    METHOD_CLOSE_SERVER,
    METHOD_STOP,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_parses_to_keep_reading() {
        assert!(try_parse(b"").unwrap().is_none());
    }

    #[test]
    fn partial_json_parses_to_keep_reading() {
        assert!(try_parse(br#"{"id":1,"meth"#).unwrap().is_none());
    }

    #[test]
    fn complete_json_parses_immediately() {
        let req = try_parse(br#"{"id":1,"method":"status","params":{}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(req.method, "status");
    }

    #[test]
    fn eof_with_empty_buffer_is_empty_request() {
        let err = parse_at_eof(b"").unwrap_err();
        assert!(matches!(err, HubError::EmptyRequest));
    }

    #[test]
    fn eof_with_garbage_is_invalid_json() {
        let err = parse_at_eof(b"not json").unwrap_err();
        assert!(matches!(err, HubError::InvalidJsonRequest(_)));
    }

    #[test]
    fn response_err_uses_daemon_code_and_message() {
        let e = HubError::UnknownMethod("frobnicate".to_string());
        let resp = Response::err(Value::from(1), &e);
        assert!(!resp.ok);
        let body = resp.error.unwrap();
        assert_eq!(body.code, "unknown_method");
        assert!(body.message.contains("frobnicate"));
    }
}
