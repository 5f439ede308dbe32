//! JSON-RPC 2.0 envelope
//!
//! Every frame on the relay link and every engine-level message is one of
//! these documents, serialized to UTF-8 text.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The protocol version string carried by every document
pub const JSONRPC_VERSION: &str = "2.0";

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique int64 request id
///
/// Millisecond timestamp scaled by 1000 plus a rolling counter, so ids are
/// unique within a process and sort roughly by creation time.
pub fn next_id() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    millis * 1000 + ID_COUNTER.fetch_add(1, Ordering::Relaxed) % 1000
}

/// A JSON-RPC request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    /// Request id
    pub id: u64,
    /// Always `"2.0"`
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Build a request with a fresh id
    pub fn new(method: &str, params: Value) -> Self {
        Request {
            id: next_id(),
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// The error member of a JSON-RPC error response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorData {
    /// Numeric error code
    pub code: i64,
    /// Human-readable message
    pub message: String,
}

/// A JSON-RPC response, carrying either `result` or `error`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request being answered
    pub id: u64,
    /// Always `"2.0"`
    pub jsonrpc: String,
    /// Success result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
}

impl Response {
    /// Build a success response
    pub fn result(id: u64, result: Value) -> Self {
        Response {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response
    pub fn error(id: u64, code: i64, message: &str) -> Self {
        Response {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(ErrorData {
                code,
                message: message.to_string(),
            }),
        }
    }

    /// Unpack into the carried result, converting wire errors
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(Error::from_rpc(error.code, error.message));
        }
        self.result.ok_or(Error::MissingResponse)
    }
}

/// Either side of the envelope, as read off the wire
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// A request (has `method`)
    Request(Request),
    /// A response (has `result` or `error`)
    Response(Response),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_unique() {
        let a = next_id();
        let b = next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_roundtrip() {
        let req = Request::new("waku_publish", json!({"topic": "t"}));
        let text = serde_json::to_string(&req).unwrap();
        let parsed: Payload = serde_json::from_str(&text).unwrap();

        match parsed {
            Payload::Request(r) => {
                assert_eq!(r.id, req.id);
                assert_eq!(r.method, "waku_publish");
            }
            _ => panic!("parsed as response"),
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = Response::result(7, json!(true));
        let text = serde_json::to_string(&resp).unwrap();
        let parsed: Payload = serde_json::from_str(&text).unwrap();

        match parsed {
            Payload::Response(r) => assert_eq!(r.into_result().unwrap(), json!(true)),
            _ => panic!("parsed as request"),
        }
    }

    #[test]
    fn test_error_response_converts() {
        let resp = Response::error(7, 3003, "matching controller");
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED_MATCHING_CONTROLLER");
    }

    #[test]
    fn test_empty_response_is_missing() {
        let resp = Response {
            id: 1,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: None,
        };
        assert!(matches!(
            resp.into_result(),
            Err(Error::MissingResponse)
        ));
    }
}
