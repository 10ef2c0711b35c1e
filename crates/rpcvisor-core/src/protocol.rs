//! Line protocol envelopes.
//!
//! Outgoing requests have one fixed shape. Incoming lines are classified by
//! [`parse_line`], which accepts the loose output real companion processes
//! produce. The fallback order, applied to each line:
//!
//! 1. The line must be a JSON object, otherwise it is log output.
//! 2. The correlation id is read from `id`, as an integer or a string holding
//!    an integer. Any other `id` shape makes the line log output.
//! 3. With an id and a `method` but no `result` or `error`, the line is
//!    request-shaped (a child echoing what it received) and is log output.
//! 4. With an id: an `error` member makes it a failed response (`error` may be
//!    an object with `code`/`message`/`data` or a bare string); otherwise the
//!    `result` member is the successful result, and a response with neither
//!    resolves to `null`.
//! 5. Without an id: a string `method` makes it a notification.
//! 6. Anything else is log output.
//!
//! The protocol version travels as `version`; `jsonrpc` is accepted as an
//! alias on input and neither is required.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Code used when the child reports an error without one
pub const UNSPECIFIED_ERROR_CODE: i64 = -32000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub version: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(version: impl Into<String>, id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            version: version.into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Structured error returned by the child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub outcome: Result<Value, RemoteError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// One classified line of child output
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
    Log(String),
}

pub fn parse_line(line: &str) -> Incoming {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return Incoming::Log(line.to_string());
    }

    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) else {
        return Incoming::Log(line.to_string());
    };

    let request_shaped = object.contains_key("method")
        && !object.contains_key("result")
        && !object.contains_key("error");

    match object.get("id") {
        Some(_) if request_shaped => Incoming::Log(line.to_string()),
        Some(id) => match parse_id(id) {
            Some(id) => Incoming::Response(Response {
                id,
                outcome: parse_outcome(object),
            }),
            None => Incoming::Log(line.to_string()),
        },
        None => match object.get("method").and_then(Value::as_str) {
            Some(method) => Incoming::Notification(Notification {
                method: method.to_string(),
                params: object.get("params").cloned(),
            }),
            None => Incoming::Log(line.to_string()),
        },
    }
}

fn parse_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_outcome(mut object: Map<String, Value>) -> Result<Value, RemoteError> {
    match object.remove("error") {
        Some(Value::Null) | None => Ok(object.remove("result").unwrap_or(Value::Null)),
        Some(error) => Err(parse_remote_error(error)),
    }
}

fn parse_remote_error(error: Value) -> RemoteError {
    match error {
        Value::Object(mut fields) => RemoteError {
            code: fields
                .get("code")
                .and_then(Value::as_i64)
                .unwrap_or(UNSPECIFIED_ERROR_CODE),
            message: match fields.remove("message") {
                Some(Value::String(message)) => message,
                Some(other) => other.to_string(),
                None => String::from("unknown error"),
            },
            data: fields.remove("data"),
        },
        Value::String(message) => RemoteError {
            code: UNSPECIFIED_ERROR_CODE,
            message,
            data: None,
        },
        other => RemoteError {
            code: UNSPECIFIED_ERROR_CODE,
            message: other.to_string(),
            data: None,
        },
    }
}
