//! Combined-stream control protocol.
//!
//! Requests are JSON objects `{"id", "method", "params"}`. The server answers
//! with `{"id", "result"}` or `{"id", "error": {"code", "msg"}}`. Channel
//! payloads arrive as `{"stream", "data"}`.

use serde::Serialize;
use serde_json::Value;

use crate::StreamError;

/// Control request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    /// Subscribe to channels.
    Subscribe,
    /// Unsubscribe from channels.
    Unsubscribe,
    /// List the channels the connection is subscribed to.
    ListSubscriptions,
}

impl Method {
    /// Returns the wire name of the method.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::ListSubscriptions => "LIST_SUBSCRIPTIONS",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a [String]>,
}

/// Encodes a control request.
///
/// # Errors
///
/// Returns [`StreamError::Protocol`] if serialization fails.
pub fn encode_request(id: u64, method: Method, params: Option<&[String]>) -> Result<String, StreamError> {
    serde_json::to_string(&Request { id, method, params }).map_err(|e| StreamError::Protocol(e.to_string()))
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Successful answer to a request.
    Response {
        /// Request id.
        id: u64,
        /// Result payload, `null` for commands without a result.
        result: Value,
    },
    /// Error answer to a request.
    Error {
        /// Request id, if the server could parse it.
        id: Option<u64>,
        /// Error code.
        code: i64,
        /// Error message.
        msg: String,
    },
    /// Answer carrying an id but neither a result nor an error.
    Malformed {
        /// Request id.
        id: u64,
    },
    /// Channel payload.
    Stream {
        /// Channel name.
        stream: String,
        /// Payload.
        data: Value,
    },
    /// Anything else.
    Other(Value),
}

/// Decodes a server text frame.
///
/// # Errors
///
/// Returns [`StreamError::Protocol`] if the frame is not valid JSON.
pub fn parse_message(text: &str) -> Result<ServerMessage, StreamError> {
    let value: Value = serde_json::from_str(text).map_err(|e| StreamError::Protocol(e.to_string()))?;

    let mut object = match value {
        Value::Object(object) => object,
        other => return Ok(ServerMessage::Other(other)),
    };

    if let Some(stream) = object.get("stream").and_then(Value::as_str).map(str::to_owned) {
        let data = object.remove("data").unwrap_or(Value::Null);
        return Ok(ServerMessage::Stream { stream, data });
    }

    let id = object.get("id").and_then(Value::as_u64);

    if let Some(error) = object.get("error") {
        let code = error.get("code").and_then(Value::as_i64);
        let msg = error.get("msg").and_then(Value::as_str);
        if let (Some(code), Some(msg)) = (code, msg) {
            return Ok(ServerMessage::Error { id, code, msg: msg.to_owned() });
        }
    }

    if let Some(id) = id {
        return Ok(match object.remove("result") {
            Some(result) => ServerMessage::Response { id, result },
            None => ServerMessage::Malformed { id },
        });
    }

    Ok(ServerMessage::Other(Value::Object(object)))
}
