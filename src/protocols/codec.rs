//! JSON-RPC 2.0 envelope types and their wire codec.
//!
//! Encoding always emits `"jsonrpc": "2.0"`. Decoding is strict: anything that
//! is not a well-formed request, response or notification is a
//! `ApiError::Decode`, which the connection treats as fatal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::types::ApiError;

const JSONRPC_VERSION: &str = "2.0";

/// Correlation token pairing a request with its response.
///
/// Numeric and string ids are kept apart so a response echoes exactly the
/// id type the request used.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<i32> for RequestId {
    fn from(value: i32) -> Self {
        RequestId::Number(i64::from(value))
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

/// Error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<&ApiError> for ResponseError {
    fn from(error: &ApiError) -> Self {
        match error {
            ApiError::Remote {
                code,
                message,
                data,
            } => ResponseError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            other => ResponseError::new(other.code(), other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Result<Value, ResponseError>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result: Ok(result),
        }
    }

    pub fn error(id: RequestId, error: ResponseError) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// One JSON-RPC envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Response(_) => None,
        }
    }

    /// Correlation id for requests and responses.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(request) => Some(&request.id),
            Message::Response(response) => Some(&response.id),
            Message::Notification(_) => None,
        }
    }

    /// Build the JSON value for this envelope.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
        match self {
            Message::Request(request) => {
                object.insert("id".to_string(), id_to_value(&request.id));
                object.insert("method".to_string(), Value::from(request.method.clone()));
                if let Some(params) = &request.params {
                    object.insert("params".to_string(), params.clone());
                }
            }
            Message::Response(response) => {
                object.insert("id".to_string(), id_to_value(&response.id));
                match &response.result {
                    Ok(result) => {
                        object.insert("result".to_string(), result.clone());
                    }
                    Err(error) => {
                        object.insert("error".to_string(), error_to_value(error));
                    }
                }
            }
            Message::Notification(notification) => {
                object.insert(
                    "method".to_string(),
                    Value::from(notification.method.clone()),
                );
                if let Some(params) = &notification.params {
                    object.insert("params".to_string(), params.clone());
                }
            }
        }
        Value::Object(object)
    }

    /// Interpret a parsed JSON value as an envelope.
    pub fn from_value(value: Value) -> Result<Self, ApiError> {
        let Value::Object(mut object) = value else {
            return Err(decode_error("message is not a JSON object"));
        };

        let id = match object.remove("id") {
            None => None,
            Some(value) => Some(parse_id(value)?),
        };
        let method = match object.remove("method") {
            None => None,
            Some(Value::String(method)) => Some(method),
            Some(other) => {
                return Err(decode_error(format!("method must be a string, got {other}")));
            }
        };
        let params = object.remove("params");

        match (id, method) {
            (Some(id), Some(method)) => Ok(Message::Request(Request { id, method, params })),
            (None, Some(method)) => Ok(Message::Notification(Notification { method, params })),
            (Some(id), None) => {
                let result = object.remove("result");
                let error = object.remove("error").filter(|error| !error.is_null());
                match (result, error) {
                    (Some(_), Some(_)) => Err(decode_error(format!(
                        "response {id} carries both result and error"
                    ))),
                    (Some(result), None) => Ok(Message::Response(Response::ok(id, result))),
                    (None, Some(error)) => {
                        let error = parse_error_object(error)?;
                        Ok(Message::Response(Response::error(id, error)))
                    }
                    (None, None) => Err(decode_error(format!(
                        "message {id} has neither method, result nor error"
                    ))),
                }
            }
            (None, None) => Err(decode_error("message has neither id nor method")),
        }
    }
}

/// Serialize a message into the bytes of one frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, ApiError> {
    serde_json::to_vec(&message.to_value()).map_err(|e| ApiError::InvalidInput {
        message: format!("Failed to serialize JSON-RPC message: {e}"),
    })
}

/// Parse the bytes of one frame into a message.
pub fn decode(bytes: &[u8]) -> Result<Message, ApiError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| decode_error(format!("invalid JSON: {e}")))?;
    Message::from_value(value)
}

fn id_to_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::from(s.clone()),
    }
}

fn error_to_value(error: &ResponseError) -> Value {
    let mut object = Map::new();
    object.insert("code".to_string(), Value::from(error.code));
    object.insert("message".to_string(), Value::from(error.message.clone()));
    if let Some(data) = &error.data {
        object.insert("data".to_string(), data.clone());
    }
    Value::Object(object)
}

fn parse_id(value: Value) -> Result<RequestId, ApiError> {
    match value {
        Value::String(s) => Ok(RequestId::String(s)),
        Value::Number(n) => n
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| decode_error(format!("id must be an integer, got {n}"))),
        other => Err(decode_error(format!(
            "id must be an integer or a string, got {other}"
        ))),
    }
}

fn parse_error_object(value: Value) -> Result<ResponseError, ApiError> {
    let Value::Object(mut object) = value else {
        return Err(decode_error("error must be an object"));
    };
    let code = object
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| decode_error("error.code must be an integer"))?;
    let message = match object.remove("message") {
        Some(Value::String(message)) => message,
        _ => return Err(decode_error("error.message must be a string")),
    };
    Ok(ResponseError {
        code,
        message,
        data: object.remove("data"),
    })
}

fn decode_error(message: impl Into<String>) -> ApiError {
    ApiError::Decode {
        message: message.into(),
    }
}
